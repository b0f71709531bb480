//! Classifying instruction addresses as compiled code.

use range_map::{Range, RangeMap};
use tracing::{debug, trace};

/// How to recover a caller's registers from a frame in a code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindInfo {
    /// The region maintains a conventional frame pointer chain.
    FramePointer,
    /// The region uses a fixed-size frame with known save slots.
    ///
    /// Offsets are relative to the stack pointer on entry to the frame.
    FixedFrame {
        frame_size: u64,
        return_address_offset: u64,
        saved_fp_offset: Option<u64>,
    },
    /// The region is compiled code but nothing is known about its frames.
    Unavailable,
}

/// An opaque handle for one region of compiled code.
///
/// Handles are small and cheap to copy, hosts may mint them freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegionHandle {
    /// Address of the first instruction in the region.
    pub start: u64,
    /// Size of the region in bytes.
    pub size: u64,
    /// How to unwind frames whose instruction pointer lies inside the region.
    pub unwind: UnwindInfo,
}

impl CodeRegionHandle {
    pub fn new(start: u64, size: u64, unwind: UnwindInfo) -> CodeRegionHandle {
        CodeRegionHandle {
            start,
            size,
            unwind,
        }
    }

    /// The inclusive address range of the region, if it is non-empty.
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.size == 0 {
            return None;
        }
        Some(Range::new(
            self.start,
            self.start.checked_add(self.size - 1)?,
        ))
    }
}

/// Finds the compiled code region containing an instruction address.
///
/// An address for which this returns `None` is unmanaged (native) code.
pub trait CodeLocator {
    fn resolve(&self, instruction_address: u64) -> Option<CodeRegionHandle>;
}

/// A [`CodeLocator`] over a fixed list of regions.
///
/// Empty regions are ignored, and of two overlapping regions only the lower-addressed one
/// is kept.
#[derive(Debug, Clone)]
pub struct CodeRegionMap {
    regions: Vec<CodeRegionHandle>,
    regions_by_addr: RangeMap<u64, usize>,
}

impl Default for CodeRegionMap {
    fn default() -> Self {
        CodeRegionMap {
            regions: Vec::new(),
            regions_by_addr: RangeMap::new(),
        }
    }
}

impl CodeRegionMap {
    pub fn from_regions(regions: Vec<CodeRegionHandle>) -> CodeRegionMap {
        let regions_by_addr = crate::into_rangemap_safe(
            regions
                .iter()
                .enumerate()
                .filter_map(|(i, region)| region.memory_range().map(|range| (range, i))),
            "code region",
        );
        debug!("indexed {} code regions", regions.len());
        CodeRegionMap {
            regions,
            regions_by_addr,
        }
    }

    pub fn regions(&self) -> &[CodeRegionHandle] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl FromIterator<CodeRegionHandle> for CodeRegionMap {
    fn from_iter<I: IntoIterator<Item = CodeRegionHandle>>(iter: I) -> Self {
        CodeRegionMap::from_regions(iter.into_iter().collect())
    }
}

impl CodeLocator for CodeRegionMap {
    fn resolve(&self, instruction_address: u64) -> Option<CodeRegionHandle> {
        let region = self
            .regions_by_addr
            .get(instruction_address)
            .map(|&index| self.regions[index]);
        trace!(
            "locator: {:#x} -> {:?}",
            instruction_address,
            region.map(|r| r.start)
        );
        region
    }
}
