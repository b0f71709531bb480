//! Read-only access to the process being inspected.

use std::collections::HashMap;
use std::fmt;

use range_map::{Range, RangeMap};
use scroll::{Pread, LE};
use tracing::trace;

use crate::frames::FRAME_TOP;

/// The CPU architecture of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// The size of a pointer in the target, in bytes.
    pub fn pointer_size(self) -> u64 {
        match self {
            Architecture::Amd64 | Architecture::Arm64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors a [`Target`] reports.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Unable to read {length} bytes at {address:#x}")]
    Unreadable { address: u64, length: usize },
    #[error("Register context unavailable for thread {thread_id}")]
    ContextUnavailable { thread_id: u64 },
}

/// Read-only access to an inspected process.
///
/// A `Target` is a snapshot: the same request must always produce the same answer,
/// which is why nothing built on top of it ever retries a failed read.
pub trait Target {
    /// The architecture of the inspected process.
    fn architecture(&self) -> Architecture;

    /// Read `length` bytes of target memory starting at `address`.
    fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, TargetError>;

    /// Get the raw register context of the thread with OS id `thread_id`.
    ///
    /// `requested_flags` is the `context_flags` mask of register groups the caller
    /// wants. Hosts are free to return more than was asked for.
    fn get_thread_context(
        &self,
        thread_id: u64,
        requested_flags: u32,
    ) -> Result<Vec<u8>, TargetError>;

    /// Look up the value of a named runtime global, if the target exposes it.
    fn read_global(&self, _name: &str) -> Option<u64> {
        None
    }

    /// Read one pointer-sized little-endian value at `address`.
    fn read_pointer(&self, address: u64) -> Result<u64, TargetError> {
        let length = self.architecture().pointer_size() as usize;
        let bytes = self.read_memory(address, length)?;
        bytes
            .as_slice()
            .pread_with::<u64>(0, LE)
            .map_err(|_| TargetError::Unreadable { address, length })
    }
}

/// The per-thread state a walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadData {
    /// The operating system's id for the thread.
    pub os_id: u64,
    /// Address of the thread's most recent transition record, or [`FRAME_TOP`].
    pub frame_head: u64,
}

impl ThreadData {
    pub fn new(os_id: u64, frame_head: u64) -> ThreadData {
        ThreadData { os_id, frame_head }
    }

    /// A thread that has never crossed a runtime transition.
    pub fn without_frames(os_id: u64) -> ThreadData {
        ThreadData::new(os_id, FRAME_TOP)
    }
}

/// A contiguous block of target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub bytes: Vec<u8>,
}

impl MemoryRegion {
    /// The inclusive range of addresses this region covers, if it covers any.
    pub fn memory_range(&self) -> Option<Range<u64>> {
        if self.bytes.is_empty() {
            return None;
        }
        let end = self
            .base_address
            .checked_add(self.bytes.len() as u64 - 1)?;
        Some(Range::new(self.base_address, end))
    }
}

/// A [`Target`] backed by an in-memory snapshot of a process.
///
/// Of two overlapping memory regions only the lower-addressed one is readable, whichever
/// was added first.
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    arch: Architecture,
    regions: Vec<MemoryRegion>,
    regions_by_addr: RangeMap<u64, usize>,
    contexts: HashMap<u64, Vec<u8>>,
    globals: HashMap<String, u64>,
}

impl MemoryTarget {
    pub fn new(arch: Architecture) -> MemoryTarget {
        MemoryTarget {
            arch,
            regions: Vec::new(),
            regions_by_addr: RangeMap::new(),
            contexts: HashMap::new(),
            globals: HashMap::new(),
        }
    }

    pub fn add_memory(&mut self, base_address: u64, bytes: Vec<u8>) {
        self.add_memory_regions(std::iter::once(MemoryRegion {
            base_address,
            bytes,
        }));
    }

    /// Add several regions at once, indexing them in a single pass.
    pub fn add_memory_regions(&mut self, regions: impl IntoIterator<Item = MemoryRegion>) {
        self.regions.extend(regions);
        self.regions_by_addr = crate::into_rangemap_safe(
            self.regions
                .iter()
                .enumerate()
                .filter_map(|(i, region)| region.memory_range().map(|range| (range, i))),
            "memory region",
        );
    }

    pub fn add_thread_context(&mut self, thread_id: u64, context: Vec<u8>) {
        self.contexts.insert(thread_id, context);
    }

    pub fn add_global(&mut self, name: &str, value: u64) {
        self.globals.insert(name.to_owned(), value);
    }

    pub fn with_memory(mut self, base_address: u64, bytes: Vec<u8>) -> MemoryTarget {
        self.add_memory(base_address, bytes);
        self
    }

    pub fn with_thread_context(mut self, thread_id: u64, context: Vec<u8>) -> MemoryTarget {
        self.add_thread_context(thread_id, context);
        self
    }

    pub fn with_globals<'n>(
        mut self,
        globals: impl IntoIterator<Item = (&'n str, u64)>,
    ) -> MemoryTarget {
        for (name, value) in globals {
            self.add_global(name, value);
        }
        self
    }

    /// Return the region whose address range covers `address`.
    pub fn region_at_address(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions_by_addr
            .get(address)
            .map(|&index| &self.regions[index])
    }

    /// The OS ids of all threads with a register context, in ascending order.
    pub fn thread_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.contexts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Target for MemoryTarget {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, TargetError> {
        let unreadable = TargetError::Unreadable { address, length };
        let region = self.region_at_address(address).ok_or(unreadable.clone())?;
        let start = (address - region.base_address) as usize;
        let end = start.checked_add(length).ok_or(unreadable.clone())?;
        region
            .bytes
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(unreadable)
    }

    fn get_thread_context(
        &self,
        thread_id: u64,
        requested_flags: u32,
    ) -> Result<Vec<u8>, TargetError> {
        trace!(
            "target: context for thread {} requested with flags {:#x}",
            thread_id,
            requested_flags
        );
        self.contexts
            .get(&thread_id)
            .cloned()
            .ok_or(TargetError::ContextUnavailable { thread_id })
    }

    fn read_global(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }
}
