//! Process snapshots: a JSON description of a stopped process's memory, threads and
//! compiled code, loaded into the in-memory target the walker reads from.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context};
use scroll::{Pwrite, LE};
use serde::Deserialize;
use stackwalk::{
    Architecture, CodeRegionHandle, CodeRegionMap, MemoryRegion, MemoryTarget, PlatformContext,
    ThreadData, UnwindInfo, FRAME_TOP,
};

/// Parse an address or id written either in decimal or as `0x` hex.
pub fn parse_address(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address {text:?}: {e}"))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireAddress {
    Number(u64),
    Text(String),
}

/// A 64-bit value that may be written as a JSON number or a `"0x..."` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "WireAddress")]
pub struct Address(pub u64);

impl TryFrom<WireAddress> for Address {
    type Error = String;

    fn try_from(value: WireAddress) -> Result<Self, Self::Error> {
        match value {
            WireAddress::Number(n) => Ok(Address(n)),
            WireAddress::Text(text) => parse_address(&text).map(Address),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub arch: Architecture,
    #[serde(default)]
    pub memory: Vec<MemorySpec>,
    #[serde(default)]
    pub threads: Vec<ThreadSpec>,
    #[serde(default)]
    pub code_regions: Vec<CodeRegionSpec>,
    #[serde(default)]
    pub globals: BTreeMap<String, Address>,
}

/// One readable range of target memory, given either as little-endian pointer-sized
/// `words` or as raw `bytes`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemorySpec {
    pub base: Address,
    #[serde(default)]
    pub words: Vec<Address>,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadSpec {
    pub id: Address,
    /// The thread's first transition record. Threads without one have no records.
    #[serde(default)]
    pub frame_head: Option<Address>,
    #[serde(default)]
    pub registers: BTreeMap<String, Address>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeRegionSpec {
    pub start: Address,
    pub size: Address,
    pub unwind: UnwindSpec,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindSpec {
    FramePointer,
    FixedFrame {
        frame_size: Address,
        return_address_offset: Address,
        #[serde(default)]
        saved_fp_offset: Option<Address>,
    },
    Unavailable,
}

impl From<&UnwindSpec> for UnwindInfo {
    fn from(spec: &UnwindSpec) -> Self {
        match *spec {
            UnwindSpec::FramePointer => UnwindInfo::FramePointer,
            UnwindSpec::FixedFrame {
                frame_size,
                return_address_offset,
                saved_fp_offset,
            } => UnwindInfo::FixedFrame {
                frame_size: frame_size.0,
                return_address_offset: return_address_offset.0,
                saved_fp_offset: saved_fp_offset.map(|offset| offset.0),
            },
            UnwindSpec::Unavailable => UnwindInfo::Unavailable,
        }
    }
}

impl MemorySpec {
    fn contents(&self, pointer_size: u64) -> anyhow::Result<Vec<u8>> {
        if !self.words.is_empty() && !self.bytes.is_empty() {
            bail!(
                "memory at {:#x} has both words and bytes, pick one",
                self.base.0
            );
        }
        if self.words.is_empty() {
            return Ok(self.bytes.clone());
        }
        let pointer_size = pointer_size as usize;
        let mut contents = vec![0u8; self.words.len() * pointer_size];
        for (i, word) in self.words.iter().enumerate() {
            contents
                .as_mut_slice()
                .pwrite_with(word.0, i * pointer_size, LE)?;
        }
        Ok(contents)
    }
}

impl ThreadSpec {
    fn context(&self, arch: Architecture) -> anyhow::Result<PlatformContext> {
        let mut context = PlatformContext::new(arch);
        for (name, value) in &self.registers {
            context
                .set_register(name, value.0)
                .with_context(|| format!("while setting registers of thread {}", self.id.0))?;
        }
        Ok(context)
    }
}

impl Snapshot {
    pub fn read_path(path: &Path) -> anyhow::Result<Snapshot> {
        let file = File::open(path)
            .with_context(|| format!("while opening snapshot {}", path.display()))?;
        Self::read(BufReader::new(file)).context("while parsing snapshot JSON")
    }

    pub fn read<R: Read>(reader: R) -> anyhow::Result<Snapshot> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Build the in-memory target this snapshot describes.
    pub fn target(&self) -> anyhow::Result<MemoryTarget> {
        let mut target = MemoryTarget::new(self.arch);
        let regions = self
            .memory
            .iter()
            .map(|region| {
                Ok(MemoryRegion {
                    base_address: region.base.0,
                    bytes: region.contents(self.arch.pointer_size())?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        target.add_memory_regions(regions);
        for thread in &self.threads {
            target.add_thread_context(thread.id.0, thread.context(self.arch)?.to_bytes());
        }
        for (name, value) in &self.globals {
            target.add_global(name, value.0);
        }
        Ok(target)
    }

    pub fn code_regions(&self) -> CodeRegionMap {
        self.code_regions
            .iter()
            .map(|region| {
                CodeRegionHandle::new(region.start.0, region.size.0, (&region.unwind).into())
            })
            .collect()
    }

    /// The threads to walk: those named in `only`, or every thread in the snapshot.
    ///
    /// Requested ids that aren't in the snapshot are still returned, so that walking
    /// them reports the missing context.
    pub fn threads(&self, only: &[u64]) -> Vec<ThreadData> {
        let data = |thread: &ThreadSpec| {
            ThreadData::new(
                thread.id.0,
                thread.frame_head.map_or(FRAME_TOP, |head| head.0),
            )
        };
        if only.is_empty() {
            return self.threads.iter().map(data).collect();
        }
        only.iter()
            .map(|&id| {
                self.threads
                    .iter()
                    .find(|thread| thread.id.0 == id)
                    .map_or_else(|| ThreadData::without_frames(id), data)
            })
            .collect()
    }
}
