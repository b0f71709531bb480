//! A library for walking the stack of a thread in another process.
//!
//! Managed runtimes interleave two kinds of code on one stack: compiled code that can be
//! unwound from registers plus per-region unwind metadata, and native code that the
//! runtime brackets with transition records (a per-thread linked list living in the
//! target's memory). [`StackWalker`] alternates between both strategies and produces the
//! thread's logical call stack one [`FrameDescriptor`] at a time.
//!
//! The pieces a host has to provide are a [`Target`] (memory and register access, see
//! [`MemoryTarget`] for a snapshot-backed one) and a [`CodeLocator`] (which addresses are
//! compiled code and how to unwind them, see [`CodeRegionMap`]).
//!
//! ```
//! use stackwalk::{
//!     Architecture, CodeRegionMap, MemoryTarget, PlatformContext, StackWalker, ThreadData,
//!     WalkState,
//! };
//!
//! // A thread sitting in native code with no transition records has nothing to report.
//! let mut context = PlatformContext::new(Architecture::Amd64);
//! context.set_instruction_pointer(0x1000);
//! let target = MemoryTarget::new(Architecture::Amd64).with_thread_context(7, context.to_bytes());
//! let locator = CodeRegionMap::default();
//! let walker = StackWalker::new(&target, &locator);
//!
//! let walk = walker.walk(&ThreadData::without_frames(7)).unwrap();
//! assert_eq!(walk.state(), WalkState::Complete);
//! assert_eq!(walk.count(), 0);
//! ```

mod code_locator;
mod context;
mod frames;
mod stackwalker;
mod target;

pub use code_locator::*;
pub use context::*;
pub use frames::*;
pub use stackwalker::*;
pub use target::*;

use range_map::{Range, RangeMap};
use tracing::warn;

/// Build an address index, dropping entries that overlap an earlier one.
///
/// `entries` pair an inclusive address range with an index into the caller's storage.
pub(crate) fn into_rangemap_safe<I>(entries: I, what: &str) -> RangeMap<u64, usize>
where
    I: IntoIterator<Item = (Range<u64>, usize)>,
{
    let mut input: Vec<_> = entries.into_iter().collect();
    input.sort_by_key(|(range, index)| (range.start, *index));

    let mut kept: Vec<(Range<u64>, usize)> = Vec::with_capacity(input.len());
    for (range, index) in input {
        if let Some((last, last_index)) = kept.last() {
            if range.start <= last.end {
                warn!(
                    "dropping {} #{} ({:#x}-{:#x}): overlaps #{} ({:#x}-{:#x})",
                    what, index, range.start, range.end, last_index, last.start, last.end
                );
                continue;
            }
        }
        kept.push((range, index));
    }

    RangeMap::try_from_iter(kept).unwrap_or_else(|e| e.non_overlapping)
}
