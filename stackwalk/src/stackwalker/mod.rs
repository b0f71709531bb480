// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Walking a thread's stack across compiled code and runtime transitions.
//!
//! A walk is a small state machine over a [`Cursor`]. While the instruction pointer is in
//! compiled code (`Frameless`) the platform context is unwound one frame at a time. Once
//! it leaves compiled code (`Framed`) the thread's transition records take over: each one
//! restores the registers the runtime saved when it left compiled code. Records that an
//! inlined native call left behind are reported as `SkippedFrame` when the register
//! unwind steps over them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::code_locator::CodeLocator;
use crate::context::{ContextError, PlatformContext, UnwindError};
use crate::frames::{FrameIterator, FrameKind};
use crate::target::{Target, TargetError, ThreadData};

/// The default value for [`WalkerOptions::max_frames`].
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// The state a walk is in, which is also the state each descriptor was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkState {
    /// The context is in compiled code and will be unwound next.
    Frameless,
    /// The context is outside compiled code; the current transition record restores it.
    Framed,
    /// The current transition record was stepped over by an inlined call and will be
    /// passed without touching the context.
    SkippedFrame,
    /// Nothing left to walk.
    Complete,
    /// The walk failed.
    Error,
}

impl WalkState {
    /// Whether no further transitions happen out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, WalkState::Complete | WalkState::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            WalkState::Frameless => "frameless",
            WalkState::Framed => "framed",
            WalkState::SkippedFrame => "skipped_frame",
            WalkState::Complete => "complete",
            WalkState::Error => "error",
        }
    }
}

impl fmt::Display for WalkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

static NEXT_WALK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the walk a [`FrameDescriptor`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkId(u64);

impl WalkId {
    fn next() -> WalkId {
        WalkId(NEXT_WALK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WalkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "walk #{}", self.0)
    }
}

/// Errors encountered while walking a stack.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum WalkError {
    #[error("Unable to get the context of thread {thread_id}: {source}")]
    ContextUnavailable {
        thread_id: u64,
        source: ContextError,
    },
    #[error("Unwind failed: {0}")]
    UnwindFailed(#[from] UnwindError),
    #[error("Frame descriptor belongs to {found}, not {expected}")]
    InvalidHandle { expected: WalkId, found: WalkId },
    #[error("Unable to read transition record at {address:#x}: {source}")]
    MarkerUnreadable { address: u64, source: TargetError },
    #[error("Transition record at {address:#x} holds an invalid context: {source}")]
    MarkerContextInvalid { address: u64, source: ContextError },
    #[error("Walk exceeded {limit} frames")]
    FrameLimitExceeded { limit: usize },
}

impl WalkError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            WalkError::ContextUnavailable { .. } => "ContextUnavailable",
            WalkError::UnwindFailed(_) => "UnwindFailed",
            WalkError::InvalidHandle { .. } => "InvalidHandle",
            WalkError::MarkerUnreadable { .. } => "MarkerUnreadable",
            WalkError::MarkerContextInvalid { .. } => "MarkerContextInvalid",
            WalkError::FrameLimitExceeded { .. } => "FrameLimitExceeded",
        }
    }
}

/// Configuration for a [`StackWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerOptions {
    /// The most descriptors a single walk may produce before it is declared broken.
    ///
    /// A corrupt target can describe a cycle, in registers or in its transition
    /// records. `None` disables the limit.
    pub max_frames: Option<usize>,
}

impl WalkerOptions {
    /// No frame limit at all. Only safe on trusted targets.
    pub fn unbounded() -> WalkerOptions {
        WalkerOptions { max_frames: None }
    }

    pub fn with_max_frames(max_frames: usize) -> WalkerOptions {
        WalkerOptions {
            max_frames: Some(max_frames),
        }
    }
}

impl Default for WalkerOptions {
    fn default() -> Self {
        WalkerOptions {
            max_frames: Some(DEFAULT_MAX_FRAMES),
        }
    }
}

/// One frame of a walk.
///
/// This is an independent snapshot: nothing that happens to the walk afterwards can
/// change it.
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    walk: WalkId,
    context: PlatformContext,
    state: WalkState,
    frame_address: Option<u64>,
}

impl FrameDescriptor {
    /// The registers of this frame.
    pub fn context(&self) -> &PlatformContext {
        &self.context
    }

    /// The registers of this frame in their raw layout.
    pub fn context_bytes(&self) -> Vec<u8> {
        self.context.to_bytes()
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    /// The address of the transition record this frame came from.
    ///
    /// Only `Framed` and `SkippedFrame` descriptors have one.
    pub fn frame_address(&self) -> Option<u64> {
        self.frame_address
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.context.instruction_pointer()
    }

    pub fn stack_pointer(&self) -> u64 {
        self.context.stack_pointer()
    }

    /// The walk that produced this descriptor.
    pub fn walk_id(&self) -> WalkId {
        self.walk
    }
}

/// The mutable state of one walk.
#[derive(Debug)]
pub struct Cursor<'a> {
    context: PlatformContext,
    state: WalkState,
    frames: FrameIterator<'a>,
}

impl<'a> Cursor<'a> {
    pub fn new(context: PlatformContext, state: WalkState, frames: FrameIterator<'a>) -> Self {
        Cursor {
            context,
            state,
            frames,
        }
    }

    pub fn context(&self) -> &PlatformContext {
        &self.context
    }

    pub fn state(&self) -> WalkState {
        self.state
    }

    pub fn frames(&self) -> &FrameIterator<'a> {
        &self.frames
    }

    /// The current transition record's address, if the state makes it meaningful.
    pub fn frame_address(&self) -> Option<u64> {
        match self.state {
            WalkState::Framed | WalkState::SkippedFrame => self.frames.current_address(),
            _ => None,
        }
    }

    fn snapshot(&self, walk: WalkId) -> FrameDescriptor {
        FrameDescriptor {
            walk,
            context: self.context.clone(),
            state: self.state,
            frame_address: self.frame_address(),
        }
    }
}

/// Advance `cursor` by one step.
///
/// Terminal states are left alone. Any error moves the cursor to [`WalkState::Error`].
pub fn step(
    cursor: &mut Cursor<'_>,
    target: &dyn Target,
    locator: &dyn CodeLocator,
) -> Result<(), WalkError> {
    if cursor.state.is_terminal() {
        return Ok(());
    }
    let result = apply_step(cursor, target, locator);
    if result.is_err() {
        cursor.state = WalkState::Error;
    }
    result
}

fn apply_step(
    cursor: &mut Cursor<'_>,
    target: &dyn Target,
    locator: &dyn CodeLocator,
) -> Result<(), WalkError> {
    match cursor.state {
        WalkState::Frameless => {
            cursor.context.unwind_one_frame(target, locator)?;
        }
        WalkState::SkippedFrame => {
            cursor.frames.advance()?;
        }
        WalkState::Framed => {
            let before = registers_of_interest(&cursor.context);
            cursor.frames.apply_saved_context(&mut cursor.context)?;
            if !cursor.frames.is_active_transition()? {
                cursor.frames.advance()?;
            } else if registers_of_interest(&cursor.context) == before {
                // Applying the record again would reproduce this exact step.
                warn!(
                    "stackwalk: active transition record {:#x?} made no progress, moving past it",
                    cursor.frames.current_address()
                );
                cursor.frames.advance()?;
            }
        }
        WalkState::Complete | WalkState::Error => return Ok(()),
    }
    update_state(cursor, target, locator)
}

fn registers_of_interest(context: &PlatformContext) -> (u64, u64, u64) {
    (
        context.instruction_pointer(),
        context.stack_pointer(),
        context.frame_pointer(),
    )
}

/// Reclassify `cursor` after its context or transition records changed.
pub fn update_state(
    cursor: &mut Cursor<'_>,
    target: &dyn Target,
    locator: &dyn CodeLocator,
) -> Result<(), WalkError> {
    if cursor.state.is_terminal() {
        return Ok(());
    }

    let instruction = cursor.context.instruction_pointer();
    cursor.state = if locator.resolve(instruction).is_some() {
        if is_skipped_frame(cursor, target, locator)? {
            WalkState::SkippedFrame
        } else {
            WalkState::Frameless
        }
    } else if cursor.frames.is_valid() {
        WalkState::Framed
    } else {
        WalkState::Complete
    };
    trace!(
        "stackwalk: ip {:#x} sp {:#x} -> {}",
        instruction,
        cursor.context.stack_pointer(),
        cursor.state
    );
    Ok(())
}

/// Whether the current transition record lives in the part of the stack that unwinding
/// the current frame steps over.
///
/// A record exactly at the caller's stack pointer belongs to the caller and is not
/// skipped.
pub fn is_skipped_frame(
    cursor: &Cursor<'_>,
    target: &dyn Target,
    locator: &dyn CodeLocator,
) -> Result<bool, WalkError> {
    let Some(record) = cursor.frames.current_address() else {
        return Ok(false);
    };
    let mut caller = cursor.context.clone();
    caller.unwind_one_frame(target, locator)?;
    let skipped = record < caller.stack_pointer();
    if skipped {
        trace!(
            "stackwalk: record {:#x} is below caller sp {:#x}, skipping it",
            record,
            caller.stack_pointer()
        );
    }
    Ok(skipped)
}

/// Walks stacks of threads in one target.
pub struct StackWalker<'a> {
    target: &'a dyn Target,
    locator: &'a dyn CodeLocator,
    options: WalkerOptions,
}

impl<'a> StackWalker<'a> {
    pub fn new(target: &'a dyn Target, locator: &'a dyn CodeLocator) -> StackWalker<'a> {
        Self::with_options(target, locator, WalkerOptions::default())
    }

    pub fn with_options(
        target: &'a dyn Target,
        locator: &'a dyn CodeLocator,
        options: WalkerOptions,
    ) -> StackWalker<'a> {
        StackWalker {
            target,
            locator,
            options,
        }
    }

    pub fn options(&self) -> &WalkerOptions {
        &self.options
    }

    /// Start walking `thread`.
    ///
    /// Fails only if the thread's context can't be fetched or decoded. Nothing is unwound
    /// and no transition record is read until the walk is pulled.
    pub fn walk(&self, thread: &ThreadData) -> Result<StackWalk<'a>, WalkError> {
        let arch = self.target.architecture();
        let thread_id = thread.os_id;
        let context = self
            .target
            .get_thread_context(thread_id, PlatformContext::default_context_flags(arch))
            .map_err(ContextError::from)
            .and_then(|bytes| PlatformContext::from_bytes(arch, &bytes))
            .map_err(|source| WalkError::ContextUnavailable { thread_id, source })?;

        let state = if self.locator.resolve(context.instruction_pointer()).is_some() {
            WalkState::Frameless
        } else {
            WalkState::Framed
        };
        let frames = FrameIterator::new(self.target, thread.frame_head);

        let mut cursor = Cursor::new(context, state, frames);
        if cursor.state == WalkState::Framed && !cursor.frames.is_valid() {
            debug!(
                "stackwalk: thread {} is outside compiled code with no transition records",
                thread_id
            );
            cursor.state = WalkState::Complete;
        }

        let id = WalkId::next();
        debug!("stackwalk: {} of thread {} starts {}", id, thread_id, cursor.state);
        Ok(StackWalk {
            id,
            target: self.target,
            locator: self.locator,
            max_frames: self.options.max_frames,
            cursor,
            yielded: 0,
            started: false,
        })
    }

    /// Walk `thread` to the end, collecting everything it produces.
    pub fn walk_stack(&self, thread: &ThreadData) -> CallStack {
        let mut frames = vec![];
        let mut error = None;
        match self.walk(thread) {
            Ok(walk) => {
                for frame in walk {
                    match frame {
                        Ok(frame) => frames.push(frame),
                        Err(e) => error = Some(e),
                    }
                }
            }
            Err(e) => error = Some(e),
        }
        CallStack {
            thread_id: thread.os_id,
            frames,
            error,
        }
    }

    /// Name the kind of transition record at `address`, for diagnostics.
    pub fn frame_name(&self, address: u64) -> String {
        FrameIterator::lookup_name(self.target, address)
    }
}

impl fmt::Debug for StackWalker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackWalker")
            .field("arch", &self.target.architecture())
            .field("options", &self.options)
            .finish()
    }
}

/// A walk in progress.
///
/// Each pull produces the next frame, the error that ended the walk (once), or `None`
/// once the walk has ended.
pub struct StackWalk<'a> {
    id: WalkId,
    target: &'a dyn Target,
    locator: &'a dyn CodeLocator,
    max_frames: Option<usize>,
    cursor: Cursor<'a>,
    yielded: usize,
    started: bool,
}

impl<'a> StackWalk<'a> {
    pub fn id(&self) -> WalkId {
        self.id
    }

    pub fn state(&self) -> WalkState {
        self.cursor.state
    }

    pub fn cursor(&self) -> &Cursor<'a> {
        &self.cursor
    }

    /// The raw context of a descriptor this walk produced.
    pub fn raw_context(&self, frame: &FrameDescriptor) -> Result<Vec<u8>, WalkError> {
        self.check_handle(frame)?;
        Ok(frame.context_bytes())
    }

    /// The transition record address of a descriptor this walk produced.
    pub fn frame_address(&self, frame: &FrameDescriptor) -> Result<Option<u64>, WalkError> {
        self.check_handle(frame)?;
        Ok(frame.frame_address())
    }

    /// The kind of transition record a descriptor this walk produced came from.
    pub fn frame_kind(&self, frame: &FrameDescriptor) -> Result<Option<FrameKind>, WalkError> {
        let address = self.frame_address(frame)?;
        Ok(address.and_then(|address| FrameIterator::lookup_kind(self.target, address)))
    }

    fn check_handle(&self, frame: &FrameDescriptor) -> Result<(), WalkError> {
        if frame.walk != self.id {
            return Err(WalkError::InvalidHandle {
                expected: self.id,
                found: frame.walk,
            });
        }
        Ok(())
    }

    fn produce(&mut self) -> Option<Result<FrameDescriptor, WalkError>> {
        if let Some(limit) = self.max_frames {
            if self.yielded >= limit {
                warn!("stackwalk: {} hit the frame limit of {}", self.id, limit);
                self.cursor.state = WalkState::Error;
                return Some(Err(WalkError::FrameLimitExceeded { limit }));
            }
        }
        self.yielded += 1;
        Some(Ok(self.cursor.snapshot(self.id)))
    }
}

impl Iterator for StackWalk<'_> {
    type Item = Result<FrameDescriptor, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if self.cursor.state.is_terminal() {
                return None;
            }
            return self.produce();
        }

        if self.cursor.state.is_terminal() {
            return None;
        }
        if let Err(e) = step(&mut self.cursor, self.target, self.locator) {
            debug!("stackwalk: {} failed: {}", self.id, e);
            return Some(Err(e));
        }
        if self.cursor.state.is_terminal() {
            debug!("stackwalk: {} complete after {} frames", self.id, self.yielded);
            return None;
        }
        self.produce()
    }
}

impl fmt::Debug for StackWalk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackWalk")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("yielded", &self.yielded)
            .finish()
    }
}

/// Everything one walk produced.
#[derive(Debug, Clone)]
pub struct CallStack {
    pub thread_id: u64,
    /// The frames, outermost first.
    pub frames: Vec<FrameDescriptor>,
    /// Why the walk stopped early, if it did.
    pub error: Option<WalkError>,
}

#[cfg(test)]
mod amd64_unittest;
#[cfg(test)]
mod arm64_unittest;
