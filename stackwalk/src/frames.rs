//! The runtime's per-thread list of transition records.
//!
//! Whenever control moves between compiled code and the runtime's own native code, the
//! runtime pushes a record onto a singly linked list hanging off the thread. Every record
//! starts with the same two pointer-sized fields:
//!
//! | offset | field |
//! |---|---|
//! | 0 | identifier, a per-kind tag |
//! | P | address of the next record, or [`FRAME_TOP`] |
//!
//! followed by a kind-specific payload. Identifiers are matched against the runtime
//! globals named `<Kind>Identifier` to recover the [`FrameKind`].

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::context::PlatformContext;
use crate::stackwalker::WalkError;
use crate::target::Target;

/// The value that terminates a thread's record list.
pub const FRAME_TOP: u64 = u64::MAX;

/// The kinds of transition records the walker knows how to restore a context from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A call to native code inlined into a compiled method.
    ///
    /// Payload: call site stack pointer, caller return address, callee saved frame
    /// pointer. The record is active while the return address is nonzero.
    InlinedCallFrame,
    /// Payload: pointer to a full saved context.
    ResumableFrame,
    /// Payload: pointer to a full saved context.
    RedirectedThreadFrame,
    /// Payload: a full saved context, stored inline.
    FaultingExceptionFrame,
    /// Payload: a full saved context, stored inline.
    SoftwareExceptionFrame,
    /// Payload: pointer to a transition block.
    FramedMethodFrame,
    PInvokeCalleeFrame,
    PrestubMethodFrame,
    StubDispatchFrame,
    ExternalMethodFrame,
    CallCountingHelperFrame,
    DynamicHelperFrame,
    /// An identifier that matches none of the runtime's globals.
    Unknown,
}

const KNOWN_KINDS: &[(FrameKind, &str)] = &[
    (FrameKind::InlinedCallFrame, "InlinedCallFrameIdentifier"),
    (FrameKind::ResumableFrame, "ResumableFrameIdentifier"),
    (FrameKind::RedirectedThreadFrame, "RedirectedThreadFrameIdentifier"),
    (FrameKind::FaultingExceptionFrame, "FaultingExceptionFrameIdentifier"),
    (FrameKind::SoftwareExceptionFrame, "SoftwareExceptionFrameIdentifier"),
    (FrameKind::FramedMethodFrame, "FramedMethodFrameIdentifier"),
    (FrameKind::PInvokeCalleeFrame, "PInvokeCalleeFrameIdentifier"),
    (FrameKind::PrestubMethodFrame, "PrestubMethodFrameIdentifier"),
    (FrameKind::StubDispatchFrame, "StubDispatchFrameIdentifier"),
    (FrameKind::ExternalMethodFrame, "ExternalMethodFrameIdentifier"),
    (FrameKind::CallCountingHelperFrame, "CallCountingHelperFrameIdentifier"),
    (FrameKind::DynamicHelperFrame, "DynamicHelperFrameIdentifier"),
];

impl FrameKind {
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::InlinedCallFrame => "InlinedCallFrame",
            FrameKind::ResumableFrame => "ResumableFrame",
            FrameKind::RedirectedThreadFrame => "RedirectedThreadFrame",
            FrameKind::FaultingExceptionFrame => "FaultingExceptionFrame",
            FrameKind::SoftwareExceptionFrame => "SoftwareExceptionFrame",
            FrameKind::FramedMethodFrame => "FramedMethodFrame",
            FrameKind::PInvokeCalleeFrame => "PInvokeCalleeFrame",
            FrameKind::PrestubMethodFrame => "PrestubMethodFrame",
            FrameKind::StubDispatchFrame => "StubDispatchFrame",
            FrameKind::ExternalMethodFrame => "ExternalMethodFrame",
            FrameKind::CallCountingHelperFrame => "CallCountingHelperFrame",
            FrameKind::DynamicHelperFrame => "DynamicHelperFrame",
            FrameKind::Unknown => "Unknown",
        }
    }

    /// The name of the runtime global holding this kind's identifier.
    pub fn identifier_global(self) -> Option<&'static str> {
        KNOWN_KINDS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, global)| *global)
    }

    /// Build the identifier to kind table from the target's runtime globals.
    ///
    /// Kinds whose global is missing are left out, so their records read as `Unknown`.
    pub fn resolve_identifiers(target: &dyn Target) -> HashMap<u64, FrameKind> {
        let mut kinds = HashMap::with_capacity(KNOWN_KINDS.len());
        for &(kind, global) in KNOWN_KINDS {
            match target.read_global(global) {
                Some(identifier) => {
                    kinds.insert(identifier, kind);
                }
                None => debug!("frames: target has no {}", global),
            }
        }
        kinds
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The header of one transition record, as read from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerRecord {
    /// Where the record lives in target memory.
    pub address: u64,
    pub identifier: u64,
    pub next: u64,
    pub kind: FrameKind,
}

fn is_terminator(address: u64) -> bool {
    address == FRAME_TOP || address == 0
}

/// A forward-only cursor over a thread's transition records.
///
/// Only the current record's address is held. Its contents are read from the target
/// when a step needs them, so a list whose records can't be read still reports where
/// it is.
#[derive(Clone)]
pub struct FrameIterator<'a> {
    target: &'a dyn Target,
    kinds: HashMap<u64, FrameKind>,
    current: Option<u64>,
}

impl<'a> FrameIterator<'a> {
    /// Start iterating at the record at `head`. Nothing is read yet.
    pub fn new(target: &'a dyn Target, head: u64) -> FrameIterator<'a> {
        FrameIterator {
            target,
            kinds: FrameKind::resolve_identifiers(target),
            current: (!is_terminator(head)).then_some(head),
        }
    }

    /// Whether there is a current record.
    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    /// Read the current record's header.
    pub fn current(&self) -> Result<Option<MarkerRecord>, WalkError> {
        self.current
            .map(|address| self.read_record(address))
            .transpose()
    }

    /// The current record's own address.
    pub fn current_address(&self) -> Option<u64> {
        self.current
    }

    pub fn current_kind(&self) -> Result<Option<FrameKind>, WalkError> {
        Ok(self.current()?.map(|record| record.kind))
    }

    /// Move to the next record. Does nothing once the list is exhausted.
    pub fn advance(&mut self) -> Result<(), WalkError> {
        if let Some(record) = self.current()? {
            self.current = (!is_terminator(record.next)).then_some(record.next);
            trace!(
                "frames: advanced past {:#x} to {:?}",
                record.address,
                self.current
            );
        }
        Ok(())
    }

    /// Overlay the current record's saved registers onto `context`.
    ///
    /// Records that don't save anything (unknown kinds, inactive inlined calls) leave
    /// `context` as it is, as does an exhausted iterator.
    pub fn apply_saved_context(&self, context: &mut PlatformContext) -> Result<(), WalkError> {
        let Some(record) = self.current()? else {
            return Ok(());
        };
        let pointer_size = self.target.architecture().pointer_size();
        let payload = record.address.wrapping_add(2 * pointer_size);

        match record.kind {
            FrameKind::InlinedCallFrame => {
                let return_address = self.read_field(&record, 3)?;
                if return_address == 0 {
                    trace!("frames: {:#x} is an inactive inlined call", record.address);
                    return Ok(());
                }
                let call_site_sp = self.read_field(&record, 2)?;
                let callee_saved_fp = self.read_field(&record, 4)?;
                context.set_instruction_pointer(return_address);
                context.set_stack_pointer(call_site_sp);
                context.set_frame_pointer(callee_saved_fp);
            }
            FrameKind::ResumableFrame | FrameKind::RedirectedThreadFrame => {
                let saved = self.read_field(&record, 2)?;
                *context = self.read_saved_context(&record, saved, context)?;
            }
            FrameKind::FaultingExceptionFrame | FrameKind::SoftwareExceptionFrame => {
                *context = self.read_saved_context(&record, payload, context)?;
            }
            FrameKind::FramedMethodFrame
            | FrameKind::PInvokeCalleeFrame
            | FrameKind::PrestubMethodFrame
            | FrameKind::StubDispatchFrame
            | FrameKind::ExternalMethodFrame
            | FrameKind::CallCountingHelperFrame
            | FrameKind::DynamicHelperFrame => {
                let block = self.read_field(&record, 2)?;
                let saved_fp = self.read_at(&record, block)?;
                let return_address = self.read_at(&record, block.wrapping_add(pointer_size))?;
                context.set_instruction_pointer(return_address);
                context.set_frame_pointer(saved_fp);
                context.set_stack_pointer(block.wrapping_add(2 * pointer_size));
            }
            FrameKind::Unknown => {
                debug!(
                    "frames: record {:#x} has unknown identifier {:#x}",
                    record.address, record.identifier
                );
            }
        }
        Ok(())
    }

    /// Whether the current record is a transition that is still in progress, so the
    /// iterator should stay on it.
    pub fn is_active_transition(&self) -> Result<bool, WalkError> {
        match self.current()? {
            Some(record) if record.kind == FrameKind::InlinedCallFrame => {
                Ok(self.read_field(&record, 3)? != 0)
            }
            _ => Ok(false),
        }
    }

    /// Name the kind of the record at `address`, for diagnostics.
    ///
    /// Never fails: an unrecognized identifier gives `"Unknown"` and a record that can't
    /// be read gives `"Unreadable"`.
    pub fn lookup_name(target: &dyn Target, address: u64) -> String {
        match Self::lookup_kind(target, address) {
            Some(kind) => kind.name().to_owned(),
            None => String::from("Unreadable"),
        }
    }

    /// The kind of the record at `address`, or `None` if it can't be read.
    pub fn lookup_kind(target: &dyn Target, address: u64) -> Option<FrameKind> {
        let identifier = target.read_pointer(address).ok()?;
        let kind = FrameKind::resolve_identifiers(target)
            .get(&identifier)
            .copied()
            .unwrap_or(FrameKind::Unknown);
        Some(kind)
    }

    fn read_record(&self, address: u64) -> Result<MarkerRecord, WalkError> {
        let pointer_size = self.target.architecture().pointer_size();
        let read = |offset: u64| {
            self.target
                .read_pointer(address.wrapping_add(offset))
                .map_err(|source| WalkError::MarkerUnreadable { address, source })
        };
        let identifier = read(0)?;
        let next = read(pointer_size)?;
        let kind = self
            .kinds
            .get(&identifier)
            .copied()
            .unwrap_or(FrameKind::Unknown);
        trace!(
            "frames: record {:#x} is {} (next {:#x})",
            address,
            kind,
            next
        );
        Ok(MarkerRecord {
            address,
            identifier,
            next,
            kind,
        })
    }

    /// Read the `index`th pointer-sized field of `record`.
    fn read_field(&self, record: &MarkerRecord, index: u64) -> Result<u64, WalkError> {
        let pointer_size = self.target.architecture().pointer_size();
        self.read_at(record, record.address.wrapping_add(index * pointer_size))
    }

    fn read_at(&self, record: &MarkerRecord, address: u64) -> Result<u64, WalkError> {
        self.target
            .read_pointer(address)
            .map_err(|source| WalkError::MarkerUnreadable {
                address: record.address,
                source,
            })
    }

    fn read_saved_context(
        &self,
        record: &MarkerRecord,
        address: u64,
        like: &PlatformContext,
    ) -> Result<PlatformContext, WalkError> {
        let arch = like.architecture();
        let bytes = self
            .target
            .read_memory(address, PlatformContext::size(arch))
            .map_err(|source| WalkError::MarkerUnreadable {
                address: record.address,
                source,
            })?;
        PlatformContext::from_bytes(arch, &bytes).map_err(|source| {
            WalkError::MarkerContextInvalid {
                address: record.address,
                source,
            }
        })
    }
}

impl fmt::Debug for FrameIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameIterator")
            .field("current", &self.current)
            .field("known_kinds", &self.kinds.len())
            .finish()
    }
}
