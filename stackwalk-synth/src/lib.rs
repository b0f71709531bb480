// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic Targets for Testing
//!
//! This intentionally doesn't use stackwalk-common's layouts so that we can catch
//! incorrect changes to stackwalk-common itself. It exists primarily as an internal
//! dev-dependency of stackwalk.
//!
//! Basic usage is to build a stack [`Section`] with a fixed start address, lay out
//! frames and runtime transition records in it with the [`SynthFrames`] methods, and
//! then hand the finished bytes plus a context from [`amd64_context`] or
//! [`arm64_context`] to an in-memory target.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::mem;
use test_assembler::*;

/// The value that terminates a thread's transition record list.
pub const FRAME_TOP: u64 = u64::MAX;

/// Identifier values the synthetic runtime stamps into each record kind.
///
/// These are arbitrary, they only need to be distinct and to match what
/// [`runtime_globals`] publishes.
pub mod identifiers {
    pub const INLINED_CALL_FRAME: u64 = 0x7ff6_1000_0100;
    pub const RESUMABLE_FRAME: u64 = 0x7ff6_1000_0200;
    pub const REDIRECTED_THREAD_FRAME: u64 = 0x7ff6_1000_0300;
    pub const FAULTING_EXCEPTION_FRAME: u64 = 0x7ff6_1000_0400;
    pub const SOFTWARE_EXCEPTION_FRAME: u64 = 0x7ff6_1000_0500;
    pub const FRAMED_METHOD_FRAME: u64 = 0x7ff6_1000_0600;
    pub const PINVOKE_CALLEE_FRAME: u64 = 0x7ff6_1000_0700;
    pub const PRESTUB_METHOD_FRAME: u64 = 0x7ff6_1000_0800;
    pub const STUB_DISPATCH_FRAME: u64 = 0x7ff6_1000_0900;
    pub const EXTERNAL_METHOD_FRAME: u64 = 0x7ff6_1000_0a00;
    pub const CALL_COUNTING_HELPER_FRAME: u64 = 0x7ff6_1000_0b00;
    pub const DYNAMIC_HELPER_FRAME: u64 = 0x7ff6_1000_0c00;
}

/// The runtime globals a target has to expose so that record identifiers can be
/// mapped back to record kinds.
pub fn runtime_globals() -> Vec<(&'static str, u64)> {
    use identifiers::*;
    vec![
        ("InlinedCallFrameIdentifier", INLINED_CALL_FRAME),
        ("ResumableFrameIdentifier", RESUMABLE_FRAME),
        ("RedirectedThreadFrameIdentifier", REDIRECTED_THREAD_FRAME),
        ("FaultingExceptionFrameIdentifier", FAULTING_EXCEPTION_FRAME),
        ("SoftwareExceptionFrameIdentifier", SOFTWARE_EXCEPTION_FRAME),
        ("FramedMethodFrameIdentifier", FRAMED_METHOD_FRAME),
        ("PInvokeCalleeFrameIdentifier", PINVOKE_CALLEE_FRAME),
        ("PrestubMethodFrameIdentifier", PRESTUB_METHOD_FRAME),
        ("StubDispatchFrameIdentifier", STUB_DISPATCH_FRAME),
        ("ExternalMethodFrameIdentifier", EXTERNAL_METHOD_FRAME),
        ("CallCountingHelperFrameIdentifier", CALL_COUNTING_HELPER_FRAME),
        ("DynamicHelperFrameIdentifier", DYNAMIC_HELPER_FRAME),
    ]
}

/// Populate a `CONTEXT_AMD64` struct with the given `endian`, `rip`, `rsp` and `rbp`.
pub fn amd64_context(endian: Endian, rip: u64, rsp: u64, rbp: u64) -> Section {
    let section = Section::with_endian(endian)
        .append_repeated(0, mem::size_of::<u64>() * 6) // p[1-6]_home
        .D32(0x10000b) // context_flags: CONTEXT_FULL
        .D32(0) // mx_csr
        .append_repeated(0, mem::size_of::<u16>() * 6) // cs,ds,es,fs,gs,ss
        .D32(0) // eflags
        .append_repeated(0, mem::size_of::<u64>() * 6) // dr0,1,2,3,6,7
        .append_repeated(0, mem::size_of::<u64>() * 4) // rax,rcx,rdx,rbx
        .D64(rsp)
        .D64(rbp)
        .append_repeated(0, mem::size_of::<u64>() * 10) // rsi-r15
        .D64(rip)
        .append_repeated(0, 512) // float_save
        .append_repeated(0, mem::size_of::<u128>() * 26) // vector_register
        .append_repeated(0, mem::size_of::<u64>() * 6); // trailing stuff
    assert_eq!(section.size(), 1232);
    section
}

/// Populate a WinNT.h `CONTEXT` for ARM64 with the given `endian`, `pc`, `sp`, `fp` and `lr`.
pub fn arm64_context(endian: Endian, pc: u64, sp: u64, fp: u64, lr: u64) -> Section {
    let section = Section::with_endian(endian)
        .D32(0x400007) // context_flags: CONTEXT_FULL
        .D32(0) // cpsr
        .append_repeated(0, mem::size_of::<u64>() * 29) // x0-x28
        .D64(fp)
        .D64(lr)
        .D64(sp)
        .D64(pc)
        .append_repeated(0, mem::size_of::<u128>() * 32) // v0-v31
        .D32(0) // fpcr
        .D32(0) // fpsr
        .append_repeated(0, mem::size_of::<u32>() * 8) // bcr
        .append_repeated(0, mem::size_of::<u64>() * 8) // bvr
        .append_repeated(0, mem::size_of::<u32>() * 2) // wcr
        .append_repeated(0, mem::size_of::<u64>() * 2); // wvr
    assert_eq!(section.size(), 912);
    section
}

/// Get the contents of a finished section as `(start address, bytes)`.
///
/// Panics if the section's start or any label it references is undefined.
pub fn section_bytes(section: Section) -> (u64, Vec<u8>) {
    let base = section.start().value().unwrap();
    let bytes = section.get_contents().unwrap();
    (base, bytes)
}

/// A pointer-sized field value: either a constant or a label resolved when the
/// section is finished.
#[derive(Clone, Copy)]
pub enum SynthValue<'a> {
    Const(u64),
    Label(&'a Label),
}

impl From<u64> for SynthValue<'_> {
    fn from(value: u64) -> Self {
        SynthValue::Const(value)
    }
}

impl<'a> From<&'a Label> for SynthValue<'a> {
    fn from(label: &'a Label) -> Self {
        SynthValue::Label(label)
    }
}

fn put<'a>(section: Section, value: impl Into<SynthValue<'a>>) -> Section {
    match value.into() {
        SynthValue::Const(value) => section.D64(value),
        SynthValue::Label(label) => section.D64(label),
    }
}

/// Builders for the runtime's transition records, laid out in place on a stack section.
///
/// Every record starts with its kind identifier followed by the address of the next
/// record (or [`FRAME_TOP`]). Callers `mark` the record's own address before appending it.
pub trait SynthFrames: Sized {
    /// Append a record header with an arbitrary `identifier`.
    fn record_header<'a>(self, identifier: u64, next: impl Into<SynthValue<'a>>) -> Self;

    /// Append an `InlinedCallFrame`. A zero `caller_return_address` marks it inactive.
    fn inlined_call_frame<'a>(
        self,
        next: impl Into<SynthValue<'a>>,
        call_site_sp: impl Into<SynthValue<'a>>,
        caller_return_address: u64,
        callee_saved_fp: impl Into<SynthValue<'a>>,
    ) -> Self;

    /// Append a record whose payload is a pointer to a saved register context.
    fn context_pointer_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        saved_context: impl Into<SynthValue<'a>>,
    ) -> Self;

    /// Append a record that carries its saved register context inline.
    fn inline_context_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        context: Section,
    ) -> Self;

    /// Append a record whose payload points at a transition block.
    fn transition_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        transition_block: impl Into<SynthValue<'a>>,
    ) -> Self;

    /// Append a transition block: the saved frame pointer and the return address.
    fn transition_block<'a>(self, saved_fp: impl Into<SynthValue<'a>>, return_address: u64) -> Self;
}

impl SynthFrames for Section {
    fn record_header<'a>(self, identifier: u64, next: impl Into<SynthValue<'a>>) -> Self {
        put(self.D64(identifier), next)
    }

    fn inlined_call_frame<'a>(
        self,
        next: impl Into<SynthValue<'a>>,
        call_site_sp: impl Into<SynthValue<'a>>,
        caller_return_address: u64,
        callee_saved_fp: impl Into<SynthValue<'a>>,
    ) -> Self {
        let section = self.record_header(identifiers::INLINED_CALL_FRAME, next);
        let section = put(section, call_site_sp).D64(caller_return_address);
        put(section, callee_saved_fp)
    }

    fn context_pointer_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        saved_context: impl Into<SynthValue<'a>>,
    ) -> Self {
        put(self.record_header(identifier, next), saved_context)
    }

    fn inline_context_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        context: Section,
    ) -> Self {
        self.record_header(identifier, next).append_section(context)
    }

    fn transition_frame<'a>(
        self,
        identifier: u64,
        next: impl Into<SynthValue<'a>>,
        transition_block: impl Into<SynthValue<'a>>,
    ) -> Self {
        put(self.record_header(identifier, next), transition_block)
    }

    fn transition_block<'a>(self, saved_fp: impl Into<SynthValue<'a>>, return_address: u64) -> Self {
        put(self, saved_fp).D64(return_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_inlined_call_frame_layout() {
        let record = Label::new();
        let section = Section::with_endian(Endian::Little);
        section.start().set_const(0x1000);
        let section = section
            .mark(&record)
            .inlined_call_frame(FRAME_TOP, 0x2000u64, 0x3000, 0x4000u64);
        let (base, bytes) = section_bytes(section);
        assert_eq!(base, 0x1000);
        assert_eq!(record.value().unwrap(), 0x1000);
        assert_eq!(bytes.len(), 40);
        assert_eq!(
            &bytes[..8],
            &identifiers::INLINED_CALL_FRAME.to_le_bytes()[..]
        );
        assert_eq!(&bytes[8..16], &FRAME_TOP.to_le_bytes()[..]);
        assert_eq!(&bytes[24..32], &0x3000u64.to_le_bytes()[..]);
    }

    #[test]
    fn test_context_sizes() {
        assert_eq!(amd64_context(Endian::Little, 1, 2, 3).size(), 1232);
        assert_eq!(arm64_context(Endian::Little, 1, 2, 3, 4).size(), 912);
    }
}
