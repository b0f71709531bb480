// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::*;
use stackwalk_common::format::{Arm64RegisterNumbers, CONTEXT_ARM64};
use stackwalk_synth::{arm64_context, identifiers, runtime_globals, section_bytes, SynthFrames};
use test_assembler::*;

const MODULE1: u64 = 0x40000000;
const MODULE2: u64 = 0x50000000;
const NATIVE: u64 = 0x30000;
const THREAD_ID: u64 = 7;

struct TestFixture {
    pub raw: CONTEXT_ARM64,
    pub regions: Vec<CodeRegionHandle>,
    pub frame_head: u64,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        let _ = env_logger::builder().is_test(true).try_init();
        TestFixture {
            raw: CONTEXT_ARM64::default(),
            regions: vec![
                CodeRegionHandle::new(MODULE1, 0x10000, UnwindInfo::FramePointer),
                // stp fp, lr, [sp, #0x10]; caller sp = sp + 0x20
                CodeRegionHandle::new(
                    MODULE2,
                    0x10000,
                    UnwindInfo::FixedFrame {
                        frame_size: 0x20,
                        return_address_offset: 0x18,
                        saved_fp_offset: Some(0x10),
                    },
                ),
            ],
            frame_head: FRAME_TOP,
        }
    }

    pub fn set_fp(&mut self, fp: u64) {
        self.raw.iregs[Arm64RegisterNumbers::FramePointer as usize] = fp;
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let (base, bytes) = section_bytes(stack);
        let context = PlatformContext::Arm64(self.raw.clone());
        let target = MemoryTarget::new(Architecture::Arm64)
            .with_memory(base, bytes)
            .with_thread_context(THREAD_ID, context.to_bytes())
            .with_globals(runtime_globals());
        let locator = CodeRegionMap::from_regions(self.regions.clone());
        StackWalker::new(&target, &locator)
            .walk_stack(&ThreadData::new(THREAD_ID, self.frame_head))
    }
}

#[test]
fn test_frame_records() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000);

    let frame0_fp = Label::new();
    let frame1_sp = Label::new();
    let frame2_fp = Label::new();
    let stack = stack
        .append_repeated(0, 16)
        // frame 0's frame record
        .mark(&frame0_fp)
        .D64(0x12345678u64) // x29 of frame 1, which doesn't use it
        .D64(MODULE2 + 0x10) // return address
        // frame 1: fixed 0x20 byte frame
        .mark(&frame1_sp)
        .append_repeated(0, 0x10)
        .D64(&frame2_fp) // saved fp
        .D64(NATIVE) // saved lr
        .mark(&frame2_fp);

    f.raw.pc = MODULE1 + 0x40;
    f.raw.sp = 0x80000;
    f.set_fp(frame0_fp.value().unwrap());

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(s.frames.len(), 2);

    {
        let f0 = &s.frames[0];
        assert_eq!(f0.state(), WalkState::Frameless);
        assert_eq!(f0.instruction_pointer(), MODULE1 + 0x40);
    }

    {
        let f1 = &s.frames[1];
        assert_eq!(f1.state(), WalkState::Frameless);
        assert_eq!(f1.instruction_pointer(), MODULE2 + 0x10);
        assert_eq!(f1.context().get_register("lr"), Some(MODULE2 + 0x10));
        assert_eq!(f1.stack_pointer(), frame1_sp.value().unwrap());
        assert_eq!(f1.context().frame_pointer(), 0x12345678);
    }
}

#[test]
fn test_resumable_frame_restores_whole_context() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000);

    let record = Label::new();
    let saved = Label::new();
    let frame_fp = Label::new();
    let stack = stack
        .mark(&record)
        .context_pointer_frame(identifiers::RESUMABLE_FRAME, FRAME_TOP, &saved)
        .mark(&frame_fp)
        .D64(0)
        .D64(0)
        .mark(&saved)
        .append_section(arm64_context(
            Endian::Little,
            MODULE1 + 0x20,
            0x80000,
            0x80018,
            0,
        ));

    f.raw.pc = NATIVE + 0x44;
    f.raw.sp = 0x70000;
    f.frame_head = record.value().unwrap();
    assert_eq!(frame_fp.value().unwrap(), 0x80018);

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(s.frames.len(), 2);

    let f0 = &s.frames[0];
    assert_eq!(f0.state(), WalkState::Framed);
    assert_eq!(f0.instruction_pointer(), NATIVE + 0x44);
    assert_eq!(f0.frame_address(), Some(0x80000));

    let f1 = &s.frames[1];
    assert_eq!(f1.state(), WalkState::Frameless);
    let expected = arm64_context(Endian::Little, MODULE1 + 0x20, 0x80000, 0x80018, 0)
        .get_contents()
        .unwrap();
    assert_eq!(f1.context_bytes(), expected);
}

#[test]
fn test_unreadable_saved_context() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000);
    let stack = stack.context_pointer_frame(
        identifiers::REDIRECTED_THREAD_FRAME,
        FRAME_TOP,
        0x10000u64,
    );

    f.raw.pc = NATIVE;
    f.frame_head = 0x80000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    assert_eq!(s.frames[0].state(), WalkState::Framed);
    assert!(matches!(
        s.error,
        Some(WalkError::MarkerUnreadable {
            address: 0x80000,
            source: TargetError::Unreadable {
                address: 0x10000,
                ..
            }
        })
    ));
}

#[test]
fn test_mismatched_saved_context() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000);
    // An amd64 tag where an arm64 context belongs.
    let bogus = Section::with_endian(Endian::Little)
        .D32(0x0010000b)
        .append_repeated(0, 908);
    let stack = stack.inline_context_frame(identifiers::SOFTWARE_EXCEPTION_FRAME, FRAME_TOP, bogus);

    f.raw.pc = NATIVE;
    f.frame_head = 0x80000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    assert_eq!(
        s.error.as_ref().map(WalkError::name),
        Some("MarkerContextInvalid")
    );
}
