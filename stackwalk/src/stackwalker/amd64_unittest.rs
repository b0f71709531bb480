// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use crate::*;
use stackwalk_common::format::CONTEXT_AMD64;
use stackwalk_synth::{identifiers, runtime_globals, section_bytes, SynthFrames};
use test_assembler::*;

const MODULE1: u64 = 0x00007400c0000000;
const MODULE2: u64 = 0x00007500b0000000;
const LEAF: u64 = 0x00007600a0000000;
const NO_INFO: u64 = 0x00007700a0000000;
const NATIVE: u64 = 0x0000000000401000;
const THREAD_ID: u64 = 1;

struct TestFixture {
    pub raw: CONTEXT_AMD64,
    pub regions: Vec<CodeRegionHandle>,
    pub frame_head: u64,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        let _ = env_logger::builder().is_test(true).try_init();
        TestFixture {
            raw: CONTEXT_AMD64::default(),
            // Give the code regions reasonable standard locations for tests to play with.
            regions: vec![
                CodeRegionHandle::new(MODULE1, 0x10000, UnwindInfo::FramePointer),
                CodeRegionHandle::new(MODULE2, 0x10000, UnwindInfo::FramePointer),
                CodeRegionHandle::new(
                    LEAF,
                    0x1000,
                    UnwindInfo::FixedFrame {
                        frame_size: 0x18,
                        return_address_offset: 0x10,
                        saved_fp_offset: None,
                    },
                ),
                CodeRegionHandle::new(NO_INFO, 0x1000, UnwindInfo::Unavailable),
            ],
            frame_head: FRAME_TOP,
        }
    }

    pub fn target(&self, stack: Section) -> MemoryTarget {
        let (base, bytes) = section_bytes(stack);
        let context = PlatformContext::Amd64(self.raw.clone());
        MemoryTarget::new(Architecture::Amd64)
            .with_memory(base, bytes)
            .with_thread_context(THREAD_ID, context.to_bytes())
            .with_globals(runtime_globals())
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let target = self.target(stack);
        let locator = CodeRegionMap::from_regions(self.regions.clone());
        StackWalker::new(&target, &locator)
            .walk_stack(&ThreadData::new(THREAD_ID, self.frame_head))
    }
}

fn states(s: &CallStack) -> Vec<WalkState> {
    s.frames.iter().map(|f| f.state()).collect()
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let frame0_rbp = Label::new();
    let stack = stack
        .append_repeated(0, 16)
        .mark(&frame0_rbp)
        .D64(0) // caller's %rbp
        .D64(NATIVE); // return into native code

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(s.frames.len(), 1);
    let f0 = &s.frames[0];
    assert_eq!(f0.state(), WalkState::Frameless);
    assert_eq!(f0.instruction_pointer(), MODULE1 + 0x200);
    assert_eq!(f0.frame_address(), None);
}

#[test]
fn test_caller_pushed_rbp() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    let stack_start = 0x80000000;
    let return_address = MODULE2 + 0x110;
    stack.start().set_const(stack_start);

    let frame0_rbp = Label::new();
    let frame1_sp = Label::new();
    let frame1_rbp = Label::new();

    stack = stack
        // frame 0
        .append_repeated(0, 16) // space
        .mark(&frame0_rbp)
        .D64(&frame1_rbp) // caller-pushed %rbp
        .D64(return_address) // actual return address
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(0, 32) // body of frame1
        .mark(&frame1_rbp)
        .D64(0)
        .D64(NATIVE);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(s.frames.len(), 2);

    {
        // To avoid reusing locals by mistake
        let f0 = &s.frames[0];
        assert_eq!(f0.state(), WalkState::Frameless);
        assert_eq!(f0.context().frame_pointer(), frame0_rbp.value().unwrap());
    }

    {
        let f1 = &s.frames[1];
        assert_eq!(f1.state(), WalkState::Frameless);
        assert_eq!(f1.instruction_pointer(), return_address);
        assert_eq!(f1.stack_pointer(), frame1_sp.value().unwrap());
        assert_eq!(f1.context().frame_pointer(), frame1_rbp.value().unwrap());
    }
}

#[test]
fn test_fixed_frame() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);

    let frame1_sp = Label::new();
    let frame1_rbp = Label::new();
    let stack = stack
        // frame 0: a leaf with a fixed 0x18 byte frame
        .append_repeated(0, 0x10)
        .D64(MODULE1 + 0x300) // return address
        .mark(&frame1_sp)
        // frame 1
        .append_repeated(0, 0x20)
        .mark(&frame1_rbp)
        .D64(0)
        .D64(NATIVE);

    f.raw.rip = LEAF + 0x10;
    f.raw.rsp = 0x80000000;
    // The leaf doesn't touch %rbp.
    f.raw.rbp = frame1_rbp.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(states(&s), vec![WalkState::Frameless, WalkState::Frameless]);

    let f1 = &s.frames[1];
    assert_eq!(f1.instruction_pointer(), MODULE1 + 0x300);
    assert_eq!(f1.stack_pointer(), frame1_sp.value().unwrap());
    assert_eq!(f1.context().frame_pointer(), frame1_rbp.value().unwrap());
}

#[test]
fn test_missing_unwind_info() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let frame0_rbp = Label::new();
    let stack = stack
        .mark(&frame0_rbp)
        .D64(0)
        .D64(NO_INFO + 0x20)
        .append_repeated(0, 16);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].instruction_pointer(), NO_INFO + 0x20);
    assert_eq!(
        s.error,
        Some(WalkError::UnwindFailed(UnwindError::NoUnwindInfo {
            start: NO_INFO
        }))
    );
}

#[test]
fn test_unreadable_stack() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let stack = stack.append_repeated(0, 16);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = 0x90000000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    assert_eq!(s.error.as_ref().map(|e| e.name()), Some("UnwindFailed"));
    assert!(matches!(
        s.error,
        Some(WalkError::UnwindFailed(UnwindError::StackUnreadable(_)))
    ));
}

#[test]
fn test_unreadable_first_record() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let frame0_rbp = Label::new();
    let stack = stack
        .append_repeated(0, 16)
        .mark(&frame0_rbp)
        .D64(0)
        .D64(NATIVE);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.frame_head = 0x4000;

    let target = f.target(stack);
    let locator = CodeRegionMap::from_regions(f.regions.clone());
    let walker = StackWalker::new(&target, &locator);
    let mut walk = walker.walk(&ThreadData::new(THREAD_ID, f.frame_head)).unwrap();

    let f0 = walk.next().unwrap().unwrap();
    assert_eq!(f0.state(), WalkState::Frameless);
    assert_eq!(f0.instruction_pointer(), MODULE1 + 0x200);

    // Back in native code, the record is only read when it is applied.
    let f1 = walk.next().unwrap().unwrap();
    assert_eq!(f1.state(), WalkState::Framed);
    assert_eq!(f1.instruction_pointer(), NATIVE);
    assert_eq!(f1.frame_address(), Some(0x4000));

    assert_eq!(
        walk.next().unwrap().unwrap_err(),
        WalkError::MarkerUnreadable {
            address: 0x4000,
            source: TargetError::Unreadable {
                address: 0x4000,
                length: 8
            }
        }
    );
    assert_eq!(walk.state(), WalkState::Error);
    assert!(walk.next().is_none());
}

#[test]
fn test_stack_must_grow() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let stack = stack
        .D64(0x80000000u64) // %rbp pointing at itself
        .D64(MODULE2 + 0x10)
        .append_repeated(0, 0x40);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000040;
    f.raw.rbp = 0x80000000;

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    assert_eq!(
        s.error,
        Some(WalkError::UnwindFailed(UnwindError::NoProgress {
            callee_sp: 0x80000040,
            caller_sp: 0x80000010,
        }))
    );
}

#[test]
fn test_transition_frame_back_into_managed_code() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);

    let frame0_rbp = Label::new();
    let record = Label::new();
    let block = Label::new();
    let frame2_rbp = Label::new();
    let stack = stack
        // frame 0: managed, called from native code
        .mark(&frame0_rbp)
        .D64(0)
        .D64(NATIVE)
        // native code, which entered the runtime through a transition
        .append_repeated(0, 16)
        .mark(&record)
        .transition_frame(identifiers::PINVOKE_CALLEE_FRAME, FRAME_TOP, &block)
        .mark(&block)
        .transition_block(&frame2_rbp, MODULE2 + 0x40)
        // frame 2: managed again
        .mark(&frame2_rbp)
        .D64(0)
        .D64(0);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.frame_head = record.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(
        states(&s),
        vec![WalkState::Frameless, WalkState::Framed, WalkState::Frameless]
    );

    {
        let f1 = &s.frames[1];
        assert_eq!(f1.instruction_pointer(), NATIVE);
        assert_eq!(f1.frame_address(), record.value());
    }

    {
        let f2 = &s.frames[2];
        assert_eq!(f2.instruction_pointer(), MODULE2 + 0x40);
        assert_eq!(f2.stack_pointer(), frame2_rbp.value().unwrap());
        assert_eq!(f2.context().frame_pointer(), frame2_rbp.value().unwrap());
        assert_eq!(f2.frame_address(), None);
    }
}

#[test]
fn test_inlined_call_frame_is_skipped() {
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);

    let frame0_rbp = Label::new();
    let record = Label::new();
    let frame1_rbp = Label::new();
    let stack = stack
        // frame 0
        .mark(&frame0_rbp)
        .D64(&frame1_rbp)
        .D64(MODULE2 + 0x100)
        // frame 1 has an inlined native call whose record lives in its frame
        .mark(&record)
        .inlined_call_frame(FRAME_TOP, 0u64, 0, 0u64)
        .mark(&frame1_rbp)
        .D64(0)
        .D64(NATIVE);

    f.raw.rip = MODULE1 + 0x200;
    f.raw.rsp = 0x80000000;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.frame_head = record.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(
        states(&s),
        vec![
            WalkState::Frameless,
            WalkState::SkippedFrame,
            WalkState::Frameless
        ]
    );
    assert_eq!(s.frames[1].frame_address(), record.value());
    // Skipping a record leaves the registers alone.
    assert_eq!(s.frames[1].context_bytes(), s.frames[2].context_bytes());
    assert_eq!(s.frames[2].instruction_pointer(), MODULE2 + 0x100);
}

#[test]
fn test_active_inlined_call_frame() {
    // A thread stopped inside a native call that a managed method made inline.
    let mut f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);

    let record = Label::new();
    let call_site = Label::new();
    let frame_rbp = Label::new();
    let stack = stack
        .mark(&record)
        .inlined_call_frame(FRAME_TOP, &call_site, MODULE1 + 0x50, &frame_rbp)
        .mark(&call_site)
        .append_repeated(0, 16)
        .mark(&frame_rbp)
        .D64(0)
        .D64(NATIVE);

    f.raw.rip = NATIVE + 0x123;
    f.raw.rsp = 0x7fffff00;
    f.frame_head = record.value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.error, None);
    assert_eq!(
        states(&s),
        vec![
            WalkState::Framed,
            WalkState::SkippedFrame,
            WalkState::Frameless
        ]
    );

    let f0 = &s.frames[0];
    assert_eq!(f0.instruction_pointer(), NATIVE + 0x123);
    assert_eq!(f0.frame_address(), record.value());

    // The record restored the managed caller but stayed current, and then the
    // register unwind stepped over it.
    let f1 = &s.frames[1];
    assert_eq!(f1.instruction_pointer(), MODULE1 + 0x50);
    assert_eq!(f1.stack_pointer(), call_site.value().unwrap());
    assert_eq!(f1.frame_address(), record.value());

    let f2 = &s.frames[2];
    assert_eq!(f2.instruction_pointer(), MODULE1 + 0x50);
    assert_eq!(f2.frame_address(), None);
}

#[test]
fn test_step_on_a_cursor() {
    let f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let block = Label::new();
    let stack = stack
        .transition_frame(identifiers::FRAMED_METHOD_FRAME, FRAME_TOP, &block)
        .mark(&block)
        .transition_block(0u64, NATIVE + 0x10);
    let target = f.target(stack);
    let locator = CodeRegionMap::from_regions(f.regions.clone());

    let mut context = PlatformContext::new(Architecture::Amd64);
    context.set_instruction_pointer(NATIVE);
    let frames = FrameIterator::new(&target, 0x80000000);
    let mut cursor = Cursor::new(context, WalkState::Framed, frames);

    step(&mut cursor, &target, &locator).unwrap();
    // Still native code, and the only record is used up.
    assert_eq!(cursor.state(), WalkState::Complete);
    assert_eq!(cursor.context().instruction_pointer(), NATIVE + 0x10);
    assert!(!cursor.frames().is_valid());
    assert_eq!(cursor.frame_address(), None);

    // Terminal states stay put.
    step(&mut cursor, &target, &locator).unwrap();
    assert_eq!(cursor.state(), WalkState::Complete);
    assert_eq!(cursor.context().instruction_pointer(), NATIVE + 0x10);
}

#[test]
fn test_step_failure_moves_to_error() {
    let f = TestFixture::new();
    let stack = Section::new();
    stack.start().set_const(0x80000000);
    let target = f.target(stack.append_repeated(0, 16));
    let locator = CodeRegionMap::from_regions(f.regions.clone());

    let mut context = PlatformContext::new(Architecture::Amd64);
    context.set_instruction_pointer(NO_INFO);
    let frames = FrameIterator::new(&target, FRAME_TOP);
    let mut cursor = Cursor::new(context, WalkState::Frameless, frames);

    assert_eq!(
        step(&mut cursor, &target, &locator),
        Err(WalkError::UnwindFailed(UnwindError::NoUnwindInfo {
            start: NO_INFO
        }))
    );
    assert_eq!(cursor.state(), WalkState::Error);
    assert_eq!(step(&mut cursor, &target, &locator), Ok(()));
    assert_eq!(cursor.state(), WalkState::Error);
}
