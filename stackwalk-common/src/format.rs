//! Register context definitions.
//!
//! Types defined here should match the `CONTEXT` structures defined in [Microsoft's headers][msdn],
//! which is the shape a debugger host hands back from a "get thread context" request. All fields
//! are little endian.
//!
//! [msdn]: https://learn.microsoft.com/en-us/windows/win32/api/winnt/ns-winnt-context
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use scroll::{Pread, Pwrite, SizeWith};

/// Valid bits in a `context_flags` for the CPU type.
pub const CONTEXT_CPU_MASK: u32 = 0xffffff00;

bitflags! {
    /// Register groups that can be requested for an x86-64 `CONTEXT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlagsAmd64: u32 {
        const CONTEXT_AMD64 = 0x00100000;
        const CONTEXT_CONTROL = Self::CONTEXT_AMD64.bits() | 0x1;
        const CONTEXT_INTEGER = Self::CONTEXT_AMD64.bits() | 0x2;
        const CONTEXT_SEGMENTS = Self::CONTEXT_AMD64.bits() | 0x4;
        const CONTEXT_FLOATING_POINT = Self::CONTEXT_AMD64.bits() | 0x8;
        const CONTEXT_DEBUG_REGISTERS = Self::CONTEXT_AMD64.bits() | 0x10;
        const CONTEXT_FULL = Self::CONTEXT_CONTROL.bits()
            | Self::CONTEXT_INTEGER.bits()
            | Self::CONTEXT_FLOATING_POINT.bits();
        const CONTEXT_ALL = Self::CONTEXT_FULL.bits()
            | Self::CONTEXT_SEGMENTS.bits()
            | Self::CONTEXT_DEBUG_REGISTERS.bits();
    }
}

bitflags! {
    /// Register groups that can be requested for an ARM64 `CONTEXT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlagsArm64: u32 {
        const CONTEXT_ARM64 = 0x00400000;
        const CONTEXT_CONTROL = Self::CONTEXT_ARM64.bits() | 0x1;
        const CONTEXT_INTEGER = Self::CONTEXT_ARM64.bits() | 0x2;
        const CONTEXT_FLOATING_POINT = Self::CONTEXT_ARM64.bits() | 0x4;
        const CONTEXT_DEBUG_REGISTERS = Self::CONTEXT_ARM64.bits() | 0x8;
        const CONTEXT_FULL = Self::CONTEXT_CONTROL.bits()
            | Self::CONTEXT_INTEGER.bits()
            | Self::CONTEXT_FLOATING_POINT.bits();
        const CONTEXT_ALL = Self::CONTEXT_FULL.bits() | Self::CONTEXT_DEBUG_REGISTERS.bits();
    }
}

/// An x86-64 (amd64) CPU context
///
/// This struct matches the definition of `CONTEXT` in WinNT.h for x86-64.
#[derive(Clone, Pread, Pwrite, SizeWith)]
pub struct CONTEXT_AMD64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// Floating point state
    ///
    /// This is defined as a union in the C headers (`XMM_SAVE_AREA32` or the
    /// legacy/xmm register block), 512 bytes either way.
    pub float_save: [u8; 512],
    pub vector_register: [u128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

impl Default for CONTEXT_AMD64 {
    fn default() -> Self {
        CONTEXT_AMD64 {
            p1_home: 0,
            p2_home: 0,
            p3_home: 0,
            p4_home: 0,
            p5_home: 0,
            p6_home: 0,
            context_flags: ContextFlagsAmd64::CONTEXT_AMD64.bits(),
            mx_csr: 0,
            cs: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            ss: 0,
            eflags: 0,
            dr0: 0,
            dr1: 0,
            dr2: 0,
            dr3: 0,
            dr6: 0,
            dr7: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            float_save: [0; 512],
            vector_register: [0; 26],
            vector_control: 0,
            debug_control: 0,
            last_branch_to_rip: 0,
            last_branch_from_rip: 0,
            last_exception_to_rip: 0,
            last_exception_from_rip: 0,
        }
    }
}

/// An aarch64 (arm64) CPU context
///
/// This struct matches the definition of `CONTEXT` in WinNT.h for ARM64. Note that
/// this differs from Breakpad's arm64 layout: `sp` is not part of `iregs` and `fpcr`
/// precedes `fpsr`.
#[derive(Clone, Pread, Pwrite, SizeWith)]
pub struct CONTEXT_ARM64 {
    pub context_flags: u32,
    pub cpsr: u32,
    /// x0-x28, then fp (x29) and lr (x30). See [`Arm64RegisterNumbers`].
    pub iregs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub vregs: [u128; 32],
    pub fpcr: u32,
    pub fpsr: u32,
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

impl Default for CONTEXT_ARM64 {
    fn default() -> Self {
        CONTEXT_ARM64 {
            context_flags: ContextFlagsArm64::CONTEXT_ARM64.bits(),
            cpsr: 0,
            iregs: [0; 31],
            sp: 0,
            pc: 0,
            vregs: [0; 32],
            fpcr: 0,
            fpsr: 0,
            bcr: [0; 8],
            bvr: [0; 8],
            wcr: [0; 2],
            wvr: [0; 2],
        }
    }
}

/// Offsets into `CONTEXT_ARM64.iregs` for registers with a dedicated or conventional purpose
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Arm64RegisterNumbers {
    FramePointer = 29,
    LinkRegister = 30,
}
