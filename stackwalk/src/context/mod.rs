// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! CPU contexts.

use std::fmt;

use scroll::ctx::SizeWith;
use scroll::{Pread, Pwrite, LE};
use stackwalk_common::format::{
    ContextFlagsAmd64, ContextFlagsArm64, CONTEXT_AMD64, CONTEXT_ARM64, CONTEXT_CPU_MASK,
};
use tracing::trace;

use crate::code_locator::{CodeLocator, CodeRegionHandle};
use crate::target::{Architecture, Target, TargetError};

mod amd64;
mod arm64;

/// Errors encountered while decoding a raw register context.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("Context buffer too short: expected {expected} bytes, found {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Context flags {flags:#x} do not describe an {arch} context")]
    WrongCpu { flags: u32, arch: Architecture },
    #[error("No register named {0}")]
    UnknownRegister(String),
    #[error("Unable to fetch the context: {0}")]
    Unavailable(#[from] TargetError),
}

/// Errors encountered while unwinding one frame.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UnwindError {
    #[error("Instruction {instruction:#x} is not in a compiled code region")]
    NoCodeRegion { instruction: u64 },
    #[error("Code region at {start:#x} has no unwind information")]
    NoUnwindInfo { start: u64 },
    #[error("Unable to read the stack while unwinding")]
    StackUnreadable(#[from] TargetError),
    #[error("Unwinding made no progress: caller sp {caller_sp:#x} <= callee sp {callee_sp:#x}")]
    NoProgress { callee_sp: u64, caller_sp: u64 },
}

impl UnwindError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            UnwindError::NoCodeRegion { .. } => "NoCodeRegion",
            UnwindError::NoUnwindInfo { .. } => "NoUnwindInfo",
            UnwindError::StackUnreadable(_) => "StackUnreadable",
            UnwindError::NoProgress { .. } => "NoProgress",
        }
    }
}

/// A trait for raw contexts that can unwind to their caller in place.
pub(crate) trait Unwind {
    /// Replace this frame's registers with its caller's, as described by `region`.
    fn unwind_frame(
        &mut self,
        region: &CodeRegionHandle,
        target: &dyn Target,
    ) -> Result<(), UnwindError>;
}

/// The register state of one thread at one point of a walk.
///
/// This is a plain value: cloning copies the whole register file and never shares
/// storage with the original.
#[derive(Clone)]
pub enum PlatformContext {
    Amd64(CONTEXT_AMD64),
    Arm64(CONTEXT_ARM64),
}

impl PlatformContext {
    /// A zeroed context tagged for `arch`.
    pub fn new(arch: Architecture) -> PlatformContext {
        match arch {
            Architecture::Amd64 => PlatformContext::Amd64(CONTEXT_AMD64::default()),
            Architecture::Arm64 => PlatformContext::Arm64(CONTEXT_ARM64::default()),
        }
    }

    /// The size in bytes of a raw context for `arch`.
    pub fn size(arch: Architecture) -> usize {
        match arch {
            Architecture::Amd64 => CONTEXT_AMD64::size_with(&LE),
            Architecture::Arm64 => CONTEXT_ARM64::size_with(&LE),
        }
    }

    /// The register groups requested when fetching a thread's context.
    pub fn default_context_flags(arch: Architecture) -> u32 {
        match arch {
            Architecture::Amd64 => ContextFlagsAmd64::CONTEXT_FULL.bits(),
            Architecture::Arm64 => ContextFlagsArm64::CONTEXT_FULL.bits(),
        }
    }

    /// Decode a raw context for `arch`.
    ///
    /// Trailing bytes past the end of the context are ignored. A buffer whose flags
    /// carry no CPU tag at all is accepted, since some hosts don't fill it in.
    pub fn from_bytes(arch: Architecture, bytes: &[u8]) -> Result<PlatformContext, ContextError> {
        let expected = Self::size(arch);
        let too_short = ContextError::TooShort {
            expected,
            actual: bytes.len(),
        };
        if bytes.len() < expected {
            return Err(too_short);
        }

        let (context, flags, cpu) = match arch {
            Architecture::Amd64 => {
                let raw: CONTEXT_AMD64 = bytes.pread_with(0, LE).map_err(|_| too_short)?;
                let flags = raw.context_flags;
                (
                    PlatformContext::Amd64(raw),
                    flags,
                    ContextFlagsAmd64::CONTEXT_AMD64.bits(),
                )
            }
            Architecture::Arm64 => {
                let raw: CONTEXT_ARM64 = bytes.pread_with(0, LE).map_err(|_| too_short)?;
                let flags = raw.context_flags;
                (
                    PlatformContext::Arm64(raw),
                    flags,
                    ContextFlagsArm64::CONTEXT_ARM64.bits(),
                )
            }
        };

        let tagged = flags & CONTEXT_CPU_MASK;
        if tagged != 0 && tagged != cpu {
            return Err(ContextError::WrongCpu { flags, arch });
        }
        Ok(context)
    }

    /// Encode this context in its raw little-endian layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::size(self.architecture())];
        let buffer = bytes.as_mut_slice();
        let written = match self {
            PlatformContext::Amd64(raw) => buffer.pwrite_with(raw, 0, LE),
            PlatformContext::Arm64(raw) => buffer.pwrite_with(raw, 0, LE),
        };
        written.expect("buffer is sized for the context");
        bytes
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            PlatformContext::Amd64(_) => Architecture::Amd64,
            PlatformContext::Arm64(_) => Architecture::Arm64,
        }
    }

    pub fn context_flags(&self) -> u32 {
        match self {
            PlatformContext::Amd64(raw) => raw.context_flags,
            PlatformContext::Arm64(raw) => raw.context_flags,
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        match self {
            PlatformContext::Amd64(raw) => raw.rip,
            PlatformContext::Arm64(raw) => raw.pc,
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            PlatformContext::Amd64(raw) => raw.rsp,
            PlatformContext::Arm64(raw) => raw.sp,
        }
    }

    pub fn frame_pointer(&self) -> u64 {
        match self {
            PlatformContext::Amd64(raw) => raw.rbp,
            PlatformContext::Arm64(raw) => arm64::frame_pointer(raw),
        }
    }

    pub fn set_instruction_pointer(&mut self, value: u64) {
        match self {
            PlatformContext::Amd64(raw) => raw.rip = value,
            PlatformContext::Arm64(raw) => raw.pc = value,
        }
    }

    pub fn set_stack_pointer(&mut self, value: u64) {
        match self {
            PlatformContext::Amd64(raw) => raw.rsp = value,
            PlatformContext::Arm64(raw) => raw.sp = value,
        }
    }

    pub fn set_frame_pointer(&mut self, value: u64) {
        match self {
            PlatformContext::Amd64(raw) => raw.rbp = value,
            PlatformContext::Arm64(raw) => arm64::set_frame_pointer(raw, value),
        }
    }

    /// The names of the general purpose registers, in report order.
    pub fn register_names(&self) -> &'static [&'static str] {
        match self {
            PlatformContext::Amd64(_) => amd64::REGISTERS,
            PlatformContext::Arm64(_) => arm64::REGISTERS,
        }
    }

    pub fn get_register(&self, name: &str) -> Option<u64> {
        match self {
            PlatformContext::Amd64(raw) => amd64::get_register(raw, name),
            PlatformContext::Arm64(raw) => arm64::get_register(raw, name),
        }
    }

    pub fn set_register(&mut self, name: &str, value: u64) -> Result<(), ContextError> {
        let slot = match self {
            PlatformContext::Amd64(raw) => amd64::register_mut(raw, name),
            PlatformContext::Arm64(raw) => arm64::register_mut(raw, name),
        };
        match slot {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ContextError::UnknownRegister(name.to_owned())),
        }
    }

    /// The general purpose registers as `(name, value)` pairs, in report order.
    pub fn registers(&self) -> Vec<(&'static str, u64)> {
        self.register_names()
            .iter()
            .filter_map(|&name| self.get_register(name).map(|value| (name, value)))
            .collect()
    }

    /// Replace this context's registers with those of its caller.
    ///
    /// The current instruction pointer must be inside a region `locator` knows about.
    /// The caller's stack pointer must be strictly above the callee's; on any error
    /// the context is left untouched.
    pub fn unwind_one_frame(
        &mut self,
        target: &dyn Target,
        locator: &dyn CodeLocator,
    ) -> Result<(), UnwindError> {
        let instruction = self.instruction_pointer();
        let region = locator
            .resolve(instruction)
            .ok_or(UnwindError::NoCodeRegion { instruction })?;

        let callee_sp = self.stack_pointer();
        let mut caller = self.clone();
        match &mut caller {
            PlatformContext::Amd64(raw) => raw.unwind_frame(&region, target)?,
            PlatformContext::Arm64(raw) => raw.unwind_frame(&region, target)?,
        }

        let caller_sp = caller.stack_pointer();
        if caller_sp <= callee_sp {
            return Err(UnwindError::NoProgress {
                callee_sp,
                caller_sp,
            });
        }
        trace!(
            "unwind: {:#x} (sp {:#x}) -> {:#x} (sp {:#x})",
            instruction,
            callee_sp,
            caller.instruction_pointer(),
            caller_sp
        );
        *self = caller;
        Ok(())
    }
}

impl fmt::Debug for PlatformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"arch", &self.architecture().name());
        for (name, value) in self.registers() {
            map.entry(&name, &format_args!("{value:#018x}"));
        }
        map.finish()
    }
}
