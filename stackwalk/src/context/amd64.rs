// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use stackwalk_common::format::CONTEXT_AMD64;
use tracing::trace;

use super::{Unwind, UnwindError};
use crate::code_locator::{CodeRegionHandle, UnwindInfo};
use crate::target::Target;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;

pub(super) const REGISTERS: &[&str] = &[
    "rip", "rsp", "rbp", "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11",
    "r12", "r13", "r14", "r15",
];

pub(super) fn get_register(ctx: &CONTEXT_AMD64, name: &str) -> Option<u64> {
    let value = match name {
        "rip" => ctx.rip,
        "rsp" => ctx.rsp,
        "rbp" => ctx.rbp,
        "rax" => ctx.rax,
        "rbx" => ctx.rbx,
        "rcx" => ctx.rcx,
        "rdx" => ctx.rdx,
        "rsi" => ctx.rsi,
        "rdi" => ctx.rdi,
        "r8" => ctx.r8,
        "r9" => ctx.r9,
        "r10" => ctx.r10,
        "r11" => ctx.r11,
        "r12" => ctx.r12,
        "r13" => ctx.r13,
        "r14" => ctx.r14,
        "r15" => ctx.r15,
        _ => return None,
    };
    Some(value)
}

pub(super) fn register_mut<'a>(ctx: &'a mut CONTEXT_AMD64, name: &str) -> Option<&'a mut u64> {
    let slot = match name {
        "rip" => &mut ctx.rip,
        "rsp" => &mut ctx.rsp,
        "rbp" => &mut ctx.rbp,
        "rax" => &mut ctx.rax,
        "rbx" => &mut ctx.rbx,
        "rcx" => &mut ctx.rcx,
        "rdx" => &mut ctx.rdx,
        "rsi" => &mut ctx.rsi,
        "rdi" => &mut ctx.rdi,
        "r8" => &mut ctx.r8,
        "r9" => &mut ctx.r9,
        "r10" => &mut ctx.r10,
        "r11" => &mut ctx.r11,
        "r12" => &mut ctx.r12,
        "r13" => &mut ctx.r13,
        "r14" => &mut ctx.r14,
        "r15" => &mut ctx.r15,
        _ => return None,
    };
    Some(slot)
}

fn get_caller_by_frame_pointer(
    ctx: &mut CONTEXT_AMD64,
    target: &dyn Target,
) -> Result<(), UnwindError> {
    // Assume the standard %bp-using prologue: CALL pushes the return address and
    // the callee PUSHes the caller's %bp before copying %sp into it.
    //
    // %ip_new = *(%bp_old + ptr)
    // %sp_new = %bp_old + ptr * 2
    // %bp_new = *(%bp_old)
    let last_bp = ctx.rbp;
    let caller_ip = target.read_pointer(last_bp.wrapping_add(POINTER_WIDTH))?;
    let caller_bp = target.read_pointer(last_bp)?;
    let caller_sp = last_bp.wrapping_add(POINTER_WIDTH * 2);

    trace!(
        "unwind: frame pointer {:#x} gave ip {:#x} sp {:#x} bp {:#x}",
        last_bp,
        caller_ip,
        caller_sp,
        caller_bp
    );
    ctx.rip = caller_ip;
    ctx.rsp = caller_sp;
    ctx.rbp = caller_bp;
    Ok(())
}

fn get_caller_by_fixed_frame(
    ctx: &mut CONTEXT_AMD64,
    target: &dyn Target,
    frame_size: u64,
    return_address_offset: u64,
    saved_fp_offset: Option<u64>,
) -> Result<(), UnwindError> {
    let last_sp = ctx.rsp;
    let caller_ip = target.read_pointer(last_sp.wrapping_add(return_address_offset))?;
    let caller_bp = match saved_fp_offset {
        Some(offset) => target.read_pointer(last_sp.wrapping_add(offset))?,
        // %bp wasn't touched by this frame.
        None => ctx.rbp,
    };
    let caller_sp = last_sp.wrapping_add(frame_size);

    trace!(
        "unwind: fixed frame of {:#x} bytes gave ip {:#x} sp {:#x} bp {:#x}",
        frame_size,
        caller_ip,
        caller_sp,
        caller_bp
    );
    ctx.rip = caller_ip;
    ctx.rsp = caller_sp;
    ctx.rbp = caller_bp;
    Ok(())
}

impl Unwind for CONTEXT_AMD64 {
    fn unwind_frame(
        &mut self,
        region: &CodeRegionHandle,
        target: &dyn Target,
    ) -> Result<(), UnwindError> {
        match region.unwind {
            UnwindInfo::FramePointer => get_caller_by_frame_pointer(self, target),
            UnwindInfo::FixedFrame {
                frame_size,
                return_address_offset,
                saved_fp_offset,
            } => get_caller_by_fixed_frame(
                self,
                target,
                frame_size,
                return_address_offset,
                saved_fp_offset,
            ),
            UnwindInfo::Unavailable => Err(UnwindError::NoUnwindInfo {
                start: region.start,
            }),
        }
    }
}
