// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use stackwalk_common::format::{Arm64RegisterNumbers, CONTEXT_ARM64};
use tracing::trace;

use super::{Unwind, UnwindError};
use crate::code_locator::{CodeRegionHandle, UnwindInfo};
use crate::target::Target;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const FRAME_POINTER: usize = Arm64RegisterNumbers::FramePointer as usize;
const LINK_REGISTER: usize = Arm64RegisterNumbers::LinkRegister as usize;

pub(super) const REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "fp", "lr", "sp", "pc",
];

pub(super) fn frame_pointer(ctx: &CONTEXT_ARM64) -> u64 {
    ctx.iregs[FRAME_POINTER]
}

pub(super) fn set_frame_pointer(ctx: &mut CONTEXT_ARM64, value: u64) {
    ctx.iregs[FRAME_POINTER] = value;
}

fn ireg_index(name: &str) -> Option<usize> {
    match name {
        "fp" | "x29" => Some(FRAME_POINTER),
        "lr" | "x30" => Some(LINK_REGISTER),
        _ => {
            let index: usize = name.strip_prefix('x')?.parse().ok()?;
            (index < FRAME_POINTER).then_some(index)
        }
    }
}

pub(super) fn get_register(ctx: &CONTEXT_ARM64, name: &str) -> Option<u64> {
    match name {
        "sp" => Some(ctx.sp),
        "pc" => Some(ctx.pc),
        _ => ireg_index(name).map(|index| ctx.iregs[index]),
    }
}

pub(super) fn register_mut<'a>(ctx: &'a mut CONTEXT_ARM64, name: &str) -> Option<&'a mut u64> {
    match name {
        "sp" => Some(&mut ctx.sp),
        "pc" => Some(&mut ctx.pc),
        _ => ireg_index(name).map(move |index| &mut ctx.iregs[index]),
    }
}

fn get_caller_by_frame_pointer(
    ctx: &mut CONTEXT_ARM64,
    target: &dyn Target,
) -> Result<(), UnwindError> {
    // The frame record is the pair (caller fp, return address) stored at fp.
    //
    // %pc_new = %lr_new = *(%fp_old + ptr)
    // %sp_new = %fp_old + ptr * 2
    // %fp_new = *(%fp_old)
    let last_fp = frame_pointer(ctx);
    let caller_lr = target.read_pointer(last_fp.wrapping_add(POINTER_WIDTH))?;
    let caller_fp = target.read_pointer(last_fp)?;
    let caller_sp = last_fp.wrapping_add(POINTER_WIDTH * 2);

    trace!(
        "unwind: frame record at {:#x} gave pc {:#x} sp {:#x} fp {:#x}",
        last_fp,
        caller_lr,
        caller_sp,
        caller_fp
    );
    ctx.pc = caller_lr;
    ctx.iregs[LINK_REGISTER] = caller_lr;
    ctx.sp = caller_sp;
    set_frame_pointer(ctx, caller_fp);
    Ok(())
}

fn get_caller_by_fixed_frame(
    ctx: &mut CONTEXT_ARM64,
    target: &dyn Target,
    frame_size: u64,
    return_address_offset: u64,
    saved_fp_offset: Option<u64>,
) -> Result<(), UnwindError> {
    let last_sp = ctx.sp;
    let caller_lr = target.read_pointer(last_sp.wrapping_add(return_address_offset))?;
    let caller_fp = match saved_fp_offset {
        Some(offset) => target.read_pointer(last_sp.wrapping_add(offset))?,
        None => frame_pointer(ctx),
    };
    let caller_sp = last_sp.wrapping_add(frame_size);

    trace!(
        "unwind: fixed frame of {:#x} bytes gave pc {:#x} sp {:#x} fp {:#x}",
        frame_size,
        caller_lr,
        caller_sp,
        caller_fp
    );
    ctx.pc = caller_lr;
    ctx.iregs[LINK_REGISTER] = caller_lr;
    ctx.sp = caller_sp;
    set_frame_pointer(ctx, caller_fp);
    Ok(())
}

impl Unwind for CONTEXT_ARM64 {
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
