// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Machine-level context switching.
//!
//! A suspended context is nothing but a stack pointer: the switch routine
//! pushes the callee-saved registers onto the outgoing stack, stores the
//! resulting stack pointer, loads the incoming one and pops its registers.
//! A fresh stack is seeded so that the first switch "returns" into a
//! trampoline which calls the fiber entry point.

#[cfg(not(unix))]
compile_error!("rask-fiber only supports unix targets");

// Symbol names as seen by the assembler.
#[cfg(target_vendor = "apple")]
macro_rules! asm_symbol {
    ($name:literal) => {
        concat!("_", $name)
    };
}

#[cfg(not(target_vendor = "apple"))]
macro_rules! asm_symbol {
    ($name:literal) => {
        $name
    };
}

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use self::x86_64 as imp;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use self::aarch64 as imp;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("rask-fiber has no context switch for this architecture");

/// Saved stack pointer of a suspended context.
pub(crate) type StackPointer = *mut u8;

/// Entry point invoked on a fresh stack. Must never return.
pub(crate) type EntryFn = extern "C" fn(arg: *mut u8) -> !;

extern "C" {
    fn rask_fiber_switch(save: *mut StackPointer, to: StackPointer);
}

/// Save the running context into `*save` and continue at `to`.
///
/// Returns when some other context switches back to the pointer stored in
/// `*save`.
///
/// # Safety
///
/// `to` must come from [`init_stack`] or from an earlier `switch_context`
/// whose context has not been resumed since, and its stack must still be
/// mapped.
#[inline]
pub(crate) unsafe fn switch_context(save: *mut StackPointer, to: StackPointer) {
    rask_fiber_switch(save, to)
}

/// Seed a fresh stack so the first switch into it calls `entry(arg)`.
///
/// # Safety
///
/// `top` must be the highest address of a writable region large enough
/// for the initial frame.
pub(crate) unsafe fn init_stack(top: *mut u8, entry: EntryFn, arg: *mut u8) -> StackPointer {
    imp::init_stack(top, entry, arg)
}
