// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! AArch64 (AAPCS64) context switch.
//!
//! Switch frame, 160 bytes from the saved stack pointer:
//! x19..x28, x29 (fp), x30 (lr), d8..d15.

use std::arch::global_asm;

use super::{EntryFn, StackPointer};

global_asm!(
    ".text",
    concat!(".global ", asm_symbol!("rask_fiber_switch")),
    ".balign 4",
    concat!(asm_symbol!("rask_fiber_switch"), ":"),
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x2, sp",
    "str x2, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    "",
    concat!(".global ", asm_symbol!("rask_fiber_trampoline")),
    ".balign 4",
    concat!(asm_symbol!("rask_fiber_trampoline"), ":"),
    // x19 = argument, x20 = entry.
    "mov x0, x19",
    "blr x20",
    "brk #0",
);

extern "C" {
    fn rask_fiber_trampoline();
}

pub(super) unsafe fn init_stack(top: *mut u8, entry: EntryFn, arg: *mut u8) -> StackPointer {
    let top = (top as usize) & !15;
    let sp = (top - 160) as *mut usize;
    for i in 0..20 {
        sp.add(i).write(0);
    }
    sp.add(0).write(arg as usize); // x19
    sp.add(1).write(entry as usize); // x20
    sp.add(11).write(rask_fiber_trampoline as usize); // x30
    sp.cast()
}
