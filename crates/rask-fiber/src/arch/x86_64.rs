// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! x86_64 System V context switch.
//!
//! Switch frame, from the saved stack pointer upwards:
//! r15, r14, r13, r12, rbx, rbp, return address.

use std::arch::global_asm;

use super::{EntryFn, StackPointer};

global_asm!(
    ".text",
    concat!(".global ", asm_symbol!("rask_fiber_switch")),
    ".balign 16",
    concat!(asm_symbol!("rask_fiber_switch"), ":"),
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    concat!(".global ", asm_symbol!("rask_fiber_trampoline")),
    ".balign 16",
    concat!(asm_symbol!("rask_fiber_trampoline"), ":"),
    // r12 = argument, r13 = entry; rsp is 16-byte aligned here.
    "mov rdi, r12",
    "call r13",
    "ud2",
);

extern "C" {
    fn rask_fiber_trampoline();
}

pub(super) unsafe fn init_stack(top: *mut u8, entry: EntryFn, arg: *mut u8) -> StackPointer {
    // Leave 16 bytes above the frame so rsp is 16-aligned once the
    // trampoline is entered through `ret`.
    let top = (top as usize) & !15;
    let sp = (top - 72) as *mut usize;
    sp.add(0).write(0); // r15
    sp.add(1).write(0); // r14
    sp.add(2).write(entry as usize); // r13
    sp.add(3).write(arg as usize); // r12
    sp.add(4).write(0); // rbx
    sp.add(5).write(0); // rbp
    sp.add(6).write(rask_fiber_trampoline as usize);
    sp.add(7).write(0);
    sp.add(8).write(0);
    sp.cast()
}
