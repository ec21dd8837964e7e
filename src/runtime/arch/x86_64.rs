//! x86_64 implementation of the stack-switch primitive

use std::arch::{asm, naked_asm};
use std::ffi::c_void;

/// Calls `f(args)` with the stack pointer set to `new_sp`, then returns
/// with the original stack restored.
///
/// System V AMD64: `new_sp` must be 16-byte aligned so that after `call`
/// pushes the return address the callee sees the ABI-required alignment.
/// The old stack pointer rides in rbp, which `f` preserves as a
/// callee-saved register.
///
/// # Safety
/// `new_sp` must point into mapped memory with enough headroom below it
/// for every frame `f` creates, and nothing may unwind through this frame.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_and_call(
    _args: *mut c_void,
    _f: extern "C" fn(*mut c_void),
    _new_sp: *mut u8,
) {
    naked_asm!(
        // rdi = args, rsi = f, rdx = new_sp
        "push rbp",
        "mov rbp, rsp",
        "mov rsp, rdx",
        "call rsi",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
    );
}

/// Reads the stack pointer of the calling frame.
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    let sp: usize;
    unsafe {
        asm!("mov {}, rsp", out(reg) sp, options(nomem, preserves_flags));
    }
    sp
}
