//! x86_64 context switching (System V AMD64)

use std::arch::naked_asm;

use super::EntryFn;

/// Saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prime `ctx` so the first switch into it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes and `stack_top` must be the high end of a
/// mapped, writable stack.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by `jmp`, and its `call` pushes the return
    // address, so rsp must be 16-aligned here for the callee to see the ABI
    // entry alignment (rsp + 8 aligned).
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

/// First code run on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save callee-saved registers to `old` and resume `new`
///
/// # Safety
///
/// Both pointers must be valid; `new` must hold a context saved by this
/// function or primed by `init_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resumed here by a later switch into old
        "1:",
        "ret",
    );
}
