//! Architecture-dependent context switch primitive, factored into its own
//! small module since it's the one piece of this crate that can't be
//! written in portable Rust.
//!
//! Only x86_64 is implemented. The save/restore sequence is the usual
//! callee-saved-register switch; the one wrinkle is that `rip` is captured
//! via a local label instead of being supplied by an interrupt frame,
//! since there is no compiler-generated trap here.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("nsched only implements context switching for x86_64");

use core::arch::naked_asm;

/// Callee-saved registers plus the resume point, saved/restored across a
/// task <-> worker switch. Field order and size are load-bearing: the
/// naked functions below address them by byte offset.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl Context {
    /// A context that, when switched into, starts executing `entry` on the
    /// stack whose highest address is `stack_top` (16-byte aligned).
    /// `context_switch` resumes via `jmp`, not `call`, so there's no return
    /// address pushed for us the way a normal call leaves one; entry
    /// functions expect the same post-`call` alignment the SysV ABI
    /// guarantees (`rsp % 16 == 8` at function entry), so the initial `rsp`
    /// is parked 8 bytes below the aligned top to match.
    pub fn fresh(stack_top: u64, entry: extern "C" fn() -> !) -> Self {
        debug_assert_eq!(stack_top % 16, 0, "stack_top must be 16-byte aligned");
        Context {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: stack_top - 8,
            rflags: 0x202, // interrupts conceptually "enabled"; carried for parity with the source word
            rip: entry as usize as u64,
        }
    }
}

/// Save the caller's registers into `*old` (unless null), load `*new`'s
/// registers, and resume at `new.rip`. When the task switched away from
/// `old` is later resumed by another `context_switch` targeting it, control
/// returns here, just after the `call`, exactly as in a normal function
/// return.
///
/// # Safety
/// `new` must point at a `Context` either freshly built by [`Context::fresh`]
/// or previously populated by a prior call to `context_switch` with that
/// same pointer as `old`. `old` may be null to discard the outgoing context
/// (used the first time a worker's `g0` context is primed).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "test rdi, rdi",
        "jz 1f",
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsp",
        "pushfq",
        "pop qword ptr [rdi + 0x38]",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x40], rax",
        "1:",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x38]",
        "popfq",
        "jmp qword ptr [rsi + 0x40]",
        "2:",
        "ret",
    );
}
