//! Segmented stacks.
//!
//! Each task starts with one `StackMin`-sized segment. `Stack::ensure` is
//! the explicit stand-in for a compiler-inserted `SP < stackguard` trap:
//! since nothing here generates a prologue check, task code calls
//! `Stack::ensure` explicitly before doing something that needs more
//! headroom than the current segment has left (a large local array, deep
//! recursion) — "run this on a bigger stack, then come back" as an
//! explicit primitive rather than an invisible trap.

pub const STACK_MIN: usize = 8 * 1024;
pub const STACK_GUARD: usize = 256;
const STACK_EXTRA: usize = 1024;
const STACK_ALIGN: usize = 16;

/// One link of a task's stack.
struct Segment {
    buf: Box<[u8]>,
}

pub struct Stack {
    segments: Vec<Segment>,
}

impl Segment {
    fn allocate(min_size: usize) -> Self {
        let size = min_size.max(STACK_MIN) + STACK_EXTRA;
        let buf = vec![0u8; size].into_boxed_slice();
        Segment { buf }
    }

    fn top(&self) -> u64 {
        let end = self.buf.as_ptr() as u64 + self.buf.len() as u64;
        end & !((STACK_ALIGN as u64) - 1)
    }

    fn headroom(&self, watermark: u64) -> usize {
        watermark.saturating_sub(self.buf.as_ptr() as u64) as usize
    }
}

impl Stack {
    pub fn new() -> Self {
        Self::with_hint(STACK_MIN)
    }

    /// Build a stack whose base segment holds at least `hint` bytes.
    pub fn with_hint(hint: usize) -> Self {
        Stack {
            segments: vec![Segment::allocate(hint)],
        }
    }

    pub fn base_top(&self) -> u64 {
        self.segments[0].top()
    }

    /// Run `f` guaranteeing at least `additional` bytes of fresh stack are
    /// available, growing (`newstack`) onto a new segment first if the
    /// current one doesn't have the room, and shrinking back (`oldstack`)
    /// once `f` returns.
    pub fn ensure<R>(&mut self, additional: usize, f: impl FnOnce() -> R) -> R {
        let current_rsp = current_stack_pointer();
        let have_room = self
            .segments
            .last()
            .map(|s| s.headroom(current_rsp) >= additional + STACK_GUARD)
            .unwrap_or(false);

        if have_room {
            return f();
        }

        let new_segment = Segment::allocate(additional);
        let new_top = new_segment.top();
        self.segments.push(new_segment);

        let mut out = None::<R>;
        let mut f = Some(f);
        let mut closure: Box<dyn FnMut()> = Box::new(|| {
            if let Some(f) = f.take() {
                out = Some(f());
            }
        });
        let arg_ptr = &mut closure as *mut Box<dyn FnMut()> as *mut ();
        unsafe {
            switch_and_call(new_top, call_trampoline, arg_ptr);
        }
        drop(closure);

        self.segments.pop();
        out.expect("ensure: continuation did not run")
    }

    /// Unwind (free) segments down to, but not including, the base
    /// segment. Used by panic recovery to discard segments that were
    /// created to run deferred calls and will not be resumed normally.
    pub fn unwind_to_base(&mut self) {
        while self.segments.len() > 1 {
            self.segments.pop();
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

#[inline(always)]
pub(crate) fn current_stack_pointer() -> u64 {
    let rsp: u64;
    unsafe {
        core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp
}

unsafe extern "C" fn call_trampoline(arg: *mut (), old_rsp: u64) {
    // Safety: `arg` is always a `*mut Box<dyn FnMut()>` packed by `ensure`,
    // alive for the duration of this call.
    let f: &mut Box<dyn FnMut()> = unsafe { &mut *(arg as *mut Box<dyn FnMut()>) };
    f();
    unsafe { return_to_caller(old_rsp) }
}

/// Switches `rsp` to `new_rsp`, then calls `f(arg, old_rsp)` where `old_rsp`
/// is `rsp` as it stood on entry to this very function — i.e. pointing at
/// the return address this `call` instruction just pushed on the *old*
/// stack. `f` is expected never to return normally — it ends by calling
/// [`return_to_caller`] with that same `old_rsp`, which restores the
/// original stack pointer and resumes the caller of this function.
///
/// `old_rsp` is captured here, inside the naked function, rather than by
/// the Rust caller beforehand: anything the caller's own prologue does
/// between reading its `rsp` and the actual `call` (spilling temporaries,
/// reserving shadow space) would otherwise leave the captured value stale,
/// and restoring a stale `rsp` later would desynchronize `return_to_caller`'s
/// `ret` from the frame the compiler actually built around this call.
///
/// # Safety
/// `new_rsp` must be the aligned top of a live, exclusively-owned stack
/// buffer at least large enough for `f` (and anything it calls) to run in.
#[unsafe(naked)]
unsafe extern "C" fn switch_and_call(new_rsp: u64, f: unsafe extern "C" fn(*mut (), u64), arg: *mut ()) {
    core::arch::naked_asm!(
        "mov r8, rsp",  // r8 = old_rsp, exactly as of this call's entry
        "mov rax, rsi", // rax = f
        "mov rsp, rdi", // switch to the new stack
        "mov rdi, rdx", // f's 1st arg: arg
        "mov rsi, r8",  // f's 2nd arg: old_rsp
        "call rax",
        "ud2", // f never returns here; see return_to_caller
    );
}

/// Restores `rsp` to `old_rsp` and returns to whatever called the matching
/// [`switch_and_call`] — `old_rsp` still has that call's return address on
/// top, exactly as a normal `ret` expects.
///
/// # Safety
/// `old_rsp` must be a value captured by a live, not-yet-resumed
/// `switch_and_call` invocation.
#[unsafe(naked)]
unsafe extern "C" fn return_to_caller(old_rsp: u64) -> ! {
    core::arch::naked_asm!("mov rsp, rdi", "ret",);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_runs_closure_and_returns_value() {
        let mut stack = Stack::new();
        let result = stack.ensure(64, || 1 + 1);
        assert_eq!(result, 2);
        assert_eq!(stack.segment_count(), 1);
    }

    #[test]
    fn ensure_grows_and_shrinks_back() {
        let mut stack = Stack::new();
        let before = stack.segment_count();
        let ran = stack.ensure(4 * STACK_MIN, || true);
        assert!(ran);
        assert_eq!(stack.segment_count(), before);
    }

    #[test]
    fn nested_ensure_calls_compose() {
        let mut stack = Stack::new();
        let total = stack.ensure(4 * STACK_MIN, || {
            // Can't re-borrow `stack` here (it's behind `&mut` already in
            // the outer call); nested growth is exercised via a second,
            // independent Stack instead.
            let mut inner = Stack::new();
            inner.ensure(4 * STACK_MIN, || 21) * 2
        });
        assert_eq!(total, 42);
    }
}
