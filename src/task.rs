//! Tasks (`G`): cooperatively scheduled, stackful green threads.
//!
//! A `TaskId` (an `AtomicU64` counter), an `#[atomic_enum]`-backed status
//! field, and a task that owns its own saved context and one growable
//! [`Stack`](crate::stack::Stack).

use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::UnsafeCell;

use atomic_enum::atomic_enum;

use crate::context_asm::Context;
use crate::defer::{Defers, PanicOutcome};
use crate::error::fatal;
use crate::stack::Stack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A task's place in the state machine. `Idle` is the slot state for a
/// task that lives in `gfree` and hasn't been handed a body yet.
#[atomic_enum]
pub enum TaskStatus {
    Idle,
    Runnable,
    Running,
    Syscall,
    Waiting,
    Moribund,
    Dead,
}

/// Returns `true` iff `from -> to` is one of the legal task-status
/// transitions. Any other transition is a scheduler bug, not a task error.
fn is_legal_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Idle, Waiting)
            | (Waiting, Runnable)
            | (Runnable, Running)
            | (Running, Runnable)
            | (Running, Syscall)
            | (Syscall, Running)
            | (Syscall, Runnable)
            | (Running, Waiting)
            | (Running, Moribund)
            | (Moribund, Dead)
            | (Dead, Idle)
    )
}

pub type Entry = Box<dyn FnOnce() + Send>;

/// A task (`G`). Owned by the all-tasks arena in [`crate::sched::Sched`];
/// every other reference to it is an index (`u32`), never a raw pointer
/// the type system tracks.
pub struct Task {
    pub id: TaskId,
    status: AtomicTaskStatus,

    /// Saved register state, valid whenever this task is not `Running`.
    context: UnsafeCell<Context>,
    stack: UnsafeCell<Stack>,

    defers: Defers,

    /// The closure this task will run the first time it's dispatched. Taken
    /// (and dropped) on first dispatch; `None` afterward for the lifetime of
    /// this dispatch.
    entry: UnsafeCell<Option<Entry>>,

    /// Worker id this task is pinned to via [`crate::pin_to_thread`], if any.
    locked_worker: UnsafeCell<Option<u32>>,

    /// Worker whose dedicated idle task this is, if any (mutually exclusive
    /// with `locked_worker`).
    idle_worker: UnsafeCell<Option<u32>>,

    /// Set as a signal to the scheduler to re-ready this task once a
    /// pending stop-the-world barrier releases it.
    readyonstop: std::sync::atomic::AtomicBool,

    /// Monotonically assigned at spawn time; `0` while the slot sits in
    /// `gfree`/has never been spawned into.
    goid: std::sync::atomic::AtomicU64,
}

// Safety: a `Task`'s `UnsafeCell` fields are only ever touched by the one
// worker currently dispatching it, enforced at the scheduler level (a task
// index is never handed to two workers at once). `Sync` is not required
// anywhere in this crate — tasks move between workers, they are never
// shared concurrently.
unsafe impl Send for Task {}

impl Task {
    /// Build a fresh task in the `Idle` slot state with `stack_hint` bytes
    /// of initial stack (rounded up to [`crate::stack::STACK_MIN`]).
    pub fn new_idle(stack_hint: usize) -> Self {
        Task {
            id: TaskId::new(),
            status: AtomicTaskStatus::new(TaskStatus::Idle),
            context: UnsafeCell::new(Context::default()),
            stack: UnsafeCell::new(Stack::with_hint(stack_hint)),
            defers: Defers::new(),
            entry: UnsafeCell::new(None),
            locked_worker: UnsafeCell::new(None),
            idle_worker: UnsafeCell::new(None),
            readyonstop: std::sync::atomic::AtomicBool::new(false),
            goid: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn goid(&self) -> u64 {
        self.goid.load(Ordering::Acquire)
    }

    pub fn set_goid(&self, value: u64) {
        self.goid.store(value, Ordering::Release);
    }

    pub fn idle_worker(&self) -> Option<u32> {
        unsafe { *self.idle_worker.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn set_idle_worker(&self, worker: Option<u32>) {
        unsafe {
            *self.idle_worker.get() = worker;
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load(Ordering::Acquire)
    }

    /// Move this task to `to`, aborting the process if the transition isn't
    /// legal (a scheduler invariant violation, not a task error).
    pub fn set_status(&self, to: TaskStatus) {
        let from = self.status.swap(to, Ordering::AcqRel);
        if !is_legal_transition(from, to) {
            fatal!("illegal task status transition: {from:?} -> {to:?} (task {:?})", self.id);
        }
    }

    /// Prepare this task to run `entry` from the top of its stack the next
    /// time it's dispatched. Only valid while `Idle` (a fresh task, or a
    /// `gfree` slot reused for a new one). Leaves the task `Waiting` — the
    /// `spawn` half of spec.md §4.3's `Idle ── spawn ──▶ Waiting`; the
    /// caller completes the `ready` half with [`Task::ready`] once it's
    /// actually about to enqueue the task.
    pub fn install_entry(&self, entry: Entry, trampoline: extern "C" fn() -> !) {
        debug_assert_eq!(self.status(), TaskStatus::Idle);
        unsafe {
            *self.entry.get() = Some(entry);
            let top = (*self.stack.get()).base_top();
            *self.context.get() = Context::fresh(top, trampoline);
        }
        self.set_status(TaskStatus::Waiting);
    }

    /// The `ready` half of spec.md §4.3's `Waiting ── ready ──▶ Runnable`:
    /// called right before a task is first handed to `gput`.
    pub fn ready(&self) {
        self.set_status(TaskStatus::Runnable);
    }

    /// Take the installed entry closure, if one hasn't already run. Called
    /// exactly once by this task's trampoline, on its own stack.
    ///
    /// # Safety
    /// Must only be called by the task currently dispatched as the only
    /// active user of `self`.
    pub unsafe fn take_entry(&self) -> Option<Entry> {
        unsafe { (*self.entry.get()).take() }
    }

    /// # Safety
    /// Caller must guarantee this task is not concurrently dispatched.
    pub unsafe fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    /// # Safety
    /// Caller must guarantee this task is not concurrently dispatched.
    pub unsafe fn stack_mut(&self) -> &mut Stack {
        unsafe { &mut *self.stack.get() }
    }

    pub fn defers(&self) -> &Defers {
        &self.defers
    }

    pub fn defer(&self, action: impl FnMut() + Send + 'static) {
        self.defers.defer(action);
    }

    pub fn recover(&self) -> Option<Box<dyn core::any::Any + Send>> {
        self.defers.recover()
    }

    /// Raise a panic within this task's defer chain. Returns whether a
    /// deferred call recovered it; an unrecovered user panic is the
    /// caller's (the task body's) responsibility to report and act on.
    ///
    /// Does not itself transfer control anywhere — see the contract on
    /// [`crate::panic_now`].
    pub fn panic_now(&self, payload: Box<dyn core::any::Any + Send>) -> PanicOutcome {
        self.defers.panic_now(payload)
    }

    pub fn run_deferred(&self) -> bool {
        self.defers.run_deferred()
    }

    pub fn run_all_deferred(&self) {
        self.defers.run_all_deferred();
    }

    pub fn locked_worker(&self) -> Option<u32> {
        unsafe { *self.locked_worker.get() }
    }

    /// # Safety
    /// Caller must guarantee this task is not concurrently dispatched.
    pub unsafe fn set_locked_worker(&self, worker: Option<u32>) {
        unsafe {
            *self.locked_worker.get() = worker;
        }
    }

    pub fn readyonstop(&self) -> bool {
        self.readyonstop.load(Ordering::Acquire)
    }

    pub fn set_readyonstop(&self, value: bool) {
        self.readyonstop.store(value, Ordering::Release);
    }

    /// Reset this slot back to `Idle` for reuse from `gfree`. Leaves the
    /// stack's base segment allocated — the free list reuses the whole
    /// task, stack included, rather than freeing and reallocating on every
    /// spawn.
    pub fn recycle(&self) {
        debug_assert_eq!(self.status(), TaskStatus::Dead);
        unsafe {
            (*self.stack.get()).unwind_to_base();
        }
        self.set_readyonstop(false);
        unsafe {
            self.set_locked_worker(None);
        }
        self.status.store(TaskStatus::Idle, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_increasing() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn legal_transitions_accepted() {
        let task = Task::new_idle(crate::stack::STACK_MIN);
        assert_eq!(task.status(), TaskStatus::Idle);
        task.set_status(TaskStatus::Waiting);
        task.set_status(TaskStatus::Runnable);
        task.set_status(TaskStatus::Running);
        task.set_status(TaskStatus::Syscall);
        task.set_status(TaskStatus::Running);
        task.set_status(TaskStatus::Moribund);
        task.set_status(TaskStatus::Dead);
        task.set_status(TaskStatus::Idle);
    }

    #[test]
    fn recycle_resets_to_idle_and_clears_stack_growth() {
        let task = Task::new_idle(crate::stack::STACK_MIN);
        unsafe {
            task.stack_mut().ensure(4 * crate::stack::STACK_MIN, || ());
        }
        task.set_status(TaskStatus::Waiting);
        task.set_status(TaskStatus::Runnable);
        task.set_status(TaskStatus::Running);
        task.set_status(TaskStatus::Moribund);
        task.set_status(TaskStatus::Dead);
        task.recycle();
        assert_eq!(task.status(), TaskStatus::Idle);
        unsafe {
            assert_eq!(task.stack_mut().segment_count(), 1);
        }
    }
}
