//! Workers (`M`): real OS threads that run the scheduler loop and dispatch
//! tasks.
//!
//! Each worker is a per-thread native context plus a single handoff slot
//! (`nextg`) rather than its own ready queue — the matcher hands tasks to
//! workers one at a time instead of letting them pull from a private
//! backlog, so there's no per-worker queue to keep fair or steal from.

use std::cell::UnsafeCell;

use crate::context_asm::Context;
use crate::note::Note;

/// A worker (`M`). Lives in the shared `Worker` arena inside
/// [`crate::sched::Sched`]; only the OS thread that owns a given index ever
/// touches its `UnsafeCell` fields, mirroring [`crate::task::Task`]'s
/// single-writer discipline.
pub struct Worker {
    pub id: u32,

    /// This worker's scheduler task context — used only to run
    /// `schedule`/`next_and_unlock` on the native OS stack. Never dispatched
    /// as a regular task.
    pub g0: UnsafeCell<Context>,

    /// The task currently executing on this worker, if any.
    curg: UnsafeCell<Option<u32>>,

    /// Handoff slot: a task index the matcher has assigned to this worker
    /// but which it hasn't picked up yet. Written only while the scheduler
    /// lock is held (by the matcher or by this worker's own
    /// `next_and_unlock`); read the same way.
    nextg: UnsafeCell<Option<u32>>,

    /// One-shot wait/wake note this worker blocks on while idle.
    pub havenextg: Note,
    waitnextg: UnsafeCell<bool>,

    lockedg: UnsafeCell<Option<u32>>,
    idleg: UnsafeCell<Option<u32>>,

    mallocing: UnsafeCell<u32>,
    gcing: UnsafeCell<u32>,
    locks: UnsafeCell<u32>,
}

// Safety: every `UnsafeCell` field here is touched either (a) only by the
// one OS thread that owns this `Worker`, or (b) only while the scheduler
// lock is held (documented per-field above) — never concurrently from two
// threads without synchronization.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(id: u32) -> Self {
        Worker {
            id,
            g0: UnsafeCell::new(Context::default()),
            curg: UnsafeCell::new(None),
            nextg: UnsafeCell::new(None),
            havenextg: Note::new(),
            waitnextg: UnsafeCell::new(false),
            lockedg: UnsafeCell::new(None),
            idleg: UnsafeCell::new(None),
            mallocing: UnsafeCell::new(0),
            gcing: UnsafeCell::new(0),
            locks: UnsafeCell::new(0),
        }
    }

    pub fn curg(&self) -> Option<u32> {
        unsafe { *self.curg.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock, or be the thread that owns this
    /// worker setting its own `curg` after a dispatch.
    pub unsafe fn set_curg(&self, g: Option<u32>) {
        unsafe { *self.curg.get() = g };
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn nextg(&self) -> Option<u32> {
        unsafe { *self.nextg.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn set_nextg(&self, g: Option<u32>) {
        unsafe { *self.nextg.get() = g };
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn waitnextg(&self) -> bool {
        unsafe { *self.waitnextg.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn set_waitnextg(&self, value: bool) {
        unsafe { *self.waitnextg.get() = value };
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn lockedg(&self) -> Option<u32> {
        unsafe { *self.lockedg.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn set_lockedg(&self, g: Option<u32>) {
        unsafe { *self.lockedg.get() = g };
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn idleg(&self) -> Option<u32> {
        unsafe { *self.idleg.get() }
    }

    /// # Safety
    /// Caller must hold the scheduler lock.
    pub unsafe fn set_idleg(&self, g: Option<u32>) {
        unsafe { *self.idleg.get() = g };
    }

    pub fn is_mallocing(&self) -> bool {
        unsafe { *self.mallocing.get() > 0 }
    }

    pub fn is_gcing(&self) -> bool {
        unsafe { *self.gcing.get() > 0 }
    }

    pub fn lock_count(&self) -> u32 {
        unsafe { *self.locks.get() }
    }

    /// # Safety
    /// Caller must be the thread that owns this worker.
    pub unsafe fn adjust_locks(&self, delta: i32) {
        unsafe {
            let locks = &mut *self.locks.get();
            *locks = (*locks as i32 + delta).max(0) as u32;
        }
    }

    /// # Safety
    /// Caller must guarantee exclusive access to this worker's `g0` context
    /// (true whenever this worker's own OS thread calls it).
    pub unsafe fn g0_ptr(&self) -> *mut Context {
        self.g0.get()
    }
}

thread_local! {
    /// The worker id owning the current OS thread, set once at `mstart` and
    /// read by `yield_now`/`enter_syscall`/etc. so free functions don't need
    /// the index threaded through every call.
    static CURRENT_WORKER: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

pub fn current_worker_id() -> Option<u32> {
    CURRENT_WORKER.with(|cell| cell.get())
}

pub fn set_current_worker_id(id: Option<u32>) {
    CURRENT_WORKER.with(|cell| cell.set(id));
}
