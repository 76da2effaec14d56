//! Scheduler state (`S`) — the process-wide (or, for tests, per-instance)
//! singleton guarding the ready queue, free list, idle-worker list, and
//! bookkeeping counters.
//!
//! A single `Mutex`-guarded struct holding everything that isn't safe to
//! touch lock-free, matching against a FIFO ready queue plus an
//! idle-worker stack rather than per-CPU round robin.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::arena::Arena;
use crate::config::Config;
use crate::error::fatal;
use crate::note::Note;
use crate::task::{Task, TaskStatus};
use crate::word::SchedWord;
use crate::worker::Worker;

pub type CpuProfiler = Box<dyn Fn(u64) + Send + Sync>;

pub(crate) struct Inner {
    pub tasks: Arena<Task>,
    pub workers: Arena<Worker>,

    /// LIFO free list of reusable `Dead` tasks.
    pub gfree: Vec<u32>,

    /// FIFO ready queue; its length is the ready-queue length tracked by
    /// `gwaiting` below.
    pub ready: VecDeque<u32>,

    /// Count of tasks in `{Running, Syscall}`.
    pub grunning: u32,
    /// Count of live (non-`Idle`, non-freed) tasks; process exits at 0.
    pub gcount: u32,
    pub goidgen: u64,

    /// LIFO idle-worker list.
    pub idle_workers: Vec<u32>,
    pub mcount: u32,

    /// Suppresses matching during `schedinit`.
    pub predawn: bool,
    pub profilehz: u32,
    pub profiler: Option<CpuProfiler>,

    /// Deferred wakeup batching slot: the matcher records the most
    /// recently matched worker here and the signal itself is sent only
    /// when the lock is released, so the freshly-matched worker doesn't
    /// immediately contend for the lock its waker still holds.
    pub mwakeup: Option<u32>,

    pub singleproc: bool,
}

impl Inner {
    fn new() -> Self {
        Inner {
            tasks: Arena::new(),
            workers: Arena::new(),
            gfree: Vec::new(),
            ready: VecDeque::new(),
            grunning: 0,
            gcount: 0,
            goidgen: 0,
            idle_workers: Vec::new(),
            mcount: 0,
            predawn: true,
            profilehz: 0,
            profiler: None,
            mwakeup: None,
            singleproc: false,
        }
    }

    pub fn task(&self, idx: u32) -> &Task {
        self.tasks.get(idx)
    }

    pub fn worker(&self, idx: u32) -> &Worker {
        self.workers.get(idx)
    }

    pub fn next_goid(&mut self) -> u64 {
        self.goidgen += 1;
        self.goidgen
    }
}

/// The process-wide (or, in tests, per-instance) scheduler singleton.
pub struct Sched {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) word: SchedWord,
    pub(crate) stopped: Note,
}

impl Sched {
    pub fn new(config: &Config) -> Self {
        let word = SchedWord::new();
        word.set_mcpumax(config.gomaxprocs());
        Sched {
            inner: Mutex::new(Inner::new()),
            word,
            stopped: Note::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn gcount(&self) -> u32 {
        self.lock().gcount
    }

    pub fn mcount(&self) -> u32 {
        self.lock().mcount
    }

    pub fn gomaxprocs(&self) -> u32 {
        self.word.load().mcpumax
    }

    /// Lock-free CAS loop: succeeds (and reserves a slot) iff `mcpu < mcpumax`.
    pub fn canaddmcpu(&self) -> bool {
        self.word.can_add_mcpu()
    }

    /// Put a task back onto the ready queue (or hand it directly to its
    /// pinned/idle worker). Caller holds the lock.
    pub(crate) fn gput(&self, inner: &mut Inner, g: u32) {
        let task = inner.task(g);
        if let Some(lockedm) = task.locked_worker() {
            if self.canaddmcpu() {
                // Routed through `mnextg` rather than setting `nextg`
                // directly: a worker's handoff slot can already be occupied
                // by a concurrent redirect (`next_and_unlock`'s
                // pinned-redirect branch), and silently overwriting it would
                // lose the previously-redirected task and leak its `mcpu`
                // reservation forever. `mnextg` aborts loudly instead.
                crate::matcher::mnextg(inner, lockedm, g);
                return;
            }
            // No room to run it right now; fall through and park it FIFO
            // like any other ready task until a slot opens up.
        }
        if let Some(idlem) = task.idle_worker() {
            let worker = inner.worker(idlem);
            if unsafe { worker.idleg() }.is_some() {
                fatal!("gput: double idle on worker {idlem}");
            }
            unsafe { worker.set_idleg(Some(g)) };
            return;
        }
        let was_empty = inner.ready.is_empty();
        inner.ready.push_back(g);
        if was_empty {
            self.word.set_gwaiting(true);
        }
    }

    /// Pop the next runnable task off the ready queue, falling back to
    /// `caller`'s own idle-task slot if the queue is empty. Caller holds
    /// the lock.
    pub(crate) fn gget(&self, inner: &mut Inner, caller: Option<u32>) -> Option<u32> {
        if let Some(g) = inner.ready.pop_front() {
            if inner.ready.is_empty() {
                self.word.set_gwaiting(false);
            }
            return Some(g);
        }
        let caller = caller?;
        let worker = inner.worker(caller);
        let slot = unsafe { worker.idleg() };
        if slot.is_some() {
            unsafe { worker.set_idleg(None) };
        }
        slot
    }

    /// Push a worker onto the idle list. Caller holds the lock.
    pub(crate) fn mput(&self, inner: &mut Inner, m: u32) {
        inner.idle_workers.push(m);
    }

    /// Pick a worker for `g`: its pinned worker if it has one, else the
    /// most recently idled worker. Caller holds the lock.
    pub(crate) fn mget(&self, inner: &mut Inner, g: u32) -> Option<u32> {
        let task = inner.task(g);
        if let Some(lockedm) = task.locked_worker() {
            return Some(lockedm);
        }
        inner.idle_workers.pop()
    }

    /// Push a `Dead` task onto the reusable free list. Caller holds the lock.
    pub(crate) fn gfput(&self, inner: &mut Inner, g: u32) {
        debug_assert_eq!(inner.task(g).status(), TaskStatus::Dead);
        inner.gfree.push(g);
    }

    /// Pop a reusable `Dead` task off the free list, if any. Caller holds
    /// the lock.
    pub(crate) fn gfget(&self, inner: &mut Inner) -> Option<u32> {
        inner.gfree.pop()
    }

    /// Releases the scheduler lock and flushes the batched wakeup slot —
    /// the signal is sent only once the lock is actually released. Every
    /// code path that drops the lock and might have set `mwakeup` goes
    /// through here instead of a bare `drop`, so the wakeup is never
    /// forgotten.
    pub(crate) fn unlock(&self, mut inner: MutexGuard<'_, Inner>) {
        let wakeup = inner.mwakeup.take();
        let worker_ptr = wakeup.map(|w| inner.worker(w) as *const Worker);
        drop(inner);
        if let Some(ptr) = worker_ptr {
            // Safety: workers are never removed from the arena.
            unsafe { (*ptr).havenextg.wakeup() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn new_test_sched(gomaxprocs: u32) -> Sched {
        Sched::new(&Config::builder().gomaxprocs(gomaxprocs).build())
    }

    #[test]
    fn gput_gget_is_fifo() {
        let sched = new_test_sched(4);
        let mut inner = sched.lock();
        let a = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        let b = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        sched.gput(&mut inner, a);
        sched.gput(&mut inner, b);
        assert_eq!(sched.gget(&mut inner, None), Some(a));
        assert_eq!(sched.gget(&mut inner, None), Some(b));
        assert_eq!(sched.gget(&mut inner, None), None);
    }

    #[test]
    fn gwaiting_bit_tracks_queue_emptiness() {
        let sched = new_test_sched(4);
        let mut inner = sched.lock();
        assert!(!sched.word.load().gwaiting);
        let a = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        sched.gput(&mut inner, a);
        assert!(sched.word.load().gwaiting);
        sched.gget(&mut inner, None);
        assert!(!sched.word.load().gwaiting);
    }

    #[test]
    fn gfree_is_lifo() {
        let sched = new_test_sched(4);
        let mut inner = sched.lock();
        let a = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        let b = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        for &g in &[a, b] {
            let t = inner.task(g);
            t.set_status(TaskStatus::Waiting);
            t.set_status(TaskStatus::Runnable);
            t.set_status(TaskStatus::Running);
            t.set_status(TaskStatus::Moribund);
            t.set_status(TaskStatus::Dead);
        }
        sched.gfput(&mut inner, a);
        sched.gfput(&mut inner, b);
        assert_eq!(sched.gfget(&mut inner), Some(b));
        assert_eq!(sched.gfget(&mut inner), Some(a));
    }
}
