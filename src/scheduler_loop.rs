//! Per-worker scheduler loop and task dispatch.
//!
//! A per-worker loop that asks the run queue for the next task and
//! context-switches onto it. Because `context_switch` resumes a yielded
//! task at the instruction right after the `call` that dispatched it (see
//! `context_asm::context_switch`'s `lea rax, [rip+2f]` trick), `schedule`
//! doesn't need to be a non-returning function reached only via some
//! separate resume primitive — it's naturally an ordinary Rust loop whose
//! dispatch call *returns* each time the task yields, blocks, or exits.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, MutexGuard};

use crate::context_asm::context_switch;
use crate::error::fatal;
use crate::matcher::{matchmg, mnextg};
use crate::sched::{Inner, Sched};
use crate::task::{Entry, Task, TaskStatus};
use crate::worker;

/// A fixed size for every worker's native OS stack, wide enough for this
/// crate's scheduler loop to run hosted Rust (logging, `Mutex`, `Vec`)
/// safely rather than a hand-tuned minimal loop.
pub const WORKER_STACK_SIZE: usize = 256 * 1024;

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Arc<Sched>>> = const { RefCell::new(None) };
    static CURRENT_TASK: Cell<Option<u32>> = const { Cell::new(None) };
}

pub(crate) fn current_sched() -> Option<Arc<Sched>> {
    CURRENT_SCHED.with(|cell| cell.borrow().clone())
}

pub(crate) fn current_task() -> Option<u32> {
    CURRENT_TASK.with(|cell| cell.get())
}

/// Test-only hook so `stw`/`syscall` unit tests can exercise their
/// thread-local lookups without spinning up a real worker thread.
#[cfg(test)]
pub(crate) fn set_current_sched_for_test(sched: Arc<Sched>) {
    CURRENT_SCHED.with(|cell| *cell.borrow_mut() = Some(sched));
}

fn set_current_task(g: Option<u32>) {
    CURRENT_TASK.with(|cell| cell.set(g));
}

/// Entry point of every worker's OS thread.
pub fn mstart(sched: Arc<Sched>, worker_id: u32) {
    worker::set_current_worker_id(Some(worker_id));
    CURRENT_SCHED.with(|cell| *cell.borrow_mut() = Some(sched.clone()));
    run_loop(sched, worker_id, None);
}

/// Dispatch loop: handle the task that just returned control to us (if
/// any), then dispatch the next one, forever.
fn run_loop(sched: Arc<Sched>, worker_id: u32, mut prev: Option<u32>) -> ! {
    loop {
        let mut inner = sched.lock();

        if let Some(prev_g) = prev.take() {
            handle_returned_task(&sched, &mut inner, prev_g);
        }
        unsafe { inner.worker(worker_id).set_curg(None) };

        let g = next_and_unlock(&sched, inner, worker_id);

        set_current_task(Some(g));
        let (task_ctx, worker_ctx) = {
            let inner = sched.lock();
            let task = inner.task(g);
            task.set_status(TaskStatus::Running);
            unsafe { inner.worker(worker_id).set_curg(Some(g)) };
            let task_ctx = unsafe { task.context_ptr() };
            let worker_ctx = unsafe { inner.worker(worker_id).g0_ptr() };
            (task_ctx, worker_ctx)
        };

        // Control leaves here and resumes either inside the freshly
        // installed trampoline (first dispatch) or right after the
        // matching `context_switch` call in `switch_to_scheduler` (a
        // resumed task) — and returns here only once that task next calls
        // `switch_to_scheduler`.
        unsafe { context_switch(worker_ctx, task_ctx) };

        prev = Some(g);
    }
}

/// React to the status `prev` left itself in before yielding control
/// back to the scheduler.
fn handle_returned_task(sched: &Arc<Sched>, inner: &mut Inner, prev_g: u32) {
    inner.grunning -= 1;
    sched.word.fetch_add_mcpu(-1);

    let status = inner.task(prev_g).status();
    match status {
        TaskStatus::Runnable => {
            sched.gput(inner, prev_g);
        }
        TaskStatus::Moribund => {
            let task = inner.task(prev_g);
            task.set_status(TaskStatus::Dead);
            let locked_worker = task.locked_worker();
            unsafe {
                task.set_locked_worker(None);
                task.set_idle_worker(None);
                task.stack_mut().unwind_to_base();
            }
            // A task can die pinned (panicked, or simply never called
            // `unpin_from_thread`) — its worker's `lockedg` must be cleared
            // here too, or that worker is left believing it is still
            // exclusively responsible for a slot that gets recycled into an
            // unrelated task, spinning through `matchmg` forever waiting for
            // a `Runnable` transition that was never its to wait for.
            if let Some(worker_id) = locked_worker {
                unsafe { inner.worker(worker_id).set_lockedg(None) };
            }
            sched.gfput(inner, prev_g);
            inner.gcount -= 1;
            if inner.gcount == 0 {
                log::info!("task count reached zero, exiting");
                std::process::exit(0);
            }
            return;
        }
        other => fatal!("schedule: task {prev_g:?} returned in unexpected status {other:?}"),
    }

    let task = inner.task(prev_g);
    if task.readyonstop() {
        task.set_readyonstop(false);
    }
}

/// Consumes the lock, returning without it held — the task index
/// returned is guaranteed dispatchable.
fn next_and_unlock(sched: &Arc<Sched>, mut inner: MutexGuard<'_, Inner>, worker_id: u32) -> u32 {
    loop {
        if let Some(g) = unsafe { inner.worker(worker_id).nextg() } {
            unsafe { inner.worker(worker_id).set_nextg(None) };
            // Every producer of a handoff (`gput`'s lockedm branch, `matchmg`,
            // the pinned-redirect branch below) reserved this dispatch's
            // `mcpu` slot via `canaddmcpu()` when it decided to send the task
            // here — but none of them bump `grunning`, since that counter
            // belongs to whichever worker actually ends up running the task.
            // `handle_returned_task` decrements it unconditionally for every
            // task that is ever returned from here, so it must be
            // incremented here too or the count drifts negative.
            inner.grunning += 1;
            sched.unlock(inner);
            return g;
        }

        if let Some(lockedg) = unsafe { inner.worker(worker_id).lockedg() } {
            if inner.task(lockedg).status() != TaskStatus::Runnable {
                matchmg(sched, &mut inner, Some(worker_id));
                continue;
            }
        }

        let mut dispatched = None;
        while sched.canaddmcpu() {
            let Some(g) = sched.gget(&mut inner, Some(worker_id)) else {
                sched.word.fetch_add_mcpu(-1);
                break;
            };
            let task = inner.task(g);
            if let Some(pinned) = task.locked_worker() {
                if pinned != worker_id {
                    // The `mcpu` slot `canaddmcpu()` just reserved travels
                    // with the handoff rather than being given back: the
                    // pinned worker's own `next_and_unlock` will pick this
                    // task up through the `nextg` branch above, which counts
                    // on the slot already being reserved (mirroring `gput`'s
                    // lockedm branch and `matchmg`) rather
                    // than re-reserving it itself.
                    //
                    // Routed through `mnextg` rather than setting `nextg`
                    // directly so a concurrent double handoff onto `pinned`
                    // (e.g. racing `gput`) aborts loudly instead of silently
                    // overwriting the other one.
                    mnextg(&mut inner, pinned, g);
                    continue;
                }
            }
            inner.grunning += 1;
            dispatched = Some(g);
            break;
        }
        if let Some(g) = dispatched {
            sched.unlock(inner);
            return g;
        }

        // Nothing dispatchable: park this worker. `worker_ptr` is taken as a
        // raw pointer (rather than kept as a `&Worker` tied to `inner`'s
        // lifetime) so it can still be dereferenced after `sched.unlock`
        // below drops the guard; workers are never removed from the arena,
        // so the pointer stays valid for the `Sched`'s lifetime.
        sched.mput(&mut inner, worker_id);
        let worker_ptr = inner.workers.get_ptr(worker_id);
        unsafe {
            (*worker_ptr).set_waitnextg(true);
            (*worker_ptr).havenextg.clear();
        }

        if inner.grunning == 0 {
            fatal!("all goroutines are asleep — deadlock");
        }

        // A parking worker must itself check for a pending stop-the-world
        // barrier — not just the syscall fast paths — since
        // a workload that only ever cooperatively yields (never calls
        // `enter_syscall`) would otherwise never signal `stopped` and
        // `stop_the_world` would hang forever.
        let word = sched.word.load();
        if word.waitstop && word.mcpu <= word.mcpumax as i32 {
            sched.word.clear_waitstop();
            sched.stopped.wakeup();
        }

        sched.unlock(inner);
        // Safety: the pointer was taken from the (never-shrinking) worker
        // arena and is still live; nothing but this worker's own thread and
        // a matcher holding the scheduler lock touch its fields, and the
        // matcher's `wakeup()` happens-before this `sleep()` returns.
        let worker = unsafe { &*worker_ptr };
        worker.havenextg.sleep();

        let g = unsafe { worker.nextg() }.unwrap_or_else(|| fatal!("woke from havenextg with no nextg"));
        unsafe {
            worker.set_nextg(None);
            worker.set_waitnextg(false);
        }
        // Same bookkeeping as the `nextg` branch at the top of this
        // function: whoever woke us already reserved the `mcpu` slot, but
        // `grunning` is this worker's to bump once it actually takes the
        // task.
        sched.lock().grunning += 1;
        return g;
    }
}

/// Switches the currently running task off the CPU and back onto its
/// worker's scheduler loop. The caller must have already set the task's
/// status to whatever it should be observed in by `handle_returned_task`
/// (`Runnable` to re-queue, `Moribund` to exit, `Syscall` handled
/// separately by `crate::syscall`).
///
/// # Safety
/// Must be called only by the task currently running as `g`, on its own
/// stack, with no scheduler lock held.
unsafe fn switch_to_scheduler(worker_id: u32, g: u32) {
    let sched = current_sched().unwrap_or_else(|| fatal!("switch_to_scheduler: no current scheduler"));
    let (task_ctx, worker_ctx) = {
        let inner = sched.lock();
        let task_ctx = unsafe { inner.task(g).context_ptr() };
        let worker_ctx = unsafe { inner.worker(worker_id).g0_ptr() };
        (task_ctx, worker_ctx)
    };
    unsafe { context_switch(task_ctx, worker_ctx) };
}

/// Re-queue the current task and dispatch another. Fatal if called off a
/// task (e.g. from the scheduler task itself) or while holding any lock
/// count.
pub fn yield_now() {
    let worker_id = worker::current_worker_id().unwrap_or_else(|| fatal!("yield_now: not running on a worker"));
    let g = current_task().unwrap_or_else(|| fatal!("yield_now: no current task (called from g0)"));
    let sched = current_sched().unwrap_or_else(|| fatal!("yield_now: no current scheduler"));
    {
        let inner = sched.lock();
        if inner.worker(worker_id).lock_count() > 0 {
            fatal!("yield_now: called while holding {} lock(s)", inner.worker(worker_id).lock_count());
        }
        inner.task(g).set_status(TaskStatus::Runnable);
    }
    unsafe { switch_to_scheduler(worker_id, g) };
}

/// Run all deferreds, then set `Moribund` and yield (never to return —
/// the slot is dead once `handle_returned_task` processes it).
pub fn exit_current() -> ! {
    let worker_id = worker::current_worker_id().unwrap_or_else(|| fatal!("exit_current: not running on a worker"));
    let g = current_task().unwrap_or_else(|| fatal!("exit_current: no current task"));
    let sched = current_sched().unwrap_or_else(|| fatal!("exit_current: no current scheduler"));
    // Deferred calls are arbitrary task code, free to call `defer`/`recover`
    // themselves (both take the scheduler lock) — run them with the lock
    // released, as with `panic_now` above.
    let task_ptr = { sched.lock().task(g) as *const Task };
    unsafe { (*task_ptr).run_all_deferred() };
    {
        let inner = sched.lock();
        inner.task(g).set_status(TaskStatus::Moribund);
    }
    unsafe { switch_to_scheduler(worker_id, g) };
    fatal!("exit_current: task resumed after Moribund handoff");
}

/// The first-ever instruction a fresh task's context resumes at. Runs the
/// installed entry closure, converting any native
/// Rust panic into this crate's own cooperative panic so it is handled by
/// the task's defer chain instead of unwinding through a raw-asm-switched
/// stack (which has no unwind tables).
pub(crate) extern "C" fn task_trampoline() -> ! {
    let worker_id = worker::current_worker_id().unwrap_or_else(|| fatal!("task_trampoline: no current worker"));
    let g = current_task().unwrap_or_else(|| fatal!("task_trampoline: no current task"));
    let sched = current_sched().unwrap_or_else(|| fatal!("task_trampoline: no current scheduler"));

    let entry: Entry = {
        let inner = sched.lock();
        unsafe { inner.task(g).take_entry() }
    }
    .unwrap_or_else(|| fatal!("task_trampoline: task {g:?} has no installed entry"));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
    if let Err(payload) = result {
        // `panic_now` walks the task's deferred calls, which are arbitrary
        // task code free to call back into `recover`/`defer` (both of which
        // take the scheduler lock themselves) — so the lock must not be
        // held across this call. Same raw-pointer pattern as the context
        // switch above: task arena slots are never removed or relocated,
        // and this task is the only thing touching its own slot right now.
        let task_ptr = { sched.lock().task(g) as *const Task };
        let outcome = unsafe { (*task_ptr).panic_now(payload) };
        if outcome == crate::defer::PanicOutcome::Unrecovered {
            log::error!("task {g:?} exited with an unrecovered panic");
        }
    }

    exit_current();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::worker::Worker;

    #[test]
    fn worker_stack_size_is_page_aligned() {
        assert_eq!(WORKER_STACK_SIZE % 4096, 0);
    }

    /// A task that dies still pinned (panicked without calling
    /// `unpin_from_thread`) must release its worker's `lockedg` too, not
    /// just its own `locked_worker` — otherwise the worker is stuck
    /// believing it owns a task index that gets recycled into something
    /// else entirely.
    #[test]
    fn moribund_pinned_task_clears_its_worker_lockedg() {
        let sched = Arc::new(Sched::new(&Config::builder().gomaxprocs(2).build()));
        let mut inner = sched.lock();
        inner.predawn = false;

        let worker_id = inner.workers.insert(Worker::new(0));
        inner.mcount += 1;

        let g = inner.tasks.insert(Task::new_idle(crate::stack::STACK_MIN));
        inner.task(g).install_entry(Box::new(|| {}), task_trampoline);
        inner.task(g).ready();
        unsafe {
            inner.task(g).set_locked_worker(Some(worker_id));
            inner.worker(worker_id).set_lockedg(Some(g));
        }
        inner.grunning += 1;
        // +2, not +1: `handle_returned_task`'s `Moribund` branch calls
        // `std::process::exit(0)` once `gcount` hits zero — fatal to a test
        // binary. Keeping one extra phantom
        // live task avoids tripping that exit for this assertion-only test.
        inner.gcount += 2;
        inner.task(g).set_status(TaskStatus::Running);
        inner.task(g).set_status(TaskStatus::Moribund);

        handle_returned_task(&sched, &mut inner, g);

        assert_eq!(inner.task(g).locked_worker(), None);
        assert_eq!(unsafe { inner.worker(worker_id).lockedg() }, None);
    }
}
