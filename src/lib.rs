//! `nsched` — a user-level M:N task scheduler: a dynamic population of
//! cooperative tasks multiplexed onto a dynamic population of OS threads,
//! bounded by a configurable parallelism ceiling.
//!
//! The scheduler supports cooperative yielding, syscall-aware parallelism
//! accounting (a blocking syscall gives back its slot instead of starving
//! compute-bound tasks), task-to-thread pinning, deferred cleanup with
//! panic/recover semantics, segmented stack growth, and a stop-the-world
//! barrier for callers that need exclusive access to shared state (e.g. a
//! garbage collector, or any caller that needs every task parked).
//!
//! Most applications only need [`spawn`] and [`run_until_exit`]; everything
//! else is here for callers that need finer control (pinning a task to its
//! OS thread, tuning parallelism at runtime, coordinating around a blocking
//! syscall by hand).

mod arena;
mod config;
mod context_asm;
mod defer;
mod error;
mod matcher;
mod note;
mod sched;
mod scheduler_loop;
mod stack;
mod stw;
mod syscall;
mod task;
mod worker;

use std::sync::{Arc, OnceLock};

use error::fatal;
use sched::Sched;
use task::Task;

pub use config::{Config, ConfigBuilder};
pub use defer::PanicOutcome;
pub use sched::CpuProfiler;
pub use scheduler_loop::{exit_current, yield_now};
pub use stw::{start_the_world, stop_the_world};
pub use syscall::{enter_syscall, exit_syscall};

static DEFAULT_SCHED: OnceLock<Arc<Sched>> = OnceLock::new();

fn build_sched(config: &Config) -> Arc<Sched> {
    let sched = Arc::new(Sched::new(config));
    let mut inner = sched.lock();
    inner.predawn = false;
    sched.unlock(inner);
    sched
}

/// Initialize the process-wide scheduler with an explicit configuration.
/// Only the first call takes effect — later calls (including the implicit
/// one `spawn`/`run_until_exit` trigger on first use) are no-ops, since the
/// scheduler can only be born once per process.
pub fn schedinit(config: Config) {
    let _ = DEFAULT_SCHED.get_or_init(|| build_sched(&config));
}

fn default_sched() -> Arc<Sched> {
    DEFAULT_SCHED
        .get_or_init(|| build_sched(&Config::from_env()))
        .clone()
}

/// Create a task running `f`, enqueue it, and return its `goid`. May be
/// called from any thread, including from inside another task.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> u64 {
    let sched = default_sched();
    let mut inner = sched.lock();

    let g = match sched.gfget(&mut inner) {
        Some(g) => {
            inner.task(g).recycle();
            g
        }
        None => inner.tasks.insert(Task::new_idle(stack::STACK_MIN)),
    };

    let goid = inner.next_goid();
    let task = inner.task(g);
    task.set_goid(goid);
    // spec.md §4.3: `Idle ── spawn ──▶ Waiting ── ready ──▶ Runnable`.
    // `install_entry` performs the `spawn` half; `ready` performs the
    // `ready` half, right before this task is actually handed to `gput`.
    task.install_entry(Box::new(f), scheduler_loop::task_trampoline);
    task.ready();
    inner.gcount += 1;

    sched.gput(&mut inner, g);
    matcher::matchmg(&sched, &mut inner, worker::current_worker_id());
    sched.unlock(inner);

    log::debug!("spawned task {goid}");
    goid
}

/// Spawn `f` as the process's initial task and run the scheduler loop on
/// the calling thread, which becomes the first worker. Never returns: the
/// process exits with status 0 once every task (this one and anything it
/// transitively spawns) has finished, per [`Sched`]'s `gcount == 0` exit
/// contract.
pub fn run_until_exit(f: impl FnOnce() + Send + 'static) -> ! {
    let sched = default_sched();
    spawn(f);

    let worker_id = {
        let mut inner = sched.lock();
        let id = inner.workers.insert(worker::Worker::new(inner.workers.len() as u32));
        inner.mcount += 1;
        id
    };
    scheduler_loop::mstart(sched, worker_id);
    unreachable!("mstart's scheduler loop never returns")
}

/// Set the parallelism ceiling, returning the previous value. Clamped to
/// `[1, MAX_MCPUMAX]`. If the calling task's worker is over the new cap,
/// yields once so the excess is given back promptly rather than waiting
/// for some other task to do so first.
pub fn set_parallelism(n: u32) -> u32 {
    let sched = default_sched();
    let old = sched.word.set_mcpumax(n);
    let word = sched.word.load();
    if word.mcpumax != n {
        log::warn!("set_parallelism({n}) out of range, clamped to {}", word.mcpumax);
    }
    if word.mcpu > word.mcpumax as i32 && scheduler_loop::current_task().is_some() {
        yield_now();
    }
    old
}

/// The current parallelism ceiling (`gomaxprocs`).
pub fn parallelism() -> u32 {
    default_sched().gomaxprocs()
}

/// Number of live tasks (spawned, not yet reclaimed into the free list).
pub fn task_count() -> u32 {
    default_sched().gcount()
}

/// Number of worker OS threads created so far.
pub fn worker_count() -> u32 {
    default_sched().mcount()
}

/// The current value of `mcpu` — workers presently executing task code,
/// excluding syscall and idle. Exposed for tests and
/// diagnostics that need to observe the scheduling word directly, e.g. to
/// confirm [`stop_the_world`] actually drained parallelism to `<= 1`.
pub fn debug_mcpu() -> i32 {
    default_sched().word.load().mcpu
}

/// Pin the calling task to its current worker: this task will only ever be
/// dispatched on this OS thread, and this worker will only ever dispatch
/// this task (until [`unpin_from_thread`]). Fatal if called before the
/// scheduler has finished initializing, or off any task.
pub fn pin_to_thread() {
    let worker_id = worker::current_worker_id().unwrap_or_else(|| fatal!("pin_to_thread: not running on a worker"));
    let g = scheduler_loop::current_task().unwrap_or_else(|| fatal!("pin_to_thread: no current task"));
    let sched = scheduler_loop::current_sched().unwrap_or_else(|| fatal!("pin_to_thread: no current scheduler"));

    let inner = sched.lock();
    if inner.predawn {
        fatal!("pin_to_thread: called before scheduler init completed");
    }
    unsafe {
        inner.task(g).set_locked_worker(Some(worker_id));
        inner.worker(worker_id).set_lockedg(Some(g));
    }
}

/// Undo a prior [`pin_to_thread`]. A no-op if the calling task isn't pinned.
pub fn unpin_from_thread() {
    let worker_id = worker::current_worker_id().unwrap_or_else(|| fatal!("unpin_from_thread: not running on a worker"));
    let g = scheduler_loop::current_task().unwrap_or_else(|| fatal!("unpin_from_thread: no current task"));
    let sched = scheduler_loop::current_sched().unwrap_or_else(|| fatal!("unpin_from_thread: no current scheduler"));

    let inner = sched.lock();
    unsafe {
        inner.task(g).set_locked_worker(None);
        inner.worker(worker_id).set_lockedg(None);
    }
}

/// Whether the calling task is currently pinned to its worker. `false` if
/// called off any task.
pub fn is_pinned() -> bool {
    let Some(g) = scheduler_loop::current_task() else {
        return false;
    };
    let sched = scheduler_loop::current_sched().unwrap_or_else(|| fatal!("is_pinned: no current scheduler"));
    sched.lock().task(g).locked_worker().is_some()
}

/// Install (or, with `hz == 0`, remove) a CPU profiler callback invoked at
/// roughly `hz` samples per second per worker. `None`/`0` disables it.
pub fn set_cpu_profiler(profiler: Option<CpuProfiler>, hz: u32) {
    let sched = default_sched();
    let mut inner = sched.lock();
    if hz == 0 {
        if inner.profiler.is_some() {
            log::debug!("cpu profiler disabled");
        }
        inner.profiler = None;
        inner.profilehz = 0;
    } else {
        log::debug!("cpu profiler enabled at {hz}hz");
        inner.profiler = profiler;
        inner.profilehz = hz;
    }
    sched.unlock(inner);
}

/// Register a deferred action on the calling task, run LIFO when the task
/// returns or panics. Fatal if called off any task.
pub fn defer(action: impl FnMut() + Send + 'static) {
    let g = scheduler_loop::current_task().unwrap_or_else(|| fatal!("defer: no current task"));
    let sched = scheduler_loop::current_sched().unwrap_or_else(|| fatal!("defer: no current scheduler"));
    sched.lock().task(g).defer(action);
}

/// Attempt to recover an in-flight panic from within a deferred call. See
/// [`crate::defer::Defers::recover`] for the exact applicability rule.
pub fn recover() -> Option<Box<dyn core::any::Any + Send>> {
    let g = scheduler_loop::current_task()?;
    let sched = scheduler_loop::current_sched()?;
    sched.lock().task(g).recover()
}

/// Raise a panic on the calling task's defer chain. Returns whether some
/// deferred call recovered it.
///
/// Unlike [`defer`]/[`recover`], this does not hold the scheduler lock
/// across the call: the deferred calls it walks are arbitrary task code
/// that will very likely call back into [`recover`] (or [`defer`], or any
/// other scheduler API) itself, and `Mutex` isn't reentrant.
///
/// `panic_now` is a plain function call: it has no way to make the calling
/// function return early the way a compiler-generated epilogue check would.
/// **Callers must check the returned [`PanicOutcome`] and `return`
/// immediately on `Recovered`** — any code written after this call that
/// isn't conditioned on the outcome runs regardless of whether the panic
/// was recovered, which is almost never what's wanted. See
/// `demo_panic_recover` for the pattern.
pub fn panic_now(payload: Box<dyn core::any::Any + Send>) -> PanicOutcome {
    let g = scheduler_loop::current_task().unwrap_or_else(|| fatal!("panic_now: no current task"));
    let sched = scheduler_loop::current_sched().unwrap_or_else(|| fatal!("panic_now: no current scheduler"));
    let task_ptr = sched.lock().task(g) as *const Task;
    // Safety: task arena entries are never removed or relocated, and the
    // calling task is the only thing touching its own `Task` while it is
    // dispatched (the scheduler lock guards arena *indices*, not the task
    // bodies a currently-running task reads from its own slot).
    unsafe { (*task_ptr).panic_now(payload) }
}
