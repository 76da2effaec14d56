//! Syscall fast-path coordination: blocking syscalls must not hold onto a
//! parallelism slot, but a worker sitting in a syscall for a handful of
//! microseconds shouldn't pay the full matcher/lock cost either.
//!
//! The fast paths touch only the atomic scheduling word, never the
//! scheduler lock. This crate's arena-indexed ownership model means
//! reaching a task's status still requires a brief lock acquisition to
//! resolve the arena index to a pointer; everything after that — the
//! status swap, the word fetch-add, the branch on `gwaiting`/`waitstop` —
//! happens without holding it. That one short lookup is the cost of not
//! having raw pointers to hand, not a re-introduction of the slow path.

use crate::error::fatal;
use crate::matcher::matchmg;
use crate::scheduler_loop::{current_sched, current_task};
use crate::task::TaskStatus;
use crate::worker;

/// Mark the current task as blocked in a syscall and give back its
/// parallelism slot. Call this immediately before a blocking OS call.
pub fn enter_syscall() {
    let g = current_task().unwrap_or_else(|| fatal!("enter_syscall: no current task"));
    let sched = current_sched().unwrap_or_else(|| fatal!("enter_syscall: no current scheduler"));

    {
        let inner = sched.lock();
        inner.task(g).set_status(TaskStatus::Syscall);
    }

    let word = sched.word.fetch_add_mcpu(-1);
    if !word.gwaiting && !(word.waitstop && word.mcpu > word.mcpumax as i32) {
        return;
    }

    // Slow path: something needs the lock (a waiting matcher, or a
    // stop-the-world barrier waiting for mcpu to drain).
    let mut inner = sched.lock();
    if sched.word.load().gwaiting {
        matchmg(&sched, &mut inner, worker::current_worker_id());
    }
    let word = sched.word.load();
    if word.waitstop && word.mcpu <= word.mcpumax as i32 {
        sched.word.clear_waitstop();
        sched.stopped.wakeup();
    }
    sched.unlock(inner);
}

/// Reclaim a parallelism slot after a blocking syscall returns, yielding
/// first if none is available.
pub fn exit_syscall() {
    let g = current_task().unwrap_or_else(|| fatal!("exit_syscall: no current task"));
    let sched = current_sched().unwrap_or_else(|| fatal!("exit_syscall: no current scheduler"));

    let word = sched.word.fetch_add_mcpu(1);
    if word.mcpu <= word.mcpumax as i32 {
        let inner = sched.lock();
        inner.task(g).set_status(TaskStatus::Running);
        return;
    }

    // Slow path: over the cap. Mark for re-readying and fall back to the
    // scheduler, which will re-dispatch once a slot is free. Status is
    // still `Syscall` here; `yield_now`'s own transition to `Runnable`
    // covers it (Syscall -> Runnable is as legal as Running -> Runnable).
    {
        let inner = sched.lock();
        inner.task(g).set_readyonstop(true);
    }
    crate::scheduler_loop::yield_now();
}
