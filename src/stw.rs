//! Stop-the-world barrier: park every worker at `mcpu <= 1` (the caller's
//! own slot) so the caller can run with exclusive access to shared state,
//! then release them again.

use crate::error::fatal;
use crate::matcher::matchmg;
use crate::scheduler_loop::current_sched;

/// Block until every other worker has vacated its parallelism slot. Callers
/// must pair this with [`start_the_world`] before returning control to any
/// task; nothing else may run while the world is stopped.
pub fn stop_the_world() {
    let sched = current_sched().unwrap_or_else(|| fatal!("stop_the_world: no current scheduler"));

    let mut inner = sched.lock();
    let previous_max = sched.word.set_mcpumax(1);
    inner.profilehz = 0;
    inner.singleproc = true;

    // Repeats the clear/CAS/drop-lock/sleep/reacquire cycle until `mcpu` is
    // actually observed <= 1 under the lock: a woken `stopped` note only
    // means "mcpu was <= mcpumax at some fast-path's moment," not that it's
    // still true by the time we reacquire — a concurrent `exit_syscall`'s
    // lock-free `fetch_add_mcpu(1)` can race the wakeup and creep `mcpu`
    // back up before this loop gets the lock again.
    loop {
        let word = sched.word.load();
        if word.mcpu <= 1 {
            break;
        }
        sched.stopped.clear();
        if sched.word.cas_waitstop_set(word) {
            sched.unlock(inner);
            sched.stopped.sleep();
            inner = sched.lock();
        }
        // Either the CAS lost to a concurrent word update (re-read and
        // retry with the lock still held) or we just woke up (re-check).
    }
    sched.unlock(inner);

    // Stash the pre-stop ceiling, since Inner has no slot reserved for it;
    // start_the_world on this same thread restores it.
    PREVIOUS_MCPUMAX.with(|cell| cell.set(previous_max));
}

thread_local! {
    static PREVIOUS_MCPUMAX: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// Resume every worker parked by a preceding [`stop_the_world`] call on the
/// same thread.
pub fn start_the_world() {
    let sched = current_sched().unwrap_or_else(|| fatal!("start_the_world: no current scheduler"));
    let previous_max = PREVIOUS_MCPUMAX.with(|cell| cell.get());

    let mut inner = sched.lock();
    sched.word.set_mcpumax(previous_max.max(1));
    inner.singleproc = previous_max <= 1;
    matchmg(&sched, &mut inner, None);
    sched.unlock(inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sched::Sched;
    use std::sync::Arc;

    #[test]
    fn stop_the_world_returns_immediately_with_no_other_workers() {
        let sched = Arc::new(Sched::new(&Config::builder().gomaxprocs(4).build()));
        crate::scheduler_loop::set_current_sched_for_test(sched.clone());
        stop_the_world();
        assert_eq!(sched.word.load().mcpumax, 1);
        start_the_world();
        assert_eq!(sched.word.load().mcpumax, 4);
    }
}
