//! The matcher (`matchmg`): pairs ready tasks with idle workers, spawning
//! new workers up to the parallelism ceiling.

use std::sync::Arc;

use crate::error::fatal;
use crate::sched::{Inner, Sched};
use crate::scheduler_loop::{mstart, WORKER_STACK_SIZE};
use crate::worker::Worker;

/// Hand `g` to `worker_id`: publish it to the worker's handoff slot and, if
/// the worker is already parked on `havenextg`, record it in `mwakeup` so
/// the caller's eventual `Sched::unlock` signals it.
pub(crate) fn mnextg(inner: &mut Inner, worker_id: u32, g: u32) {
    let worker = inner.worker(worker_id);
    if unsafe { worker.nextg() }.is_some() {
        fatal!("mnextg: worker {worker_id} already has a pending handoff");
    }
    unsafe { worker.set_nextg(Some(g)) };
    if unsafe { worker.waitnextg() } {
        inner.mwakeup = Some(worker_id);
    }
}

/// Allocate a new worker and launch its OS thread entering `mstart`. The
/// new thread blocks on `Sched`'s lock inside `mstart` until this call's
/// locked section (and anything after it) finishes — no deadlock, just a
/// short park.
fn spawn_worker(sched: &Arc<Sched>, inner: &mut Inner) -> u32 {
    let id = inner.workers.insert(Worker::new(inner.workers.len() as u32));
    inner.mcount += 1;
    let sched = sched.clone();
    std::thread::Builder::new()
        .name(format!("nsched-worker-{id}"))
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || mstart(sched, id))
        .unwrap_or_else(|e| fatal!("failed to spawn worker thread: {e}"));
    id
}

/// `caller` is the worker invoking the matcher on its own behalf (e.g. from
/// `next_and_unlock`), if any; `None` when called from a context with no
/// current worker (e.g. `spawn` from outside any task).
pub(crate) fn matchmg(sched: &Arc<Sched>, inner: &mut Inner, caller: Option<u32>) {
    if let Some(caller) = caller {
        let worker = inner.worker(caller);
        if worker.is_mallocing() || worker.is_gcing() {
            return;
        }
    }
    if inner.predawn {
        return;
    }

    while !inner.ready.is_empty() && sched.canaddmcpu() {
        let g = match sched.gget(inner, None) {
            Some(g) => g,
            None => {
                // Another path drained the queue between the emptiness
                // check and gget (shouldn't happen under the single
                // scheduler lock, but the word's mcpu reservation from
                // canaddmcpu above must still be given back).
                sched.word.fetch_add_mcpu(-1);
                break;
            }
        };
        let worker_id = match sched.mget(inner, g) {
            Some(w) => w,
            None => spawn_worker(sched, inner),
        };
        mnextg(inner, worker_id, g);
    }
}
