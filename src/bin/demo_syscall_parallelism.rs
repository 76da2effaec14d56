//! Scenario 3: with a single parallelism slot, a task blocked in
//! `enter_syscall`/`exit_syscall` must give its slot back to a compute-bound
//! sibling rather than starving it — and must itself become runnable again
//! (not be skipped) once it returns from the syscall.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(1).build());

    nsched::run_until_exit(|| {
        let spins = Arc::new(AtomicU64::new(0));
        let b_done = Arc::new(AtomicBool::new(false));
        let spins_at_b_exit = Arc::new(AtomicU64::new(0));

        {
            let spins = spins.clone();
            let b_done = b_done.clone();
            nsched::spawn(move || {
                while !b_done.load(Ordering::Acquire) {
                    spins.fetch_add(1, Ordering::Relaxed);
                    nsched::yield_now();
                }
            });
        }

        {
            let spins = spins.clone();
            let b_done = b_done.clone();
            let spins_at_b_exit = spins_at_b_exit.clone();
            nsched::spawn(move || {
                nsched::enter_syscall();
                std::thread::sleep(Duration::from_millis(20));
                nsched::exit_syscall();
                spins_at_b_exit.store(spins.load(Ordering::Relaxed), Ordering::Relaxed);
                b_done.store(true, Ordering::Release);
            });
        }

        while !b_done.load(Ordering::Acquire) {
            nsched::yield_now();
        }

        // The spinner must have made progress *while* B was blocked in its
        // syscall — i.e. B's slot really was given back.
        let made_progress_during_syscall = spins_at_b_exit.load(Ordering::Relaxed) > 0;
        println!("progressed_during_syscall={made_progress_during_syscall}");
        std::io::stdout().flush().ok();
    });
}
