//! Scenario 2: with two parallelism slots, two compute-bound spinners must
//! make real, concurrent progress — both counters are nonzero after a
//! short, wall-clock window.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(2).build());

    nsched::run_until_exit(|| {
        let counter_a = Arc::new(AtomicU64::new(0));
        let counter_b = Arc::new(AtomicU64::new(0));

        for counter in [counter_a.clone(), counter_b.clone()] {
            nsched::spawn(move || {
                // A spinner with no cooperative yield point would starve this
                // scheduler (there's no preemption) — real workloads must yield
                // periodically, so this one does too.
                loop {
                    counter.fetch_add(1, Ordering::Relaxed);
                    nsched::yield_now();
                }
            });
        }

        // enter_syscall/exit_syscall around the wait so the orchestrator's
        // own slot is given back to the two spinners for the duration.
        nsched::enter_syscall();
        std::thread::sleep(Duration::from_millis(10));
        nsched::exit_syscall();

        println!("a={} b={}", counter_a.load(Ordering::Relaxed), counter_b.load(Ordering::Relaxed));
        std::io::stdout().flush().ok();
        std::process::exit(0);
    });
}
