//! Boundary behavior: a task pinned to worker W is never executed on any
//! other worker, even under scheduling pressure from siblings competing
//! for the same parallelism slots.

use std::io::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(2).build());

    nsched::run_until_exit(|| {
        let pinned_saw_drift = Arc::new(AtomicU32::new(0));
        let pinned_iterations = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU32::new(0));

        {
            let pinned_saw_drift = pinned_saw_drift.clone();
            let pinned_iterations = pinned_iterations.clone();
            let done = done.clone();
            nsched::spawn(move || {
                nsched::pin_to_thread();
                assert!(nsched::is_pinned());
                let home = std::thread::current().id();
                for _ in 0..200 {
                    if std::thread::current().id() != home {
                        pinned_saw_drift.fetch_add(1, Ordering::Relaxed);
                    }
                    pinned_iterations.fetch_add(1, Ordering::Relaxed);
                    nsched::yield_now();
                }
                nsched::unpin_from_thread();
                assert!(!nsched::is_pinned());
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Scheduling pressure: enough competing tasks to make the matcher
        // and idle-worker list actually churn while the pinned task runs.
        for _ in 0..4 {
            let done = done.clone();
            nsched::spawn(move || {
                for _ in 0..200 {
                    nsched::yield_now();
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        while done.load(Ordering::SeqCst) < 5 {
            nsched::yield_now();
        }

        println!(
            "pinned_iterations={} drift={}",
            pinned_iterations.load(Ordering::Relaxed),
            pinned_saw_drift.load(Ordering::Relaxed)
        );
        std::io::stdout().flush().ok();
    });
}
