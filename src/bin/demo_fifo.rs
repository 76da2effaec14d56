//! Scenario 1 from the scheduler's testable-properties list: under a single
//! parallelism slot, three tasks that each print their id and yield three
//! times must interleave in strict FIFO order (A B C A B C A B C).
//!
//! Run as its own process (rather than a `#[test]`) because the scheduler
//! is a process-wide singleton and the demo wants a clean `GOMAXPROCS=1`.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(1).build());

    nsched::run_until_exit(|| {
        let order = Arc::new(Mutex::new(String::new()));
        let done = Arc::new(AtomicU32::new(0));

        for id in ["A", "B", "C"] {
            let order = order.clone();
            let done = done.clone();
            nsched::spawn(move || {
                for _ in 0..3 {
                    order.lock().unwrap().push_str(id);
                    nsched::yield_now();
                }
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        while done.load(Ordering::SeqCst) < 3 {
            nsched::yield_now();
        }

        println!("{}", order.lock().unwrap());
        std::io::stdout().flush().ok();
    });
}
