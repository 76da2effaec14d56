//! Scenario 4: `stop_the_world` must not return until every worker but the
//! caller's has vacated its parallelism slot, and `start_the_world` must
//! let every parked task go on to make progress again.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(4).build());

    nsched::run_until_exit(|| {
        let progress = Arc::new(AtomicU64::new(0));

        for _ in 0..8 {
            let progress = progress.clone();
            nsched::spawn(move || {
                loop {
                    progress.fetch_add(1, Ordering::Relaxed);
                    nsched::yield_now();
                }
            });
        }

        // Let the pool get going before we ask it to stop.
        for _ in 0..64 {
            nsched::yield_now();
        }

        nsched::stop_the_world();
        let mcpu_at_stop = nsched::debug_mcpu();
        let before = progress.load(Ordering::Relaxed);
        // Deliberately a raw sleep, not enter_syscall-wrapped: giving back
        // this task's own slot while the world is stopped would let the
        // matcher immediately hand it to one of the eight parked spinners,
        // defeating the barrier this scenario is testing.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let during_stop = progress.load(Ordering::Relaxed);
        nsched::start_the_world();

        nsched::enter_syscall();
        std::thread::sleep(std::time::Duration::from_millis(10));
        nsched::exit_syscall();
        let after = progress.load(Ordering::Relaxed);

        println!(
            "mcpu_at_stop={mcpu_at_stop} no_progress_while_stopped={} progressed_after_start={}",
            during_stop == before,
            after > during_stop
        );
        std::io::stdout().flush().ok();
        std::process::exit(0);
    });
}
