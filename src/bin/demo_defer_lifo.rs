//! Scenario 6: deferred calls on a task run in LIFO order when the task
//! returns normally.

use std::io::Write;

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(1).build());

    nsched::run_until_exit(|| {
        nsched::defer(|| {
            println!("1");
            std::io::stdout().flush().ok();
        });
        nsched::defer(|| {
            println!("2");
            std::io::stdout().flush().ok();
        });
        nsched::defer(|| {
            println!("3");
            std::io::stdout().flush().ok();
        });
    });
}
