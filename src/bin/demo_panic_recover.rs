//! Scenario 5: a deferred call may `recover` an in-flight panic exactly
//! once; the function that panicked returns as if nothing happened, and a
//! second `recover` attempt (outside any deferred call) sees nothing.
//!
//! `b` has a statement after its `panic_now` call to exercise the
//! recover-skips-trailing-code contract documented on `nsched::panic_now`:
//! since this crate has no compiler epilogue to jump to on recovery, `b`
//! must check the outcome and return immediately itself.

use std::io::Write;

fn b() {
    nsched::defer(|| {
        if let Some(payload) = nsched::recover() {
            let msg = payload.downcast_ref::<&str>().copied().unwrap_or("<unknown>");
            println!("recovered: {msg}");
        } else {
            println!("recovered: <nothing>");
        }
    });
    if nsched::panic_now(Box::new("boom")) == nsched::PanicOutcome::Recovered {
        return;
    }
    println!("b: unreachable, the panic above was recovered");
}

fn a() {
    b();
    println!("a returned normally");
}

fn main() {
    env_logger::init();
    nsched::schedinit(nsched::Config::builder().gomaxprocs(1).build());

    nsched::run_until_exit(|| {
        a();
        let second = nsched::recover();
        println!("second recover is none: {}", second.is_none());
        std::io::stdout().flush().ok();
    });
}
