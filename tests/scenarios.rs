//! End-to-end scheduler scenarios.
//!
//! Each scenario is a standalone binary under `src/bin/`, run here as a
//! subprocess rather than in-process: the scheduler is a process-wide
//! singleton that exits the whole process once its task count reaches
//! zero, which a `#[test]` sharing a process with every other test cannot
//! tolerate.

use std::process::Command;

fn run(bin: &str) -> String {
    let output = Command::new(bin)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {bin}: {e}"));
    assert!(
        output.status.success(),
        "{bin} exited with {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout was not utf8")
}

#[test]
fn single_proc_fifo_interleaves_strictly() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_fifo"));
    assert_eq!(stdout.trim(), "ABCABCABC");
}

#[test]
fn parallel_two_both_counters_progress() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_parallel_two"));
    let line = stdout.trim();
    let mut a = 0u64;
    let mut b = 0u64;
    for field in line.split_whitespace() {
        if let Some(n) = field.strip_prefix("a=") {
            a = n.parse().unwrap();
        } else if let Some(n) = field.strip_prefix("b=") {
            b = n.parse().unwrap();
        }
    }
    assert!(a > 0, "counter a never progressed: {line}");
    assert!(b > 0, "counter b never progressed: {line}");
}

#[test]
fn syscall_parallelism_frees_slot_for_sibling() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_syscall_parallelism"));
    assert_eq!(stdout.trim(), "progressed_during_syscall=true");
}

#[test]
fn stop_the_world_drains_parallelism_and_resumes() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_stop_the_world"));
    let line = stdout.trim();
    assert!(line.starts_with("mcpu_at_stop=1 "), "stop_the_world returned with mcpu > 1: {line}");
    assert!(line.contains("no_progress_while_stopped=true"), "tasks progressed while stopped: {line}");
    assert!(line.contains("progressed_after_start=true"), "no progress after start_the_world: {line}");
}

#[test]
fn panic_is_recovered_exactly_once() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_panic_recover"));
    let lines: Vec<&str> = stdout.lines().collect();
    // In particular, `b`'s trailing "unreachable" line after its recovered
    // `panic_now` call must not appear — see demo_panic_recover.rs.
    assert_eq!(lines, vec!["recovered: boom", "a returned normally", "second recover is none: true"]);
}

#[test]
fn deferred_calls_run_lifo() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_defer_lifo"));
    assert_eq!(stdout, "3\n2\n1\n");
}

#[test]
fn pinned_task_never_migrates_off_its_worker() {
    let stdout = run(env!("CARGO_BIN_EXE_demo_pin_to_thread"));
    let line = stdout.trim();
    assert!(line.contains("pinned_iterations=200"), "{line}");
    assert!(line.contains("drift=0"), "pinned task ran on more than one OS thread: {line}");
}

