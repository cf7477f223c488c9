//! Initialization and termination: flag errors, idempotent init, clean
//! shutdown, and restart after termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn run_one_thread(tag: &str) {
    let done = Arc::new(AtomicBool::new(false));
    let inner = done.clone();
    arachne::create_thread(move || {
        inner.store(true, Ordering::Release);
    })
    .expect("an idle runtime should have room");
    wait_until(tag, || done.load(Ordering::Acquire));
}

#[test]
fn init_shutdown_and_restart() {
    // Asking for the real arbiter fails with the distinguished error and
    // leaves nothing initialized.
    let mut arbiter_args: Vec<String> =
        vec!["--enableArbiter".into(), "1".into(), "keep".into()];
    match arachne::init(Some(&mut arbiter_args)) {
        Err(arachne::Error::ArbiterUnavailable) => {}
        other => panic!("expected ArbiterUnavailable, got {other:?}"),
    }

    // Bad flag values are invalid usage, not silently accepted.
    let mut bad_args: Vec<String> = vec!["--minNumCores".into(), "zero".into()];
    assert!(matches!(
        arachne::init(Some(&mut bad_args)),
        Err(arachne::Error::InvalidOption(_))
    ));

    let mut args: Vec<String> = [
        "--minNumCores",
        "2",
        "--maxNumCores",
        "2",
        "--stackSize",
        "131072",
        "--disableLoadEstimation",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    arachne::init(Some(&mut args)).unwrap();

    // A second init is a no-op.
    arachne::init(None).unwrap();
    run_one_thread("a thread to run after init");

    arachne::shut_down();
    arachne::wait_for_termination();

    // The runtime restarts against the same slot arrays.
    arachne::init(None).unwrap();
    run_one_thread("a thread to run after restart");

    arachne::shut_down();
    arachne::wait_for_termination();
}
