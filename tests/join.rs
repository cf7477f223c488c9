//! Join semantics: joining live threads, already-finished threads, and the
//! completion ordering guarantee.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

fn init_runtime() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
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
    });
}

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn joining_a_live_thread_waits_for_its_exit() {
    init_runtime();
    let target_done = Arc::new(AtomicBool::new(false));
    let joiner_done = Arc::new(AtomicBool::new(false));

    let inner = target_done.clone();
    let target = arachne::create_thread_on_core(0, move || {
        arachne::sleep(20_000_000); // 20 ms
        inner.store(true, Ordering::Release);
    })
    .unwrap();

    let target_flag = target_done.clone();
    let joiner_flag = joiner_done.clone();
    arachne::create_thread_on_core(1, move || {
        arachne::join(target);
        // The joined thread finished before join returned.
        assert!(target_flag.load(Ordering::Acquire));
        joiner_flag.store(true, Ordering::Release);
    })
    .unwrap();

    wait_until("the joiner to return", || joiner_done.load(Ordering::Acquire));
}

#[test]
fn joining_a_finished_thread_returns_immediately() {
    init_runtime();
    let target_done = Arc::new(AtomicBool::new(false));
    let inner = target_done.clone();
    let target = arachne::create_thread_on_core(0, move || {
        inner.store(true, Ordering::Release);
    })
    .unwrap();
    wait_until("the target to finish", || target_done.load(Ordering::Acquire));
    // Give the trampoline time to retire the slot as well.
    std::thread::sleep(Duration::from_millis(5));

    let joined = Arc::new(AtomicBool::new(false));
    let inner = joined.clone();
    arachne::create_thread_on_core(1, move || {
        let start = Instant::now();
        arachne::join(target);
        assert!(start.elapsed() < Duration::from_secs(1));
        inner.store(true, Ordering::Release);
    })
    .unwrap();
    wait_until("the late joiner to return", || joined.load(Ordering::Acquire));
}

#[test]
fn many_joiners_all_wake() {
    const JOINERS: usize = 8;
    init_runtime();
    let gate = Arc::new(AtomicBool::new(false));
    let woken = Arc::new(AtomicUsize::new(0));

    let inner = gate.clone();
    let target = arachne::create_thread_on_core(0, move || {
        while !inner.load(Ordering::Acquire) {
            arachne::yield_now();
        }
    })
    .unwrap();

    for _ in 0..JOINERS {
        let woken = woken.clone();
        arachne::create_thread_on_core(1, move || {
            arachne::join(target);
            woken.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    // Nobody returns while the target runs.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(woken.load(Ordering::Acquire), 0);

    gate.store(true, Ordering::Release);
    wait_until("every joiner to wake", || {
        woken.load(Ordering::Acquire) == JOINERS
    });
}
