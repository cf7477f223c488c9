//! Parking and waking: the signal-before-block race, cross-core signals,
//! sleep's minimum duration, and yield's round-robin property.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
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
fn signal_before_block_still_wakes() {
    init_runtime();
    let done = Arc::new(AtomicBool::new(false));
    let inner = done.clone();
    arachne::create_thread_on_core(0, move || {
        // The wake arrives before the park; block must consume it.
        arachne::signal(arachne::this_thread_id());
        arachne::block();
        inner.store(true, Ordering::Release);
    })
    .unwrap();
    wait_until("the self-signaled thread to wake", || {
        done.load(Ordering::Acquire)
    });
}

#[test]
fn a_blocked_thread_wakes_on_a_remote_signal() {
    init_runtime();
    let id_cell = Arc::new(Mutex::new(None));
    let parked = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let id_inner = id_cell.clone();
    let parked_inner = parked.clone();
    let done_inner = done.clone();
    arachne::create_thread_on_core(0, move || {
        *id_inner.lock().unwrap() = Some(arachne::this_thread_id());
        parked_inner.store(true, Ordering::Release);
        arachne::block();
        done_inner.store(true, Ordering::Release);
    })
    .unwrap();

    wait_until("the target to park", || parked.load(Ordering::Acquire));
    std::thread::sleep(Duration::from_millis(10));
    assert!(!done.load(Ordering::Acquire));

    let id = id_cell.lock().unwrap().take().unwrap();
    arachne::signal(id);
    wait_until("the signal to land", || done.load(Ordering::Acquire));
}

#[test]
fn sleep_lasts_at_least_the_requested_time() {
    init_runtime();
    let elapsed = Arc::new(Mutex::new(None));
    let inner = elapsed.clone();
    arachne::create_thread_on_core(0, move || {
        let start = Instant::now();
        arachne::sleep(50_000_000); // 50 ms
        *inner.lock().unwrap() = Some(start.elapsed());
    })
    .unwrap();
    wait_until("the sleeper to wake", || elapsed.lock().unwrap().is_some());
    let elapsed = elapsed.lock().unwrap().take().unwrap();
    // Slack for the wall-clock calibration of the cycle counter.
    assert!(
        elapsed >= Duration::from_millis(45),
        "slept only {elapsed:?}"
    );
}

#[test]
fn yield_lets_every_runnable_thread_run() {
    const THREADS: usize = 3;
    init_runtime();
    let order = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicUsize::new(0));

    for index in 0..THREADS {
        let order = order.clone();
        let started = started.clone();
        arachne::create_thread_on_core(1, move || {
            started.fetch_add(1, Ordering::AcqRel);
            order.lock().unwrap().push(index);
            arachne::yield_now();
            order.lock().unwrap().push(index);
        })
        .unwrap();
    }

    wait_until("all rounds to finish", || order.lock().unwrap().len() == THREADS * 2);
    let order = order.lock().unwrap();
    // Yielding parks the first round until every peer has run: the first
    // three entries are the three distinct threads.
    let mut first_round: Vec<usize> = order[..THREADS].to_vec();
    first_round.sort_unstable();
    assert_eq!(first_round, (0..THREADS).collect::<Vec<_>>());
}
