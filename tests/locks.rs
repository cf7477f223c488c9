//! Lock behavior: sleep-lock FIFO handoff, spin lock mutual exclusion and
//! the one-second deadlock warning, and semaphore counting.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};

use arachne::{Semaphore, SleepLock, SpinLock};

/// The deadlock-warning test owns the global error stream, so run the file
/// serially.
fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

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
    let deadline = Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn sleep_lock_grants_in_fifo_order() {
    const CONTENDERS: usize = 20;
    let _serial = serial();
    init_runtime();

    let lock = Arc::new(SleepLock::new(()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let turn = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    for index in 0..CONTENDERS {
        let lock = lock.clone();
        let order = order.clone();
        let turn = turn.clone();
        let finished = finished.clone();
        arachne::create_thread_on_core(0, move || {
            // The turnstile fixes the contention order: taking the turn and
            // enqueueing happen without a suspension point in between, so
            // arrival order equals index order.
            while turn.load(Ordering::Acquire) != index {
                arachne::yield_now();
            }
            turn.store(index + 1, Ordering::Release);
            let guard = lock.lock();
            if index == 0 {
                // Hold until every contender is parked behind us.
                while turn.load(Ordering::Acquire) < CONTENDERS {
                    arachne::yield_now();
                }
            }
            order.lock().unwrap().push(index);
            drop(guard);
            finished.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    wait_until("every contender to pass the lock", || {
        finished.load(Ordering::Acquire) == CONTENDERS
    });
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..CONTENDERS).collect::<Vec<_>>());
}

#[test]
fn try_lock_respects_ownership() {
    let _serial = serial();
    init_runtime();
    let lock = Arc::new(SleepLock::new(0u64));
    let observed = Arc::new(AtomicUsize::new(0));

    let lock_inner = lock.clone();
    let observed_inner = observed.clone();
    arachne::create_thread_on_core(0, move || {
        let guard = lock_inner.lock();
        // While held, a sibling's try_lock must fail.
        let lock_probe = lock_inner.clone();
        let observed_probe = observed_inner.clone();
        arachne::create_thread_on_core(0, move || {
            assert!(lock_probe.try_lock().is_none());
            observed_probe.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
        while observed_inner.load(Ordering::Acquire) == 0 {
            arachne::yield_now();
        }
        drop(guard);
        assert!(lock_inner.try_lock().is_some());
        observed_inner.fetch_add(1, Ordering::AcqRel);
    })
    .unwrap();

    wait_until("both probes to run", || observed.load(Ordering::Acquire) == 2);
}

/// A sink that appends everything written to a shared buffer.
struct CaptureStream(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn contended_spin_lock_warns_after_one_second() {
    let _serial = serial();
    init_runtime();

    let captured = Arc::new(Mutex::new(Vec::new()));
    arachne::set_error_stream(Box::new(CaptureStream(captured.clone())));

    let lock = Arc::new(SpinLock::named("locktest", ()));
    let finished = Arc::new(AtomicUsize::new(0));

    let holder_lock = lock.clone();
    let holder_finished = finished.clone();
    arachne::create_thread_on_core(0, move || {
        let guard = holder_lock.lock();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(1300) {
            arachne::yield_now();
        }
        drop(guard);
        holder_finished.fetch_add(1, Ordering::AcqRel);
    })
    .unwrap();

    // Give the holder time to take the lock before contending.
    std::thread::sleep(Duration::from_millis(50));
    let contender_lock = lock.clone();
    let contender_finished = finished.clone();
    arachne::create_thread_on_core(1, move || {
        drop(contender_lock.lock());
        contender_finished.fetch_add(1, Ordering::AcqRel);
    })
    .unwrap();

    wait_until("holder and contender to finish", || {
        finished.load(Ordering::Acquire) == 2
    });

    let captured = captured.lock().unwrap();
    let text = String::from_utf8(captured.clone()).unwrap();
    assert_eq!(text, "locktest SpinLock locked for one second; deadlock?\n");

    arachne::set_error_stream(Box::new(io::stderr()));
}

#[test]
fn semaphore_counts_notifications() {
    let _serial = serial();
    init_runtime();
    let semaphore = Arc::new(Semaphore::new());
    let passed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let semaphore = semaphore.clone();
        let passed = passed.clone();
        arachne::create_thread_on_core(0, move || {
            semaphore.wait();
            passed.fetch_add(1, Ordering::AcqRel);
        })
        .unwrap();
    }

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(passed.load(Ordering::Acquire), 0);

    let notifier = semaphore.clone();
    arachne::create_thread_on_core(1, move || {
        notifier.notify();
        notifier.notify();
    })
    .unwrap();
    wait_until("two waiters to pass", || passed.load(Ordering::Acquire) == 2);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(passed.load(Ordering::Acquire), 2);

    let notifier = semaphore.clone();
    arachne::create_thread_on_core(1, move || {
        assert!(!notifier.try_wait());
        notifier.notify();
    })
    .unwrap();
    wait_until("the last waiter to pass", || {
        passed.load(Ordering::Acquire) == 3
    });
}
