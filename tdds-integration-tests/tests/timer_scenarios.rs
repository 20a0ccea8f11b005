//! Timer manager scenarios: ordering, lock collisions and the
//! invariants of interleaved start/stop/manage sequences.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tdds_kernel::pool::PoolLimits;
use tdds_kernel::time::{ticks_diff, MAX_TICK_DIFF, TICK_MS};
use tdds_kernel::timer::{TimerCallback, TimerLock, TimerManager};

fn manager() -> TimerManager {
    TimerManager::new(PoolLimits {
        reserved: 16,
        extra: 16,
        grow: 4,
    })
}

fn tick_sleep(ticks: u32) {
    thread::sleep(Duration::from_millis((ticks * TICK_MS) as u64 + 5));
}

/// Three timers started at t=0 with deadlines +30, +10, +20 ticks fire
/// one by one as their deadlines pass, in deadline order.
#[test]
fn timer_ordering_scenario() {
    tdds_integration_tests::init_tracing();
    let m = manager();
    let fired: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let cb = |tag: &'static str| -> TimerCallback {
        let fired = fired.clone();
        Arc::new(move |_| fired.lock().push(tag))
    };

    let t30 = m.alloc("t30").unwrap();
    let t10 = m.alloc("t10").unwrap();
    let t20 = m.alloc("t20").unwrap();
    m.start(t30, 30, 0, cb("t30"));
    m.start(t10, 10, 0, cb("t10"));
    m.start(t20, 20, 0, cb("t20"));

    tick_sleep(11);
    m.manage();
    assert_eq!(fired.lock().clone(), vec!["t10"]);

    tick_sleep(10);
    m.manage();
    assert_eq!(fired.lock().clone(), vec!["t10", "t20"]);

    tick_sleep(10);
    m.manage();
    assert_eq!(fired.lock().clone(), vec!["t10", "t20", "t30"]);
}

/// A timer with a contended caller lock is deferred to the retry list
/// and invoked exactly once after the lock is released.
#[test]
fn timer_lock_collision_scenario() {
    let m = Arc::new(manager());
    let hits = Arc::new(AtomicUsize::new(0));
    let lock: TimerLock = Arc::new(Mutex::new(()));
    let t = m.alloc("locked").unwrap();
    let hits2 = hits.clone();
    m.start_locked(
        t,
        1,
        0,
        Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }),
        Some(lock.clone()),
    );
    tick_sleep(2);

    {
        let _held = lock.lock();
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(m.stats().busy, 1);
    }

    m.manage();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    m.manage();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Every timer started, not stopped, and past its deadline fires
/// exactly once over an interleaved sequence of operations.
#[test]
fn interleaved_start_stop_fire_exactly_once() {
    let m = Arc::new(manager());
    let counts: Arc<Vec<AtomicUsize>> =
        Arc::new((0..8).map(|_| AtomicUsize::new(0)).collect());

    let ids: Vec<_> = (0..8).map(|i| m.alloc(Box::leak(format!("t{i}").into_boxed_str()))).collect::<Result<_, _>>().unwrap();
    for (i, &id) in ids.iter().enumerate() {
        let counts = counts.clone();
        m.start(
            id,
            (i % 3) as u32,
            i,
            Arc::new(move |user| {
                counts[user].fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    // Stop the odd ones before any deadline can be reached.
    for (i, &id) in ids.iter().enumerate() {
        if i % 2 == 1 {
            m.stop(id);
        }
    }
    tick_sleep(4);
    m.manage();
    m.manage();

    for (i, c) in counts.iter().enumerate() {
        let expected = if i % 2 == 1 { 0 } else { 1 };
        assert_eq!(c.load(Ordering::SeqCst), expected, "timer {i}");
    }
}

/// `pending_ms` decreases monotonically while no starts occur and
/// clamps at zero once the head deadline passed.
#[test]
fn pending_ms_monotonically_decreases() {
    let m = manager();
    let t = m.alloc("head").unwrap();
    m.start(t, 15, 0, Arc::new(|_| {}));

    let mut prev = m.pending_ms();
    assert!(prev <= 15 * TICK_MS);
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(40));
        let cur = m.pending_ms();
        assert!(cur <= prev, "pending_ms went up: {prev} -> {cur}");
        prev = cur;
    }
    assert_eq!(prev, 0);
    m.manage();
    assert_eq!(m.pending_ms(), MAX_TICK_DIFF);
}

/// Wrap-around tick arithmetic near `u32::MAX`.
#[test]
fn ticks_diff_wraps_at_boundary() {
    assert_eq!(ticks_diff(u32::MAX - 1, 3), 5);
    assert_eq!(ticks_diff(0, MAX_TICK_DIFF), MAX_TICK_DIFF);
    // A "past" deadline shows up as a wrapped, over-MAX diff.
    assert!(ticks_diff(100, 99) > MAX_TICK_DIFF);
}

/// Stopping a timer from another thread while the worker manages the
/// list never double-fires nor leaks an invocation after stop.
#[test]
fn concurrent_stop_is_race_free() {
    for _ in 0..20 {
        let m = Arc::new(manager());
        let hits = Arc::new(AtomicUsize::new(0));
        let t = m.alloc("race").unwrap();
        let hits2 = hits.clone();
        m.start(
            t,
            0,
            0,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let m2 = m.clone();
        let stopper = thread::spawn(move || m2.stop(t));
        m.manage();
        stopper.join().unwrap();
        assert!(hits.load(Ordering::SeqCst) <= 1);
        // After both returned, another manage round must not fire it.
        m.manage();
        assert!(hits.load(Ordering::SeqCst) <= 1);
    }
}
