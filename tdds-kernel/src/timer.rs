//! Timer manager: a single deadline-ordered timer list with a
//! callback-lock handshake.
//!
//! Timers live in an arena owned by the manager and are addressed by
//! [`TimerId`] handles. The active list is ordered by deadline; a
//! second list holds timers whose caller-supplied lock was contended at
//! expiry, to be retried on the next `manage` round. Only `manage` runs
//! callbacks, and only one callback is in flight at a time.

use crate::error::{DdsError, Result};
use crate::pool::{PoolLimits, PoolStats};
use crate::time::{now_ticks, ticks_diff, Ticks, MAX_TICK_DIFF, TICK_MS};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Timer callback, invoked with the user word given at `start`.
pub type TimerCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Caller-supplied lock taken around a timer callback.
pub type TimerLock = Arc<Mutex<()>>;

/// Handle to a timer slot in the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

/// Timer activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub starts: u32,
    pub stops: u32,
    pub timeouts: u32,
    pub busy: u32,
    pub active: u32,
}

struct TimerSlot {
    name: &'static str,
    deadline: Ticks,
    user: usize,
    cb: Option<TimerCallback>,
    lock: Option<TimerLock>,
    next: Option<usize>,
    allocated: bool,
}

impl TimerSlot {
    fn empty() -> Self {
        TimerSlot {
            name: "",
            deadline: 0,
            user: 0,
            cb: None,
            lock: None,
            next: None,
            allocated: false,
        }
    }
}

struct TimerTable {
    slots: Vec<TimerSlot>,
    free: Vec<usize>,
    head: Option<usize>,
    phead: Option<usize>,
    ptail: Option<usize>,
    callback_active: bool,
    active_timer: Option<usize>,
    stats: TimerStats,
    limits: PoolLimits,
    pool: PoolStats,
}

/// The timer manager. One instance drives all timers of a runtime.
pub struct TimerManager {
    inner: Mutex<TimerTable>,
}

impl TimerManager {
    pub fn new(limits: PoolLimits) -> Self {
        let mut slots = Vec::with_capacity(limits.reserved);
        slots.resize_with(limits.reserved, TimerSlot::empty);
        let free = (0..limits.reserved).rev().collect();
        TimerManager {
            inner: Mutex::new(TimerTable {
                slots,
                free,
                head: None,
                phead: None,
                ptail: None,
                callback_active: false,
                active_timer: None,
                stats: TimerStats::default(),
                limits,
                pool: PoolStats {
                    capacity: limits.reserved,
                    ..PoolStats::default()
                },
            }),
        }
    }

    /// Allocate a timer slot.
    pub fn alloc(&self, name: &'static str) -> Result<TimerId> {
        let mut t = self.inner.lock();
        if t.free.is_empty() {
            let room = t.limits.max().saturating_sub(t.slots.len());
            if t.limits.grow == 0 || room == 0 {
                t.pool.failures += 1;
                return Err(DdsError::NoMemory);
            }
            let step = t.limits.grow.min(room);
            let base = t.slots.len();
            t.slots.resize_with(base + step, TimerSlot::empty);
            t.free.extend((base..base + step).rev());
            t.pool.capacity = t.slots.len();
            t.pool.grown += step;
        }
        let i = t.free.pop().ok_or(DdsError::NoMemory)?;
        t.slots[i] = TimerSlot {
            name,
            allocated: true,
            ..TimerSlot::empty()
        };
        t.pool.in_use += 1;
        if t.pool.in_use > t.pool.peak {
            t.pool.peak = t.pool.in_use;
        }
        Ok(TimerId(i))
    }

    /// Stop and release a timer slot.
    pub fn free(&self, id: TimerId) {
        let mut t = self.inner.lock();
        if !t.slots[id.0].allocated {
            return;
        }
        Self::stop_inner(&mut t, id.0);
        t.slots[id.0] = TimerSlot::empty();
        t.free.push(id.0);
        t.pool.in_use = t.pool.in_use.saturating_sub(1);
    }

    /// Start (or restart) a timer to fire after `ticks`.
    pub fn start(&self, id: TimerId, ticks: Ticks, user: usize, cb: TimerCallback) {
        self.start_locked(id, ticks, user, cb, None);
    }

    /// Start a timer whose callback runs under `lock`. The manager takes
    /// the lock with `try_lock` at expiry; a contended lock defers the
    /// callback to the next `manage` round.
    pub fn start_locked(
        &self,
        id: TimerId,
        ticks: Ticks,
        user: usize,
        cb: TimerCallback,
        lock: Option<TimerLock>,
    ) {
        let now = now_ticks();
        let mut t = self.inner.lock();
        if !t.slots[id.0].allocated {
            return;
        }
        if t.slots[id.0].cb.is_some() {
            Self::stop_inner(&mut t, id.0);
            t.stats.stops = t.stats.stops.wrapping_sub(1); // restart, not a stop
        }
        t.stats.starts += 1;
        t.stats.active += 1;
        let deadline = now.wrapping_add(ticks);
        {
            let slot = &mut t.slots[id.0];
            slot.deadline = deadline;
            slot.user = user;
            slot.cb = Some(cb);
            slot.lock = lock;
        }

        // Ordered insert: skip entries that already elapsed (wrapped
        // diff) and entries with an earlier deadline.
        let mut prev: Option<usize> = None;
        let mut cur = t.head;
        while let Some(p) = cur {
            let p_diff = ticks_diff(now, t.slots[p].deadline);
            if p_diff > MAX_TICK_DIFF || ticks_diff(now, deadline) > p_diff {
                prev = Some(p);
                cur = t.slots[p].next;
            } else {
                break;
            }
        }
        t.slots[id.0].next = cur;
        match prev {
            Some(p) => t.slots[p].next = Some(id.0),
            None => t.head = Some(id.0),
        }
    }

    /// Stop a timer. Safe against the timer currently executing: the
    /// in-flight dispatch is abandoned and the timer is not re-queued.
    pub fn stop(&self, id: TimerId) {
        let mut t = self.inner.lock();
        if !t.slots[id.0].allocated {
            return;
        }
        Self::stop_inner(&mut t, id.0);
    }

    fn stop_inner(t: &mut TimerTable, i: usize) {
        if t.active_timer == Some(i) {
            t.active_timer = None;
        }
        if t.slots[i].cb.is_none() {
            return;
        }
        t.stats.stops += 1;
        t.slots[i].cb = None;
        if Self::unlink_main(t, i) || Self::unlink_retry(t, i) {
            t.stats.active = t.stats.active.saturating_sub(1);
        }
    }

    fn unlink_main(t: &mut TimerTable, i: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = t.head;
        while let Some(p) = cur {
            if p == i {
                let next = t.slots[p].next;
                match prev {
                    Some(pp) => t.slots[pp].next = next,
                    None => t.head = next,
                }
                t.slots[i].next = None;
                return true;
            }
            prev = Some(p);
            cur = t.slots[p].next;
        }
        false
    }

    fn unlink_retry(t: &mut TimerTable, i: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = t.phead;
        while let Some(p) = cur {
            if p == i {
                let next = t.slots[p].next;
                match prev {
                    Some(pp) => t.slots[pp].next = next,
                    None => t.phead = next,
                }
                if t.ptail == Some(i) {
                    t.ptail = prev;
                }
                t.slots[i].next = None;
                return true;
            }
            prev = Some(p);
            cur = t.slots[p].next;
        }
        false
    }

    /// Attach a caller lock to a running timer.
    pub fn set_lock(&self, id: TimerId, lock: TimerLock) {
        let mut t = self.inner.lock();
        if t.slots[id.0].allocated && t.slots[id.0].cb.is_some() {
            t.slots[id.0].lock = Some(lock);
        }
    }

    /// Detach the caller lock from a timer.
    pub fn clear_lock(&self, id: TimerId) {
        let mut t = self.inner.lock();
        if t.slots[id.0].allocated {
            t.slots[id.0].lock = None;
        }
    }

    /// Whether the timer is currently scheduled.
    pub fn is_active(&self, id: TimerId) -> bool {
        let t = self.inner.lock();
        t.slots[id.0].allocated && t.slots[id.0].cb.is_some()
    }

    /// Ticks until the timer fires; `MAX_TICK_DIFF` when not running,
    /// 0 when the deadline already passed.
    pub fn remain(&self, id: TimerId) -> Ticks {
        let now = now_ticks();
        let t = self.inner.lock();
        if !t.slots[id.0].allocated || t.slots[id.0].cb.is_none() {
            return MAX_TICK_DIFF;
        }
        let d = ticks_diff(now, t.slots[id.0].deadline);
        if d >= MAX_TICK_DIFF {
            0
        } else {
            d
        }
    }

    /// Milliseconds until the earliest deadline, clamped to 0 when past;
    /// `MAX_TICK_DIFF` when no timer is scheduled. This feeds the poll
    /// timeout of the worker loop.
    pub fn pending_ms(&self) -> u32 {
        let t = self.inner.lock();
        match t.head {
            Some(h) => {
                let d = ticks_diff(now_ticks(), t.slots[h].deadline);
                if d > MAX_TICK_DIFF {
                    0
                } else {
                    d.saturating_mul(TICK_MS).min(MAX_TICK_DIFF)
                }
            }
            None => MAX_TICK_DIFF,
        }
    }

    /// Run every elapsed timer's callback. The only site that invokes
    /// callbacks; re-entrant calls return immediately.
    pub fn manage(&self) {
        let mut t = self.inner.lock();
        if t.callback_active {
            return;
        }
        loop {
            let Some(h) = t.head else { break };
            let now = now_ticks();
            let d = ticks_diff(now, t.slots[h].deadline);
            if d != 0 && d < MAX_TICK_DIFF {
                break;
            }

            // Timer elapsed: detach the head.
            t.head = t.slots[h].next;
            t.slots[h].next = None;
            let Some(cb) = t.slots[h].cb.take() else {
                // Stopped racily; nothing to run.
                continue;
            };
            let lockp = t.slots[h].lock.clone();
            let user = t.slots[h].user;
            t.active_timer = Some(h);
            t.stats.timeouts += 1;
            t.stats.active = t.stats.active.saturating_sub(1);
            drop(t);

            let caller_guard = match &lockp {
                Some(l) => match l.try_lock() {
                    Some(g) => Some(g),
                    None => {
                        // Lock busy: put the timer on the retry list,
                        // unless it was stopped while we tried.
                        t = self.inner.lock();
                        t.stats.busy += 1;
                        t.stats.active += 1;
                        if t.active_timer.is_none() {
                            t.stats.active = t.stats.active.saturating_sub(1);
                            continue;
                        }
                        t.active_timer = None;
                        t.slots[h].cb = Some(cb);
                        t.slots[h].next = None;
                        match t.ptail {
                            Some(pt) => t.slots[pt].next = Some(h),
                            None => t.phead = Some(h),
                        }
                        t.ptail = Some(h);
                        continue;
                    }
                },
                None => None,
            };

            {
                let mut g = self.inner.lock();
                g.callback_active = true;
            }
            cb(user);
            t = self.inner.lock();
            drop(caller_guard);
            t.callback_active = false;
            t.active_timer = None;
        }

        if t.phead.is_some() {
            // Lock collisions occurred: splice the retry list in front
            // and give the lock holders a chance to run.
            let ph = t.phead.take();
            if let Some(pt) = t.ptail.take() {
                t.slots[pt].next = t.head;
            }
            t.head = ph;
            drop(t);
            std::thread::yield_now();
        }
    }

    pub fn stats(&self) -> TimerStats {
        self.inner.lock().stats
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.lock().pool
    }

    /// Log the active timer list.
    pub fn dump(&self) {
        let t = self.inner.lock();
        debug!(
            starts = t.stats.starts,
            stops = t.stats.stops,
            timeouts = t.stats.timeouts,
            busy = t.stats.busy,
            active = t.stats.active,
            "timer stats"
        );
        let mut cur = t.head;
        while let Some(p) = cur {
            debug!(
                slot = p,
                name = t.slots[p].name,
                deadline = t.slots[p].deadline,
                user = t.slots[p].user,
                "active timer"
            );
            cur = t.slots[p].next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mgr() -> TimerManager {
        TimerManager::new(PoolLimits {
            reserved: 8,
            extra: 8,
            grow: 4,
        })
    }

    fn counter_cb(c: &Arc<AtomicUsize>) -> TimerCallback {
        let c = c.clone();
        Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn alloc_free_recycles_slots() {
        let m = TimerManager::new(PoolLimits {
            reserved: 1,
            extra: 0,
            grow: 0,
        });
        let t = m.alloc("one").unwrap();
        assert_eq!(m.alloc("two"), Err(DdsError::NoMemory));
        m.free(t);
        m.alloc("three").unwrap();
    }

    #[test]
    fn zero_tick_timer_fires_once() {
        let m = mgr();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = m.alloc("zero").unwrap();
        m.start(t, 0, 1, counter_cb(&hits));
        assert!(m.is_active(t));
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!m.is_active(t));
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_timer_does_not_fire_early() {
        let m = mgr();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = m.alloc("future").unwrap();
        m.start(t, 1000, 0, counter_cb(&hits));
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(m.remain(t) > 0);
        m.stop(t);
        assert_eq!(m.remain(t), MAX_TICK_DIFF);
    }

    #[test]
    fn list_is_deadline_ordered() {
        let m = mgr();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mk = |tag: usize| -> TimerCallback {
            let order = order.clone();
            Arc::new(move |_| order.lock().push(tag))
        };
        let a = m.alloc("a").unwrap();
        let b = m.alloc("b").unwrap();
        let c = m.alloc("c").unwrap();
        // Started out of order with distinct deadlines.
        m.start(c, 3, 0, mk(3));
        m.start(a, 1, 0, mk(1));
        m.start(b, 2, 0, mk(2));
        std::thread::sleep(std::time::Duration::from_millis(60));
        m.manage();
        assert_eq!(order.lock().clone(), vec![1, 2, 3]);
    }

    #[test]
    fn stop_prevents_callback() {
        let m = mgr();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = m.alloc("stopped").unwrap();
        m.start(t, 0, 0, counter_cb(&hits));
        m.stop(t);
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(m.stats().stops, 1);
    }

    #[test]
    fn restart_moves_deadline() {
        let m = mgr();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = m.alloc("restart").unwrap();
        m.start(t, 2000, 0, counter_cb(&hits));
        m.start(t, 0, 0, counter_cb(&hits));
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Restart counts one start; the implicit stop is not a user stop.
        assert_eq!(m.stats().starts, 2);
        assert_eq!(m.stats().stops, 0);
    }

    #[test]
    fn busy_lock_defers_to_retry_list() {
        let m = Arc::new(mgr());
        let hits = Arc::new(AtomicUsize::new(0));
        let lock: TimerLock = Arc::new(Mutex::new(()));
        let t = m.alloc("locked").unwrap();
        m.start_locked(t, 0, 0, counter_cb(&hits), Some(lock.clone()));

        {
            let _held = lock.lock();
            m.manage();
            // Lock busy: callback deferred, not lost.
            assert_eq!(hits.load(Ordering::SeqCst), 0);
            assert_eq!(m.stats().busy, 1);
        }
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_while_on_retry_list() {
        let m = mgr();
        let hits = Arc::new(AtomicUsize::new(0));
        let lock: TimerLock = Arc::new(Mutex::new(()));
        let t = m.alloc("retry.stop").unwrap();
        m.start_locked(t, 0, 0, counter_cb(&hits), Some(lock.clone()));
        {
            let _held = lock.lock();
            m.manage();
        }
        m.stop(t);
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_can_restart_itself() {
        let m = Arc::new(mgr());
        let t = m.alloc("self").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let m2 = m.clone();
        let hits2 = hits.clone();
        let cb: TimerCallback = Arc::new(move |user| {
            hits2.fetch_add(1, Ordering::SeqCst);
            if hits2.load(Ordering::SeqCst) < 2 {
                let m3 = m2.clone();
                // Re-arm far in the future from inside the callback.
                m3.start(TimerId(user), 5000, user, Arc::new(|_| {}));
            }
        });
        m.start(t, 0, t.0, cb);
        m.manage();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(m.is_active(t));
        assert!(m.remain(t) > 0);
    }

    #[test]
    fn pending_ms_tracks_head() {
        let m = mgr();
        assert_eq!(m.pending_ms(), MAX_TICK_DIFF);
        let t = m.alloc("pending").unwrap();
        m.start(t, 100, 0, Arc::new(|_| {}));
        let ms = m.pending_ms();
        assert!(ms > 0 && ms <= 100 * TICK_MS);
        m.stop(t);
        assert_eq!(m.pending_ms(), MAX_TICK_DIFF);
    }

    #[test]
    fn pending_ms_zero_for_elapsed() {
        let m = mgr();
        let t = m.alloc("late").unwrap();
        m.start(t, 0, 0, Arc::new(|_| {}));
        assert_eq!(m.pending_ms(), 0);
    }
}
