//! Event loop and deferred-work dispatcher.
//!
//! One worker thread owns all callback dispatch: timer callbacks, socket
//! callbacks and user listeners. Foreign threads enqueue deferred work
//! (notifications, waitset checks, config updates) under the event lock
//! and wake the worker through a self-pipe when it is parked in `poll`.
//! Events drain in a fixed priority order: quit, timers, I/O, proxy
//! send, cache transfer, waitset checks, notifications, config updates.

use crate::error::{DdsError, Result};
use crate::sock::{PollEvents, SocketCallback, SocketSet};
use crate::timer::TimerManager;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{info, warn};

bitflags! {
    /// Pending work classes, listed in drain priority order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const QUIT     = 0x01;
        const TMR      = 0x02;
        const IO       = 0x04;
        const PROXY_NE = 0x08;
        const CACHE_X  = 0x10;
        const WAITSET  = 0x20;
        const NOTIFY   = 0x40;
        const CONFIG   = 0x80;
    }
}

/// Opaque reference to a user-visible entity.
pub type EntityHandle = usize;

/// Per-class notifier delivering `(entity, status)` to user listeners.
pub type NotifierFn = Arc<dyn Fn(EntityHandle, u32) + Send + Sync>;

/// Deferred waitset evaluation, `(entity, condition)`.
pub type WaitsetCheckFn = Arc<dyn Fn(EntityHandle, usize) + Send + Sync>;

/// Parameterless forwarder hook (proxy send, cache transfer).
pub type WorkHook = Arc<dyn Fn() + Send + Sync>;

/// Deferred configuration-update callback, invoked with the key id.
pub type ConfigUpdateFn = Arc<dyn Fn(u32) + Send + Sync>;

/// Number of notification classes.
pub const MAX_NOTIFIER_CLASSES: usize = 4;

/// Drain rounds per `work` call before the loop re-polls.
const MAX_DRAIN_ROUNDS: u32 = 32;

struct PendingNotify {
    entity: EntityHandle,
    class: usize,
    status: u32,
}

struct PendingWaitset {
    entity: EntityHandle,
    condition: usize,
}

struct PendingConfig {
    key: u32,
    update: ConfigUpdateFn,
}

struct EvState {
    pending: EventFlags,
    sleeping: bool,
    notify_q: VecDeque<PendingNotify>,
    waitset_q: VecDeque<PendingWaitset>,
    config_q: VecDeque<PendingConfig>,
    entity_in_listener: Option<EntityHandle>,
    listeners_waiting: usize,
}

/// The worker-thread dispatcher binding timers, sockets and the
/// deferred work queues together.
pub struct Dispatcher {
    ev: Mutex<EvState>,
    ev_wait: Condvar,
    timers: Arc<TimerManager>,
    socks: Arc<SocketSet>,
    pipe_fds: [RawFd; 2],
    notifiers: RwLock<[Option<NotifierFn>; MAX_NOTIFIER_CLASSES]>,
    waitset_checker: RwLock<Option<WaitsetCheckFn>>,
    proxy_send: RwLock<Option<WorkHook>>,
    cache_transfer: RwLock<Option<WorkHook>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: RwLock<Option<ThreadId>>,
    queue_limit: usize,
}

impl Dispatcher {
    /// Create the dispatcher and register its wakeup pipe in the socket
    /// set.
    pub fn new(
        timers: Arc<TimerManager>,
        socks: Arc<SocketSet>,
        queue_limit: usize,
    ) -> Result<Arc<Self>> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: pipe writes two descriptors into the array.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(DdsError::already_deleted("pipe() failed"));
        }

        let wakeup_cb: SocketCallback = Arc::new(|fd, _events, _user| {
            let mut b = [0u8; 1];
            // SAFETY: one-byte read from our own pipe after poll
            // reported it readable.
            unsafe { libc::read(fd, b.as_mut_ptr().cast(), 1) };
        });
        socks.add(
            fds[0],
            PollEvents::IN | PollEvents::PRI | PollEvents::HUP | PollEvents::NVAL,
            wakeup_cb,
            0,
            "DDS.wakeup",
        )?;

        Ok(Arc::new(Dispatcher {
            ev: Mutex::new(EvState {
                pending: EventFlags::empty(),
                sleeping: false,
                notify_q: VecDeque::new(),
                waitset_q: VecDeque::new(),
                config_q: VecDeque::new(),
                entity_in_listener: None,
                listeners_waiting: 0,
            }),
            ev_wait: Condvar::new(),
            timers,
            socks,
            pipe_fds: fds,
            notifiers: RwLock::new([None, None, None, None]),
            waitset_checker: RwLock::new(None),
            proxy_send: RwLock::new(None),
            cache_transfer: RwLock::new(None),
            worker: Mutex::new(None),
            worker_thread: RwLock::new(None),
            queue_limit,
        }))
    }

    fn wakeup(&self) {
        let b = b".";
        // SAFETY: one-byte write into our own pipe.
        let n = unsafe { libc::write(self.pipe_fds[1], b.as_ptr().cast(), 1) };
        if n != 1 {
            warn!("wakeup write() failure");
        }
    }

    /// Raise pending events, waking the worker if it is parked.
    pub fn signal(&self, event: EventFlags) {
        let mut ev = self.ev.lock();
        let was_empty = ev.pending.is_empty();
        ev.pending |= event;
        let wake = was_empty && ev.sleeping;
        drop(ev);
        if wake {
            self.wakeup();
        }
    }

    /// Register the notifier for one notification class.
    pub fn attach_notifier(&self, class: usize, f: NotifierFn) {
        if class < MAX_NOTIFIER_CLASSES {
            self.notifiers.write()[class] = Some(f);
        }
    }

    pub fn set_waitset_checker(&self, f: WaitsetCheckFn) {
        *self.waitset_checker.write() = Some(f);
    }

    pub fn set_proxy_send_hook(&self, f: WorkHook) {
        *self.proxy_send.write() = Some(f);
    }

    pub fn set_cache_transfer_hook(&self, f: WorkHook) {
        *self.cache_transfer.write() = Some(f);
    }

    /// Queue a status notification for delivery on the worker.
    pub fn notify(&self, class: usize, entity: EntityHandle, status: u32) {
        if class >= MAX_NOTIFIER_CLASSES || self.notifiers.read()[class].is_none() {
            warn!(class, "invalid notification class");
            return;
        }
        let mut ev = self.ev.lock();
        if ev.notify_q.len() >= self.queue_limit {
            warn!("out of memory for pending notification");
            return;
        }
        ev.notify_q.push_back(PendingNotify {
            entity,
            class,
            status,
        });
        ev.pending |= EventFlags::NOTIFY;
        let wake = ev.sleeping;
        drop(ev);
        if wake {
            self.wakeup();
        }
    }

    /// Queue a deferred waitset re-evaluation.
    pub fn defer_waitset_check(&self, entity: EntityHandle, condition: usize) {
        let mut ev = self.ev.lock();
        if ev.waitset_q.len() >= self.queue_limit {
            warn!("out of memory for deferred waitset check");
            return;
        }
        ev.waitset_q.push_back(PendingWaitset { entity, condition });
        ev.pending |= EventFlags::WAITSET;
        let wake = ev.sleeping;
        drop(ev);
        if wake {
            self.wakeup();
        }
    }

    /// Drop queued waitset checks for `(entity, condition)`.
    pub fn undo_waitset_check(&self, entity: EntityHandle, condition: usize) {
        let mut ev = self.ev.lock();
        ev.waitset_q
            .retain(|p| !(p.entity == entity && p.condition == condition));
        if ev.waitset_q.is_empty() {
            ev.pending &= !EventFlags::WAITSET;
        }
    }

    /// Schedule a configuration update on the worker; runs inline when
    /// already called from the worker (or before it started).
    pub fn config_update(&self, key: u32, update: ConfigUpdateFn) {
        let on_worker = match *self.worker_thread.read() {
            Some(id) => id == thread::current().id(),
            None => true,
        };
        if on_worker {
            update(key);
            return;
        }
        let mut ev = self.ev.lock();
        if ev.config_q.len() >= self.queue_limit {
            warn!("out of memory for scheduled configuration update");
            return;
        }
        ev.config_q.push_back(PendingConfig { key, update });
        ev.pending |= EventFlags::CONFIG;
        let wake = ev.sleeping;
        drop(ev);
        if wake {
            self.wakeup();
        }
    }

    fn waitset_checks(&self, events: &mut EventFlags) {
        let item = {
            let mut ev = self.ev.lock();
            let item = ev.waitset_q.pop_front();
            if ev.waitset_q.is_empty() {
                ev.pending &= !EventFlags::WAITSET;
                *events &= !EventFlags::WAITSET;
            }
            item
        };
        let Some(p) = item else { return };
        if let Some(checker) = self.waitset_checker.read().clone() {
            checker(p.entity, p.condition);
        }
    }

    fn config_checks(&self, events: &mut EventFlags) {
        let item = {
            let mut ev = self.ev.lock();
            let item = ev.config_q.pop_front();
            if ev.config_q.is_empty() {
                ev.pending &= !EventFlags::CONFIG;
                *events &= !EventFlags::CONFIG;
            }
            item
        };
        let Some(p) = item else { return };
        (p.update)(p.key);
    }

    fn client_notify(&self, events: &mut EventFlags) {
        let item = {
            let mut ev = self.ev.lock();
            let item = ev.notify_q.pop_front();
            if let Some(ref p) = item {
                ev.entity_in_listener = Some(p.entity);
            }
            if ev.notify_q.is_empty() {
                ev.pending &= !EventFlags::NOTIFY;
                *events &= !EventFlags::NOTIFY;
            }
            item
        };
        let Some(p) = item else { return };

        if let Some(notifier) = self.notifiers.read()[p.class].clone() {
            notifier(p.entity, p.status);
        }

        let mut ev = self.ev.lock();
        ev.entity_in_listener = None;
        if ev.listeners_waiting > 0 {
            self.ev_wait.notify_all();
        }
    }

    /// Block until no listener is in flight for `entity`.
    pub fn wait_listener(&self, entity: EntityHandle) {
        let mut ev = self.ev.lock();
        while ev.entity_in_listener == Some(entity) {
            ev.listeners_waiting += 1;
            self.ev_wait.wait(&mut ev);
            ev.listeners_waiting -= 1;
        }
    }

    /// Remove queued notifications for `entity` whose status bit is in
    /// `mask`. Returns `false` while a listener for the entity is still
    /// running (immediately if `not_running` is set, after the purge
    /// otherwise).
    pub fn purge_notifications(
        &self,
        entity: EntityHandle,
        mask: u32,
        not_running: bool,
    ) -> bool {
        let mut ev = self.ev.lock();
        if not_running && ev.entity_in_listener == Some(entity) {
            return false;
        }
        ev.notify_q
            .retain(|p| !(p.entity == entity && (mask & (1 << p.status)) != 0));
        if ev.notify_q.is_empty() {
            ev.pending &= !EventFlags::NOTIFY;
        }
        ev.entity_in_listener != Some(entity)
    }

    /// One scheduling round: drain pending events, or park in `poll`
    /// for at most `max_wait_ms`. Returns `true` when QUIT was seen.
    pub fn work(&self, max_wait_ms: u32) -> bool {
        let mut rounds = 0;
        let mut parked = false;
        while rounds < MAX_DRAIN_ROUNDS {
            let (mut events, tmr_delay, sleeping) = {
                let mut ev = self.ev.lock();
                let mut events = ev.pending;
                ev.pending = EventFlags::empty();
                let tmr_delay = self.timers.pending_ms();
                if tmr_delay == 0 {
                    events |= EventFlags::TMR;
                    ev.sleeping = false;
                } else {
                    ev.sleeping = events.is_empty();
                }
                (events, tmr_delay, ev.sleeping)
            };

            if sleeping {
                if rounds > 0 || parked {
                    break;
                }
                // Nothing to do: park until I/O, wakeup or next timer.
                parked = true;
                let ready = self.socks.poll(tmr_delay.min(max_wait_ms));
                {
                    let mut ev = self.ev.lock();
                    ev.sleeping = false;
                    if ready {
                        ev.pending |= EventFlags::IO;
                    }
                }
                rounds = 0;
                continue;
            }

            while !events.is_empty() {
                if events.contains(EventFlags::QUIT) {
                    return true;
                } else if events.contains(EventFlags::TMR) {
                    events &= !EventFlags::TMR;
                    self.timers.manage();
                } else if events.contains(EventFlags::IO) {
                    events &= !EventFlags::IO;
                    self.socks.dispatch();
                } else if events.contains(EventFlags::PROXY_NE) {
                    events &= !EventFlags::PROXY_NE;
                    if let Some(hook) = self.proxy_send.read().clone() {
                        hook();
                    }
                } else if events.contains(EventFlags::CACHE_X) {
                    events &= !EventFlags::CACHE_X;
                    if let Some(hook) = self.cache_transfer.read().clone() {
                        hook();
                    }
                } else if events.contains(EventFlags::WAITSET) {
                    self.waitset_checks(&mut events);
                } else if events.contains(EventFlags::NOTIFY) {
                    self.client_notify(&mut events);
                } else if events.contains(EventFlags::CONFIG) {
                    self.config_checks(&mut events);
                }
            }
            rounds += 1;
        }
        false
    }

    /// Start the worker thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(DdsError::precondition("worker already running"));
        }
        let me = self.clone();
        let handle = thread::Builder::new()
            .name("tdds-core".into())
            .spawn(move || {
                info!("core thread running");
                loop {
                    if me.work(2000) {
                        break;
                    }
                }
                info!("core thread exited");
            })
            .map_err(|_| DdsError::already_deleted("thread spawn failed"))?;
        *self.worker_thread.write() = Some(handle.thread().id());
        *worker = Some(handle);
        Ok(())
    }

    /// Signal QUIT and join the worker.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(h) = handle {
            self.signal(EventFlags::QUIT);
            let _ = h.join();
            *self.worker_thread.write() = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.socks.remove(self.pipe_fds[0]);
        // SAFETY: closing the pipe descriptors we created.
        unsafe {
            libc::close(self.pipe_fds[0]);
            libc::close(self.pipe_fds[1]);
        }
    }
}
