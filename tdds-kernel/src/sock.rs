//! Socket set: a registry of file descriptors with callbacks, serviced
//! by a single `poll(2)` wait.
//!
//! Two locks split the work: `set_lock` guards the registry for short
//! mutations, `poll_lock` serialises the kernel wait. The kernel sees a
//! snapshot of the descriptor array taken under `set_lock`; ready events
//! are merged back by descriptor, so a socket removed while the worker
//! was parked is skipped rather than dispatched stale. `dispatch` copies
//! a ready entry out and clears it before invoking the callback, which
//! makes a callback that removes its own descriptor safe.

use crate::error::{DdsError, Result};
use crate::log::{self, source};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tracing::warn;

/// Default registry bound; overridable at construction (`IP_SOCKETS`).
pub const DEFAULT_MAX_SOCKETS: usize = 1024;

/// Registry growth increment.
const FD_INC_SIZE: usize = 64;

bitflags! {
    /// Abstract poll event set, mirroring the kernel's `poll(2)` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: i16 {
        const IN   = libc::POLLIN;
        const PRI  = libc::POLLPRI;
        const OUT  = libc::POLLOUT;
        const ERR  = libc::POLLERR;
        const HUP  = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

/// Callback invoked with `(fd, ready events, user word)`.
pub type SocketCallback = Arc<dyn Fn(RawFd, PollEvents, usize) + Send + Sync>;

struct SockEntry {
    fd: RawFd,
    events: PollEvents,
    revents: PollEvents,
    cb: SocketCallback,
    user: usize,
    name: &'static str,
}

struct SockTable {
    entries: Vec<SockEntry>,
}

impl SockTable {
    fn position(&self, fd: RawFd) -> Option<usize> {
        self.entries.iter().position(|e| e.fd == fd)
    }
}

/// The descriptor registry plus its poll primitive.
pub struct SocketSet {
    set_lock: Mutex<SockTable>,
    poll_lock: Mutex<()>,
    max_size: usize,
}

impl SocketSet {
    pub fn new(max_size: usize) -> Self {
        SocketSet {
            set_lock: Mutex::new(SockTable {
                entries: Vec::with_capacity(FD_INC_SIZE),
            }),
            poll_lock: Mutex::new(()),
            max_size,
        }
    }

    /// Register a descriptor with its interest set and callback.
    pub fn add(
        &self,
        fd: RawFd,
        events: PollEvents,
        cb: SocketCallback,
        user: usize,
        name: &'static str,
    ) -> Result<()> {
        let mut table = self.set_lock.lock();
        if table.entries.len() >= self.max_size {
            return Err(DdsError::out_of_resources("socket set full"));
        }
        if table.entries.capacity() == table.entries.len() {
            table.entries.reserve(FD_INC_SIZE);
        }
        table.entries.push(SockEntry {
            fd,
            events,
            revents: PollEvents::empty(),
            cb,
            user,
            name,
        });
        Ok(())
    }

    /// Remove a descriptor. Unknown descriptors are ignored.
    pub fn remove(&self, fd: RawFd) {
        let mut table = self.set_lock.lock();
        if let Some(i) = table.position(fd) {
            table.entries.remove(i);
        }
    }

    /// Whether a descriptor is still registered.
    pub fn valid(&self, fd: RawFd) -> bool {
        self.set_lock.lock().position(fd).is_some()
    }

    /// Enable or disable event bits on a registered descriptor.
    pub fn set_events(&self, fd: RawFd, events: PollEvents, on: bool) {
        let mut table = self.set_lock.lock();
        if let Some(i) = table.position(fd) {
            if on {
                table.entries[i].events |= events;
            } else {
                table.entries[i].events &= !events;
            }
        }
    }

    /// Replace the callback of a registered descriptor.
    pub fn set_callback(&self, fd: RawFd, cb: SocketCallback) {
        let mut table = self.set_lock.lock();
        if let Some(i) = table.position(fd) {
            table.entries[i].cb = cb;
        }
    }

    /// Replace the user word of a registered descriptor.
    pub fn set_user(&self, fd: RawFd, user: usize) {
        let mut table = self.set_lock.lock();
        if let Some(i) = table.position(fd) {
            table.entries[i].user = user;
        }
    }

    pub fn len(&self) -> usize {
        self.set_lock.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a registered descriptor is ready or the timeout (in
    /// milliseconds) elapses. Returns whether any descriptor has ready
    /// events pending dispatch.
    pub fn poll(&self, timeout_ms: u32) -> bool {
        let _poll_guard = self.poll_lock.lock();

        let mut fds: Vec<libc::pollfd> = {
            let table = self.set_lock.lock();
            table
                .entries
                .iter()
                .map(|e| libc::pollfd {
                    fd: e.fd,
                    events: e.events.bits(),
                    revents: 0,
                })
                .collect()
        };
        if fds.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms as u64));
            return false;
        }

        let timeout = timeout_ms.min(i32::MAX as u32) as i32;
        // SAFETY: fds points at a live, correctly sized pollfd array for
        // the duration of the call; poll does not retain the pointer.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                warn!(error = %err, "poll() returned an error");
            }
            return false;
        }
        if n == 0 {
            return false;
        }

        let mut any = false;
        let mut table = self.set_lock.lock();
        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            if let Some(i) = table.position(pfd.fd) {
                table.entries[i].revents |= PollEvents::from_bits_truncate(pfd.revents);
                any = true;
            }
        }
        any
    }

    /// Run the callbacks of every descriptor with pending ready events.
    pub fn dispatch(&self) {
        loop {
            let (cb, fd, revents, user) = {
                let mut table = self.set_lock.lock();
                let Some(i) = table.entries.iter().position(|e| !e.revents.is_empty()) else {
                    return;
                };
                let e = &mut table.entries[i];
                let revents = e.revents;
                e.revents = PollEvents::empty();
                (e.cb.clone(), e.fd, revents, e.user)
            };
            cb(fd, revents, user);
        }
    }

    /// Log every registered descriptor.
    pub fn dump(&self) {
        let table = self.set_lock.lock();
        for (i, e) in table.entries.iter().enumerate() {
            log::debug_line(
                source::SOCK,
                &format!(
                    "{i}: [{fd}] {name} events={events:?} user={user:#x}",
                    fd = e.fd,
                    name = e.name,
                    events = e.events,
                    user = e.user
                ),
            );
        }
    }
}

impl Default for SocketSet {
    fn default() -> Self {
        SocketSet::new(DEFAULT_MAX_SOCKETS)
    }
}

/// Put a descriptor in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a caller-supplied descriptor; no memory is passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(DdsError::already_deleted("fcntl(F_GETFL) failed"));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        warn!(fd, "can't set non-blocking mode");
        return Err(DdsError::already_deleted("fcntl(F_SETFL) failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn noop_cb() -> SocketCallback {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn add_remove_valid() {
        let set = SocketSet::new(8);
        let (r, w) = pipe_pair();
        set.add(r, PollEvents::IN, noop_cb(), 0, "test.r").unwrap();
        assert!(set.valid(r));
        assert!(!set.valid(w));
        set.remove(r);
        assert!(!set.valid(r));
        close(r);
        close(w);
    }

    #[test]
    fn bound_enforced() {
        let set = SocketSet::new(1);
        let (r, w) = pipe_pair();
        set.add(r, PollEvents::IN, noop_cb(), 0, "one").unwrap();
        let err = set.add(w, PollEvents::IN, noop_cb(), 0, "two");
        assert!(matches!(err, Err(DdsError::OutOfResources(_))));
        close(r);
        close(w);
    }

    #[test]
    fn poll_and_dispatch_readable_pipe() {
        let set = SocketSet::new(8);
        let (r, w) = pipe_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let cb: SocketCallback = Arc::new(move |fd, ev, user| {
            assert!(ev.contains(PollEvents::IN));
            assert_eq!(user, 7);
            let mut b = [0u8; 1];
            unsafe { libc::read(fd, b.as_mut_ptr().cast(), 1) };
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        set.add(r, PollEvents::IN, cb, 7, "pipe.r").unwrap();

        unsafe { libc::write(w, b".".as_ptr().cast(), 1) };
        assert!(set.poll(1000));
        set.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Nothing further pending.
        assert!(!set.poll(0));
        close(r);
        close(w);
    }

    #[test]
    fn callback_may_remove_its_own_fd() {
        let set = Arc::new(SocketSet::new(8));
        let (r, w) = pipe_pair();
        let set2 = set.clone();
        let cb: SocketCallback = Arc::new(move |fd, _, _| {
            let mut b = [0u8; 1];
            unsafe { libc::read(fd, b.as_mut_ptr().cast(), 1) };
            set2.remove(fd);
        });
        set.add(r, PollEvents::IN, cb, 0, "self.remove").unwrap();
        unsafe { libc::write(w, b".".as_ptr().cast(), 1) };
        assert!(set.poll(1000));
        set.dispatch();
        assert!(!set.valid(r));
        close(r);
        close(w);
    }

    #[test]
    fn event_mask_toggle() {
        let set = SocketSet::new(8);
        let (r, w) = pipe_pair();
        set.add(r, PollEvents::IN, noop_cb(), 0, "mask").unwrap();
        set.set_events(r, PollEvents::IN, false);
        unsafe { libc::write(w, b".".as_ptr().cast(), 1) };
        // Interest cleared: poll times out without ready entries.
        assert!(!set.poll(10));
        set.set_events(r, PollEvents::IN, true);
        assert!(set.poll(1000));
        close(r);
        close(w);
    }
}
