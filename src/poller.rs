//! The readiness poller: a thin, single-threaded wrapper around the OS
//! readiness facility (`mio`) that exposes the four per-round membership
//! sets (`in`, `out`, `idle`, `err`) plus deferred rescan and idle-timeout
//! bookkeeping that the rest of the crate is built around.
//!
//! A [`Poller`] never crosses thread boundaries; the master/sub-proxy model
//! (`crate::master`) achieves parallelism by giving each worker thread its
//! own `Poller`, not by sharing one.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use fnv::{FnvHashMap, FnvHashSet};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slog::Logger;

use crate::error::PollerError;

/// Opaque identifier for whatever owns a descriptor (typically a sub-proxy
/// slab index). The poller does not interpret it; it only remembers the
/// association so a dispatcher can ask "which handlers are due this round".
pub type HandlerId = u64;

/// Readiness mask a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask {
    pub read: bool,
    pub write: bool,
}

impl Mask {
    pub const READ: Mask = Mask { read: true, write: false };
    pub const WRITE: Mask = Mask { read: false, write: true };
    pub const BOTH: Mask = Mask { read: true, write: true };

    fn to_interest(self) -> Interest {
        match (self.read, self.write) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }
}

struct Registration {
    mask: Mask,
    handler: HandlerId,
}

/// The readiness poller. Owns the OS facility, the descriptor → handler map,
/// and the per-round membership sets.
pub struct Poller {
    log: Logger,
    poll: Poll,
    events: Events,

    registry: FnvHashMap<RawFd, Registration>,

    in_set: FnvHashSet<RawFd>,
    out_set: FnvHashSet<RawFd>,
    err_set: FnvHashSet<RawFd>,
    idle_set: FnvHashSet<RawFd>,

    enforce_in: FnvHashSet<RawFd>,
    rescan_in: FnvHashSet<RawFd>,
    rescan_out: FnvHashSet<RawFd>,
    rescan_granularity: Duration,
    rescan_deadline: Instant,

    idle_watched: FnvHashSet<RawFd>,
    idle_last_activity: FnvHashMap<RawFd, Instant>,
    idle_timeout: Duration,

    hint_fd: Option<RawFd>,

    /// When true (the default), a descriptor that was ready for write in the
    /// previous round has its write interest dropped so the next round
    /// doesn't immediately re-fire on a still-writable socket.
    pub auto_epollout_remove: bool,
}

impl Poller {
    pub fn new(log: Logger, idle_timeout: Duration, rescan_granularity: Duration) -> Result<Self, PollerError> {
        let poll = Poll::new().map_err(PollerError::Register)?;
        Ok(Self {
            log,
            poll,
            events: Events::with_capacity(1024),
            registry: FnvHashMap::default(),
            in_set: FnvHashSet::default(),
            out_set: FnvHashSet::default(),
            err_set: FnvHashSet::default(),
            idle_set: FnvHashSet::default(),
            enforce_in: FnvHashSet::default(),
            rescan_in: FnvHashSet::default(),
            rescan_out: FnvHashSet::default(),
            rescan_granularity,
            rescan_deadline: Instant::now() + rescan_granularity,
            idle_watched: FnvHashSet::default(),
            idle_last_activity: FnvHashMap::default(),
            idle_timeout,
            hint_fd: None,
            auto_epollout_remove: true,
        })
    }

    fn token(fd: RawFd) -> Token {
        Token(fd as usize)
    }

    /// Register `fd` for the given readiness mask, associated with `handler`.
    /// Idempotent: re-adding an already-registered fd updates its mask.
    pub fn add(&mut self, fd: RawFd, mask: Mask, handler: HandlerId) -> Result<(), PollerError> {
        if self.registry.contains_key(&fd) {
            return self.modify(fd, mask);
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Self::token(fd), mask.to_interest())
            .map_err(PollerError::Register)?;
        self.registry.insert(fd, Registration { mask, handler });
        Ok(())
    }

    /// Change the readiness mask for an already-registered fd. Falls through
    /// to `add` for an unknown fd only when a handler association already
    /// exists (otherwise it is a programming error the caller must avoid).
    pub fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<(), PollerError> {
        match self.registry.get_mut(&fd) {
            Some(reg) => {
                reg.mask = mask;
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Self::token(fd), mask.to_interest())
                    .map_err(PollerError::Register)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Deregister `fd`. A no-op if it was never registered.
    pub fn del(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if self.registry.remove(&fd).is_none() {
            return Ok(());
        }
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        self.in_set.remove(&fd);
        self.out_set.remove(&fd);
        self.err_set.remove(&fd);
        self.idle_set.remove(&fd);
        self.enforce_in.remove(&fd);
        self.rescan_in.remove(&fd);
        self.rescan_out.remove(&fd);
        self.idle_watched.remove(&fd);
        self.idle_last_activity.remove(&fd);
        Ok(())
    }

    pub fn handler_of(&self, fd: RawFd) -> Option<HandlerId> {
        self.registry.get(&fd).map(|r| r.handler)
    }

    /// `fd` will be present in the `in` set on the very next round, even if
    /// the OS reports no readiness for it (used when upper layers already
    /// hold buffered data that just needs one more pass of processing).
    pub fn enforce_in(&mut self, fd: RawFd) {
        self.enforce_in.insert(fd);
    }

    /// Defer `fd`: remove it from the live `in` set and re-add it only once
    /// the rescan timer elapses. Avoids busy-spinning on a descriptor that
    /// has data but not enough to make progress yet.
    pub fn rescan_in(&mut self, fd: RawFd) {
        self.in_set.remove(&fd);
        self.rescan_in.insert(fd);
    }

    pub fn rescan_out(&mut self, fd: RawFd) {
        self.out_set.remove(&fd);
        self.rescan_out.insert(fd);
    }

    pub fn cancel_rescan_in(&mut self, fd: RawFd) {
        self.rescan_in.remove(&fd);
    }

    pub fn cancel_rescan_out(&mut self, fd: RawFd) {
        self.rescan_out.remove(&fd);
    }

    /// Opt `fd` into idle-timeout tracking: each round it shows no activity
    /// counts towards `idle_timeout`, at which point it is placed in the
    /// idle set.
    pub fn idle_watch(&mut self, fd: RawFd) {
        self.idle_watched.insert(fd);
        self.idle_last_activity.insert(fd, Instant::now());
    }

    pub fn clear_idle_watch(&mut self, fd: RawFd) {
        self.idle_watched.remove(&fd);
        self.idle_last_activity.remove(&fd);
        self.idle_set.remove(&fd);
    }

    /// Record that `fd` just did something (read or wrote), resetting its
    /// idle clock.
    pub fn note_activity(&mut self, fd: RawFd) {
        if self.idle_watched.contains(&fd) {
            self.idle_last_activity.insert(fd, Instant::now());
        }
        self.idle_set.remove(&fd);
    }

    /// A non-handler descriptor whose readiness should cause the owning
    /// proxy's own round to run (used by non-socket event sources such as a
    /// UDP virtual-flow wakeup pipe).
    pub fn hint_socket(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Self::token(fd), Interest::READABLE)
            .map_err(PollerError::Register)?;
        self.hint_fd = Some(fd);
        Ok(())
    }

    pub fn hint_fd(&self) -> Option<RawFd> {
        self.hint_fd
    }

    /// Run one round: move enforced fds into `in`, poll the OS, merge
    /// elapsed rescans, and update idle bookkeeping. `timeout = None` blocks
    /// until any event; `Some(Duration::ZERO)` is a non-blocking poll.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<(), PollerError> {
        self.in_set.clear();
        self.out_set.clear();
        self.err_set.clear();

        for fd in self.enforce_in.drain() {
            self.in_set.insert(fd);
        }

        self.poll.poll(&mut self.events, timeout).map_err(PollerError::Wait)?;

        for ev in self.events.iter() {
            let fd = ev.token().0 as RawFd;
            if ev.is_error() || ev.is_read_closed() && ev.is_write_closed() {
                self.err_set.insert(fd);
                continue;
            }
            if ev.is_readable() {
                self.in_set.insert(fd);
            }
            if ev.is_writable() {
                self.out_set.insert(fd);
                if self.auto_epollout_remove {
                    if let Some(reg) = self.registry.get_mut(&fd) {
                        if reg.mask.write && !reg.mask.read {
                            // write-only watcher: nothing to fall back to, leave as-is
                        } else if reg.mask.write {
                            reg.mask.write = false;
                            let _ = self.poll.registry().reregister(
                                &mut SourceFd(&fd),
                                Self::token(fd),
                                reg.mask.to_interest(),
                            );
                        }
                    }
                }
            }
        }

        if Instant::now() >= self.rescan_deadline {
            for fd in self.rescan_in.drain() {
                self.in_set.insert(fd);
            }
            for fd in self.rescan_out.drain() {
                self.out_set.insert(fd);
            }
            self.rescan_deadline = Instant::now() + self.rescan_granularity;
        }

        let now = Instant::now();
        let mut timed_out = Vec::new();
        for fd in &self.idle_watched {
            if let Some(last) = self.idle_last_activity.get(fd) {
                if now.duration_since(*last) >= self.idle_timeout {
                    timed_out.push(*fd);
                }
            }
        }
        for fd in timed_out {
            self.idle_set.insert(fd);
        }

        Ok(())
    }

    pub fn in_contains(&self, fd: RawFd) -> bool {
        self.in_set.contains(&fd)
    }
    pub fn out_contains(&self, fd: RawFd) -> bool {
        self.out_set.contains(&fd)
    }
    pub fn err_contains(&self, fd: RawFd) -> bool {
        self.err_set.contains(&fd)
    }
    pub fn idle_contains(&self, fd: RawFd) -> bool {
        self.idle_set.contains(&fd)
    }

    pub fn in_set(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.in_set.iter().copied()
    }
    pub fn out_set(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.out_set.iter().copied()
    }
    pub fn err_set(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.err_set.iter().copied()
    }
    pub fn idle_set(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.idle_set.iter().copied()
    }

    /// Every distinct handler with at least one descriptor ready this round
    /// (in any of in/out/idle/err). Used by the master proxy to decide which
    /// sub-proxies to dispatch to.
    pub fn due_handlers(&self) -> FnvHashSet<HandlerId> {
        let mut due = FnvHashSet::default();
        for fd in self.in_set.iter().chain(self.out_set.iter()).chain(self.err_set.iter()).chain(self.idle_set.iter()) {
            if let Some(h) = self.registry.get(fd).map(|r| r.handler) {
                due.insert(h);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Drain};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn mask_to_interest_round_trips_intent() {
        assert_eq!(Mask::BOTH.read, true);
        assert_eq!(Mask::BOTH.write, true);
        assert_eq!(Mask::READ.write, false);
    }

    #[test]
    fn new_poller_starts_with_empty_sets() {
        let p = Poller::new(test_logger(), Duration::from_secs(3600), Duration::from_secs(1)).unwrap();
        assert_eq!(p.in_set().count(), 0);
        assert_eq!(p.due_handlers().len(), 0);
    }

    #[test]
    fn del_on_unknown_fd_is_a_noop() {
        let mut p = Poller::new(test_logger(), Duration::from_secs(3600), Duration::from_secs(1)).unwrap();
        assert!(p.del(999).is_ok());
    }
}
