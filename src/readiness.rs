//! The readiness-queue reactor, built on epoll.
//!
//! Where the completion reactor consumes a task per event, watchers here
//! are persistent: registered once, fired any number of times, removed
//! explicitly.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::{debug, trace, warn};
use slab::Slab;

use crate::callback::ReadyCallback;

/// Interest mask for a watcher registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Self = Self(libc::EPOLLIN as u32);
    pub const WRITABLE: Self = Self(libc::EPOLLOUT as u32);

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Ready-event mask reported to a watcher's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(u32);

impl Ready {
    pub(crate) fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Opaque identity of one watcher registration: an index into the
/// reactor's watcher slab, stable across any number of readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherHandle(usize);

/// A persistent registration binding a descriptor, an interest mask and a
/// callback. The watcher owns its descriptor; removal closes it.
struct Watcher {
    fd: OwnedFd,
    interest: Interest,
    on_ready: ReadyCallback,
}

/// A reactor multiplexing persistent descriptor watchers through epoll.
///
/// The event buffer is sized once at creation; a single
/// [`ReadinessReactor::step`] dispatches at most that many ready events.
pub struct ReadinessReactor {
    epoll: OwnedFd,
    watchers: Slab<Watcher>,
    events: Box<[libc::epoll_event]>,
}

impl ReadinessReactor {
    /// Create a reactor reporting up to `max_events` ready descriptors per
    /// wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)];

        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(epfd) },
            watchers: Slab::new(),
            events: events.into_boxed_slice(),
        })
    }

    /// Register `fd` for `interest`. Ownership of the descriptor passes to
    /// the watcher, which persists until [`ReadinessReactor::remove_watcher`].
    pub fn add_watcher(
        &mut self,
        fd: OwnedFd,
        interest: Interest,
        on_ready: ReadyCallback,
    ) -> io::Result<WatcherHandle> {
        let raw = fd.as_raw_fd();
        let key = self.watchers.insert(Watcher {
            fd,
            interest,
            on_ready,
        });

        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: key as u64,
        };

        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, raw, &mut event)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            self.watchers.remove(key);
            return Err(err);
        }

        trace!("watching fd {raw} with interest {:#x} as watcher {key}", interest.bits());
        Ok(WatcherHandle(key))
    }

    /// Deregister a watcher, closing its descriptor and dropping its
    /// callback.
    pub fn remove_watcher(&mut self, handle: WatcherHandle) -> io::Result<()> {
        let raw = match self.watchers.get(handle.0) {
            Some(watcher) => watcher.fd.as_raw_fd(),
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such watcher")),
        };

        // Deregister before touching the slab: a failed DEL must leave the
        // handle valid and the descriptor open.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                raw,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let watcher = self.watchers.remove(handle.0);
        trace!("removed watcher {}", handle.0);
        crate::fd::close(watcher.fd)
    }

    /// Block until at least one watched descriptor is ready or
    /// `timeout_ms` elapses (negative blocks indefinitely, zero polls),
    /// then invoke each ready watcher's callback with the descriptor and
    /// its ready mask, in the order the mechanism reported them.
    ///
    /// Returns the number of events dispatched. Watchers are not consumed
    /// and may fire again on a future call.
    pub fn step(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let count = ret as usize;
        for i in 0..count {
            let bits = self.events[i].events;
            let key = self.events[i].u64 as usize;

            let Some(watcher) = self.watchers.get_mut(key) else {
                warn!("ready event for unknown watcher {key}");
                continue;
            };

            let fd = watcher.fd.as_raw_fd();
            debug!("dispatching watcher {key}: fd {fd} ready with {bits:#x}");
            (watcher.on_ready)(fd, Ready::from_bits(bits));
        }

        Ok(count)
    }

    /// Interest mask a watcher was registered with.
    pub fn interest(&self, handle: WatcherHandle) -> Option<Interest> {
        self.watchers.get(handle.0).map(|w| w.interest)
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}
