//! Periodic and one-shot timers backed by a timerfd.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::fd;

/// When a timer first fires and how often it repeats.
///
/// A zero `interval` makes the timer one-shot: it fires once after
/// `initial` and is then exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSchedule {
    pub initial: Duration,
    pub interval: Duration,
}

impl TimerSchedule {
    pub fn one_shot(initial: Duration) -> Self {
        Self {
            initial,
            interval: Duration::ZERO,
        }
    }

    pub fn periodic(initial: Duration, interval: Duration) -> Self {
        Self { initial, interval }
    }

    pub fn is_periodic(&self) -> bool {
        !self.interval.is_zero()
    }
}

/// Clock a timer's schedule is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Monotonic,
    Realtime,
    Boottime,
}

impl Clock {
    pub(crate) fn to_clockid(self) -> libc::clockid_t {
        match self {
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::Boottime => libc::CLOCK_BOOTTIME,
        }
    }
}

/// A timerfd plus its schedule and the expiration count filled in by the
/// most recent wait.
///
/// The counter lives in its own heap box so its address stays valid for an
/// in-flight read even when the owning task slab reallocates. Dropping the
/// timer closes the descriptor.
pub(crate) struct Timer {
    fd: OwnedFd,
    schedule: TimerSchedule,
    expirations: Box<u64>,
}

impl Timer {
    /// Create and arm a timerfd per `schedule`. `fd_flags` are `TFD_*`
    /// creation flags, `arm_flags` are `timerfd_settime` flags.
    pub(crate) fn new(
        schedule: TimerSchedule,
        clock: Clock,
        fd_flags: libc::c_int,
        arm_flags: libc::c_int,
    ) -> io::Result<Self> {
        let fd = fd::create_timer_fd(clock, fd_flags)?;
        fd::arm_timer_fd(fd.as_raw_fd(), &schedule, arm_flags)?;

        Ok(Self {
            fd,
            schedule,
            expirations: Box::new(0),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn is_periodic(&self) -> bool {
        self.schedule.is_periodic()
    }

    /// Destination for the 8-byte expiration-count read.
    pub(crate) fn expirations_ptr(&mut self) -> *mut u8 {
        &mut *self.expirations as *mut u64 as *mut u8
    }

    /// Number of expirations reported by the completed read. Clears the
    /// counter in place; the box itself must survive for resubmission.
    pub(crate) fn take_expirations(&mut self) -> u64 {
        std::mem::replace(&mut *self.expirations, 0)
    }
}
