//! Pending-operation records for the completion-queue reactor.

use std::os::fd::OwnedFd;

use crate::callback::{EventCallback, IoCallback, TimerCallback};
use crate::timer::Timer;

/// One in-flight asynchronous operation.
///
/// A task is reachable from exactly one pending submission: its slab key is
/// the sqe's `user_data`, and it is removed from the slab when that
/// completion is dispatched. The one exception is a periodic `TimerWait`,
/// which keeps its slot and is resubmitted under the same key after each
/// firing.
pub(crate) enum Task {
    Read {
        buffer: Box<[u8]>,
        on_complete: IoCallback,
    },
    Write {
        buffer: Box<[u8]>,
        on_complete: IoCallback,
    },
    EventWait {
        fd: OwnedFd,
        on_complete: EventCallback,
    },
    TimerWait {
        timer: Timer,
        on_complete: TimerCallback,
        cancelled: bool,
    },
}

impl Task {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Task::Read { .. } => "read",
            Task::Write { .. } => "write",
            Task::EventWait { .. } => "event-wait",
            Task::TimerWait { .. } => "timer-wait",
        }
    }
}
