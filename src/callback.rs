//! The dispatch boundary between the reactors and their host.
//!
//! Callbacks are owned, boxed closures handed over at submission time. The
//! reactor holds them inside the pending task or watcher record and drops
//! them exactly once: at dispatch for one-shot operations, at removal or
//! cancellation otherwise. Since every callback is invoked from within
//! `step`, which holds `&mut self` on the reactor, safe code cannot reenter
//! the same reactor instance from inside a callback.

use std::os::fd::RawFd;

use crate::readiness::Ready;

/// Completion callback for file reads and writes.
///
/// Receives the operation's buffer (ownership passes to the callback) and
/// the number of bytes actually transferred.
pub type IoCallback = Box<dyn FnOnce(Box<[u8]>, usize)>;

/// Completion callback for an eventfd wait. Receives the drained 64-bit
/// counter value.
pub type EventCallback = Box<dyn FnOnce(u64)>;

/// Completion callback for a timer. Invoked once per elapsed expiration,
/// so a periodic timer calls it many times over its life.
pub type TimerCallback = Box<dyn FnMut()>;

/// Readiness callback for a watcher. Receives the watched descriptor and
/// the ready-event mask reported by the mechanism.
pub type ReadyCallback = Box<dyn FnMut(RawFd, Ready)>;

/// Source of output buffers for `submit_read`.
///
/// The reactor never allocates read buffers itself; it asks the host for a
/// fixed-length contiguous region it can write into directly. The returned
/// box's heap address must stay stable for the pendency of the read, which
/// `Box<[u8]>` guarantees.
pub trait BufferAllocator {
    fn allocate(&mut self, len: usize) -> Box<[u8]>;
}

/// Default allocator: zeroed heap slices.
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, len: usize) -> Box<[u8]> {
        vec![0u8; len].into_boxed_slice()
    }
}
