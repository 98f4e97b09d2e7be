//! Evring is a pair of single-threaded I/O reactors for Linux sharing one
//! task/watcher lifecycle and callback-dispatch contract:
//!
//! - [`CompletionReactor`] multiplexes asynchronous operations (file
//!   read/write, eventfd wait, timerfd wait) through an io_uring
//!   completion queue, retiring exactly one completion per
//!   [`CompletionReactor::step`] call.
//! - [`ReadinessReactor`] multiplexes persistent descriptor watchers
//!   through epoll, dispatching a batch of ready events per
//!   [`ReadinessReactor::step`] call.
//!
//! The caller drives both from its own loop; all blocking happens inside
//! `step`, bounded by a caller-supplied timeout (negative blocks
//! indefinitely). Callbacks are boxed closures invoked synchronously from
//! within `step`; buffers, descriptors and callback handles are owned by
//! exactly one pending task or watcher and released exactly once, at
//! dispatch or explicit teardown.
//!
//! ```no_run
//! use std::os::fd::AsRawFd;
//! use evring::{fd, CompletionReactor, Step};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut reactor = CompletionReactor::new(16)?;
//! let file = fd::open_path("/etc/hostname".as_ref(), libc::O_RDONLY)?;
//!
//! reactor.submit_read(
//!     file.as_raw_fd(),
//!     64,
//!     0,
//!     Box::new(|buffer, count| {
//!         println!("read {count} bytes: {:?}", &buffer[..count]);
//!     }),
//! )?;
//!
//! while reactor.step(1000)? == Step::TimedOut {}
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod completion;
pub mod fd;
pub mod readiness;
pub mod timer;

pub use callback::{
    BufferAllocator, EventCallback, HeapAllocator, IoCallback, ReadyCallback, TimerCallback,
};
pub use completion::{CompletionReactor, Step, TaskHandle};
pub use readiness::{Interest, ReadinessReactor, Ready, WatcherHandle};
pub use timer::{Clock, TimerSchedule};
