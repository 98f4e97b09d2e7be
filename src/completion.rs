//! The completion-queue reactor, built on io_uring.
//!
//! Operations are submitted against the ring with their task's slab key as
//! the sqe `user_data`. Each [`CompletionReactor::step`] call blocks for at
//! most one completion and dispatches exactly the work that finished;
//! callers drive the loop themselves, so per-iteration work stays bounded.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use io_uring::types::CancelBuilder;
use io_uring::{opcode, squeue, types, IoUring};
use log::{debug, trace, warn};
use slab::Slab;

use crate::callback::{BufferAllocator, EventCallback, HeapAllocator, IoCallback, TimerCallback};
use crate::fd;
use crate::timer::{Clock, Timer, TimerSchedule};

use task::Task;

mod task;

/// Opaque identity of one pending task: an index into the reactor's task
/// slab. Stable for the task's whole life, including across the many
/// completions of a periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(usize);

/// Outcome of one [`CompletionReactor::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// One completion was retired.
    Dispatched,
    /// The timeout elapsed with nothing ready; no callback ran.
    TimedOut,
}

/// A reactor multiplexing asynchronous operations through an io_uring
/// completion queue.
///
/// Single-threaded: submission and `step` mutate the same exclusively
/// owned state, and callbacks run synchronously inside `step`. Dropping the
/// reactor while operations are still in flight is a caller contract
/// violation; buffers owned by pending tasks would be freed under the
/// kernel.
pub struct CompletionReactor {
    uring: IoUring,
    tasks: Slab<Task>,
    alloc: Box<dyn BufferAllocator>,
}

impl CompletionReactor {
    /// Create a reactor whose ring holds up to `capacity` concurrently
    /// outstanding operations.
    pub fn new(capacity: u32) -> io::Result<Self> {
        Self::with_allocator(capacity, Box::new(HeapAllocator))
    }

    /// As [`CompletionReactor::new`], with a host-supplied source for read
    /// buffers.
    pub fn with_allocator(capacity: u32, alloc: Box<dyn BufferAllocator>) -> io::Result<Self> {
        Ok(Self {
            uring: IoUring::new(capacity)?,
            tasks: Slab::new(),
            alloc,
        })
    }

    /// Number of in-flight tasks.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Enqueue a read of at most `len` bytes from `fd` at `offset` into a
    /// freshly allocated buffer. The callback receives the buffer and the
    /// transferred byte count once the completion is dispatched.
    pub fn submit_read(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: u64,
        on_complete: IoCallback,
    ) -> io::Result<TaskHandle> {
        let mut buffer = self.alloc.allocate(len);
        let ptr = buffer.as_mut_ptr();

        let key = self.tasks.insert(Task::Read {
            buffer,
            on_complete,
        });

        let entry = opcode::Read::new(types::Fd(fd), ptr, len as u32)
            .offset(offset)
            .build()
            .user_data(key as u64);

        self.push(entry, key)?;
        trace!("submitted read of {len} bytes at {offset} on fd {fd} as task {key}");

        Ok(TaskHandle(key))
    }

    /// Enqueue a write of `len` bytes from `buffer` to `fd` at `offset`.
    /// The reactor owns the buffer until dispatch, which hands it back to
    /// the callback along with the transferred byte count.
    pub fn submit_write(
        &mut self,
        fd: RawFd,
        buffer: Box<[u8]>,
        len: usize,
        offset: u64,
        on_complete: IoCallback,
    ) -> io::Result<TaskHandle> {
        if len > buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write length exceeds buffer length",
            ));
        }

        let ptr = buffer.as_ptr();
        let key = self.tasks.insert(Task::Write {
            buffer,
            on_complete,
        });

        let entry = opcode::Write::new(types::Fd(fd), ptr, len as u32)
            .offset(offset)
            .build()
            .user_data(key as u64);

        self.push(entry, key)?;
        trace!("submitted write of {len} bytes at {offset} on fd {fd} as task {key}");

        Ok(TaskHandle(key))
    }

    /// Enqueue a wait for `efd` to become readable. At dispatch the
    /// callback receives the drained 64-bit counter and the descriptor is
    /// closed; the reactor owns it from here on.
    pub fn submit_event_wait(
        &mut self,
        efd: OwnedFd,
        on_complete: EventCallback,
    ) -> io::Result<TaskHandle> {
        let raw = efd.as_raw_fd();
        let key = self.tasks.insert(Task::EventWait {
            fd: efd,
            on_complete,
        });

        let entry = opcode::PollAdd::new(types::Fd(raw), libc::POLLIN as u32)
            .build()
            .user_data(key as u64);

        self.push(entry, key)?;
        trace!("submitted event wait on fd {raw} as task {key}");

        Ok(TaskHandle(key))
    }

    /// Create and arm a timer per `schedule`, then enqueue a read of its
    /// expiration counter. The callback is invoked once per elapsed tick;
    /// a periodic timer is resubmitted under the same handle after every
    /// firing until [`CompletionReactor::cancel_timer`].
    ///
    /// `fd_flags` are `TFD_*` creation flags, `arm_flags` are
    /// `timerfd_settime` flags (e.g. `TFD_TIMER_ABSTIME`).
    pub fn submit_timer_wait(
        &mut self,
        schedule: TimerSchedule,
        clock: Clock,
        fd_flags: libc::c_int,
        arm_flags: libc::c_int,
        on_complete: TimerCallback,
    ) -> io::Result<TaskHandle> {
        let timer = Timer::new(schedule, clock, fd_flags, arm_flags)?;
        let key = self.tasks.insert(Task::TimerWait {
            timer,
            on_complete,
            cancelled: false,
        });

        self.submit_timer_read(key)?;
        trace!("submitted timer wait as task {key}");

        Ok(TaskHandle(key))
    }

    /// Cancel a periodic timer.
    ///
    /// The task is marked cancelled and a synchronous cancel is issued for
    /// its pending read. Whether the kernel cancels the read or it had
    /// already completed, the next completion observed for this handle
    /// tears the timer down without invoking its callback.
    pub fn cancel_timer(&mut self, handle: TaskHandle) -> io::Result<()> {
        match self.tasks.get_mut(handle.0) {
            Some(Task::TimerWait { cancelled, .. }) => *cancelled = true,
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "handle does not refer to a timer task",
                ))
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no such pending task",
                ))
            }
        }

        match self
            .uring
            .submitter()
            .register_sync_cancel(None, CancelBuilder::user_data(handle.0 as u64))
        {
            Ok(()) => {}
            // The read already completed; its cqe is queued and the
            // cancelled flag will reap it at dispatch.
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
            Err(err) => return Err(err),
        }

        trace!("cancelled timer task {}", handle.0);
        Ok(())
    }

    /// Block until one completion is available or `timeout_ms` elapses
    /// (negative blocks indefinitely), then dispatch it.
    ///
    /// Exactly one completion is retired per call; callers loop. A
    /// negative operation result frees the task and surfaces as an error,
    /// except a cancelled timer's final completion, which is a silent
    /// teardown.
    pub fn step(&mut self, timeout_ms: i32) -> io::Result<Step> {
        if !self.wait_for_completion(timeout_ms)? {
            return Ok(Step::TimedOut);
        }

        let Some(entry) = self.uring.completion().next() else {
            return Ok(Step::TimedOut);
        };

        self.dispatch(entry.user_data() as usize, entry.result())?;
        Ok(Step::Dispatched)
    }

    fn wait_for_completion(&mut self, timeout_ms: i32) -> io::Result<bool> {
        let wait = if timeout_ms >= 0 {
            let ts = types::Timespec::new()
                .sec(timeout_ms as u64 / 1000)
                .nsec((timeout_ms as u32 % 1000) * 1_000_000);
            let args = types::SubmitArgs::new().timespec(&ts);

            self.uring.submitter().submit_with_args(1, &args)
        } else {
            self.uring.submit_and_wait(1)
        };

        match wait {
            Ok(_) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::ETIME) => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(false),
            // Completion-queue backlog: a completion is waiting to be
            // consumed, and retiring it is what unblocks the ring.
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn dispatch(&mut self, key: usize, res: i32) -> io::Result<()> {
        if !self.tasks.contains(key) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "completion for a task the reactor does not know",
            ));
        }

        if let Some(Task::TimerWait {
            cancelled: true, ..
        }) = self.tasks.get(key)
        {
            debug!("reaping cancelled timer task {key}");
            self.tasks.remove(key);
            return match res {
                r if r >= 0 || r == -libc::ECANCELED => Ok(()),
                r => Err(io::Error::from_raw_os_error(-r)),
            };
        }

        if res < 0 {
            let task = self.tasks.remove(key);
            debug!("task {key} ({}) failed: {res}", task.kind());
            return Err(io::Error::from_raw_os_error(-res));
        }

        if matches!(self.tasks.get(key), Some(Task::TimerWait { .. })) {
            return self.dispatch_timer(key);
        }

        match self.tasks.remove(key) {
            Task::Read {
                buffer,
                on_complete,
            }
            | Task::Write {
                buffer,
                on_complete,
            } => {
                debug!("dispatching task {key}: {res} bytes transferred");
                on_complete(buffer, res as usize);
            }
            Task::EventWait { fd, on_complete } => {
                let value = fd::read_event_counter(fd.as_raw_fd())?;
                debug!("dispatching event task {key}: counter {value}");
                on_complete(value);
                fd::close(fd)?;
            }
            Task::TimerWait { .. } => unreachable!("timer tasks are dispatched in place"),
        }

        Ok(())
    }

    /// Deliver one callback per elapsed tick, then either retire a
    /// one-shot timer or resubmit the same task for the next firing.
    fn dispatch_timer(&mut self, key: usize) -> io::Result<()> {
        let periodic = {
            let Some(Task::TimerWait {
                timer, on_complete, ..
            }) = self.tasks.get_mut(key)
            else {
                unreachable!("dispatch_timer called for a non-timer key");
            };

            let expired = timer.take_expirations();
            debug!("dispatching timer task {key}: {expired} expirations");
            for _ in 0..expired {
                on_complete();
            }

            timer.is_periodic()
        };

        if periodic {
            self.submit_timer_read(key)
        } else {
            self.tasks.remove(key);
            Ok(())
        }
    }

    fn submit_timer_read(&mut self, key: usize) -> io::Result<()> {
        let Some(Task::TimerWait { timer, .. }) = self.tasks.get_mut(key) else {
            unreachable!("submit_timer_read called for a non-timer key");
        };

        let entry = opcode::Read::new(
            types::Fd(timer.raw_fd()),
            timer.expirations_ptr(),
            std::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(key as u64);

        self.push(entry, key)
    }

    /// Queue `entry` and hand it to the kernel. The task is abandoned only
    /// if the entry never made it into the ring; once queued, the task
    /// must stay alive even when the submit itself is refused
    /// (completion-queue backlog), since the next submit carries the
    /// queued sqe.
    fn push(&mut self, entry: squeue::Entry, key: usize) -> io::Result<()> {
        if unsafe { self.uring.submission().push(&entry) }.is_err() {
            self.tasks.remove(key);
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "submission queue is full",
            ));
        }

        if let Err(err) = self.uring.submit() {
            warn!("submit refused, task {key} stays queued: {err}");
            return Err(err);
        }

        Ok(())
    }
}

impl Drop for CompletionReactor {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            warn!(
                "completion reactor dropped with {} task(s) still in flight",
                self.tasks.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use assert_fs::prelude::*;

    use super::*;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn step_until(reactor: &mut CompletionReactor, done: &Cell<bool>) {
        while !done.get() {
            assert_eq!(reactor.step(1000).unwrap(), Step::Dispatched);
        }
    }

    #[test]
    fn write_then_read_round_trip() -> anyhow::Result<()> {
        init_logs();
        let file = assert_fs::NamedTempFile::new("data.txt")?;
        file.touch()?;

        let mut reactor = CompletionReactor::new(8)?;
        let fd = fd::open_path(file.path(), libc::O_RDWR)?;

        let wrote = Rc::new(Cell::new(false));
        let buffer = b"hello".to_vec().into_boxed_slice();
        let flag = wrote.clone();
        reactor.submit_write(
            fd.as_raw_fd(),
            buffer,
            5,
            0,
            Box::new(move |_buffer, count| {
                assert_eq!(count, 5);
                flag.set(true);
            }),
        )?;
        step_until(&mut reactor, &wrote);

        let got = Rc::new(RefCell::new(Vec::new()));
        let read_done = Rc::new(Cell::new(false));
        let sink = got.clone();
        let flag = read_done.clone();
        reactor.submit_read(
            fd.as_raw_fd(),
            5,
            0,
            Box::new(move |buffer, count| {
                sink.borrow_mut().extend_from_slice(&buffer[..count]);
                flag.set(true);
            }),
        )?;
        step_until(&mut reactor, &read_done);

        assert_eq!(&*got.borrow(), b"hello");
        assert_eq!(reactor.pending(), 0);

        fd::close(fd)?;
        Ok(())
    }

    #[test]
    fn timeout_returns_without_dispatch() {
        let mut reactor = CompletionReactor::new(4).unwrap();

        let start = Instant::now();
        let outcome = reactor.step(100).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcome, Step::TimedOut);
        assert!(elapsed >= Duration::from_millis(80), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "returned after {elapsed:?}");
    }

    #[test]
    fn event_signals_coalesce_into_one_completion() {
        let mut reactor = CompletionReactor::new(4).unwrap();
        let efd = fd::create_event_fd(libc::EFD_NONBLOCK).unwrap();
        let raw = efd.as_raw_fd();

        let seen = Rc::new(Cell::new(0u64));
        let sink = seen.clone();
        reactor
            .submit_event_wait(
                efd,
                Box::new(move |value| {
                    sink.set(value);
                }),
            )
            .unwrap();

        fd::signal_event_fd(raw, 150).unwrap();
        fd::signal_event_fd(raw, 50).unwrap();

        assert_eq!(reactor.step(-1).unwrap(), Step::Dispatched);
        assert_eq!(seen.get(), 200);
        assert_eq!(reactor.pending(), 0);
    }

    #[test]
    fn one_shot_timer_fires_exactly_once() {
        let mut reactor = CompletionReactor::new(4).unwrap();

        let fired = Rc::new(Cell::new(0u32));
        let sink = fired.clone();
        reactor
            .submit_timer_wait(
                TimerSchedule::one_shot(Duration::from_millis(20)),
                Clock::Monotonic,
                libc::TFD_CLOEXEC,
                0,
                Box::new(move || {
                    sink.set(sink.get() + 1);
                }),
            )
            .unwrap();

        assert_eq!(reactor.step(-1).unwrap(), Step::Dispatched);
        assert_eq!(fired.get(), 1);
        assert_eq!(reactor.pending(), 0);

        // Exhausted: nothing left to complete for that handle.
        assert_eq!(reactor.step(100).unwrap(), Step::TimedOut);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn periodic_timer_delivers_one_callback_per_tick() {
        let mut reactor = CompletionReactor::new(4).unwrap();

        let fired = Rc::new(Cell::new(0u32));
        let sink = fired.clone();
        let handle = reactor
            .submit_timer_wait(
                TimerSchedule::periodic(Duration::from_millis(20), Duration::from_millis(20)),
                Clock::Monotonic,
                libc::TFD_CLOEXEC,
                0,
                Box::new(move || {
                    sink.set(sink.get() + 1);
                }),
            )
            .unwrap();

        // Let several ticks elapse before the first observation; they must
        // all be delivered by a single dispatch.
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(reactor.step(-1).unwrap(), Step::Dispatched);
        assert!(fired.get() >= 2, "only {} tick(s) delivered", fired.get());

        let before = fired.get();
        reactor.cancel_timer(handle).unwrap();
        assert_eq!(reactor.step(1000).unwrap(), Step::Dispatched);

        assert_eq!(fired.get(), before);
        assert_eq!(reactor.pending(), 0);
    }

    #[test]
    fn cancel_of_non_timer_task_is_rejected() {
        let file = assert_fs::NamedTempFile::new("data.txt").unwrap();
        file.touch().unwrap();

        let mut reactor = CompletionReactor::new(4).unwrap();
        let fd = fd::open_path(file.path(), libc::O_RDWR).unwrap();

        let handle = reactor
            .submit_write(
                fd.as_raw_fd(),
                b"x".to_vec().into_boxed_slice(),
                1,
                0,
                Box::new(|_, _| {}),
            )
            .unwrap();

        let err = reactor.cancel_timer(handle).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        assert_eq!(reactor.step(1000).unwrap(), Step::Dispatched);
    }

    #[test]
    fn backpressure_does_not_lose_queued_tasks() {
        init_logs();
        let file = assert_fs::NamedTempFile::new("data.txt").unwrap();
        file.touch().unwrap();

        // A one-entry ring gives a two-entry completion queue, so a burst
        // of submissions without stepping can hit completion-queue
        // backlog. Whatever the kernel refuses stays queued under a live
        // task; nothing may complete against a freed buffer or an unknown
        // key.
        let mut reactor = CompletionReactor::new(1).unwrap();
        let fd = fd::open_path(file.path(), libc::O_RDWR).unwrap();

        let fired = Rc::new(Cell::new(0u32));
        for offset in 0..8u64 {
            let sink = fired.clone();
            let _ = reactor.submit_write(
                fd.as_raw_fd(),
                b"x".to_vec().into_boxed_slice(),
                1,
                offset,
                Box::new(move |_, count| {
                    assert_eq!(count, 1);
                    sink.set(sink.get() + 1);
                }),
            );
        }

        let surviving = reactor.pending() as u32;
        assert!(surviving > 0);
        while reactor.pending() > 0 {
            assert_eq!(reactor.step(1000).unwrap(), Step::Dispatched);
        }

        assert_eq!(fired.get(), surviving);
        fd::close(fd).unwrap();
    }

    #[test]
    fn oversized_write_length_is_rejected() {
        let mut reactor = CompletionReactor::new(4).unwrap();

        let err = reactor
            .submit_write(0, b"ab".to_vec().into_boxed_slice(), 3, 0, Box::new(|_, _| {}))
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(reactor.pending(), 0);
    }
}
