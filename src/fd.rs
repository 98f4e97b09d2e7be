//! Descriptor utilities: plain, synchronous syscall wrappers.
//!
//! Everything here is non-blocking bookkeeping around `open`, `close`,
//! `eventfd` and `timerfd`; the asynchronous waiting lives in the reactors.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::timer::{Clock, TimerSchedule};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Open `path` with the given `open(2)` flags.
pub fn open_path(path: &Path, flags: libc::c_int) -> io::Result<OwnedFd> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;

    let fd = cvt(unsafe { libc::open(cpath.as_ptr(), flags) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Close a descriptor, reporting the error instead of swallowing it as a
/// plain `drop` of the `OwnedFd` would.
pub fn close(fd: OwnedFd) -> io::Result<()> {
    let raw = fd.into_raw_fd();
    cvt(unsafe { libc::close(raw) }).map(drop)
}

/// Create an eventfd with a zero counter and the given `EFD_*` flags.
pub fn create_event_fd(flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, flags) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Add `value` to an eventfd's counter, waking any pending wait on it.
pub fn signal_event_fd(fd: RawFd, value: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };

    if ret != std::mem::size_of::<u64>() as isize {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Drain and return an eventfd's counter.
pub(crate) fn read_event_counter(fd: RawFd) -> io::Result<u64> {
    let mut value = 0u64;
    let ret = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };

    if ret != std::mem::size_of::<u64>() as isize {
        return Err(io::Error::last_os_error());
    }

    Ok(value)
}

pub(crate) fn create_timer_fd(clock: Clock, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::timerfd_create(clock.to_clockid(), flags) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arm a timerfd per `schedule`. A zero interval leaves the timer one-shot.
pub(crate) fn arm_timer_fd(
    fd: RawFd,
    schedule: &TimerSchedule,
    flags: libc::c_int,
) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_value: libc::timespec {
            tv_sec: schedule.initial.as_secs() as libc::time_t,
            tv_nsec: schedule.initial.subsec_nanos() as libc::c_long,
        },
        it_interval: libc::timespec {
            tv_sec: schedule.interval.as_secs() as libc::time_t,
            tv_nsec: schedule.interval.subsec_nanos() as libc::c_long,
        },
    };

    cvt(unsafe { libc::timerfd_settime(fd, flags, &spec, std::ptr::null_mut()) }).map(drop)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use assert_fs::prelude::*;

    use super::*;

    #[test]
    fn eventfd_counter_accumulates() {
        let efd = create_event_fd(libc::EFD_NONBLOCK).unwrap();

        signal_event_fd(efd.as_raw_fd(), 150).unwrap();
        signal_event_fd(efd.as_raw_fd(), 50).unwrap();

        assert_eq!(read_event_counter(efd.as_raw_fd()).unwrap(), 200);
        close(efd).unwrap();
    }

    #[test]
    fn open_missing_path_fails() {
        let err = open_path(Path::new("/nonexistent/evring-test"), libc::O_RDONLY).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn open_close_temp_file() -> anyhow::Result<()> {
        let file = assert_fs::NamedTempFile::new("fd.txt")?;
        file.touch()?;

        let fd = open_path(file.path(), libc::O_RDWR)?;
        close(fd)?;

        Ok(())
    }
}
