//! Thin epoll wrapper: the readiness reactor and self-pipe host capabilities.
//!
//! All reactor unsafe code is confined here. The epoll fd is shared: any
//! number of idle workers may block in [`Poller::wait`] concurrently while
//! registrations are adjusted from other threads, which epoll supports
//! natively.

use std::io;
use std::os::unix::io::RawFd;

/// Readiness reactor over an epoll instance.
///
/// Registrations carry a caller-chosen `u64` cookie that comes back verbatim
/// in the event batch.
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        // SAFETY: plain syscall; the fd is owned by the returned Poller.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: data };
        // SAFETY: epfd is a live epoll fd; event outlives the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers `fd` for `events`, delivering `data` as the cookie.
    pub fn add(&self, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, data)
    }

    /// Replaces the event mask of an already-registered `fd`.
    pub fn modify(&self, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, data)
    }

    /// Removes `fd` from the interest set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Blocks for up to `timeout_ms` collecting a batch of ready events.
    ///
    /// Interruption by a signal is retried transparently.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        loop {
            // SAFETY: the buffer is valid for `events.len()` entries.
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd is owned by this Poller and closed exactly once.
        unsafe { libc::close(self.epfd) };
    }
}

/// Creates a non-blocking pipe; `(read_end, write_end)`.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid out-buffer for two descriptors.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Writes a single wakeup byte; a full pipe is fine (the reader is already
/// due to wake).
pub fn write_wakeup(fd: RawFd) {
    let byte = [1u8];
    // SAFETY: fd is the owned write end of a pipe; short or failed writes are
    // tolerated.
    let rc = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!(fd, error = %err, "wakeup write failed");
        }
    }
}

/// Drains a non-blocking read end completely (edge-triggered discipline).
pub fn drain(fd: RawFd) {
    let mut buf = [0u8; 256];
    loop {
        // SAFETY: fd is a non-blocking read end; buf is a valid buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// Closes a raw descriptor, ignoring errors.
pub fn close(fd: RawFd) {
    // SAFETY: callers pass fds they own exactly once.
    unsafe { libc::close(fd) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_events(n: usize) -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; n]
    }

    #[test]
    fn test_pipe_readiness_round_trip() {
        let poller = Poller::new().unwrap();
        let (read_end, write_end) = pipe().unwrap();

        poller
            .add(read_end, (libc::EPOLLIN as u32) | (libc::EPOLLET as u32), 7)
            .unwrap();

        let mut events = empty_events(8);
        let n = poller.wait(&mut events, 0).unwrap();
        assert_eq!(n, 0, "nothing written yet");

        write_wakeup(write_end);
        let n = poller.wait(&mut events, 1_000).unwrap();
        assert_eq!(n, 1);
        let cookie = events[0].u64;
        assert_eq!(cookie, 7);

        drain(read_end);
        poller.delete(read_end).unwrap();
        close(read_end);
        close(write_end);
    }

    #[test]
    fn test_add_invalid_fd_fails_cleanly() {
        let poller = Poller::new().unwrap();
        let err = poller
            .add(-1, libc::EPOLLIN as u32, 0)
            .expect_err("registering fd -1 must fail");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_wait_times_out() {
        let poller = Poller::new().unwrap();
        let mut events = empty_events(4);
        let start = std::time::Instant::now();
        let n = poller.wait(&mut events, 30).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }
}
