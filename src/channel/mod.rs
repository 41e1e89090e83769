pub mod endpoint;

use crate::error::{ErrorCode, Result};
use nix::poll::{poll, PollFd, PollFlags};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// A connected byte-stream endpoint. Every transport the stub speaks (TCP,
/// UNIX socket, character device, inherited descriptor) reduces to a file
/// descriptor, so one concrete channel type serves them all.
///
/// The descriptor lives in an atomic so that the queue-channel reader worker
/// and the session thread can share the channel without a lock; `close` is
/// idempotent and wakes neither side spuriously.
pub struct Channel {
    fd: AtomicI32,
}

impl Channel {
    pub fn from_fd(fd: RawFd) -> Channel {
        Channel {
            fd: AtomicI32::new(fd),
        }
    }

    /// Adopt a descriptor inherited from a parent process (`--fd N`).
    /// The descriptor is switched to non-blocking on acquisition.
    pub fn from_inherited_fd(fd: RawFd) -> Result<Channel> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(ErrorCode::last_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(ErrorCode::last_error());
        }
        Ok(Channel::from_fd(fd))
    }

    pub fn connected(&self) -> bool {
        self.fd.load(Ordering::SeqCst) >= 0
    }

    fn raw(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    /// Block until readable, for at most `ms` milliseconds (negative waits
    /// forever). Returns false on timeout or when the channel is closed.
    pub fn wait(&self, ms: i32) -> bool {
        let fd = self.raw();
        if fd < 0 {
            return false;
        }
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, ms) {
            Ok(1) => fds[0]
                .revents()
                .map_or(false, |r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)),
            _ => false,
        }
    }

    /// Read whatever is available. Ok(0) means end of stream; the channel
    /// closes itself in that case.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let fd = self.raw();
            if fd < 0 {
                return Err(ErrorCode::InvalidHandle);
            }
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                self.close();
                return Ok(0);
            }
            match nix::errno::errno() {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    if !self.wait(-1) {
                        return Ok(0);
                    }
                }
                _ => {
                    self.close();
                    return Err(ErrorCode::last_error());
                }
            }
        }
    }

    /// Write the whole buffer, waiting out short writes and EAGAIN.
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let fd = self.raw();
            if fd < 0 {
                return Err(ErrorCode::InvalidHandle);
            }
            let n = unsafe {
                libc::write(
                    fd,
                    buf[written..].as_ptr() as *const libc::c_void,
                    buf.len() - written,
                )
            };
            if n > 0 {
                written += n as usize;
                continue;
            }
            match nix::errno::errno() {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                    let _ = poll(&mut fds, -1);
                }
                _ => {
                    self.close();
                    return Err(ErrorCode::last_error());
                }
            }
        }
        Ok(())
    }

    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            // Wake any thread blocked in poll/read on this descriptor.
            // Harmless ENOTSOCK on character devices.
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
                libc::close(fd);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (Channel, Channel) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (Channel::from_fd(fds[0]), Channel::from_fd(fds[1]))
    }

    #[test]
    fn round_trip_over_socketpair() {
        let (a, b) = socketpair();
        a.send(b"$OK#9a").unwrap();
        let mut buf = [0u8; 64];
        assert!(b.wait(1000));
        let n = b.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"$OK#9a");
    }

    #[test]
    fn eof_closes_channel() {
        let (a, b) = socketpair();
        a.close();
        let mut buf = [0u8; 8];
        assert_eq!(b.receive(&mut buf).unwrap(), 0);
        assert!(!b.connected());
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = socketpair();
        a.close();
        a.close();
        assert!(!a.connected());
    }
}
