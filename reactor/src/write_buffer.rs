use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Coalesces small formatted writes into one descriptor-level write.
///
/// Binds a descriptor, a poll timeout, and a fixed-capacity backing buffer.
/// `push` appends into the free region without touching the descriptor at
/// all; `flush` (or `check_flush` once the free region runs low) is what
/// actually issues `write(2)` calls, retrying across `EAGAIN` via a
/// single-descriptor `poll`. Mirrors `sbuffer_t`, down to discarding (rather
/// than partially writing) a `push` that would overflow the free region.
pub struct WriteBuffer {
    fd: RawFd,
    timeout_ms: i32,
    buf: Vec<u8>,
    flush_cursor: usize,
}

impl WriteBuffer {
    pub fn new(fd: RawFd, capacity: usize, timeout_ms: i32) -> Self {
        WriteBuffer {
            fd,
            timeout_ms,
            buf: Vec::with_capacity(capacity),
            flush_cursor: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    pub fn unwritten(&self) -> usize {
        self.buf.len() - self.flush_cursor
    }

    /// Formats `args` into the free region. Returns the number of bytes
    /// appended, or 0 if the formatted text would not fit (the buffer is
    /// left unchanged in that case).
    pub fn push(&mut self, args: fmt::Arguments<'_>) -> usize {
        let mut scratch = String::new();
        if fmt::write(&mut scratch, args).is_err() {
            return 0;
        }
        self.push_bytes(scratch.as_bytes())
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> usize {
        if data.len() > self.remaining() {
            return 0;
        }
        self.buf.extend_from_slice(data);
        data.len()
    }

    /// Writes everything between the flush cursor and the write cursor,
    /// blocking (via `poll`, bounded by the configured timeout) across
    /// `EAGAIN`. On success the buffer is reset to empty.
    pub fn flush(&mut self) -> io::Result<()> {
        let timeout = PollTimeout::try_from(self.timeout_ms).unwrap_or(PollTimeout::NONE);

        while self.unwritten() > 0 {
            let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
            match nix::unistd::write(fd, &self.buf[self.flush_cursor..]) {
                Ok(n) => self.flush_cursor += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
                    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
                    let ready = poll(&mut fds, timeout).map_err(io::Error::from)?;
                    if ready == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write buffer flush timed out",
                        ));
                    }
                }
                Err(e) => return Err(io::Error::from(e)),
            }
        }

        self.buf.clear();
        self.flush_cursor = 0;
        Ok(())
    }

    pub fn check_flush(&mut self, threshold: usize) -> io::Result<()> {
        if self.remaining() < threshold {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn push_discards_when_buffer_is_full() {
        let devnull = std::fs::File::create("/dev/null").unwrap();
        let mut buf = WriteBuffer::new(devnull.as_raw_fd(), 8, 100);
        assert_eq!(buf.push_bytes(b"1234567"), 7);
        assert_eq!(buf.push_bytes(b"ab"), 0);
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn flush_resets_cursors() {
        let devnull = std::fs::OpenOptions::new().write(true).open("/dev/null").unwrap();
        let mut buf = WriteBuffer::new(devnull.as_raw_fd(), 64, 100);
        buf.push_bytes(b"hello");
        buf.flush().unwrap();
        assert_eq!(buf.unwritten(), 0);
        assert_eq!(buf.remaining(), 64);
    }
}
