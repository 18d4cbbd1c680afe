//! Connection abstraction (spec Design Notes section 9).
//!
//! A capability set rather than a raw fd: read-some, write-some, close, and
//! the handful of socket options the server cares about. Production code
//! talks to `TcpConnection`; parser and client-lifecycle tests drive
//! `MockConnection`, an in-memory stand-in, without opening a real socket.

use crate::net::{self, Fd, IoFailure};

/// Outcome of a non-blocking read/write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum IoResult {
    /// `n` bytes transferred (0 on read means EOF).
    Done(usize),
    /// Would block; no bytes transferred, try again once readable/writable.
    WouldBlock,
}

pub trait Connection {
    fn read(&mut self, buf: &mut [u8]) -> Result<IoResult, String>;
    fn write(&mut self, buf: &[u8]) -> Result<IoResult, String>;
    fn close(&mut self);
    fn set_nonblocking(&mut self) -> Result<(), String>;
    fn set_nodelay(&mut self) -> Result<(), String>;
    fn set_keepalive(&mut self, interval_secs: i32) -> Result<(), String>;
    /// The raw fd to register with the event loop, if this connection is
    /// backed by one (the mock isn't).
    fn raw_fd(&self) -> Option<Fd>;

    /// Escape hatch for tests that need to poke at a `MockConnection`
    /// through the trait object (flip `blocked_writes`, inspect `outbound`).
    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

/// A real, already-accepted TCP client socket.
pub struct TcpConnection {
    fd: Fd,
    closed: bool,
}

impl TcpConnection {
    pub fn new(fd: Fd) -> Self {
        TcpConnection { fd, closed: false }
    }
}

impl Connection for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<IoResult, String> {
        match net::raw_read(self.fd, buf) {
            Ok(n) => Ok(IoResult::Done(n)),
            Err(IoFailure::WouldBlock) => Ok(IoResult::WouldBlock),
            Err(IoFailure::Broken) => Err(crate::util::last_os_error_message()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoResult, String> {
        match net::raw_write(self.fd, buf) {
            Ok(n) => Ok(IoResult::Done(n)),
            Err(IoFailure::WouldBlock) => Ok(IoResult::WouldBlock),
            Err(IoFailure::Broken) => Err(crate::util::last_os_error_message()),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            net::close_fd(self.fd);
            self.closed = true;
        }
    }

    fn set_nonblocking(&mut self) -> Result<(), String> {
        net::set_nonblocking(self.fd)
    }

    fn set_nodelay(&mut self) -> Result<(), String> {
        net::set_tcp_nodelay(self.fd)
    }

    fn set_keepalive(&mut self, interval_secs: i32) -> Result<(), String> {
        net::set_tcp_keepalive(self.fd, interval_secs)
    }

    fn raw_fd(&self) -> Option<Fd> {
        if self.closed {
            None
        } else {
            Some(self.fd)
        }
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory connection for tests: an inbound byte queue the test feeds,
/// and an outbound byte sink the test inspects. No fd, so it never
/// registers with the event loop.
#[derive(Default)]
pub struct MockConnection {
    pub inbound: std::collections::VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub blocked_reads: bool,
    pub blocked_writes: bool,
    pub closed: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        MockConnection::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Connection for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<IoResult, String> {
        if self.blocked_reads || self.inbound.is_empty() {
            if self.blocked_reads {
                return Ok(IoResult::WouldBlock);
            }
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(IoResult::Done(n))
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoResult, String> {
        if self.blocked_writes {
            return Ok(IoResult::WouldBlock);
        }
        self.outbound.extend_from_slice(buf);
        Ok(IoResult::Done(buf.len()))
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn set_nonblocking(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn set_nodelay(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn set_keepalive(&mut self, _interval_secs: i32) -> Result<(), String> {
        Ok(())
    }

    fn raw_fd(&self) -> Option<Fd> {
        None
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_read_drains_fed_bytes() {
        let mut conn = MockConnection::new();
        conn.feed(b"hello");
        let mut buf = [0u8; 8];
        let r = conn.read(&mut buf).unwrap();
        assert_eq!(r, IoResult::Done(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn mock_write_would_block_when_flagged() {
        let mut conn = MockConnection::new();
        conn.blocked_writes = true;
        let r = conn.write(b"abc").unwrap();
        assert_eq!(r, IoResult::WouldBlock);
        assert!(conn.outbound.is_empty());
    }

    #[test]
    fn mock_read_empty_is_zero_not_would_block() {
        let mut conn = MockConnection::new();
        let mut buf = [0u8; 4];
        let r = conn.read(&mut buf).unwrap();
        assert_eq!(r, IoResult::Done(0));
    }
}
