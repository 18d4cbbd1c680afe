//! Basic TCP socket plumbing, made a bit less boring.
//!
//! Grounded on `net.rs`/`anet.rs`: direct libc calls rather than `TcpListener`,
//! because the event loop needs raw, non-blocking fds it owns the lifecycle
//! of and registers directly with epoll/kqueue (a `std::net` socket works
//! for this too, but the teacher's whole codebase talks to sockets through
//! libc directly, and that idiom is kept here).

use std::mem::{size_of, zeroed};
use std::net::Ipv4Addr;

use libc::{
    accept, bind, c_void, close, fcntl, listen, read, setsockopt, sockaddr, sockaddr_in, socket,
    write, AF_INET, EINTR, F_GETFL, F_SETFL, INADDR_ANY, IPPROTO_TCP, O_NONBLOCK, SOCK_STREAM,
    SOL_SOCKET, SO_KEEPALIVE, SO_REUSEADDR, TCP_NODELAY,
};

use crate::util::last_os_error_message;

pub type Fd = i32;

/// Bind and listen on `port`, returning the listening fd. `bindaddr` empty
/// means `INADDR_ANY`.
pub fn tcp_server(port: u16, bindaddr: &str, backlog: i32) -> Result<Fd, String> {
    unsafe {
        let sock = socket(AF_INET, SOCK_STREAM, 0);
        if sock == -1 {
            return Err(format!("socket: {}", last_os_error_message()));
        }

        let on: i32 = 1;
        if setsockopt(sock, SOL_SOCKET, SO_REUSEADDR, &on as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            close(sock);
            return Err(format!("setsockopt SO_REUSEADDR: {}", last_os_error_message()));
        }

        let mut sa: sockaddr_in = zeroed();
        #[cfg(target_os = "linux")]
        {
            sa.sin_family = AF_INET as u16;
        }
        #[cfg(target_os = "macos")]
        {
            sa.sin_family = AF_INET as u8;
        }
        sa.sin_port = port.to_be();
        sa.sin_addr.s_addr = u32::from(Ipv4Addr::UNSPECIFIED).to_be();
        let _ = INADDR_ANY; // documents the default; real value comes from Ipv4Addr above

        if !bindaddr.is_empty() {
            let addr: Ipv4Addr = bindaddr
                .parse()
                .map_err(|e| format!("invalid bind address '{bindaddr}': {e}"))?;
            sa.sin_addr.s_addr = u32::from(addr).to_be();
        }

        if bind(sock, &sa as *const _ as *const sockaddr, size_of::<sockaddr_in>() as u32) == -1 {
            let err = last_os_error_message();
            close(sock);
            return Err(format!("bind: {err}"));
        }

        if listen(sock, backlog) == -1 {
            let err = last_os_error_message();
            close(sock);
            return Err(format!("listen: {err}"));
        }

        Ok(sock)
    }
}

/// Accept one pending connection, retrying on `EINTR`.
pub fn tcp_accept(server_sock: Fd) -> Result<(Fd, u32, u16), String> {
    loop {
        unsafe {
            let mut sa: sockaddr_in = zeroed();
            let mut len = size_of::<sockaddr_in>() as u32;
            let fd = accept(server_sock, &mut sa as *mut _ as *mut sockaddr, &mut len);
            if fd == -1 {
                if crate::util::errno() == EINTR {
                    continue;
                }
                return Err(format!("accept: {}", last_os_error_message()));
            }
            let ip = u32::from_be(sa.sin_addr.s_addr);
            let port = u16::from_be(sa.sin_port);
            return Ok((fd, ip, port));
        }
    }
}

pub fn set_nonblocking(fd: Fd) -> Result<(), String> {
    unsafe {
        let flags = fcntl(fd, F_GETFL);
        if flags == -1 {
            return Err(format!("fcntl(F_GETFL): {}", last_os_error_message()));
        }
        if fcntl(fd, F_SETFL, flags | O_NONBLOCK) == -1 {
            return Err(format!("fcntl(F_SETFL, O_NONBLOCK): {}", last_os_error_message()));
        }
    }
    Ok(())
}

pub fn set_tcp_nodelay(fd: Fd) -> Result<(), String> {
    unsafe {
        let yes: i32 = 1;
        if setsockopt(fd, IPPROTO_TCP, TCP_NODELAY, &yes as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            return Err(format!("setsockopt TCP_NODELAY: {}", last_os_error_message()));
        }
    }
    Ok(())
}

pub fn set_tcp_keepalive(fd: Fd, _interval_secs: i32) -> Result<(), String> {
    unsafe {
        let yes: i32 = 1;
        if setsockopt(fd, SOL_SOCKET, SO_KEEPALIVE, &yes as *const _ as *const c_void, size_of::<i32>() as u32) == -1 {
            return Err(format!("setsockopt SO_KEEPALIVE: {}", last_os_error_message()));
        }
    }
    Ok(())
}

/// Raw non-blocking read. `Ok(0)` is EOF, `Err` with `would_block() == true`
/// means "no data right now, try again later".
pub fn raw_read(fd: Fd, buf: &mut [u8]) -> Result<usize, IoFailure> {
    unsafe {
        let n = read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if n < 0 {
            return Err(IoFailure::from_errno());
        }
        Ok(n as usize)
    }
}

pub fn raw_write(fd: Fd, buf: &[u8]) -> Result<usize, IoFailure> {
    unsafe {
        let n = write(fd, buf.as_ptr() as *const c_void, buf.len());
        if n < 0 {
            return Err(IoFailure::from_errno());
        }
        Ok(n as usize)
    }
}

pub fn close_fd(fd: Fd) {
    unsafe {
        close(fd);
    }
}

/// The outcome of a failed raw read/write syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFailure {
    /// `EAGAIN`/`EWOULDBLOCK`: treat as zero bytes transferred, try later.
    WouldBlock,
    /// Any other errno: the connection is no longer usable.
    Broken,
}

impl IoFailure {
    fn from_errno() -> Self {
        let errno = crate::util::errno();
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            IoFailure::WouldBlock
        } else {
            IoFailure::Broken
        }
    }
}
