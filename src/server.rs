//! Server context and the main loop (spec component I).
//!
//! Grounded on `initServer`/`acceptTcpHandler`/`readQueryFromClient`/
//! `ProcessEvents`/`freeClientsInAsyncFreeQueue` in
//! `original_source/server.c`, and on `handler.rs`'s
//! `accept_handler`/`send_reply_to_client` for the Rust-side handler shape.
//! Per spec Design Notes section 9, there is no global singleton here: the
//! event loop calls back into this `Server` with an explicit `&mut self`.

use std::collections::HashMap;

use crate::adlist::{Handle, List};
use crate::client::{Client, ParseState};
use crate::command::{self, arity_ok};
use crate::config::Config;
use crate::connection::{Connection, IoResult, TcpConnection};
use crate::error::{Disposition, ProtocolError};
use crate::event_loop::{EventLoop, FiredEvent, Mask};
use crate::net::{self, Fd};
use crate::reply::{self, FlushOutcome};
use crate::resp::{self, ParseOutcome};
use crate::util::{self, LogLevel};

/// One read syscall asks for at most this many bytes, except when a big
/// argument is in flight and less is known to be needed (see
/// `read_size_hint`). Mirrors `PROTO_IOBUF_LEN`.
const PROTO_IOBUF_LEN: usize = 16 * 1024;

pub struct Server {
    listen_fd: Fd,
    clients: List<Client>,
    fd_to_handle: HashMap<Fd, Handle>,
    pending_writes: Vec<Handle>,
    to_close: Vec<Handle>,
    next_client_id: u64,
    config: Config,
    event_loop: EventLoop,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, String> {
        let listen_fd = net::tcp_server(config.port, &config.bind, config.tcp_backlog)?;
        net::set_nonblocking(listen_fd)?;
        let mut event_loop = EventLoop::new()?;
        event_loop.create_file_event(listen_fd, Mask::READABLE)?;

        util::log(
            LogLevel::Notice,
            &format!("Ready to accept connections on port {}", config.port),
        );

        Ok(Server {
            listen_fd,
            clients: List::new(),
            fd_to_handle: HashMap::new(),
            pending_writes: Vec::new(),
            to_close: Vec::new(),
            next_client_id: 1,
            config,
            event_loop,
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Drive one iteration of the loop ordering spec section 4.E requires:
    /// flush pending writes, reap the async-free queue, poll, dispatch.
    pub fn tick(&mut self) -> Result<(), String> {
        self.flush_pending_writes();
        self.reap_closed_clients();

        let fired = self.event_loop.poll(Some(1_000_000))?;
        for event in fired {
            self.dispatch(event);
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), String> {
        loop {
            self.tick()?;
        }
    }

    fn dispatch(&mut self, event: FiredEvent) {
        if event.fd == self.listen_fd {
            if event.mask.contains(Mask::READABLE) {
                self.accept_handler();
            }
            return;
        }

        let Some(&handle) = self.fd_to_handle.get(&event.fd) else {
            return;
        };

        if event.mask.contains(Mask::READABLE) {
            self.read_handler(handle);
        }
        if event.mask.contains(Mask::WRITABLE) && self.clients.get(handle).is_some() {
            self.write_handler(handle);
        }
    }

    fn accept_handler(&mut self) {
        loop {
            let (fd, _ip, _port) = match net::tcp_accept(self.listen_fd) {
                Ok(t) => t,
                Err(_) => return, // no more pending connections right now
            };

            if at_client_capacity(self.clients.len(), self.config.maxclients) {
                util::log(LogLevel::Warning, "max number of clients reached");
                // Best-effort synchronous write: the socket may not even be
                // non-blocking yet, but a rejection line is worth trying
                // before the fd is discarded without ever being registered.
                send_overload_rejection(fd);
                net::close_fd(fd);
                continue;
            }

            if let Err(e) = net::set_nonblocking(fd) {
                util::log(LogLevel::Warning, &format!("accept: {e}"));
                net::close_fd(fd);
                continue;
            }
            let mut conn = TcpConnection::new(fd);
            let _ = conn.set_nodelay();
            let _ = conn.set_keepalive(self.config.tcp_keepalive);

            let id = self.next_client_id;
            self.next_client_id += 1;
            let client = Client::new(id, Box::new(conn));
            let handle = self.clients.push_back(client);
            self.clients.get_mut(handle).unwrap().node = Some(handle);
            self.fd_to_handle.insert(fd, handle);

            if let Err(e) = self.event_loop.create_file_event(fd, Mask::READABLE) {
                util::log(LogLevel::Warning, &format!("failed to register client fd: {e}"));
                self.queue_close(handle);
            }
        }
    }

    fn read_handler(&mut self, handle: Handle) {
        let Some(client) = self.clients.get_mut(handle) else { return };

        let readlen = read_size_hint(client);
        let start = client.querybuf.len();
        let n = {
            let spare = client.querybuf.spare_capacity_mut(readlen);
            match client.conn.read(spare) {
                Ok(IoResult::Done(0)) => {
                    client.querybuf.truncate(start);
                    self.queue_close(handle);
                    return;
                }
                Ok(IoResult::Done(n)) => n,
                Ok(IoResult::WouldBlock) => {
                    client.querybuf.truncate(start);
                    return;
                }
                Err(e) => {
                    util::log(LogLevel::Verbose, &format!("reading from client: {e}"));
                    client.querybuf.truncate(start);
                    self.queue_close(handle);
                    return;
                }
            }
        };
        client.querybuf.truncate(start + n);

        if client.querybuf.len() > self.config.client_max_querybuf_len {
            reply::add_reply_error(client, "Protocol error: too big inline request");
            self.queue_close(handle);
            return;
        }

        self.drain_query_buffer(handle);
    }

    /// Parse and dispatch as many fully-buffered commands as are ready,
    /// stopping at the first `NeedMoreData` or a protocol error.
    fn drain_query_buffer(&mut self, handle: Handle) {
        loop {
            let Some(client) = self.clients.get_mut(handle) else { return };
            if client.querybuf.len() <= client.qb_pos {
                return;
            }

            match resp::process_multibulk_buffer(client) {
                ParseOutcome::NeedMoreData => return,
                ParseOutcome::Error(err) => {
                    self.handle_protocol_error(handle, err);
                    return;
                }
                ParseOutcome::CommandReady => {
                    self.dispatch_command(handle);
                    let Some(client) = self.clients.get_mut(handle) else { return };
                    client.reset_for_next_command();
                    if client.should_close {
                        return;
                    }
                }
            }
        }
    }

    fn handle_protocol_error(&mut self, handle: Handle, err: ProtocolError) {
        if let Some(client) = self.clients.get_mut(handle) {
            reply::add_reply_error(client, &err.to_string());
            match protocol_error_disposition(&err) {
                Disposition::CloseConnection => self.queue_close(handle),
                Disposition::Continue => {}
            }
        }
        self.install_write_handler_if_needed(handle);
    }

    fn dispatch_command(&mut self, handle: Handle) {
        let Some(client) = self.clients.get_mut(handle) else { return };
        if client.argv.is_empty() {
            return;
        }

        let name = String::from_utf8_lossy(&client.argv[0]).to_string();
        match command::lookup_command(&name) {
            None => {
                let message = command::unknown_command_message(&client.argv);
                reply::add_reply_error(client, &message);
            }
            Some(cmd) => {
                if !arity_ok(cmd, client.argv.len()) {
                    reply::add_reply_error(
                        client,
                        &format!("wrong number of arguments for '{}' command", cmd.name),
                    );
                } else {
                    client.cmd = Some(cmd);
                    client.lastcmd = Some(cmd);
                    let argv = std::mem::take(&mut client.argv);
                    (cmd.handler)(client, &argv);
                    client.argv = argv;
                }
            }
        }

        self.install_write_handler_if_needed(handle);
    }

    fn install_write_handler_if_needed(&mut self, handle: Handle) {
        let Some(client) = self.clients.get(handle) else { return };
        if !client.has_pending_write {
            return;
        }
        if !self.pending_writes.contains(&handle) {
            self.pending_writes.push(handle);
        }
    }

    fn write_handler(&mut self, handle: Handle) {
        self.flush_one(handle);
    }

    fn flush_pending_writes(&mut self) {
        let pending = std::mem::take(&mut self.pending_writes);
        for handle in pending {
            self.flush_one(handle);
        }
    }

    fn flush_one(&mut self, handle: Handle) {
        let Some(client) = self.clients.get_mut(handle) else { return };
        let fd = client.conn.raw_fd();
        let was_installed = fd.map(|_| true).unwrap_or(false);

        match reply::write_to_client(client, was_installed) {
            FlushOutcome::Drained => {
                if let Some(fd) = fd {
                    self.event_loop.delete_file_event(fd, Mask::WRITABLE);
                }
                if client.should_close {
                    self.queue_close(handle);
                }
            }
            FlushOutcome::StillPending => {
                if let Some(fd) = fd {
                    let _ = self.event_loop.create_file_event(fd, Mask::WRITABLE);
                }
                if !self.pending_writes.contains(&handle) {
                    self.pending_writes.push(handle);
                }
            }
            FlushOutcome::Broken(e) => {
                util::log(LogLevel::Verbose, &format!("writing to client: {e}"));
                self.queue_close(handle);
            }
        }
    }

    fn queue_close(&mut self, handle: Handle) {
        if let Some(client) = self.clients.get_mut(handle) {
            client.mark_for_close();
        }
        if !self.to_close.contains(&handle) {
            self.to_close.push(handle);
        }
    }

    /// Drain clients queued for destruction. Deferred to the top of the
    /// loop so a client never gets freed while its fd is still being
    /// dispatched for the current batch of fired events (spec section
    /// 4.I, "async client destruction").
    fn reap_closed_clients(&mut self) {
        let to_close = std::mem::take(&mut self.to_close);
        for handle in to_close {
            self.free_client(handle);
        }
    }

    fn free_client(&mut self, handle: Handle) {
        let Some(mut client) = self.clients.remove(handle) else { return };
        if let Some(fd) = client.conn.raw_fd() {
            self.event_loop.delete_file_event(fd, Mask::READABLE | Mask::WRITABLE);
            self.fd_to_handle.remove(&fd);
        }
        self.pending_writes.retain(|&h| h != handle);
        client.conn.close();
    }
}

/// Mirrors the read-size shrinking in `readQueryFromClient`: once we know
/// we're in the middle of a big argument, ask for only as much as is left
/// to read, so the buffer is more likely to contain *exactly* that
/// argument plus its trailing CRLF — the precondition for the zero-copy
/// steal path in the parser.
fn read_size_hint(client: &Client) -> usize {
    let mut readlen = PROTO_IOBUF_LEN;
    if client.parse_state == ParseState::AwaitingBulkHeader
        && client.multibulklen > 0
        && client.bulklen != -1
        && client.bulklen >= resp::PROTO_MBULK_BIG_ARG
    {
        let remaining = (client.bulklen as usize + 2).saturating_sub(client.querybuf.len());
        if remaining > 0 && remaining < readlen {
            readlen = remaining;
        }
    }
    readlen
}

fn protocol_error_disposition(_err: &ProtocolError) -> Disposition {
    // Every protocol error this core raises leaves the connection's framing
    // unrecoverable (we don't know where the next command starts), so all
    // of them close the connection after the error reply is queued.
    Disposition::CloseConnection
}

/// Spec section 8 scenario 6: once the registry is full, the next accepted
/// socket is rejected rather than given a client slot.
fn at_client_capacity(current: usize, maxclients: usize) -> bool {
    current >= maxclients
}

/// The literal bytes `original_source/src/server.c:543` writes when refusing
/// a connection for being over `maxclients`.
const MAX_CLIENTS_REJECTION: &[u8] = b"-ERR max number of clients reached.\r\n";

fn send_overload_rejection(fd: Fd) {
    let _ = net::raw_write(fd, MAX_CLIENTS_REJECTION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;

    /// A `Server` with no real listening socket, for tests that only
    /// exercise dispatch/flush/reap logic. `listen_fd` is a sentinel that
    /// never matches a real fired event. The event loop is real (mirrors
    /// the precedent in `event_loop.rs`'s own tests, which construct a
    /// real backend without a real listening socket).
    fn test_server(maxclients: usize) -> Server {
        Server {
            listen_fd: -1,
            clients: List::new(),
            fd_to_handle: HashMap::new(),
            pending_writes: Vec::new(),
            to_close: Vec::new(),
            next_client_id: 1,
            config: Config { maxclients, ..Config::default() },
            event_loop: EventLoop::new().expect("event loop backend available in test environment"),
        }
    }

    fn push_mock_client(server: &mut Server) -> Handle {
        let id = server.next_client_id;
        server.next_client_id += 1;
        let client = Client::new(id, Box::new(MockConnection::new()));
        let handle = server.clients.push_back(client);
        server.clients.get_mut(handle).unwrap().node = Some(handle);
        handle
    }

    fn outbound(server: &mut Server, handle: Handle) -> Vec<u8> {
        server.clients.get_mut(handle).unwrap().conn.as_any()
            .downcast_mut::<MockConnection>()
            .unwrap()
            .outbound
            .clone()
    }

    #[test]
    fn at_client_capacity_threshold() {
        assert!(!at_client_capacity(0, 1));
        assert!(at_client_capacity(1, 1));
        assert!(at_client_capacity(5, 1));
    }

    #[test]
    fn send_overload_rejection_writes_exact_literal_bytes() {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        let (read_fd, write_fd) = (fds[0], fds[1]);

        send_overload_rejection(write_fd);

        let mut buf = [0u8; 64];
        let n = net::raw_read(read_fd, &mut buf).expect("read from pipe");
        assert_eq!(&buf[..n], MAX_CLIENTS_REJECTION);

        net::close_fd(write_fd);
        net::close_fd(read_fd);
    }

    #[test]
    fn dispatch_unknown_command_echoes_arguments_and_keeps_connection_open() {
        let mut server = test_server(10);
        let handle = push_mock_client(&mut server);
        server.clients.get_mut(handle).unwrap().argv =
            vec![b"bogus".to_vec(), b"foo".to_vec(), b"bar".to_vec()];

        server.dispatch_command(handle);

        let client = server.clients.get(handle).unwrap();
        assert!(!client.should_close);
        let reply = String::from_utf8_lossy(&client.buf[..client.bufpos]).into_owned();
        assert_eq!(
            reply,
            "-ERR unknown command `bogus`, with args beginning with: `foo`, `bar`, \r\n"
        );
    }

    #[test]
    fn dispatch_arity_mismatch_replies_and_keeps_connection_open() {
        let mut server = test_server(10);
        let handle = push_mock_client(&mut server);
        server.clients.get_mut(handle).unwrap().argv = vec![b"test".to_vec(), b"extra".to_vec()];

        server.dispatch_command(handle);

        let client = server.clients.get(handle).unwrap();
        assert!(!client.should_close);
        let reply = String::from_utf8_lossy(&client.buf[..client.bufpos]).into_owned();
        assert_eq!(reply, "-ERR wrong number of arguments for 'test' command\r\n");
    }

    #[test]
    fn dispatch_known_command_runs_handler_and_queues_write() {
        let mut server = test_server(10);
        let handle = push_mock_client(&mut server);
        server.clients.get_mut(handle).unwrap().argv = vec![b"test".to_vec()];

        server.dispatch_command(handle);

        let client = server.clients.get(handle).unwrap();
        assert_eq!(&client.buf[..client.bufpos], b"+OK\r\n");
        assert!(server.pending_writes.contains(&handle));
    }

    #[test]
    fn flush_pending_writes_runs_before_reap_closed_clients() {
        let mut server = test_server(10);
        let handle = push_mock_client(&mut server);
        server.clients.get_mut(handle).unwrap().argv = vec![b"test".to_vec()];
        server.dispatch_command(handle);
        server.queue_close(handle);

        assert!(server.pending_writes.contains(&handle));
        assert!(server.to_close.contains(&handle));

        // Step 1 of tick's ordering: the queued reply must reach the
        // connection while the client is still in the registry.
        server.flush_pending_writes();
        assert_eq!(outbound(&mut server, handle), b"+OK\r\n".to_vec());
        assert!(server.clients.get(handle).is_some());

        // Step 2: only now is the client actually freed.
        server.reap_closed_clients();
        assert!(server.clients.get(handle).is_none());
    }
}
