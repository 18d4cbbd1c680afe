//! Reply buffering and flush (spec section 4.H, component H).
//!
//! Grounded on `_addReplyToBuffer`/`_addReplyProtoToList`/`addReplyProto`/
//! `writeToClient`/`handleClientsWithPendingWrites` in
//! `original_source/server.c`: replies land in the client's small inline
//! slab first; once that's full, they spill into a chain of fixed-size
//! blocks. Flushing drains both, in order, bounded by a per-event byte
//! budget so one client with a huge reply can't starve the others.

use crate::client::{Client, ReplyBlock, REPLY_INLINE_SIZE};
use crate::connection::IoResult;

/// Size of each block allocated once the inline slab overflows.
pub const PROTO_REPLY_CHUNK_BYTES: usize = 16 * 1024;

/// Upper bound on bytes written to a single client within one flush call,
/// so a client with a backlog doesn't monopolize the event loop.
pub const NET_MAX_WRITES_PER_EVENT: usize = 64 * 1024;

/// Append raw protocol bytes to a client's outbound reply, spilling into
/// the chain once the inline slab is full. Mirrors `_addReplyToBuffer` +
/// `_addReplyProtoToList`.
pub fn add_reply_proto(client: &mut Client, bytes: &[u8]) {
    let mut remaining = bytes;

    if client.reply.is_empty() {
        let space = REPLY_INLINE_SIZE - client.bufpos;
        let take = space.min(remaining.len());
        if take > 0 {
            client.buf[client.bufpos..client.bufpos + take].copy_from_slice(&remaining[..take]);
            client.bufpos += take;
            remaining = &remaining[take..];
        }
    }

    if remaining.is_empty() {
        client.has_pending_write = client.bufpos > 0 || !client.reply.is_empty();
        return;
    }

    let mut offset = 0;
    while offset < remaining.len() {
        if client.reply.back().map(|b| b.free_space()).unwrap_or(0) == 0 {
            let cap = PROTO_REPLY_CHUNK_BYTES.max(remaining.len() - offset);
            client.reply.push_back(ReplyBlock::with_capacity(cap));
            client.reply_bytes += cap;
        }
        let block = client.reply.back_mut().unwrap();
        let take = block.free_space().min(remaining.len() - offset);
        block.data[block.used..block.used + take].copy_from_slice(&remaining[offset..offset + take]);
        block.used += take;
        offset += take;
    }

    client.has_pending_write = true;
}

pub fn add_reply_status(client: &mut Client, status: &str) {
    add_reply_proto(client, format!("+{status}\r\n").as_bytes());
}

pub fn add_reply_error(client: &mut Client, message: &str) {
    if message.starts_with('-') {
        add_reply_proto(client, format!("{message}\r\n").as_bytes());
    } else {
        add_reply_proto(client, format!("-ERR {message}\r\n").as_bytes());
    }
}

pub fn add_reply_integer(client: &mut Client, n: i64) {
    add_reply_proto(client, format!(":{n}\r\n").as_bytes());
}

pub fn add_reply_bulk_string(client: &mut Client, s: &[u8]) {
    add_reply_proto(client, format!("${}\r\n", s.len()).as_bytes());
    add_reply_proto(client, s);
    add_reply_proto(client, b"\r\n");
}

pub fn add_reply_array_of_bulk_strings(client: &mut Client, items: &[&str]) {
    add_reply_proto(client, format!("*{}\r\n", items.len()).as_bytes());
    for item in items {
        add_reply_bulk_string(client, item.as_bytes());
    }
}

/// What happened after attempting to drain a client's reply buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Everything queued was written; nothing pending for this client now.
    Drained,
    /// The socket would block, or the per-event byte budget ran out;
    /// caller should keep (or install) the writable handler.
    StillPending,
    /// The connection broke; caller must tear the client down.
    Broken(String),
}

/// Drain as much of the client's inline slab and reply chain as the
/// per-event write budget and the socket allow. Mirrors `writeToClient`.
pub fn write_to_client(client: &mut Client, handler_installed: bool) -> FlushOutcome {
    let mut written_this_call = 0usize;

    while client.bufpos > 0 || !client.reply.is_empty() {
        if written_this_call >= NET_MAX_WRITES_PER_EVENT {
            return FlushOutcome::StillPending;
        }

        if client.bufpos > 0 {
            let remaining = &client.buf[client.sentlen..client.bufpos];
            match client.conn.write(remaining) {
                Ok(IoResult::Done(0)) => return FlushOutcome::StillPending,
                Ok(IoResult::Done(n)) => {
                    client.sentlen += n;
                    written_this_call += n;
                    if client.sentlen == client.bufpos {
                        client.bufpos = 0;
                        client.sentlen = 0;
                    }
                }
                Ok(IoResult::WouldBlock) => return FlushOutcome::StillPending,
                Err(e) => return FlushOutcome::Broken(e),
            }
            continue;
        }

        let block = client.reply.front().unwrap();
        let remaining = &block.data[client.sentlen..block.used];
        if remaining.is_empty() {
            let block = client.reply.pop_front().unwrap();
            client.reply_bytes -= block.data.len();
            client.sentlen = 0;
            continue;
        }
        match client.conn.write(remaining) {
            Ok(IoResult::Done(0)) => return FlushOutcome::StillPending,
            Ok(IoResult::Done(n)) => {
                client.sentlen += n;
                written_this_call += n;
            }
            Ok(IoResult::WouldBlock) => return FlushOutcome::StillPending,
            Err(e) => return FlushOutcome::Broken(e),
        }
    }

    client.has_pending_write = false;
    let _ = handler_installed;
    FlushOutcome::Drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;

    fn client_with_mock() -> Client {
        Client::new(1, Box::new(MockConnection::new()))
    }

    #[test]
    fn small_reply_stays_in_inline_buffer() {
        let mut c = client_with_mock();
        add_reply_status(&mut c, "OK");
        assert_eq!(c.bufpos, 5); // "+OK\r\n"
        assert!(c.reply.is_empty());
    }

    #[test]
    fn oversized_reply_spills_into_chain() {
        let mut c = client_with_mock();
        let big = vec![b'x'; REPLY_INLINE_SIZE + 100];
        add_reply_bulk_string(&mut c, &big);
        assert_eq!(c.bufpos, REPLY_INLINE_SIZE);
        assert!(!c.reply.is_empty());
    }

    #[test]
    fn write_to_client_drains_inline_reply_fully() {
        let mut c = client_with_mock();
        add_reply_status(&mut c, "OK");
        let outcome = write_to_client(&mut c, false);
        assert_eq!(outcome, FlushOutcome::Drained);
        assert_eq!(c.bufpos, 0);
        assert!(!c.has_pending_write);
    }

    #[test]
    fn write_to_client_reports_still_pending_when_socket_blocks() {
        let mut c = client_with_mock();
        add_reply_status(&mut c, "OK");
        c.conn
            .as_any()
            .downcast_mut::<MockConnection>()
            .unwrap()
            .blocked_writes = true;
        let outcome = write_to_client(&mut c, false);
        assert_eq!(outcome, FlushOutcome::StillPending);
    }

    #[test]
    fn error_reply_gets_err_prefix_when_missing() {
        let mut c = client_with_mock();
        add_reply_error(&mut c, "bad input");
        assert_eq!(&c.buf[..c.bufpos], b"-ERR bad input\r\n");
    }

    #[test]
    fn error_reply_keeps_existing_dash_prefix() {
        let mut c = client_with_mock();
        add_reply_error(&mut c, "-WRONGTYPE bad input");
        assert_eq!(&c.buf[..c.bufpos], b"-WRONGTYPE bad input\r\n");
    }
}
