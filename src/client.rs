//! Per-connection client state (spec section 3, Data Model).
//!
//! Shaped after `redis/client.rs`'s `RedisClient`, but the fields here track
//! exactly what the parser and reply paths in `original_source/server.c`
//! need (`querybuf`/`qb_pos`/`multibulklen`/`bulklen`/`argv`), not the
//! legacy inline-protocol fields the teacher's version also carried.

use crate::adlist::Handle;
use crate::buf::DynBuf;
use crate::command::Command;
use crate::connection::Connection;

/// Inline reply slab size: small replies are copied straight in here and
/// never touch the heap-allocated chain (spec section 4.H).
pub const REPLY_INLINE_SIZE: usize = 16 * 1024;

/// One block in the overflow reply chain, once the inline slab fills up.
pub struct ReplyBlock {
    pub data: Vec<u8>,
    pub used: usize,
}

impl ReplyBlock {
    pub fn with_capacity(cap: usize) -> Self {
        ReplyBlock { data: vec![0u8; cap], used: 0 }
    }

    pub fn free_space(&self) -> usize {
        self.data.len() - self.used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for the leading `*<count>\r\n` (or rejecting an inline `\r\n`
    /// terminated line, which this core does not support).
    AwaitingMultibulkHeader,
    /// Inside the per-argument loop: waiting for `$<len>\r\n` then
    /// `<len bytes>\r\n`.
    AwaitingBulkHeader,
    AwaitingBulkBody,
}

pub struct Client {
    pub id: u64,
    pub conn: Box<dyn Connection>,
    pub node: Option<Handle>,

    // --- parser state (spec section 4.G) ---
    pub querybuf: DynBuf,
    pub qb_pos: usize,
    pub parse_state: ParseState,
    pub multibulklen: i64,
    pub bulklen: i64,
    pub argv: Vec<Vec<u8>>,
    pub argv_len_sum: usize,

    // --- dispatch ---
    pub cmd: Option<&'static Command>,
    pub lastcmd: Option<&'static Command>,

    // --- reply buffering (spec section 4.H) ---
    pub buf: Vec<u8>,
    pub bufpos: usize,
    pub reply: std::collections::VecDeque<ReplyBlock>,
    pub reply_bytes: usize,
    pub sentlen: usize,

    pub should_close: bool,
    pub has_pending_write: bool,
}

impl Client {
    pub fn new(id: u64, conn: Box<dyn Connection>) -> Self {
        Client {
            id,
            conn,
            node: None,
            querybuf: DynBuf::new(),
            qb_pos: 0,
            parse_state: ParseState::AwaitingMultibulkHeader,
            multibulklen: 0,
            bulklen: -1,
            argv: Vec::new(),
            argv_len_sum: 0,
            cmd: None,
            lastcmd: None,
            buf: vec![0u8; REPLY_INLINE_SIZE],
            bufpos: 0,
            reply: std::collections::VecDeque::new(),
            reply_bytes: 0,
            sentlen: 0,
            should_close: false,
            has_pending_write: false,
        }
    }

    /// Reset per-command parser state after a command has been fully
    /// parsed and dispatched, ready for the next one.
    pub fn reset_for_next_command(&mut self) {
        self.argv.clear();
        self.argv_len_sum = 0;
        self.multibulklen = 0;
        self.bulklen = -1;
        self.parse_state = ParseState::AwaitingMultibulkHeader;
    }

    pub fn mark_for_close(&mut self) {
        self.should_close = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;

    #[test]
    fn new_client_starts_awaiting_header() {
        let c = Client::new(1, Box::new(MockConnection::new()));
        assert_eq!(c.parse_state, ParseState::AwaitingMultibulkHeader);
        assert_eq!(c.bulklen, -1);
    }

    #[test]
    fn reset_clears_argv_and_parser_state() {
        let mut c = Client::new(1, Box::new(MockConnection::new()));
        c.argv.push(b"PING".to_vec());
        c.argv_len_sum = 4;
        c.multibulklen = 3;
        c.bulklen = 10;
        c.parse_state = ParseState::AwaitingBulkBody;

        c.reset_for_next_command();

        assert!(c.argv.is_empty());
        assert_eq!(c.argv_len_sum, 0);
        assert_eq!(c.multibulklen, 0);
        assert_eq!(c.bulklen, -1);
        assert_eq!(c.parse_state, ParseState::AwaitingMultibulkHeader);
    }
}
