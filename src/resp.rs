//! The streaming RESP multibulk parser (spec section 4.G) — the
//! algorithmic heart of this crate.
//!
//! A direct, careful port of `processMultibulkBuffer` from
//! `original_source/server.c`: everything here works off `qb_pos`, a
//! cursor into `client.querybuf`, rather than repeatedly slicing the front
//! of the buffer off, so a command that straddles several `read(2)` calls
//! picks up exactly where it left off. The one optimization worth calling
//! out is the "big argument" path: once a bulk string's declared length
//! clears `PROTO_MBULK_BIG_ARG`, the buffer is compacted so the argument
//! starts at offset 0, and if it turns out the whole buffer *is* that one
//! argument plus its trailing CRLF, the argument steals the buffer outright
//! instead of being copied out of it.

use crate::buf::DynBuf;
use crate::client::{Client, ParseState};
use crate::error::ProtocolError;

/// An argument may never be declared longer than this, matching
/// `proto_max_bulk_len`'s conservative built-in default (the config layer
/// can lower it further, never raise it past what this core supports).
pub const PROTO_MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// A multibulk count (`*N`) above this is always a protocol error.
const PROTO_MAX_MULTIBULK_COUNT: i64 = 1024 * 1024;

/// Once a header line (the `*N` or `$N` line, before the body) grows past
/// this many bytes without a `\r\n`, give up rather than buffer forever.
const PROTO_INLINE_MAX_SIZE: usize = 16 * 1024;

/// Bulk strings at or above this size get the zero-copy treatment.
pub const PROTO_MBULK_BIG_ARG: i64 = 32 * 1024;

pub enum ParseOutcome {
    /// Not enough bytes buffered yet to make progress; wait for more I/O.
    NeedMoreData,
    /// A full command was parsed; its arguments are in `client.argv`.
    CommandReady,
    Error(ProtocolError),
}

/// Find `\r\n` starting at `querybuf[from..]`, returning the offset of the
/// `\r` relative to `from`, if both bytes are present in the buffer.
fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    let haystack = &data[from..];
    let pos = haystack.windows(2).position(|w| w == b"\r\n")?;
    Some(pos)
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

/// Drive the parser forward as far as the currently buffered bytes allow.
/// Call in a loop from the read handler: each `CommandReady` hands off one
/// command, after which the caller should reset parser state and call
/// again in case more than one command was pipelined in the same read.
pub fn process_multibulk_buffer(client: &mut Client) -> ParseOutcome {
    if client.parse_state == ParseState::AwaitingMultibulkHeader {
        let data = client.querybuf.as_slice();
        let from = client.qb_pos;
        if from >= data.len() {
            return ParseOutcome::NeedMoreData;
        }

        if data[from] != b'*' {
            return ParseOutcome::Error(ProtocolError::InlineNotSupported);
        }

        let Some(rel) = find_crlf(data, from) else {
            if data.len() - from > PROTO_INLINE_MAX_SIZE {
                return ParseOutcome::Error(ProtocolError::TooBigMbulkCount);
            }
            return ParseOutcome::NeedMoreData;
        };

        let count_bytes = &data[from + 1..from + rel];
        let Some(count) = parse_i64(count_bytes) else {
            return ParseOutcome::Error(ProtocolError::InvalidMultibulkLength);
        };
        if count > PROTO_MAX_MULTIBULK_COUNT {
            return ParseOutcome::Error(ProtocolError::InvalidMultibulkLength);
        }

        client.qb_pos = from + rel + 2;

        if count <= 0 {
            // Empty multibulk: nothing to dispatch, but the line was consumed.
            trim_consumed(client);
            client.multibulklen = 0;
            return ParseOutcome::CommandReady;
        }

        client.multibulklen = count;
        client.argv = Vec::with_capacity(count as usize);
        client.argv_len_sum = 0;
        client.parse_state = ParseState::AwaitingBulkHeader;
    }

    while client.multibulklen > 0 {
        if client.bulklen == -1 {
            let data = client.querybuf.as_slice();
            let from = client.qb_pos;
            if from >= data.len() {
                break;
            }

            let Some(rel) = find_crlf(data, from) else {
                if data.len() - from > PROTO_INLINE_MAX_SIZE {
                    return ParseOutcome::Error(ProtocolError::TooBigBulkCount);
                }
                break;
            };

            if data[from] != b'$' {
                return ParseOutcome::Error(ProtocolError::ExpectedDollar(data[from]));
            }

            let len_bytes = &data[from + 1..from + rel];
            let Some(len) = parse_i64(len_bytes) else {
                return ParseOutcome::Error(ProtocolError::InvalidBulkLength);
            };
            if len < 0 || len > PROTO_MAX_BULK_LEN {
                return ParseOutcome::Error(ProtocolError::InvalidBulkLength);
            }

            client.qb_pos = from + rel + 2;

            if len >= PROTO_MBULK_BIG_ARG {
                let remaining = client.querybuf.len() - client.qb_pos;
                if remaining <= len as usize + 2 {
                    compact_for_big_arg(&mut client.querybuf, client.qb_pos, len);
                    client.qb_pos = 0;
                }
            }

            client.bulklen = len;
        }

        let data = client.querybuf.as_slice();
        let needed = client.bulklen as usize + 2;
        if data.len() - client.qb_pos < needed {
            break;
        }

        let bulklen = client.bulklen as usize;
        if client.qb_pos == 0
            && client.bulklen >= PROTO_MBULK_BIG_ARG
            && data.len() == bulklen + 2
        {
            let mut stolen = client.querybuf.take();
            stolen.truncate(bulklen); // drop the trailing \r\n
            client.argv_len_sum += stolen.len();
            client.argv.push(stolen);
            // Install a fresh buffer sized for another big argument, rather
            // than the zero-capacity one `take` leaves behind, so the next
            // one doesn't pay a realloc before it can reuse this path.
            client.querybuf.replace(Vec::with_capacity(bulklen + 2));
            client.qb_pos = 0;
        } else {
            let arg = data[client.qb_pos..client.qb_pos + bulklen].to_vec();
            client.argv_len_sum += arg.len();
            client.argv.push(arg);
            client.qb_pos += bulklen + 2;
        }

        client.bulklen = -1;
        client.multibulklen -= 1;
    }

    trim_consumed(client);

    if client.multibulklen == 0 {
        ParseOutcome::CommandReady
    } else {
        ParseOutcome::NeedMoreData
    }
}

/// Shift `qb_pos` out of the buffer once we've consumed a prefix of it,
/// so the next read appends after what's actually left to parse.
fn trim_consumed(client: &mut Client) {
    if client.qb_pos > 0 {
        client.querybuf.drain_prefix(client.qb_pos);
        client.qb_pos = 0;
    }
}

/// Make the upcoming big argument likely to land at offset 0 of a buffer
/// sized to hold exactly it, so the zero-copy steal path below becomes
/// reachable. Mirrors the `sdsrange` + `sdsMakeRoomFor` pair around the
/// `bulklen >= PROTO_MBULK_BIG_ARG` check in `processMultibulkBuffer`.
fn compact_for_big_arg(querybuf: &mut DynBuf, qb_pos: usize, bulklen: i64) {
    querybuf.drain_prefix(qb_pos);
    querybuf.reserve(bulklen as usize + 2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;

    fn feed(client: &mut Client, bytes: &[u8]) {
        client.querybuf.extend_from_slice(bytes);
    }

    fn new_client() -> Client {
        Client::new(1, Box::new(MockConnection::new()))
    }

    #[test]
    fn parses_simple_two_arg_command_in_one_shot() {
        let mut c = new_client();
        feed(&mut c, b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n");
        match process_multibulk_buffer(&mut c) {
            ParseOutcome::CommandReady => {}
            _ => panic!("expected CommandReady"),
        }
        assert_eq!(c.argv, vec![b"PING".to_vec(), b"hello".to_vec()]);
    }

    #[test]
    fn resumes_across_a_split_header() {
        let mut c = new_client();
        feed(&mut c, b"*1\r\n$4\r\nPI");
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::NeedMoreData));
        feed(&mut c, b"NG\r\n");
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::CommandReady));
        assert_eq!(c.argv, vec![b"PING".to_vec()]);
    }

    #[test]
    fn resumes_across_a_split_multibulk_count() {
        let mut c = new_client();
        feed(&mut c, b"*");
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::NeedMoreData));
        feed(&mut c, b"1\r\n$2\r\nhi\r\n");
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::CommandReady));
        assert_eq!(c.argv, vec![b"hi".to_vec()]);
    }

    #[test]
    fn non_star_prefix_is_an_inline_error() {
        let mut c = new_client();
        feed(&mut c, b"PING\r\n");
        match process_multibulk_buffer(&mut c) {
            ParseOutcome::Error(ProtocolError::InlineNotSupported) => {}
            _ => panic!("expected InlineNotSupported"),
        }
    }

    #[test]
    fn bad_multibulk_count_is_rejected() {
        let mut c = new_client();
        feed(&mut c, b"*notanumber\r\n");
        match process_multibulk_buffer(&mut c) {
            ParseOutcome::Error(ProtocolError::InvalidMultibulkLength) => {}
            _ => panic!("expected InvalidMultibulkLength"),
        }
    }

    #[test]
    fn missing_dollar_sign_is_rejected() {
        let mut c = new_client();
        feed(&mut c, b"*1\r\nXhi\r\n");
        match process_multibulk_buffer(&mut c) {
            ParseOutcome::Error(ProtocolError::ExpectedDollar(b'X')) => {}
            _ => panic!("expected ExpectedDollar('X')"),
        }
    }

    #[test]
    fn oversize_bulk_length_is_rejected() {
        let mut c = new_client();
        feed(&mut c, b"*1\r\n$99999999999\r\n");
        match process_multibulk_buffer(&mut c) {
            ParseOutcome::Error(ProtocolError::InvalidBulkLength) => {}
            _ => panic!("expected InvalidBulkLength"),
        }
    }

    #[test]
    fn big_argument_takes_the_zero_copy_steal_path() {
        let mut c = new_client();
        let payload = vec![b'z'; PROTO_MBULK_BIG_ARG as usize];
        let mut frame = format!("*1\r\n${}\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");
        feed(&mut c, &frame);

        match process_multibulk_buffer(&mut c) {
            ParseOutcome::CommandReady => {}
            _ => panic!("expected CommandReady"),
        }
        assert_eq!(c.argv.len(), 1);
        assert_eq!(c.argv[0].len(), PROTO_MBULK_BIG_ARG as usize);
        assert!(c.argv[0].iter().all(|&b| b == b'z'));
    }

    #[test]
    fn pipelined_commands_are_parsed_one_at_a_time() {
        let mut c = new_client();
        feed(&mut c, b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPONG\r\n");
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::CommandReady));
        assert_eq!(c.argv, vec![b"PING".to_vec()]);
        c.reset_for_next_command();
        assert!(matches!(process_multibulk_buffer(&mut c), ParseOutcome::CommandReady));
        assert_eq!(c.argv, vec![b"PONG".to_vec()]);
    }
}
