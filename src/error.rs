//! Error taxonomy (spec section 7).
//!
//! The core never unwinds across a handler boundary — every fallible path
//! returns one of these and the caller (the dispatcher or the event loop)
//! decides what to do, exactly as section 7 specifies. Kept as a small
//! typed enum rather than the teacher's bare `String` because the
//! dispatcher needs to branch on *kind* (close vs. reply-and-continue), not
//! just log a message.

use std::fmt;

/// A malformed request: bad framing, an oversize header, a non-`*`/`$`
/// prefix, a non-numeric or out-of-range length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InlineNotSupported,
    TooBigMbulkCount,
    InvalidMultibulkLength,
    TooBigBulkCount,
    ExpectedDollar(u8),
    InvalidBulkLength,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InlineNotSupported => write!(f, "Protocol error: inline commands are not supported"),
            Self::TooBigMbulkCount => write!(f, "Protocol error: too big mbulk count string"),
            Self::InvalidMultibulkLength => write!(f, "Protocol error: invalid multibulk length"),
            Self::TooBigBulkCount => write!(f, "Protocol error: too big bulk count string"),
            Self::ExpectedDollar(got) => write!(f, "Protocol error: expected '$', got '{}'", *got as char),
            Self::InvalidBulkLength => write!(f, "Protocol error: invalid bulk length"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// What the caller should do after a parse/command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Reply was already queued (or nothing to reply); keep the connection.
    Continue,
    /// The connection is unrecoverable and must be torn down.
    CloseConnection,
}
