use std::io;

/// Errors surfaced by the transport, both from user-facing calls and from the
///  protocol engines.
///
/// Terminal connection states map 1:1 onto `Closed`, `Refused`, `Corrupted`
///  and `Timeout`; once a connection has entered one of those states, every
///  subsequent `read`/`write` fails with the corresponding variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection was shut down, either locally or by a peer Shutdown packet.
    #[error("connection closed")]
    Closed,

    /// The peer refused the connection during the handshake.
    #[error("connection refused by peer")]
    Refused,

    /// The peer violated a protocol invariant (version, socket type or
    ///  initial-sequence mismatch).
    #[error("connection corrupted: {0}")]
    Corrupted(&'static str),

    /// The peer stopped responding (handshake timeout or EXP exhaustion).
    #[error("connection timed out")]
    Timeout,

    /// A read or write deadline expired before the call could complete.
    #[error("deadline expired")]
    DeadlineExceeded,

    /// An inbound buffer could not be decoded as a UDT packet.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// A datagram was larger than the caller's read buffer; the prefix that
    ///  fit was copied out, the rest of the message is discarded.
    #[error("message truncated to {copied} bytes")]
    Truncated { copied: usize },

    /// Internal marker for non-blocking paths; never returned to callers.
    #[error("operation would block")]
    WouldBlock,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that net-style callers treat as timeouts: both an
    ///  expired deadline and a peer liveness timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout | Error::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
