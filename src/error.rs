use std::io;

use crate::protocol::RecordType;

/// Everything that can go wrong inside the protocol engine.
///
/// The decode variants are fatal: the connection that produced them is torn
/// down and the error is returned from its `run` future. Peer records that
/// merely reference the wrong request id are *not* errors; the connections
/// drop those silently.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer spoke a FastCGI version other than 1.
    #[error("unsupported FastCGI version {0}")]
    UnsupportedVersion(u8),

    /// A record header carried a type code outside 1..=11.
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    /// A BEGIN_REQUEST body carried a role code outside 1..=3.
    #[error("unknown role {0}")]
    UnknownRole(u16),

    /// An END_REQUEST body carried a protocol status outside 0..=3.
    #[error("unknown protocol status {0}")]
    UnknownProtocolStatus(u8),

    /// A record body ended before its declared layout was complete.
    #[error("truncated {0:?} record body")]
    Truncated(RecordType),

    /// A non-stream record body exceeded the 65535-byte content limit.
    #[error("record body of {0} bytes does not fit a single record")]
    Oversize(usize),

    /// Codec construction with a padding alignment outside [1, 255].
    #[error("invalid padding fit {0} (must be 1..=255)")]
    InvalidPaddingFit(u8),

    /// All 65535 request ids on the connection are in use.
    #[error("too many requests open on this connection")]
    TooManyRequests,

    /// A write or end was attempted on a request that already ended.
    #[error("request already ended")]
    RequestEnded,

    /// The connection task is gone (closed or torn down).
    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}
