//! Client-facing error taxonomy.
//!
//! Server-side failures travel as [`Status`](crate::Status) values and always
//! end up on the wire as `grpc-status`/`grpc-message` trailers. The client
//! surfaces connection-level failures directly instead of masking them with
//! default values, and keeps timeouts distinct from broken connections so
//! callers can tell "still pending" from "gone".

use std::time::Duration;

use crate::framing::FramingError;
use crate::transport::{StreamId, TransportError};
use crate::Status;

/// Errors surfaced by [`Client`](crate::Client) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A received frame carried a malformed message envelope.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The connection was closed while the operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// `send` gave up after the configured number of attempts because the
    /// transport kept reporting no free stream.
    #[error("no stream available after {0} attempts")]
    StreamExhausted(u32),

    /// `recv` exceeded the caller-supplied timeout. The stream is still
    /// pending; the connection is not known to be broken.
    #[error("receive timed out after {0:?}")]
    RecvTimeout(Duration),

    /// The stream id is not (or no longer) tracked by this client.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// The stream was already half-closed by an earlier `end = true` send.
    #[error("stream {0} is already half-closed")]
    StreamClosed(StreamId),

    /// The framed message would exceed `max_package_length`.
    #[error("message of {got} bytes exceeds max_package_length {limit}")]
    PackageTooLarge { got: usize, limit: usize },

    /// Message encode/decode failed.
    #[error("codec error: {0}")]
    Codec(Status),

    /// The call completed with a non-OK gRPC status.
    #[error("rpc failed: {0}")]
    Grpc(Status),
}

impl ClientError {
    /// The gRPC status of a failed call, when this error carries one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            ClientError::Grpc(status) | ClientError::Codec(status) => Some(status),
            _ => None,
        }
    }
}

/// Errors surfaced by [`ClientPool`](crate::client::pool::ClientPool).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was closed while the caller was waiting.
    #[error("pool is closed")]
    Closed,

    /// Constructing a fresh client through the factory failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}
