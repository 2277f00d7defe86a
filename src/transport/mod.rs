//! The transport capability consumed by the client and the server.
//!
//! The engine does not speak HTTP/2 itself. It is written against the small
//! set of primitives below: a client side that can open multiplexed streams,
//! write additional data on them, and read frames off the connection; and a
//! server side that delivers complete inbound requests together with a sink
//! for the response. [`mem`] provides an in-memory implementation of both
//! roles for tests and loopback hosts.

pub mod mem;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

/// Identifier of one logical request/response exchange on a connection.
pub type StreamId = u32;

/// A shared handle to the response side of one inbound request.
pub type SharedSink = Arc<dyn ResponseSink>;

/// Connection-level failures surfaced by the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings applied to a client connection before `connect`.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Default receive timeout for unary conveniences.
    pub timeout: Duration,
    /// Whether the transport should verify end-of-frame boundaries.
    pub open_eof_check: bool,
    /// Upper bound on a single framed message, envelope included.
    pub max_package_length: usize,
    /// Streams the transport may keep open concurrently.
    pub max_concurrent_streams: usize,
    /// Attempts made by `send` while the transport reports no free stream.
    pub max_retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            open_eof_check: true,
            max_package_length: 2_000_000,
            max_concurrent_streams: 1000,
            max_retries: 30,
        }
    }
}

/// Head of an outbound request.
#[derive(Clone, Debug)]
pub struct RequestHead {
    /// `/<service>/<method>`
    pub path: String,
    pub headers: HeaderMap,
}

/// One demultiplexable unit read off a client connection.
#[derive(Clone, Debug)]
pub struct Frame {
    pub stream_id: StreamId,
    pub headers: HeaderMap,
    /// Framed payload; empty for trailer frames.
    pub data: Bytes,
    /// More frames will follow on this stream (server-streaming push).
    pub pipeline: bool,
    /// Trailers-only frame carrying `grpc-status`/`grpc-message`.
    pub trailer: bool,
}

/// A complete inbound request as delivered by the transport.
///
/// The transport buffers client-streaming chunks and hands over the request
/// once the sender half-closes, so the engine always sees a whole body.
#[derive(Clone, Debug)]
pub struct RawRequest {
    pub stream_id: StreamId,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Peer description, informational (`host:port` for network transports).
    pub peer: String,
}

/// Client-side connect capability. Connecting splits the connection into a
/// shareable sender half and an exclusively owned reader half, which the
/// client hands to its background demultiplexing task.
#[async_trait]
pub trait ClientTransport: Send {
    type Sender: TransportSender;
    type Reader: TransportReader;

    async fn connect(
        self,
        settings: &ClientSettings,
    ) -> Result<(Self::Sender, Self::Reader), TransportError>;
}

/// The write half of a client connection.
#[async_trait]
pub trait TransportSender: Send + Sync + 'static {
    /// Open a new stream carrying `head` and `data`.
    ///
    /// Returns `Ok(None)` when the peer currently has no stream capacity;
    /// that outcome is retryable. `end` half-closes the stream.
    async fn send_request(
        &self,
        head: RequestHead,
        data: Bytes,
        end: bool,
    ) -> Result<Option<StreamId>, TransportError>;

    /// Write an additional data chunk on an open stream.
    async fn write(
        &self,
        stream_id: StreamId,
        data: Bytes,
        end: bool,
    ) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// The read half of a client connection.
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Read the next frame. `Ok(None)` signals orderly end of the connection.
    async fn read(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Server-side accept capability.
#[async_trait]
pub trait ServerTransport: Send + 'static {
    /// Wait for the next complete inbound request. `None` once the transport
    /// shuts down.
    async fn accept(&mut self) -> Option<(RawRequest, SharedSink)>;
}

/// The response side of one inbound request.
///
/// `send_headers` is first-call-wins so that streaming pushes and the final
/// packing step can both offer headers without coordination.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Send the response headers. Calls after the first are ignored.
    async fn send_headers(&self, headers: HeaderMap) -> Result<(), TransportError>;

    /// Write one streamed data frame on the still-open response stream.
    async fn write_data(&self, data: Bytes) -> Result<(), TransportError>;

    /// Write the terminal data frame followed by the trailers, ending the
    /// stream.
    async fn finish(&self, data: Bytes, trailers: HeaderMap) -> Result<(), TransportError>;
}
