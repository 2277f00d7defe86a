//! The client connection: one transport connection, many concurrent RPCs.
//!
//! A [`Client`] owns the write half of a connection and a background task
//! that owns the read half. The background task demultiplexes frames by
//! stream id into per-stream queues of capacity one; callers pull from those
//! queues through [`Client::recv`]. Closing the client cancels the task and
//! fails every pending `recv` with
//! [`ClientError::ConnectionClosed`](crate::error::ClientError).

pub mod pool;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, TE, USER_AGENT};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{self, Encoding};
use crate::error::ClientError;
use crate::framing;
use crate::status::{GRPC_MESSAGE_HEADER, GRPC_STATUS_HEADER};
use crate::transport::{
    ClientSettings, ClientTransport, Frame, RequestHead, StreamId, TransportReader,
    TransportSender,
};
use crate::{Code, Status};

const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(10);
const USER_AGENT_VALUE: &str = concat!("tenor/", env!("CARGO_PKG_VERSION"));

/// A multiplexed gRPC client connection.
///
/// Cheap to clone; all clones share the connection and its stream table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    sender: Box<dyn TransportSender>,
    settings: ClientSettings,
    streams: Mutex<HashMap<StreamId, Arc<StreamEntry>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

struct StreamEntry {
    tx: mpsc::Sender<StreamItem>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamItem>>>,
    /// The request was sent with `end = true`; the response carries a
    /// correlated trailer pair.
    expects_trailers: bool,
    /// No more request data may be written on this stream.
    half_closed: AtomicBool,
}

struct StreamItem {
    payload: Bytes,
    trailers: HeaderMap,
    /// Last item for this stream; the entry retires once it is consumed.
    terminal: bool,
}

impl Client {
    /// Connect over `transport` and spawn the background demultiplexing task.
    pub async fn connect<T: ClientTransport>(
        transport: T,
        settings: ClientSettings,
    ) -> Result<Client, ClientError> {
        let (sender, reader) = transport.connect(&settings).await?;
        let inner = Arc::new(ClientInner {
            sender: Box::new(sender),
            settings,
            streams: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(demux_loop(inner.clone(), reader));

        Ok(Client { inner })
    }

    /// The settings this connection was opened with.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Issue a request on a new stream and return its id.
    ///
    /// While the transport reports no free stream (without a hard error) the
    /// send is retried up to `max_retries` times with a short backoff. A
    /// transport error aborts immediately.
    pub async fn send<M>(
        &self,
        method: &str,
        message: &M,
        encoding: Encoding,
        end: bool,
    ) -> Result<StreamId, ClientError>
    where
        M: prost::Message + serde::Serialize + Default + Send + 'static,
    {
        let payload = codec::encode_message(encoding, message).map_err(ClientError::Codec)?;
        self.send_raw(method, payload, encoding, end).await
    }

    /// Issue a request carrying an already-encoded message payload.
    pub async fn send_raw(
        &self,
        method: &str,
        payload: Bytes,
        encoding: Encoding,
        end: bool,
    ) -> Result<StreamId, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }

        let framed = self.frame_payload(&payload)?;
        let head = RequestHead {
            path: method.to_owned(),
            headers: request_headers(encoding),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .inner
                .sender
                .send_request(head.clone(), framed.clone(), end)
                .await?
            {
                Some(stream_id) => {
                    self.register_stream(stream_id, end);
                    trace!(stream_id, method, "stream opened");
                    return Ok(stream_id);
                }
                None if attempts >= self.inner.settings.max_retries => {
                    return Err(ClientError::StreamExhausted(attempts));
                }
                None => time::sleep(SEND_RETRY_BACKOFF).await,
            }
        }
    }

    /// Write an additional message on an already-open stream
    /// (client-streaming). `end = true` half-closes the stream.
    pub async fn send_packet<M>(
        &self,
        stream_id: StreamId,
        message: &M,
        encoding: Encoding,
        end: bool,
    ) -> Result<(), ClientError>
    where
        M: prost::Message + serde::Serialize + Default + Send + 'static,
    {
        let entry = self
            .inner
            .streams
            .lock()
            .unwrap()
            .get(&stream_id)
            .cloned()
            .ok_or(ClientError::UnknownStream(stream_id))?;
        if entry.half_closed.load(Ordering::Acquire) {
            return Err(ClientError::StreamClosed(stream_id));
        }

        let payload = codec::encode_message(encoding, message).map_err(ClientError::Codec)?;
        let framed = self.frame_payload(&payload)?;
        self.inner.sender.write(stream_id, framed, end).await?;
        if end {
            entry.half_closed.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Pull the next `(payload, trailers)` pair for `stream_id`.
    ///
    /// Blocks until the demultiplexer delivers an item, the timeout elapses
    /// ([`ClientError::RecvTimeout`]), or the connection closes
    /// ([`ClientError::ConnectionClosed`]).
    pub async fn recv(
        &self,
        stream_id: StreamId,
        timeout: Option<Duration>,
    ) -> Result<(Bytes, HeaderMap), ClientError> {
        let rx = self
            .inner
            .streams
            .lock()
            .unwrap()
            .get(&stream_id)
            .map(|entry| entry.rx.clone())
            .ok_or(ClientError::UnknownStream(stream_id))?;

        let pop = async { rx.lock().await.recv().await };
        let item = match timeout {
            Some(limit) => time::timeout(limit, pop)
                .await
                .map_err(|_| ClientError::RecvTimeout(limit))?,
            None => pop.await,
        };
        let item = item.ok_or(ClientError::ConnectionClosed)?;

        if item.terminal {
            self.inner.streams.lock().unwrap().remove(&stream_id);
        }
        Ok((item.payload, item.trailers))
    }

    /// Pull and decode the next message for `stream_id`.
    ///
    /// Typed flavor of [`recv`](Client::recv); the trailers come back
    /// alongside so streaming consumers can watch for the terminal status.
    pub async fn recv_message<M>(
        &self,
        stream_id: StreamId,
        encoding: Encoding,
        timeout: Option<Duration>,
    ) -> Result<(M, HeaderMap), ClientError>
    where
        M: prost::Message + serde::de::DeserializeOwned + Default + Send + 'static,
    {
        let (payload, trailers) = self.recv(stream_id, timeout).await?;
        let message = codec::decode_message(encoding, payload).map_err(ClientError::Codec)?;
        Ok((message, trailers))
    }

    /// Send a unary request and decode the reply, failing on a non-OK status.
    ///
    /// The connection's `timeout` setting bounds the wait for the reply.
    pub async fn unary<Req, Res>(
        &self,
        method: &str,
        message: &Req,
        encoding: Encoding,
    ) -> Result<Res, ClientError>
    where
        Req: prost::Message + serde::Serialize + Default + Send + 'static,
        Res: prost::Message + serde::de::DeserializeOwned + Default + Send + 'static,
    {
        let stream_id = self.send(method, message, encoding, true).await?;
        let (payload, trailers) = self
            .recv(stream_id, Some(self.inner.settings.timeout))
            .await?;

        let status = Status::from_header_map(&trailers)
            .unwrap_or_else(|| Status::unknown("response carried no grpc-status"));
        if status.code() != Code::Ok {
            return Err(ClientError::Grpc(status));
        }
        codec::decode_message(encoding, payload).map_err(ClientError::Codec)
    }

    /// Close the connection. Idempotent.
    ///
    /// The demultiplexing task is cancelled and every pending `recv` fails
    /// with [`ClientError::ConnectionClosed`] instead of being left to time
    /// out.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.sender.close().await;
        self.inner.fail_pending();
    }

    fn frame_payload(&self, payload: &[u8]) -> Result<Bytes, ClientError> {
        let limit = self.inner.settings.max_package_length;
        if payload.len() + framing::HEADER_SIZE > limit {
            return Err(ClientError::PackageTooLarge {
                got: payload.len() + framing::HEADER_SIZE,
                limit,
            });
        }
        Ok(framing::encode(payload)?)
    }

    fn register_stream(&self, stream_id: StreamId, end: bool) {
        // capacity 1: at most one pending, unconsumed item per stream
        let (tx, rx) = mpsc::channel(1);
        let entry = Arc::new(StreamEntry {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            expects_trailers: end,
            half_closed: AtomicBool::new(end),
        });
        if self
            .inner
            .streams
            .lock()
            .unwrap()
            .insert(stream_id, entry)
            .is_some()
        {
            warn!(stream_id, "transport reissued a live stream id");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("open_streams", &self.inner.streams.lock().unwrap().len())
            .finish()
    }
}

impl ClientInner {
    /// Drop every stream entry so pending and future `recv` calls observe
    /// closure instead of hanging.
    fn fail_pending(&self) {
        self.streams.lock().unwrap().clear();
    }

    fn entry(&self, stream_id: StreamId) -> Option<Arc<StreamEntry>> {
        self.streams.lock().unwrap().get(&stream_id).cloned()
    }
}

fn request_headers(encoding: Encoding) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(encoding.to_content_type()),
    );
    headers.insert(TE, HeaderValue::from_static("trailers"));
    headers
}

/// Extract the `grpc-status`/`grpc-message` pair from `headers`, defaulting
/// to OK with an empty message.
fn trailer_pair(headers: &HeaderMap) -> HeaderMap {
    let mut trailers = HeaderMap::with_capacity(2);
    trailers.insert(
        GRPC_STATUS_HEADER,
        headers
            .get(GRPC_STATUS_HEADER)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("0")),
    );
    trailers.insert(
        GRPC_MESSAGE_HEADER,
        headers
            .get(GRPC_MESSAGE_HEADER)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("")),
    );
    trailers
}

fn internal_trailers(err: impl std::fmt::Display) -> HeaderMap {
    let mut trailers = HeaderMap::with_capacity(2);
    trailers.insert(GRPC_STATUS_HEADER, Code::Internal.to_header_value());
    trailers.insert(
        GRPC_MESSAGE_HEADER,
        HeaderValue::from_str(&err.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("malformed frame")),
    );
    trailers
}

/// Background task owning the read half: routes frames by stream id until
/// cancelled or the transport ends.
async fn demux_loop<R: TransportReader>(inner: Arc<ClientInner>, mut reader: R) {
    loop {
        let read = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            read = reader.read() => read,
        };
        match read {
            Ok(Some(frame)) => deliver_frame(&inner, frame, &mut reader).await,
            Ok(None) => {
                trace!("connection reached end of stream");
                break;
            }
            Err(err) => {
                warn!("transport read failed: {err}");
                break;
            }
        }
    }
    inner.fail_pending();
}

async fn deliver_frame<R: TransportReader>(inner: &Arc<ClientInner>, frame: Frame, reader: &mut R) {
    if frame.stream_id == 0 {
        return;
    }

    let Some(entry) = lookup_entry(inner, frame.stream_id).await else {
        debug!(stream_id = frame.stream_id, "frame for unknown stream dropped");
        return;
    };

    if frame.pipeline {
        // streamed push: deliver repeatedly without retiring the stream
        let item = match framing::decode(frame.data) {
            Ok(payload) => StreamItem {
                payload,
                trailers: HeaderMap::new(),
                terminal: false,
            },
            Err(err) => StreamItem {
                payload: Bytes::new(),
                trailers: internal_trailers(err),
                terminal: false,
            },
        };
        push_item(inner, &entry, item).await;
        return;
    }

    let mut trailers = trailer_pair(&frame.headers);
    if entry.expects_trailers && !frame.trailer {
        // Trailer correlation: the status trailer is assumed to be the next
        // frame read off this connection. That holds for transports that
        // deliver a stream's DATA and trailing HEADERS back to back, and is
        // not safe under arbitrary interleaving; a transport implementation
        // must preserve that ordering.
        match reader.read().await {
            Ok(Some(next)) if next.stream_id == frame.stream_id && next.trailer => {
                trailers = trailer_pair(&next.headers);
            }
            Ok(Some(next)) => {
                warn!(
                    expected = frame.stream_id,
                    got = next.stream_id,
                    "trailer frame did not follow its data frame; frame dropped"
                );
            }
            Ok(None) | Err(_) => {}
        }
    }

    let item = if frame.trailer {
        StreamItem {
            payload: Bytes::new(),
            trailers: trailer_pair(&frame.headers),
            terminal: true,
        }
    } else {
        match framing::decode(frame.data) {
            Ok(payload) => StreamItem {
                payload,
                trailers,
                terminal: true,
            },
            Err(err) => StreamItem {
                payload: Bytes::new(),
                trailers: internal_trailers(err),
                terminal: true,
            },
        }
    };
    push_item(inner, &entry, item).await;
}

/// Queue an item, respecting the capacity-1 backpressure: a second item for
/// the same stream waits until the consumer drains the first.
async fn push_item(inner: &Arc<ClientInner>, entry: &StreamEntry, item: StreamItem) {
    tokio::select! {
        _ = inner.cancel.cancelled() => {}
        sent = entry.tx.send(item) => {
            if sent.is_err() {
                trace!("stream consumer went away before delivery");
            }
        }
    }
}

/// `send` publishes the stream entry right after the transport allocates the
/// id, so a fast response can race the registration. Yield briefly before
/// declaring the stream unknown.
async fn lookup_entry(inner: &Arc<ClientInner>, stream_id: StreamId) -> Option<Arc<StreamEntry>> {
    for _ in 0..50 {
        if let Some(entry) = inner.entry(stream_id) {
            return Some(entry);
        }
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing;
    use crate::transport::mem;
    use crate::transport::ServerTransport;

    #[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
    struct Ping {
        #[prost(string, tag = "1")]
        text: String,
    }

    fn ping(text: &str) -> Ping {
        Ping { text: text.into() }
    }

    async fn connect(connector: mem::MemConnector) -> Client {
        Client::connect(connector, ClientSettings::default())
            .await
            .unwrap()
    }

    fn ok_trailers() -> HeaderMap {
        Status::ok("").to_header_map().unwrap()
    }

    #[tokio::test]
    async fn stream_ids_unique_while_open() {
        let (connector, _listener) = mem::link();
        let client = connect(connector).await;

        let mut ids = std::collections::HashSet::new();
        for _ in 0..8 {
            let id = client
                .send("/svc/M", &ping("x"), Encoding::Proto, true)
                .await
                .unwrap();
            assert!(ids.insert(id));
        }
    }

    #[tokio::test]
    async fn unary_send_recv() {
        let (connector, mut listener) = mem::link();
        let client = connect(connector).await;

        let server = tokio::spawn(async move {
            let (request, sink) = listener.accept().await.unwrap();
            assert_eq!(request.path, "/svc/Echo");
            assert_eq!(
                request.headers.get(CONTENT_TYPE).unwrap(),
                "application/grpc+proto"
            );
            assert_eq!(request.headers.get(TE).unwrap(), "trailers");
            assert!(request
                .headers
                .get(USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("tenor/"));

            // echo the body back, framed, with OK trailers
            let payload = framing::decode(request.body).unwrap();
            sink.finish(framing::encode(&payload).unwrap(), ok_trailers())
                .await
                .unwrap();
        });

        let reply: Ping = client
            .unary("/svc/Echo", &ping("hello"), Encoding::Proto)
            .await
            .unwrap();
        assert_eq!(reply.text, "hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_timeout_is_distinct() {
        let (connector, mut listener) = mem::link();
        let client = connect(connector).await;

        // server accepts but never answers
        let id = client
            .send("/svc/Slow", &ping("x"), Encoding::Proto, true)
            .await
            .unwrap();
        let (_request, _sink) = listener.accept().await.unwrap();

        let err = client
            .recv(id, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RecvTimeout(_)));

        // the stream is still pending, not gone
        assert!(matches!(
            client.recv(id, Some(Duration::from_millis(10))).await,
            Err(ClientError::RecvTimeout(_))
        ));
    }

    #[tokio::test]
    async fn close_fails_pending_recv() {
        let (connector, mut listener) = mem::link();
        let client = connect(connector).await;

        let id = client
            .send("/svc/Slow", &ping("x"), Encoding::Proto, true)
            .await
            .unwrap();
        let (_request, _sink) = listener.accept().await.unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.recv(id, None).await })
        };
        time::sleep(Duration::from_millis(20)).await;

        client.close().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));

        // and further sends are refused
        assert!(matches!(
            client.send("/svc/M", &ping("y"), Encoding::Proto, true).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn streamed_pushes_are_not_dropped_under_backpressure() {
        let (connector, mut listener) = mem::link();
        let client = connect(connector).await;

        let id = client
            .send("/svc/Stream", &ping("go"), Encoding::Proto, true)
            .await
            .unwrap();
        let (_request, sink) = listener.accept().await.unwrap();

        // three pushes before the consumer reads anything: the capacity-1
        // queue must hold them back, not overwrite
        let pusher = tokio::spawn(async move {
            for n in 0..3u8 {
                sink.write_data(framing::encode(&[n]).unwrap()).await.unwrap();
            }
            sink.finish(framing::encode(b"").unwrap(), ok_trailers())
                .await
                .unwrap();
        });

        time::sleep(Duration::from_millis(30)).await;
        for n in 0..3u8 {
            let (payload, _trailers) = client.recv(id, Some(Duration::from_secs(1))).await.unwrap();
            assert_eq!(&payload[..], &[n]);
        }
        let (final_payload, trailers) = client.recv(id, Some(Duration::from_secs(1))).await.unwrap();
        assert!(final_payload.is_empty());
        assert_eq!(trailers.get(GRPC_STATUS_HEADER).unwrap(), "0");
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn send_exhausts_retries_when_no_stream_available() {
        let (connector, mut listener) = mem::link();
        let settings = ClientSettings {
            max_concurrent_streams: 1,
            max_retries: 3,
            ..Default::default()
        };
        let client = Client::connect(connector, settings).await.unwrap();

        // occupy the only stream slot and never answer
        client
            .send("/svc/Hold", &ping("x"), Encoding::Proto, true)
            .await
            .unwrap();
        let (_request, _sink) = listener.accept().await.unwrap();

        let err = client
            .send("/svc/M", &ping("y"), Encoding::Proto, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::StreamExhausted(3)));
    }

    #[tokio::test]
    async fn oversized_message_is_refused_locally() {
        let (connector, _listener) = mem::link();
        let settings = ClientSettings {
            max_package_length: 16,
            ..Default::default()
        };
        let client = Client::connect(connector, settings).await.unwrap();

        let err = client
            .send("/svc/M", &ping(&"x".repeat(64)), Encoding::Proto, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::PackageTooLarge { .. }));
    }

    #[tokio::test]
    async fn send_packet_after_half_close_is_refused() {
        let (connector, mut listener) = mem::link();
        let client = connect(connector).await;

        let id = client
            .send("/svc/Upload", &ping("a"), Encoding::Proto, false)
            .await
            .unwrap();
        client
            .send_packet(id, &ping("b"), Encoding::Proto, true)
            .await
            .unwrap();

        let err = client
            .send_packet(id, &ping("c"), Encoding::Proto, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::StreamClosed(_)));

        // the buffered body reached the server in one piece
        let (request, _sink) = listener.accept().await.unwrap();
        assert_eq!(request.path, "/svc/Upload");
    }
}
