//! In-memory transport used by the test suite and loopback hosts.
//!
//! [`link`] produces a connector/listener pair. Every `connect` on the
//! (cloneable) connector opens an independent connection to the same
//! listener, so one in-process server can serve many pooled clients.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    ClientSettings, ClientTransport, Frame, RawRequest, RequestHead, ResponseSink, ServerTransport,
    SharedSink, StreamId, TransportError, TransportReader, TransportSender,
};

/// Create a linked connector/listener pair.
pub fn link() -> (MemConnector, MemListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemConnector {
            accept_tx,
            conn_seq: Arc::new(AtomicU64::new(0)),
        },
        MemListener { accept_rx },
    )
}

/// Client end of an in-memory link. Cloneable; each `connect` opens a fresh
/// connection.
#[derive(Clone, Debug)]
pub struct MemConnector {
    accept_tx: mpsc::UnboundedSender<(RawRequest, SharedSink)>,
    conn_seq: Arc<AtomicU64>,
}

#[async_trait]
impl ClientTransport for MemConnector {
    type Sender = MemSender;
    type Reader = MemReader;

    async fn connect(
        self,
        settings: &ClientSettings,
    ) -> Result<(Self::Sender, Self::Reader), TransportError> {
        if self.accept_tx.is_closed() {
            return Err(TransportError::Connect("listener is gone".into()));
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnInner {
            accept_tx: self.accept_tx,
            frame_tx,
            peer: format!("mem:{}", self.conn_seq.fetch_add(1, Ordering::Relaxed)),
            max_streams: settings.max_concurrent_streams,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnState {
                // client-initiated stream ids are odd, as on the wire
                next_stream_id: 1,
                partial: HashMap::new(),
            }),
        });

        Ok((MemSender { conn }, MemReader { frame_rx }))
    }
}

#[derive(Debug)]
struct ConnState {
    next_stream_id: StreamId,
    partial: HashMap<StreamId, Partial>,
}

#[derive(Debug)]
struct Partial {
    head: RequestHead,
    body: BytesMut,
}

#[derive(Debug)]
struct ConnInner {
    accept_tx: mpsc::UnboundedSender<(RawRequest, SharedSink)>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    peer: String,
    max_streams: usize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    state: Mutex<ConnState>,
}

fn deliver(
    conn: &Arc<ConnInner>,
    stream_id: StreamId,
    head: RequestHead,
    body: Bytes,
) -> Result<(), TransportError> {
    let request = RawRequest {
        stream_id,
        path: head.path,
        headers: head.headers,
        body,
        peer: conn.peer.clone(),
    };
    let sink = Arc::new(MemSink {
        stream_id,
        frame_tx: conn.frame_tx.clone(),
        in_flight: InFlightGuard::new(conn.clone()),
        headers: Mutex::new(HeaderMap::new()),
        headers_sent: AtomicBool::new(false),
    });
    conn.accept_tx
        .send((request, sink))
        .map_err(|_| TransportError::Closed)
}

/// Shared write half of an in-memory connection.
#[derive(Debug)]
pub struct MemSender {
    conn: Arc<ConnInner>,
}

#[async_trait]
impl TransportSender for MemSender {
    async fn send_request(
        &self,
        head: RequestHead,
        data: Bytes,
        end: bool,
    ) -> Result<Option<StreamId>, TransportError> {
        if self.conn.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.conn.in_flight.load(Ordering::Acquire) >= self.conn.max_streams {
            // no stream capacity right now; the caller may retry
            return Ok(None);
        }

        let stream_id = {
            let mut state = self.conn.state.lock().unwrap();
            let id = state.next_stream_id;
            state.next_stream_id += 2;
            if !end {
                let mut body = BytesMut::new();
                body.extend_from_slice(&data);
                state.partial.insert(
                    id,
                    Partial {
                        head: head.clone(),
                        body,
                    },
                );
            }
            id
        };

        self.conn.in_flight.fetch_add(1, Ordering::AcqRel);
        if end {
            deliver(&self.conn, stream_id, head, data)?;
        }
        Ok(Some(stream_id))
    }

    async fn write(
        &self,
        stream_id: StreamId,
        data: Bytes,
        end: bool,
    ) -> Result<(), TransportError> {
        if self.conn.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let complete = {
            let mut state = self.conn.state.lock().unwrap();
            let partial = state
                .partial
                .get_mut(&stream_id)
                .ok_or(TransportError::Closed)?;
            partial.body.extend_from_slice(&data);
            if end {
                state.partial.remove(&stream_id)
            } else {
                None
            }
        };

        if let Some(partial) = complete {
            deliver(&self.conn, stream_id, partial.head, partial.body.freeze())?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.conn.closed.store(true, Ordering::Release);
        self.conn.state.lock().unwrap().partial.clear();
    }
}

/// Exclusively owned read half of an in-memory connection.
#[derive(Debug)]
pub struct MemReader {
    frame_rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportReader for MemReader {
    async fn read(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.frame_rx.recv().await)
    }
}

struct InFlightGuard {
    conn: Arc<ConnInner>,
    released: AtomicBool,
}

impl InFlightGuard {
    fn new(conn: Arc<ConnInner>) -> Self {
        Self {
            conn,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.conn.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct MemSink {
    stream_id: StreamId,
    frame_tx: mpsc::UnboundedSender<Frame>,
    in_flight: InFlightGuard,
    headers: Mutex<HeaderMap>,
    headers_sent: AtomicBool,
}

#[async_trait]
impl ResponseSink for MemSink {
    async fn send_headers(&self, headers: HeaderMap) -> Result<(), TransportError> {
        if !self.headers_sent.swap(true, Ordering::AcqRel) {
            *self.headers.lock().unwrap() = headers;
        }
        Ok(())
    }

    async fn write_data(&self, data: Bytes) -> Result<(), TransportError> {
        let frame = Frame {
            stream_id: self.stream_id,
            headers: self.headers.lock().unwrap().clone(),
            data,
            pipeline: true,
            trailer: false,
        };
        self.frame_tx
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn finish(&self, data: Bytes, trailers: HeaderMap) -> Result<(), TransportError> {
        let headers = self.headers.lock().unwrap().clone();
        let sent = self
            .frame_tx
            .send(Frame {
                stream_id: self.stream_id,
                headers,
                data,
                pipeline: false,
                trailer: false,
            })
            .and_then(|()| {
                self.frame_tx.send(Frame {
                    stream_id: self.stream_id,
                    headers: trailers,
                    data: Bytes::new(),
                    pipeline: false,
                    trailer: true,
                })
            });

        self.in_flight.release();
        if sent.is_err() {
            trace!(stream_id = self.stream_id, "reader gone before response");
        }
        sent.map_err(|_| TransportError::Closed)
    }
}

impl Drop for MemSink {
    fn drop(&mut self) {
        self.in_flight.release();
    }
}

/// Server end of an in-memory link.
#[derive(Debug)]
pub struct MemListener {
    accept_rx: mpsc::UnboundedReceiver<(RawRequest, SharedSink)>,
}

#[async_trait]
impl ServerTransport for MemListener {
    async fn accept(&mut self) -> Option<(RawRequest, SharedSink)> {
        self.accept_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(path: &str) -> RequestHead {
        RequestHead {
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (connector, mut listener) = link();
        let (sender, mut reader) = connector
            .connect(&ClientSettings::default())
            .await
            .unwrap();

        let id = sender
            .send_request(head("/svc/Method"), Bytes::from_static(b"body"), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 1);

        let (request, sink) = listener.accept().await.unwrap();
        assert_eq!(request.path, "/svc/Method");
        assert_eq!(&request.body[..], b"body");

        sink.send_headers(HeaderMap::new()).await.unwrap();
        sink.finish(Bytes::from_static(b"reply"), HeaderMap::new())
            .await
            .unwrap();

        let data = reader.read().await.unwrap().unwrap();
        assert_eq!(data.stream_id, 1);
        assert_eq!(&data.data[..], b"reply");
        assert!(!data.trailer);

        let trailer = reader.read().await.unwrap().unwrap();
        assert_eq!(trailer.stream_id, 1);
        assert!(trailer.trailer);
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_unique() {
        let (connector, _listener) = link();
        let (sender, _reader) = connector
            .connect(&ClientSettings::default())
            .await
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let id = sender
                .send_request(head("/svc/M"), Bytes::new(), true)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(id % 2, 1);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn stream_capacity_is_retryable_not_fatal() {
        let (connector, mut listener) = link();
        let settings = ClientSettings {
            max_concurrent_streams: 1,
            ..Default::default()
        };
        let (sender, _reader) = connector.connect(&settings).await.unwrap();

        let first = sender
            .send_request(head("/svc/M"), Bytes::new(), true)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = sender
            .send_request(head("/svc/M"), Bytes::new(), true)
            .await
            .unwrap();
        assert!(second.is_none());

        // finishing the first response frees the slot
        let (_request, sink) = listener.accept().await.unwrap();
        sink.finish(Bytes::new(), HeaderMap::new()).await.unwrap();

        let third = sender
            .send_request(head("/svc/M"), Bytes::new(), true)
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn buffered_client_streaming_delivers_on_end() {
        let (connector, mut listener) = link();
        let (sender, _reader) = connector
            .connect(&ClientSettings::default())
            .await
            .unwrap();

        let id = sender
            .send_request(head("/svc/M"), Bytes::from_static(b"one"), false)
            .await
            .unwrap()
            .unwrap();
        sender
            .write(id, Bytes::from_static(b"two"), true)
            .await
            .unwrap();

        let (request, _sink) = listener.accept().await.unwrap();
        assert_eq!(&request.body[..], b"onetwo");
    }
}
