//! The server: accept loop, request pipeline, and streamed pushes.
//!
//! Every accepted request runs through the same pipeline in its own task:
//! validate the gRPC request headers, route `/<service>/<method>`, build the
//! request [`Context`], run the interceptor chain, dispatch through the
//! registration table, and pack the response. The response is always
//! well-formed gRPC: recognized failures travel as `grpc-status` /
//! `grpc-message` trailers, and one failed request never takes down the
//! accept loop.

pub mod interceptor;
pub mod service;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, TE};
use tracing::{debug, info, warn};

use crate::codec::{self, Encoding};
use crate::framing;
use crate::server::interceptor::{CallInfo, CallTarget, Interceptor, Next};
use crate::server::service::{Registry, ServiceContainer};
use crate::transport::{RawRequest, ServerTransport, SharedSink};
use crate::{Context, Status};

const TRAILER_HEADER: &str = "trailer";
const DECLARED_TRAILERS: &str = "grpc-status, grpc-message";

/// Peer description of the current request, available from the [`Context`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub String);

/// A gRPC server over an abstract transport.
///
/// Configured builder-style, then driven by [`Server::serve`]:
///
/// ```no_run
/// # use tenor::server::{Server, service::ServiceContainer};
/// # async fn run(listener: tenor::transport::mem::MemListener) {
/// let greeter = ServiceContainer::new("helloworld.Greeter");
/// Server::new().register(greeter).serve(listener).await;
/// # }
/// ```
#[derive(Default)]
pub struct Server {
    registry: Registry,
    interceptors: Vec<Arc<dyn Interceptor>>,
    worker_ctx: Context,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service's method table.
    pub fn register(mut self, container: ServiceContainer) -> Self {
        self.registry.register(container);
        self
    }

    /// Append an interceptor; interceptors run in registration order.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Install a server-scoped value visible to every request's context.
    pub fn with_worker_context<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.worker_ctx = self.worker_ctx.with_value(value);
        self
    }

    /// Accept and serve requests until the transport shuts down.
    pub async fn serve<T: ServerTransport>(self, mut transport: T) {
        info!(
            services = self.registry.len(),
            interceptors = self.interceptors.len(),
            "server accepting requests"
        );
        let shared = Arc::new(self);
        while let Some((request, sink)) = transport.accept().await {
            let server = shared.clone();
            tokio::spawn(async move {
                server.process(request, sink).await;
            });
        }
        debug!("server transport closed, accept loop ending");
    }

    /// Push one streamed message on the response stream of the request that
    /// produced `ctx`. The request's negotiated encoding applies.
    pub async fn push<M>(ctx: &Context, message: &M) -> Result<(), Status>
    where
        M: prost::Message + serde::Serialize + Default + Send + 'static,
    {
        let writer = ctx
            .value::<ResponseWriter>()
            .ok_or_else(|| Status::internal("context carries no response stream"))?;
        writer.push(message).await
    }

    /// Run the full pipeline for one inbound request.
    async fn process(&self, request: RawRequest, sink: SharedSink) {
        let encoding = negotiated_encoding(&request.headers);

        let outcome = match self.validate_and_route(&request) {
            Ok((encoding, call)) => {
                let ctx = self
                    .worker_ctx
                    .with_value(encoding)
                    .with_value(PeerAddr(request.peer.clone()))
                    .with_value(ResponseWriter::new(sink.clone(), encoding));
                let target = DispatchTarget {
                    registry: &self.registry,
                    encoding,
                };
                Next::new(&self.interceptors, &target)
                    .run(&call, ctx, request.body)
                    .await
            }
            Err(status) => Err(status),
        };

        if let Err(status) = outcome.as_ref() {
            debug!(
                path = %request.path,
                peer = %request.peer,
                code = ?status.code(),
                "request failed: {}",
                status.message()
            );
        }
        if let Err(err) = write_response(&sink, encoding, outcome).await {
            warn!(stream_id = request.stream_id, "response write failed: {err}");
        }
    }

    /// Steps 1 and 2: request header validation and routing. The handler is
    /// never reached when either fails.
    fn validate_and_route(&self, request: &RawRequest) -> Result<(Encoding, CallInfo), Status> {
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Status::internal("request carries no content-type header"))?;
        let encoding = Encoding::from_content_type(content_type).ok_or_else(|| {
            Status::internal(format!("unsupported content-type {content_type}"))
        })?;

        let te = request
            .headers
            .get(TE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Status::internal("request carries no te header"))?;
        if te != "trailers" {
            return Err(Status::internal(format!("unsupported te header {te}")));
        }

        let (service, method) = split_path(&request.path)
            .ok_or_else(|| Status::not_found(format!("malformed path {}", request.path)))?;
        if self.registry.service(service).is_none() {
            return Err(Status::not_found(format!(
                "service {service} is not registered"
            )));
        }

        Ok((
            encoding,
            CallInfo {
                service: service.to_owned(),
                method: method.to_owned(),
                peer: request.peer.clone(),
                stream_id: request.stream_id,
            },
        ))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("registry", &self.registry)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Terminal chain step: deframe, look up the registered handler, dispatch.
struct DispatchTarget<'a> {
    registry: &'a Registry,
    encoding: Encoding,
}

#[async_trait]
impl CallTarget for DispatchTarget<'_> {
    async fn call(&self, call: &CallInfo, ctx: Context, payload: Bytes) -> Result<Bytes, Status> {
        let message = framing::decode(payload)?;
        self.registry
            .execute(&call.service, &call.method, ctx, self.encoding, message)
            .await
    }
}

/// Handle for pushing streamed messages on one request's response stream.
///
/// Installed into the request [`Context`]; handlers usually reach it through
/// [`Server::push`]. The handler's own loop controls cadence and termination:
/// the stream ends when the handler returns and the terminal response is
/// packed.
#[derive(Clone)]
pub struct ResponseWriter {
    sink: SharedSink,
    encoding: Encoding,
    headers: HeaderMap,
}

impl ResponseWriter {
    fn new(sink: SharedSink, encoding: Encoding) -> Self {
        Self {
            sink,
            encoding,
            headers: response_headers(encoding),
        }
    }

    /// Frame and write one message on the still-open response stream.
    pub async fn push<M>(&self, message: &M) -> Result<(), Status>
    where
        M: prost::Message + serde::Serialize + Default + Send + 'static,
    {
        let payload = codec::encode_message(self.encoding, message)?;
        let framed = framing::encode(&payload)?;

        // first call wins, so pushing before the pack step is safe
        self.sink
            .send_headers(self.headers.clone())
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;
        self.sink
            .write_data(framed)
            .await
            .map_err(|err| Status::unavailable(err.to_string()))
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn negotiated_encoding(headers: &HeaderMap) -> Encoding {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(Encoding::from_content_type)
        .unwrap_or_default()
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.strip_prefix('/')?.splitn(2, '/');
    let service = parts.next().filter(|s| !s.is_empty())?;
    let method = parts.next().filter(|m| !m.is_empty() && !m.contains('/'))?;
    Some((service, method))
}

fn response_headers(encoding: Encoding) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(2);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(encoding.to_content_type()),
    );
    headers.insert(TRAILER_HEADER, HeaderValue::from_static(DECLARED_TRAILERS));
    headers
}

/// Step 6: pack and send the terminal response. Always well-formed — an OK
/// status with the framed payload, or the carried status with an empty body.
async fn write_response(
    sink: &SharedSink,
    encoding: Encoding,
    outcome: Result<Bytes, Status>,
) -> Result<(), crate::transport::TransportError> {
    let (payload, status) = match outcome {
        Ok(payload) => (payload, Status::ok("")),
        Err(status) => (Bytes::new(), status),
    };

    let framed = match framing::encode(&payload) {
        Ok(framed) => framed,
        // oversize reply: drop the body, report the failure in trailers
        Err(err) => return write_status_only(sink, encoding, err.into()).await,
    };

    sink.send_headers(response_headers(encoding)).await?;
    sink.finish(framed, status_trailers(&status)).await
}

async fn write_status_only(
    sink: &SharedSink,
    encoding: Encoding,
    status: Status,
) -> Result<(), crate::transport::TransportError> {
    let empty = framing::encode(&[]).unwrap_or_default();
    sink.send_headers(response_headers(encoding)).await?;
    sink.finish(empty, status_trailers(&status)).await
}

fn status_trailers(status: &Status) -> HeaderMap {
    status.to_header_map().unwrap_or_else(|fallback| {
        // unencodable grpc-message: keep the code, drop the message
        let mut map = HeaderMap::with_capacity(1);
        map.insert(
            crate::status::GRPC_STATUS_HEADER,
            fallback.code().to_header_value(),
        );
        map
    })
}
