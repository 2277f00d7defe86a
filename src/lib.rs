//! A gRPC protocol engine over an abstract HTTP/2-like transport.
//!
//! `tenor` implements the gRPC request/response semantics — message framing,
//! status trailers, content-type negotiation, multiplexed client streams and
//! a server dispatch pipeline — without binding to a concrete network stack.
//! The transport is a capability handed in by the host: anything that can
//! open multiplexed streams on the client side and deliver complete requests
//! with a response sink on the server side. An in-memory implementation ships
//! in [`transport::mem`] for tests and loopback setups.
//!
//! # Client
//!
//! A [`Client`] multiplexes any number of concurrent calls over one
//! connection. A background task routes response frames by stream id;
//! callers interact through `send`/`recv` or the [`Client::unary`]
//! convenience. [`client::pool::ClientPool`] bounds a set of connections
//! behind `get`/`put`.
//!
//! # Server
//!
//! A [`server::Server`] dispatches `/<service>/<method>` paths through an
//! explicit registration table ([`server::service::ServiceContainer`]),
//! wrapped in an interceptor chain with explicit continuations
//! ([`server::interceptor::Next`]). Handlers are plain async functions from
//! a [`Context`] and a decoded request to a `Result<Response, Status>`;
//! server-streaming handlers push additional messages via [`server::Server::push`].
//!
//! # Encodings
//!
//! Payloads are protobuf (`application/grpc+proto`, via `prost`) or JSON
//! (`application/grpc+json`, via `serde_json`), negotiated per call from the
//! request's `content-type` header.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod framing;
pub mod server;
pub mod transport;

mod context;
mod error;
mod status;

pub use crate::client::{pool::ClientPool, Client};
pub use crate::codec::Encoding;
pub use crate::context::Context;
pub use crate::error::{ClientError, PoolError};
pub use crate::server::interceptor::{Interceptor, Next};
pub use crate::server::service::{NamedService, ServiceContainer};
pub use crate::server::Server;
pub use crate::status::{Code, Status};
