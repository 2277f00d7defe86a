//! The server-side interceptor chain.
//!
//! Interceptors wrap the execution of every routed call. Each interceptor
//! receives an explicit [`Next`] continuation and decides whether to run it;
//! not calling `next` short-circuits the rest of the chain and the handler,
//! and whatever the interceptor returns becomes the response. The chain is an
//! immutable slice walked by value, so one request's position never leaks
//! into another's.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::transport::StreamId;
use crate::{Context, Status};

/// Identity of one inbound call, available to every interceptor.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Package-qualified service name, e.g. `helloworld.Greeter`.
    pub service: String,
    /// Bare method name, e.g. `SayHello`.
    pub method: String,
    /// Peer description as reported by the transport.
    pub peer: String,
    pub stream_id: StreamId,
}

impl CallInfo {
    /// The full request path, `/<service>/<method>`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// A unit of the server's middleware chain.
///
/// Implementations run in registration order. Returning without calling
/// `next.run(..)` skips everything downstream, handler included.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn handle(
        &self,
        call: &CallInfo,
        ctx: Context,
        payload: Bytes,
        next: Next<'_>,
    ) -> Result<Bytes, Status>;
}

/// The terminal step of the chain: decode, dispatch, encode.
#[async_trait]
pub trait CallTarget: Send + Sync {
    async fn call(&self, call: &CallInfo, ctx: Context, payload: Bytes) -> Result<Bytes, Status>;
}

/// Continuation over the remaining interceptors plus the terminal target.
///
/// `Next` is consumed by `run`, so an interceptor can invoke the rest of the
/// chain at most once.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    target: &'a dyn CallTarget,
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.rest.len())
            .finish()
    }
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Arc<dyn Interceptor>], target: &'a dyn CallTarget) -> Self {
        Self { rest, target }
    }

    /// Run the rest of the chain and, at the end of it, the handler.
    pub async fn run(
        self,
        call: &CallInfo,
        ctx: Context,
        payload: Bytes,
    ) -> Result<Bytes, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    rest,
                    target: self.target,
                };
                head.handle(call, ctx, payload, next).await
            }
            None => self.target.call(call, ctx, payload).await,
        }
    }
}

/// Boxed future returned by closure-style interceptors.
pub type InterceptFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, Status>> + Send + 'a>>;

/// Adapter turning a closure into an [`Interceptor`].
///
/// ```
/// # use tenor::server::interceptor::{InterceptorFn, InterceptFuture, Next, CallInfo};
/// # use tenor::{Context, Status};
/// # use bytes::Bytes;
/// # fn constrain<F>(f: F) -> F
/// # where
/// #     F: for<'a> Fn(&'a CallInfo, Context, Bytes, Next<'a>) -> InterceptFuture<'a>,
/// # {
/// #     f
/// # }
/// let tagger = InterceptorFn(constrain(
///     |call: &CallInfo, ctx: Context, payload: Bytes, next: Next<'_>| {
///         Box::pin(async move { next.run(call, ctx, payload).await })
///             as tenor::server::interceptor::InterceptFuture<'_>
///     },
/// ));
/// # let _ = tagger;
/// ```
pub struct InterceptorFn<F>(pub F);

impl<F> std::fmt::Debug for InterceptorFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InterceptorFn")
    }
}

#[async_trait]
impl<F> Interceptor for InterceptorFn<F>
where
    F: for<'a> Fn(&'a CallInfo, Context, Bytes, Next<'a>) -> InterceptFuture<'a>
        + Send
        + Sync
        + 'static,
{
    async fn handle(
        &self,
        call: &CallInfo,
        ctx: Context,
        payload: Bytes,
        next: Next<'_>,
    ) -> Result<Bytes, Status> {
        (self.0)(call, ctx, payload, next).await
    }
}

/// Logs every call with its peer and outcome code.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn handle(
        &self,
        call: &CallInfo,
        ctx: Context,
        payload: Bytes,
        next: Next<'_>,
    ) -> Result<Bytes, Status> {
        let result = next.run(call, ctx, payload).await;
        let code = match &result {
            Ok(_) => crate::Code::Ok,
            Err(status) => status.code(),
        };
        info!(
            peer = %call.peer,
            stream_id = call.stream_id,
            method = %call.path(),
            code = ?code,
            "handled rpc"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn call() -> CallInfo {
        CallInfo {
            service: "test.Svc".into(),
            method: "M".into(),
            peer: "mem:0".into(),
            stream_id: 1,
        }
    }

    struct EchoTarget;

    #[async_trait]
    impl CallTarget for EchoTarget {
        async fn call(
            &self,
            _call: &CallInfo,
            _ctx: Context,
            payload: Bytes,
        ) -> Result<Bytes, Status> {
            Ok(payload)
        }
    }

    struct Recorder {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn handle(
            &self,
            call: &CallInfo,
            ctx: Context,
            payload: Bytes,
            next: Next<'_>,
        ) -> Result<Bytes, Status> {
            self.order.lock().unwrap().push(self.label);
            next.run(call, ctx, payload).await
        }
    }

    struct Refuser;

    #[async_trait]
    impl Interceptor for Refuser {
        async fn handle(
            &self,
            _call: &CallInfo,
            _ctx: Context,
            _payload: Bytes,
            _next: Next<'_>,
        ) -> Result<Bytes, Status> {
            Err(Status::permission_denied("not today"))
        }
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                label: "a",
                order: order.clone(),
            }),
            Arc::new(Recorder {
                label: "b",
                order: order.clone(),
            }),
        ];

        let out = Next::new(&chain, &EchoTarget)
            .run(&call(), Context::new(), Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(&out[..], b"x");
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Refuser),
            Arc::new(Recorder {
                label: "unreached",
                order: order.clone(),
            }),
        ];

        let err = Next::new(&chain, &EchoTarget)
            .run(&call(), Context::new(), Bytes::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), crate::Code::PermissionDenied);
        assert!(order.lock().unwrap().is_empty());
    }

    fn constrain<F>(f: F) -> F
    where
        F: for<'a> Fn(&'a CallInfo, Context, Bytes, Next<'a>) -> InterceptFuture<'a>,
    {
        f
    }

    #[tokio::test]
    async fn closure_interceptor_participates() {
        let tagged = InterceptorFn(constrain(
            |call: &CallInfo, ctx: Context, payload: Bytes, next: Next<'_>| {
                Box::pin(async move {
                    let mut body = payload.to_vec();
                    body.extend_from_slice(b"!");
                    next.run(call, ctx, Bytes::from(body)).await
                }) as InterceptFuture<'_>
            },
        ));
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(tagged)];

        let out = Next::new(&chain, &EchoTarget)
            .run(&call(), Context::new(), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(&out[..], b"hi!");
    }
}
