//! Service registration and dispatch.
//!
//! A [`ServiceContainer`] is an explicit table built at startup: every method
//! a service exposes is registered by name together with a typed handler, and
//! dispatch is a plain map lookup. Nothing is discovered at call time; a path
//! that was never registered answers `NOT_FOUND`.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use tracing::debug;

use crate::codec::{self, Encoding};
use crate::{Context, Status};

/// A service with a statically known package-qualified name,
/// e.g. `helloworld.Greeter`.
pub trait NamedService {
    const NAME: &'static str;
}

type BoxedHandler = Arc<
    dyn Fn(Context, Encoding, Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes, Status>> + Send>>
        + Send
        + Sync,
>;

/// One service's method table.
pub struct ServiceContainer {
    name: String,
    methods: HashMap<String, BoxedHandler>,
}

impl ServiceContainer {
    /// Start a table for the service called `name` (no leading slash).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Start a table for a [`NamedService`].
    pub fn of<S: NamedService>() -> Self {
        Self::new(S::NAME)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `handler` under `method`.
    ///
    /// The request and response types fix the codecs at registration time;
    /// the encoding actually used is negotiated per call from the request's
    /// content-type. A handler reports failure by returning a [`Status`],
    /// which is packed into the response trailers verbatim.
    pub fn method<Req, Res, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: prost::Message + serde::de::DeserializeOwned + Default + Send + 'static,
        Res: prost::Message + serde::Serialize + Default + Send + 'static,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: BoxedHandler = Arc::new(move |ctx, encoding, payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = codec::decode_message(encoding, payload)?;
                let response = handler(ctx, request).await?;
                codec::encode_message(encoding, &response)
            })
        });
        if self.methods.insert(method.to_owned(), erased).is_some() {
            debug!(service = %self.name, method, "method registration replaced");
        }
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Dispatch one call. The payload is the deframed message body.
    pub async fn invoke(
        &self,
        method: &str,
        ctx: Context,
        encoding: Encoding,
        payload: Bytes,
    ) -> Result<Bytes, Status> {
        let handler = self.methods.get(method).ok_or_else(|| {
            Status::not_found(format!("method /{}/{} is not registered", self.name, method))
        })?;
        handler(ctx, encoding, payload).await
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("ServiceContainer")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

/// All services a server dispatches to, keyed by service name.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, ServiceContainer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, container: ServiceContainer) {
        if self
            .services
            .insert(container.name().to_owned(), container)
            .is_some()
        {
            debug!("service registration replaced");
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceContainer> {
        self.services.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Dispatch one call to the named service and method.
    pub async fn execute(
        &self,
        service: &str,
        method: &str,
        ctx: Context,
        encoding: Encoding,
        payload: Bytes,
    ) -> Result<Bytes, Status> {
        let container = self
            .services
            .get(service)
            .ok_or_else(|| Status::not_found(format!("service {service} is not registered")))?;
        container.invoke(method, ctx, encoding, payload).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("services", &names).finish()
    }
}
