//! A bounded pool of client connections.
//!
//! The pool lazily opens connections through a [`ClientFactory`] up to a
//! fixed capacity. `get` hands out an idle connection or builds a fresh one;
//! once the capacity is in use, further `get` calls wait until a connection
//! is returned with `put`. Closing the pool wakes every waiter with
//! [`PoolError::Closed`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::client::Client;
use crate::error::{ClientError, PoolError};
use crate::transport::{ClientSettings, ClientTransport};

/// Builds one client connection on demand.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    async fn make(&self) -> Result<Client, ClientError>;
}

/// The default factory: connects a fresh transport with fixed settings.
#[derive(Debug)]
pub struct TransportFactory<T> {
    transport: T,
    settings: ClientSettings,
}

impl<T> TransportFactory<T> {
    pub fn new(transport: T, settings: ClientSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }
}

#[async_trait]
impl<T> ClientFactory for TransportFactory<T>
where
    T: ClientTransport + Clone + Send + Sync + 'static,
{
    async fn make(&self) -> Result<Client, ClientError> {
        Client::connect(self.transport.clone(), self.settings.clone()).await
    }
}

/// A bounded, lazily filled pool of [`Client`] connections.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    factory: Box<dyn ClientFactory>,
    /// One permit per pool slot; a checked-out connection holds its permit
    /// implicitly (the permit is forgotten on `get` and restored on `put`).
    permits: Semaphore,
    idle: Mutex<Vec<Client>>,
    capacity: usize,
    closed: AtomicBool,
}

impl ClientPool {
    /// Create a pool of `capacity` slots over `factory`.
    pub fn new(factory: impl ClientFactory, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                permits: Semaphore::new(capacity),
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a pool whose connections share one transport and settings.
    pub fn over<T>(transport: T, settings: ClientSettings, capacity: usize) -> Self
    where
        T: ClientTransport + Clone + Send + Sync + 'static,
    {
        Self::new(TransportFactory::new(transport, settings), capacity)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Check out a connection, waiting for a free slot if the pool is at
    /// capacity.
    ///
    /// An idle connection that was closed behind the pool's back is discarded
    /// and replaced rather than handed out.
    pub async fn get(&self) -> Result<Client, PoolError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        permit.forget();

        loop {
            let idle = self.inner.idle.lock().unwrap().pop();
            match idle {
                Some(client) if !client.is_closed() => return Ok(client),
                Some(stale) => {
                    debug!("discarding closed pooled connection");
                    stale.close().await;
                }
                None => break,
            }
        }

        match self.inner.factory.make().await {
            Ok(client) => Ok(client),
            Err(err) => {
                // the slot stays usable for the next caller
                self.inner.permits.add_permits(1);
                Err(err.into())
            }
        }
    }

    /// Return a connection to the pool, freeing its slot.
    pub async fn put(&self, client: Client) {
        if self.inner.closed.load(Ordering::Acquire) || client.is_closed() {
            client.close().await;
            if !self.inner.closed.load(Ordering::Acquire) {
                self.inner.permits.add_permits(1);
            }
            return;
        }
        self.inner.idle.lock().unwrap().push(client);
        self.inner.permits.add_permits(1);
    }

    /// Close the pool and every idle connection. Waiters in `get` fail with
    /// [`PoolError::Closed`]. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock().unwrap());
        for client in idle {
            client.close().await;
        }
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.inner.idle.lock().unwrap().len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}
