use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use msgrpc_common::config::TransportConfig;
use msgrpc_common::{MsgRpcError, Result};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::transport::ClientTransport;

/// Connection pool configuration.
///
/// # Fields
///
/// - `transport`: options applied to every connection the pool opens; its
///   `min_connections` and `max_connections` bound each endpoint
/// - `acquire_timeout_ms`: maximum time in milliseconds to wait for a
///   connection
///
/// # Default Configuration
///
/// The default transport options with a 30 second acquire timeout.
///
/// # Example
///
/// ```rust
/// use msgrpc_client::PoolConfig;
/// use msgrpc_common::config::TransportConfig;
///
/// let config = PoolConfig {
///     transport: TransportConfig::default().with_connections(2, 8),
///     acquire_timeout_ms: 5_000,
/// };
/// assert_eq!(config.transport.max_connections, 8);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub transport: TransportConfig,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            acquire_timeout_ms: 30_000,
        }
    }
}

impl From<TransportConfig> for PoolConfig {
    fn from(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }
}

/// Idle connections and the checkout limit of one address.
struct Endpoint {
    addr: String,
    idle: Mutex<Vec<ClientTransport>>,
    permits: Arc<Semaphore>,
}

impl Endpoint {
    /// Pops the most recently returned connection that still accepts calls.
    fn pop_usable(&self) -> Option<ClientTransport> {
        let mut idle = self.idle.lock();
        while let Some(transport) = idle.pop() {
            if !transport.is_shutting_down() {
                return Some(transport);
            }
            tracing::debug!(addr = %self.addr, "discarding closed pooled connection");
        }
        None
    }
}

struct PoolInner {
    config: PoolConfig,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    closed: AtomicBool,
}

/// Pool of client transports, grouped by target address.
///
/// # Architecture
///
/// - Each address keeps a LIFO stack of idle transports
/// - At most `max_connections` transports per address are checked out at
///   once; further acquirers wait up to the acquire timeout
/// - Transports that have begun shutting down are discarded on release and
///   skipped on acquire
///
/// # Example
///
/// ```rust,no_run
/// use msgrpc_client::{ConnectionPool, PoolConfig};
/// use rmpv::Value;
///
/// # async fn example() -> msgrpc_common::Result<()> {
/// let pool = ConnectionPool::new(PoolConfig::default())?;
/// let transport = pool.acquire("127.0.0.1:18800").await?;
/// transport.call("ping", vec![]).await?;
/// // dropping the guard returns the connection to the pool
/// drop(transport);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool.
    ///
    /// # Errors
    ///
    /// Returns `MsgRpcError::Config` if the transport options are invalid.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.transport.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                endpoints: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn endpoint(&self, addr: &str) -> Arc<Endpoint> {
        let mut endpoints = self.inner.endpoints.lock();
        endpoints
            .entry(addr.to_owned())
            .or_insert_with(|| {
                Arc::new(Endpoint {
                    addr: addr.to_owned(),
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.inner.config.transport.max_connections)),
                })
            })
            .clone()
    }

    /// Acquires a connection to `addr`, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// - `MsgRpcError::PoolTimeout` if no connection became available within
    ///   the acquire timeout
    /// - `MsgRpcError::PoolClosed` if the pool was closed
    /// - connection errors when a new transport had to be opened
    pub async fn acquire(&self, addr: &str) -> Result<PooledTransport> {
        if self.is_closed() {
            return Err(MsgRpcError::PoolClosed);
        }
        let endpoint = self.endpoint(addr);
        let timeout = Duration::from_millis(self.inner.config.acquire_timeout_ms);

        let acquired = tokio::time::timeout(timeout, async {
            let permit = endpoint
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| MsgRpcError::PoolClosed)?;
            let transport = match endpoint.pop_usable() {
                Some(transport) => transport,
                None => {
                    tracing::debug!(addr, "opening pooled connection");
                    ClientTransport::connect(addr, self.inner.config.transport.clone()).await?
                }
            };
            Ok::<_, MsgRpcError>((transport, permit))
        })
        .await;

        match acquired {
            Ok(Ok((transport, permit))) => Ok(PooledTransport {
                transport: Some(transport),
                endpoint,
                _permit: permit,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MsgRpcError::PoolTimeout(self.inner.config.acquire_timeout_ms)),
        }
    }

    /// Opens connections to `addr` until `min_connections` are idle.
    ///
    /// # Returns
    ///
    /// The number of connections opened.
    pub async fn warm(&self, addr: &str) -> Result<usize> {
        let endpoint = self.endpoint(addr);
        let target = self.inner.config.transport.min_connections;
        let mut opened = 0;
        while endpoint.idle.lock().len() < target {
            let transport = ClientTransport::connect(addr, self.inner.config.transport.clone()).await?;
            endpoint.idle.lock().push(transport);
            opened += 1;
        }
        if opened > 0 {
            tracing::debug!(addr, opened, "pool warmed");
        }
        Ok(opened)
    }

    /// Idle connections currently pooled for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        let endpoints = self.inner.endpoints.lock();
        endpoints
            .get(addr)
            .map(|endpoint| endpoint.idle.lock().len())
            .unwrap_or(0)
    }

    /// Closes the pool: pending and future acquisitions fail and idle
    /// connections are shut down gracefully.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let endpoints: Vec<Arc<Endpoint>> = self.inner.endpoints.lock().drain().map(|(_, e)| e).collect();
        for endpoint in endpoints {
            endpoint.permits.close();
            let idle = std::mem::take(&mut *endpoint.idle.lock());
            tracing::debug!(addr = %endpoint.addr, count = idle.len(), "closing pooled connections");
        }
    }
}

impl ConnectionPool {
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self.inner.endpoints.lock();
        f.debug_struct("ConnectionPool")
            .field("endpoints", &endpoints.keys().collect::<Vec<_>>())
            .field("acquire_timeout_ms", &self.inner.config.acquire_timeout_ms)
            .finish()
    }
}

/// A checked-out transport; returned to its pool on drop.
pub struct PooledTransport {
    transport: Option<ClientTransport>,
    endpoint: Arc<Endpoint>,
    _permit: OwnedSemaphorePermit,
}

impl PooledTransport {
    /// Keeps the connection out of the pool; it shuts down when dropped.
    pub fn discard(mut self) {
        self.transport.take();
    }
}

impl Deref for PooledTransport {
    type Target = ClientTransport;

    fn deref(&self) -> &ClientTransport {
        self.transport
            .as_ref()
            .expect("pooled transport is present until drop")
    }
}

impl Drop for PooledTransport {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if transport.is_shutting_down() || self.endpoint.permits.is_closed() {
            tracing::debug!(addr = %self.endpoint.addr, "dropping unusable connection");
            return;
        }
        self.endpoint.idle.lock().push(transport);
    }
}

impl fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTransport")
            .field("addr", &self.endpoint.addr)
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Accepts connections and holds them open, counting each one.
    async fn counting_listener() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepted)
    }

    /// The listener counts on its own task, so connects are seen a little later.
    async fn wait_for_accepted(accepted: &AtomicUsize, expected: usize) {
        for _ in 0..500 {
            if accepted.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} accepted connections, saw {}",
            expected,
            accepted.load(Ordering::SeqCst)
        );
    }

    fn pool_config(min: usize, max: usize, acquire_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            transport: TransportConfig::default().with_connections(min, max),
            acquire_timeout_ms,
        }
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_pool_rejects_invalid_config() {
        let config = PoolConfig::from(TransportConfig::default().with_max_connections(0));
        assert!(ConnectionPool::new(config).is_err());
    }

    #[tokio::test]
    async fn test_acquire_nonexistent_fails() {
        let pool = ConnectionPool::new(pool_config(0, 2, 1_000)).unwrap();
        assert!(pool.acquire("127.0.0.1:1").await.is_err());
    }

    #[tokio::test]
    async fn test_connection_reuse() {
        let (addr, accepted) = counting_listener().await;
        let pool = ConnectionPool::new(pool_config(0, 2, 1_000)).unwrap();

        let first = pool.acquire(&addr).await.unwrap();
        let local = first.local_addr();
        drop(first);
        assert_eq!(pool.idle_count(&addr), 1);

        let second = pool.acquire(&addr).await.unwrap();
        assert_eq!(second.local_addr(), local);
        wait_for_accepted(&accepted, 1).await;
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_exhausted() {
        let (addr, _) = counting_listener().await;
        let pool = ConnectionPool::new(pool_config(0, 1, 100)).unwrap();

        let _held = pool.acquire(&addr).await.unwrap();
        let err = pool.acquire(&addr).await.unwrap_err();
        assert!(matches!(err, MsgRpcError::PoolTimeout(100)));
    }

    #[tokio::test]
    async fn test_shutting_down_transport_not_reused() {
        let (addr, accepted) = counting_listener().await;
        let pool = ConnectionPool::new(pool_config(0, 2, 1_000)).unwrap();

        let first = pool.acquire(&addr).await.unwrap();
        first.reset();
        drop(first);
        assert_eq!(pool.idle_count(&addr), 0);

        let _second = pool.acquire(&addr).await.unwrap();
        wait_for_accepted(&accepted, 2).await;
    }

    #[tokio::test]
    async fn test_warm_opens_min_connections() {
        let (addr, accepted) = counting_listener().await;
        let pool = ConnectionPool::new(pool_config(3, 4, 1_000)).unwrap();

        assert_eq!(pool.warm(&addr).await.unwrap(), 3);
        assert_eq!(pool.idle_count(&addr), 3);
        assert_eq!(pool.warm(&addr).await.unwrap(), 0);
        wait_for_accepted(&accepted, 3).await;
    }

    #[tokio::test]
    async fn test_close_fails_acquire() {
        let (addr, _) = counting_listener().await;
        let pool = ConnectionPool::new(pool_config(0, 1, 1_000)).unwrap();
        let held = pool.acquire(&addr).await.unwrap();
        pool.close();
        drop(held);
        assert_eq!(pool.idle_count(&addr), 0);
        assert!(matches!(pool.acquire(&addr).await, Err(MsgRpcError::PoolClosed)));
    }
}
