//! Server transport manager.
//!
//! Owns the listening socket and every live [`ServerSession`]. The pool of
//! session contexts doubles as the connection limit: each accept loop
//! borrows a context before it accepts, so at most `max_connections`
//! sessions exist at once and further peers wait in the listen backlog.
//!
//! # Shutdown
//!
//! [`ServerTransportManager::shutdown`] stops accepting, asks every session
//! to drain and waits until the last one has closed.
//! [`ServerTransportManager::dispose`] resets every connection instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use msgrpc_common::codec::{FrameParser, ParserRole};
use msgrpc_common::config::TransportConfig;
use msgrpc_common::context::{SendContext, SessionContext};
use msgrpc_common::pool::{ObjectPool, PoolStats, Pooled};
use msgrpc_common::watchdog::TimeoutWatchdog;
use msgrpc_common::{MsgRpcError, Result};
use msgrpc_metrics::MetricsRegistry;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;
use crate::session::{ServerSession, SessionShared};

/// Back-off after a failed `accept`, so a persistent error (e.g. EMFILE)
/// does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Resolves `addr` and binds the first address that works, trying the
/// preferred IP version first.
///
/// # Errors
///
/// `MsgRpcError::Transport` if the address does not resolve or no resolved
/// address can be bound.
pub async fn bind_listener(addr: impl ToSocketAddrs, config: &TransportConfig) -> Result<TcpListener> {
    let resolved: Vec<SocketAddr> = lookup_host(addr)
        .await
        .map_err(|e| MsgRpcError::Transport(format!("Failed to resolve listen address: {}", e)))?
        .collect();
    let candidates = config.preferred_ip_version.order(resolved);

    let mut last_error = None;
    for candidate in candidates {
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(addr = %candidate, error = %e, "bind failed");
                last_error = Some(e);
            }
        }
    }
    Err(MsgRpcError::Transport(match last_error {
        Some(e) => format!("Failed to bind: {}", e),
        None => "Listen address resolved to nothing".to_string(),
    }))
}

struct ManagerInner {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: TransportConfig,
    shared: Arc<SessionShared>,
    connections: ObjectPool<SessionContext>,
    sessions: Mutex<HashMap<u64, Arc<ServerSession>>>,
    next_session: AtomicU64,
    started: AtomicBool,
    stop_accepting: watch::Sender<bool>,
    drained: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Accepts connections and tracks their sessions.
#[derive(Clone)]
pub struct ServerTransportManager {
    inner: Arc<ManagerInner>,
}

impl ServerTransportManager {
    /// Binds a listener and builds a manager around it.
    ///
    /// The manager does not accept connections until
    /// [`ServerTransportManager::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no address can
    /// be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: TransportConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(addr, &config).await?;
        Self::from_listener(listener, config, dispatcher, metrics)
    }

    /// Builds a manager around an already bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: TransportConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = listener.local_addr()?;

        let limits = config.parser_limits();
        let shared = Arc::new(SessionShared {
            dispatcher,
            parsers: ObjectPool::new("request_contexts", config.context_limits(), move || {
                FrameParser::new(ParserRole::Server, limits)
            }),
            send_contexts: ObjectPool::new("response_contexts", config.context_limits(), SendContext::new),
            watchdog: TimeoutWatchdog::new(config.timeout_budgets(), config.watchdog_interval),
            config: config.clone(),
            metrics,
        });
        let connections = ObjectPool::new("session_contexts", config.connection_limits(), SessionContext::new);

        Ok(ServerTransportManager {
            inner: Arc::new(ManagerInner {
                listener,
                local_addr,
                config,
                shared,
                connections,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stop_accepting: watch::channel(false).0,
                drained: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawns the accept loops and the timeout watchdog. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        tasks.push(self.inner.shared.watchdog.spawn());
        for _ in 0..self.inner.config.accept_concurrency {
            let stop = self.inner.stop_accepting.subscribe();
            tasks.push(tokio::spawn(accept_loop(self.inner.clone(), stop)));
        }
        tracing::info!(
            addr = %self.inner.local_addr,
            accept_concurrency = self.inner.config.accept_concurrency,
            max_connections = self.inner.config.max_connections,
            "server listening"
        );
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.shared.metrics
    }

    /// Number of sessions not yet closed.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    /// Counters of the pooled request contexts (frame parsers).
    pub fn request_context_stats(&self) -> PoolStats {
        self.inner.shared.parsers.stats()
    }

    /// Counters of the pooled response contexts (encode buffers).
    pub fn response_context_stats(&self) -> PoolStats {
        self.inner.shared.send_contexts.stats()
    }

    /// Counters of the session contexts. `borrowed` counts live sessions
    /// plus accept loops already holding a slot for the next connection.
    pub fn session_context_stats(&self) -> PoolStats {
        self.inner.connections.stats()
    }

    /// Stops accepting, drains every session and waits until all are closed.
    pub async fn shutdown(&self) {
        self.stop_accepting();
        let sessions = self.sessions();
        tracing::info!(sessions = sessions.len(), "shutting down transport manager");
        for session in sessions {
            session.shutdown();
        }
        self.wait_drained().await;
        self.inner.connections.close();
        tracing::info!("transport manager shut down");
    }

    /// Like [`ServerTransportManager::shutdown`], but resets whatever is
    /// still open after `timeout`.
    ///
    /// # Returns
    ///
    /// `true` if every session drained in time.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.shutdown()).await.is_ok() {
            return true;
        }
        tracing::warn!(
            remaining = self.active_sessions(),
            "graceful shutdown timed out, resetting sessions"
        );
        self.dispose();
        false
    }

    /// Stops accepting and resets every connection.
    pub fn dispose(&self) {
        self.stop_accepting();
        for session in self.sessions() {
            session.reset();
        }
        self.inner.connections.close();
    }

    fn stop_accepting(&self) {
        if !self.inner.stop_accepting.send_replace(true) {
            tracing::debug!(addr = %self.inner.local_addr, "stopped accepting");
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.sessions.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ServerTransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransportManager")
            .field("local_addr", &self.inner.local_addr)
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

impl ManagerInner {
    fn open_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, slot: Pooled<SessionContext>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (session, queue) = ServerSession::new(id, peer, self.shared.clone());
        self.sessions.lock().insert(id, session.clone());
        self.shared.metrics.record_session_opened();
        tracing::info!(session = id, peer = %peer, "accepted connection");

        let manager: Weak<ManagerInner> = Arc::downgrade(self);
        session.spawn(stream, slot, queue, move |id| {
            if let Some(manager) = manager.upgrade() {
                manager.release(id);
            }
        });

        // raced with shutdown: drain it like the others
        if *self.stop_accepting.borrow() {
            session.shutdown();
        }
    }

    fn release(&self, id: u64) {
        let remaining = {
            let mut sessions = self.sessions.lock();
            if sessions.remove(&id).is_none() {
                return;
            }
            sessions.len()
        };
        self.shared.metrics.record_session_closed();
        tracing::debug!(session = id, remaining, "session released");
        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }
}

async fn accept_loop(inner: Arc<ManagerInner>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let slot = tokio::select! {
            biased;
            _ = stop.changed() => continue,
            slot = inner.connections.acquire() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            biased;
            _ = stop.changed() => continue,
            accepted = inner.listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => inner.open_session(stream, peer, slot),
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                drop(slot);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MethodRegistry;
    use msgrpc_common::config::IpVersion;

    fn dispatcher() -> Arc<dyn Dispatcher> {
        Arc::new(MethodRegistry::new())
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let manager = ServerTransportManager::bind(
            "127.0.0.1:0",
            TransportConfig::default(),
            dispatcher(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();
        assert_ne!(manager.local_addr().port(), 0);
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = TransportConfig::default().with_connections(5, 1);
        let result = ServerTransportManager::bind(
            "127.0.0.1:0",
            config,
            dispatcher(),
            Arc::new(MetricsRegistry::new()),
        )
        .await;
        assert!(matches!(result, Err(MsgRpcError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_listener_prefers_ip_version() {
        let config = TransportConfig::default().with_preferred_ip_version(IpVersion::V4);
        let listener = bind_listener("localhost:0", &config).await.unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn test_shutdown_without_sessions() {
        let manager = ServerTransportManager::bind(
            "127.0.0.1:0",
            TransportConfig::default(),
            dispatcher(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();
        manager.start();
        assert!(manager.shutdown_timeout(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_accepts_and_releases_session() {
        let manager = ServerTransportManager::bind(
            "127.0.0.1:0",
            TransportConfig::default(),
            dispatcher(),
            Arc::new(MetricsRegistry::new()),
        )
        .await
        .unwrap();
        manager.start();

        let stream = TcpStream::connect(manager.local_addr()).await.unwrap();
        for _ in 0..100 {
            if manager.active_sessions() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_sessions(), 1);

        drop(stream);
        assert!(manager.shutdown_timeout(Duration::from_secs(2)).await);
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.metrics().snapshot().transport.accepted_sessions, 1);
    }
}
