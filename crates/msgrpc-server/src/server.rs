//! `RpcServer` facade.
//!
//! Wires a [`MethodRegistry`] (or any [`Dispatcher`]), the built-in
//! observability methods, a metrics registry and a
//! [`ServerTransportManager`] together.
//!
//! # Example
//!
//! ```no_run
//! use msgrpc_common::codec::Arguments;
//! use msgrpc_server::RpcServer;
//!
//! # async fn run() -> msgrpc_common::Result<()> {
//! let server = RpcServer::builder()
//!     .method("echo", |mut args: Arguments| async move { args.next_value() })
//!     .bind("127.0.0.1:18000")
//!     .await?;
//! println!("listening on {}", server.local_addr());
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use msgrpc_common::config::TransportConfig;
use msgrpc_common::Result;
use msgrpc_metrics::{MetricsConfig, MetricsRegistry, MetricsSnapshot};
use tokio::net::ToSocketAddrs;

use crate::builtin::BuiltinDispatcher;
use crate::dispatch::{Dispatcher, MethodRegistry, RpcMethod};
use crate::manager::{bind_listener, ServerTransportManager};

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    config: TransportConfig,
    registry: MethodRegistry,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    builtin_methods: bool,
    metrics_config: MetricsConfig,
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self {
            config: TransportConfig::default(),
            registry: MethodRegistry::new(),
            dispatcher: None,
            builtin_methods: true,
            metrics_config: MetricsConfig::default(),
        }
    }
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a method with the built-in registry.
    ///
    /// Ignored if a custom dispatcher is set.
    pub fn method(mut self, name: impl Into<String>, method: impl RpcMethod) -> Self {
        self.registry.register(name, method);
        self
    }

    /// Replaces the method registry with a custom dispatcher.
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Whether `_metrics` and `_info` are answered (default: yes).
    pub fn builtin_methods(mut self, enabled: bool) -> Self {
        self.builtin_methods = enabled;
        self
    }

    pub fn metrics_config(mut self, config: MetricsConfig) -> Self {
        self.metrics_config = config;
        self
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<RpcServer> {
        self.config.validate()?;
        let listener = bind_listener(addr, &self.config).await?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(MetricsRegistry::with_config(self.metrics_config));
        if self.dispatcher.is_some() && !self.registry.is_empty() {
            tracing::warn!("custom dispatcher set; registered methods are ignored");
        }
        let mut dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(self.registry),
        };
        if self.builtin_methods {
            dispatcher = Arc::new(
                BuiltinDispatcher::new(dispatcher, metrics.clone()).with_local_addr(local_addr),
            );
        }

        let manager = ServerTransportManager::from_listener(listener, self.config, dispatcher, metrics)?;
        manager.start();
        Ok(RpcServer { manager })
    }
}

/// A running MessagePack-RPC server.
#[derive(Debug, Clone)]
pub struct RpcServer {
    manager: ServerTransportManager,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.manager.local_addr()
    }

    pub fn manager(&self) -> &ServerTransportManager {
        &self.manager
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.manager.metrics().snapshot()
    }

    pub fn active_sessions(&self) -> usize {
        self.manager.active_sessions()
    }

    /// Stops accepting and drains every session.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }

    /// Drains for at most `timeout`, then resets what is left.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.manager.shutdown_timeout(timeout).await
    }

    /// Resets every connection immediately.
    pub fn dispose(&self) {
        self.manager.dispose()
    }
}
