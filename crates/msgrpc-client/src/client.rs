use msgrpc_common::completion::{CompletionHandle, HandleOwner};
use msgrpc_common::{MsgRpcError, Result};
use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

use crate::pool::{ConnectionPool, PoolConfig, PooledTransport};

/// MessagePack-RPC client for one server address.
///
/// Calls borrow a connection from the pool for the duration of the exchange,
/// so up to `max_connections` calls run in parallel. Clones share the pool.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    pool: ConnectionPool,
    owner: HandleOwner,
    runtime: Handle,
}

/// An outstanding call started with [`RpcClient::begin_call`].
///
/// Holds the connection until the call is finished.
#[derive(Debug)]
pub struct PendingCall {
    handle: CompletionHandle<Value>,
    _transport: PooledTransport,
}

impl PendingCall {
    pub fn handle(&self) -> &CompletionHandle<Value> {
        &self.handle
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }
}

impl RpcClient {
    /// Creates a client for `addr`.
    ///
    /// Succeeds even if the server is unreachable; connections are opened on
    /// first use.
    pub async fn new(addr: impl Into<String>, config: impl Into<PoolConfig>) -> Result<Self> {
        Ok(Self {
            addr: addr.into(),
            pool: ConnectionPool::new(config.into())?,
            owner: HandleOwner::new(),
            runtime: Handle::current(),
        })
    }

    /// Creates a client and opens `min_connections` connections up front.
    pub async fn connect(addr: impl Into<String>, config: impl Into<PoolConfig>) -> Result<Self> {
        let client = Self::new(addr, config).await?;
        client.pool.warm(&client.addr).await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Calls `method` and waits for the result.
    ///
    /// # Errors
    ///
    /// - `MsgRpcError::Remote` if the server answered with an error
    /// - `MsgRpcError::Timeout` if the execution timeout elapsed
    /// - pool and transport errors otherwise
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let transport = self.pool.acquire(&self.addr).await?;
        let handle = transport.begin_call(self.owner, method, params)?;
        let outcome = handle.finish(self.owner).await;
        drop(transport);
        outcome
    }

    /// Calls `method` and deserializes the result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let value = self.call(method, params).await?;
        rmpv::ext::from_value(value).map_err(|e| MsgRpcError::Encode(e.to_string()))
    }

    /// Sends a notification; resolves once it has been written.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let transport = self.pool.acquire(&self.addr).await?;
        transport.notify(method, params).await
    }

    /// Starts a call without waiting for it.
    pub async fn begin_call(&self, method: &str, params: Vec<Value>) -> Result<PendingCall> {
        let transport = self.pool.acquire(&self.addr).await?;
        let handle = transport.begin_call(self.owner, method, params)?;
        Ok(PendingCall {
            handle,
            _transport: transport,
        })
    }

    /// Waits for a call started with [`RpcClient::begin_call`].
    ///
    /// # Errors
    ///
    /// `MsgRpcError::Handle` if `call` was started by another client.
    pub async fn end_call(&self, call: PendingCall) -> Result<Value> {
        call.handle.finish(self.owner).await
    }

    /// Blocking form of [`RpcClient::call`].
    ///
    /// Parks the calling thread on the completion handle. Must not be called
    /// from an async context; use it from plain threads or
    /// `tokio::task::spawn_blocking`.
    pub fn call_blocking(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let transport = self.runtime.block_on(self.pool.acquire(&self.addr))?;
        let handle = transport.begin_call(self.owner, method, params)?;
        transport.end_call(&handle, self.owner)
    }
}
