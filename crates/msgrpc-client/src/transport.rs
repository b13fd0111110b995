//! Client transport session.
//!
//! # Architecture
//!
//! A [`ClientTransport`] owns one TCP connection and multiplexes calls over
//! it. Two tasks drive the socket:
//!
//! - **writer**: drains the outbound queue in order, encoding each frame into
//!   a reused buffer
//! - **reader**: feeds the frame parser and completes pending calls by
//!   message id
//!
//! Each call registers a [`CompletionHandle`] in the pending table before its
//! frame is queued, so a response can never race ahead of its registration.
//! Whoever removes the entry from the table first (the reader, the watchdog
//! or a connection failure) completes the handle; the others find nothing.
//!
//! Dropping the last [`ClientTransport`] starts a graceful shutdown: calls
//! already pending still receive their responses, then the sending half is
//! closed and the transport waits for the server to close its side.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use msgrpc_common::codec::{FrameError, FrameParser, InboundFrame, ParserRole};
use msgrpc_common::completion::{CompletionHandle, HandleOwner};
use msgrpc_common::config::TransportConfig;
use msgrpc_common::context::SendContext;
use msgrpc_common::shutdown::{Drainable, ExchangeGuard, ShutdownSource, ShutdownState};
use msgrpc_common::watchdog::{TimeoutBudgets, TimeoutWatchdog, WatchGuard, WatchPhase, WatchTarget};
use msgrpc_common::{next_message_id, MessageId, MsgRpcError, Response, Result};
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 8 * 1024;

/// Opens a TCP connection, trying resolved addresses in preference order.
pub async fn connect_stream(addr: impl ToSocketAddrs, config: &TransportConfig) -> Result<TcpStream> {
    let resolved: Vec<SocketAddr> = lookup_host(addr).await?.collect();
    let mut last_error = None;
    for candidate in config.preferred_ip_version.order(resolved) {
        match TcpStream::connect(candidate).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(addr = %candidate, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => MsgRpcError::Io(e),
        None => MsgRpcError::Transport("address resolved to nothing".to_string()),
    })
}

enum Outbound {
    Call {
        id: MessageId,
        method: String,
        params: Vec<Value>,
    },
    Notify {
        method: String,
        params: Vec<Value>,
        handle: CompletionHandle<()>,
        exchange: ExchangeGuard<Connection>,
    },
    ShutdownSending,
}

enum ReadEnd {
    Eof,
    Killed,
    Failed(io::Error),
    Protocol(FrameError),
}

struct PendingCall {
    handle: CompletionHandle<Value>,
    _watch: Option<WatchGuard>,
    _exchange: ExchangeGuard<Connection>,
}

struct Connection {
    local: SocketAddr,
    peer: SocketAddr,
    config: TransportConfig,
    state: ShutdownState,
    pending: Mutex<HashMap<MessageId, PendingCall>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    kill: watch::Sender<bool>,
    watchdog: TimeoutWatchdog,
    this: Weak<Connection>,
}

/// One multiplexed connection to a MessagePack-RPC server.
///
/// # Example
///
/// ```no_run
/// use msgrpc_client::ClientTransport;
/// use msgrpc_common::config::TransportConfig;
/// use rmpv::Value;
///
/// # async fn example() -> msgrpc_common::Result<()> {
/// let transport = ClientTransport::connect("127.0.0.1:18800", TransportConfig::default()).await?;
/// let reply = transport.call("echo", vec![Value::from("hi")]).await?;
/// assert_eq!(reply, Value::from("hi"));
/// transport.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientTransport {
    connection: Arc<Connection>,
}

impl ClientTransport {
    /// Resolves `addr` and connects.
    ///
    /// # Errors
    ///
    /// - `MsgRpcError::Config` if `config` is invalid
    /// - `MsgRpcError::Io` if no resolved address accepts the connection
    pub async fn connect(addr: impl ToSocketAddrs, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let stream = connect_stream(addr, &config).await?;
        Self::from_stream(stream, config)
    }

    /// Wraps an already connected stream and starts its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (outbound, queue) = mpsc::unbounded_channel();
        let (kill, _) = watch::channel(false);
        let watchdog = TimeoutWatchdog::new(config.timeout_budgets(), config.watchdog_interval);

        let connection = Arc::new_cyclic(|this| Connection {
            local,
            peer,
            config,
            state: ShutdownState::new(),
            pending: Mutex::new(HashMap::new()),
            outbound,
            kill,
            watchdog,
            this: this.clone(),
        });

        let budgets = connection.config.timeout_budgets();
        if budgets != TimeoutBudgets::default() {
            connection.watchdog.spawn();
        }

        let (read_half, write_half) = stream.into_split();
        let reader = connection.clone();
        let read_kill = connection.kill.subscribe();
        tokio::spawn(async move { reader.read_loop(read_half, read_kill).await });
        let writer = connection.clone();
        let write_kill = connection.kill.subscribe();
        tokio::spawn(async move { writer.write_loop(write_half, queue, write_kill).await });

        tracing::debug!(local = %local, peer = %peer, "client transport connected");
        Ok(ClientTransport { connection })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer
    }

    pub fn config(&self) -> &TransportConfig {
        &self.connection.config
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.connection.pending.lock().len()
    }

    /// Whether new calls are refused.
    pub fn is_shutting_down(&self) -> bool {
        self.connection.state.is_shutting_down()
    }

    pub fn shutdown_source(&self) -> ShutdownSource {
        self.connection.state.source()
    }

    /// Whether both halves of the connection have shut down.
    pub fn is_closed(&self) -> bool {
        self.connection.state.is_completed()
    }

    /// Starts a call and returns its completion handle.
    ///
    /// The handle completes with the result value, with
    /// `MsgRpcError::Remote` when the server answered with an error, or with
    /// a local error when the connection failed first. Only `owner` may
    /// finish it.
    ///
    /// # Errors
    ///
    /// `MsgRpcError::ShuttingDown` if the transport no longer accepts calls.
    pub fn begin_call(
        &self,
        owner: HandleOwner,
        method: &str,
        params: Vec<Value>,
    ) -> Result<CompletionHandle<Value>> {
        let connection = &self.connection;
        let exchange = ExchangeGuard::enter(connection).ok_or(MsgRpcError::ShuttingDown)?;
        let handle = CompletionHandle::new(owner);

        let id = {
            let mut pending = connection.pending.lock();
            // ids come from a wrapping counter; skip any still outstanding
            let id = loop {
                let candidate = next_message_id();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            let watch = connection
                .watchdog
                .watch(WatchPhase::Execute, connection.watch_target(), Some(id));
            pending.insert(
                id,
                PendingCall {
                    handle: handle.clone(),
                    _watch: watch,
                    _exchange: exchange,
                },
            );
            id
        };

        tracing::trace!(message_id = id, method, "queueing request");
        let queued = connection.outbound.send(Outbound::Call {
            id,
            method: method.to_owned(),
            params,
        });
        if queued.is_err() {
            connection.settle(id, Err(MsgRpcError::ShuttingDown), true);
        }
        Ok(handle)
    }

    /// Blocks until the call completes and returns its outcome.
    ///
    /// Must not be called from an async context.
    pub fn end_call(&self, handle: &CompletionHandle<Value>, owner: HandleOwner) -> Result<Value> {
        handle.finish_blocking(owner)
    }

    /// Queues a notification.
    ///
    /// The handle completes once the frame has been written to the socket.
    ///
    /// # Errors
    ///
    /// `MsgRpcError::ShuttingDown` if the transport no longer accepts calls.
    pub fn begin_notify(
        &self,
        owner: HandleOwner,
        method: &str,
        params: Vec<Value>,
    ) -> Result<CompletionHandle<()>> {
        let exchange = ExchangeGuard::enter(&self.connection).ok_or(MsgRpcError::ShuttingDown)?;
        let handle = CompletionHandle::new(owner);
        let queued = self.connection.outbound.send(Outbound::Notify {
            method: method.to_owned(),
            params,
            handle: handle.clone(),
            exchange,
        });
        if queued.is_err() {
            handle.complete(Err(MsgRpcError::ShuttingDown), true);
        }
        Ok(handle)
    }

    pub fn end_notify(&self, handle: &CompletionHandle<()>, owner: HandleOwner) -> Result<()> {
        handle.finish_blocking(owner)
    }

    /// Sends a request and waits for its response.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let owner = HandleOwner::new();
        let handle = self.begin_call(owner, method, params)?;
        handle.finish(owner).await
    }

    /// Sends a notification and waits until it has been written.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let owner = HandleOwner::new();
        let handle = self.begin_notify(owner, method, params)?;
        handle.finish(owner).await
    }

    /// Refuses new calls, lets pending ones finish, then closes the
    /// connection and waits for the server to close its side.
    pub async fn shutdown(&self) {
        self.connection.begin_shutdown(ShutdownSource::Client);
        self.connection.state.closed().await;
    }

    /// Like [`ClientTransport::shutdown`], resetting the connection if it has
    /// not closed within `timeout`.
    ///
    /// # Returns
    ///
    /// `true` if the connection closed gracefully.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.shutdown()).await.is_ok() {
            return true;
        }
        tracing::warn!(peer = %self.connection.peer, "graceful shutdown timed out");
        self.reset();
        false
    }

    /// Aborts the connection; pending calls fail with a transport error.
    pub fn reset(&self) {
        self.connection
            .abort(|| MsgRpcError::Transport("connection reset locally".to_string()));
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.connection.begin_shutdown(ShutdownSource::Client);
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("peer", &self.connection.peer)
            .field("pending", &self.pending_calls())
            .field("shutdown_source", &self.shutdown_source())
            .finish()
    }
}

impl Connection {
    fn watch_target(&self) -> Weak<dyn WatchTarget> {
        self.this.clone()
    }

    fn begin_shutdown(&self, source: ShutdownSource) {
        let initiation = self.state.initiate(source);
        if initiation.accepted {
            tracing::debug!(
                peer = %self.peer,
                source = %source,
                pending = self.state.processing(),
                "client shutdown initiated"
            );
        }
        if initiation.drain_complete {
            let _ = self.outbound.send(Outbound::ShutdownSending);
        }
    }

    /// Resets the connection, failing every pending call with `error`.
    fn abort(&self, error: impl Fn() -> MsgRpcError) {
        if self.state.initiate(ShutdownSource::Disposing).accepted {
            tracing::debug!(peer = %self.peer, "resetting connection");
        }
        self.fail_pending(error);
        self.kill.send_replace(true);
    }

    /// Completes the pending call `id`, if it is still pending.
    fn settle(&self, id: MessageId, outcome: Result<Value>, synchronously: bool) {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(call) => {
                call.handle.complete(outcome, synchronously);
            }
            None => tracing::warn!(peer = %self.peer, message_id = id, "response for unknown message id"),
        }
    }

    fn fail_pending(&self, error: impl Fn() -> MsgRpcError) {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        if !drained.is_empty() {
            tracing::debug!(peer = %self.peer, count = drained.len(), "failing pending calls");
        }
        for call in drained {
            call.handle.complete(Err(error()), false);
        }
    }

    async fn read_loop(self: Arc<Self>, mut half: OwnedReadHalf, mut kill: watch::Receiver<bool>) {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK);
        let mut parser = FrameParser::new(ParserRole::Client, self.config.parser_limits());
        let mut receiving: Option<WatchGuard> = None;

        let end = 'read: loop {
            if *kill.borrow_and_update() {
                break ReadEnd::Killed;
            }

            buffer.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = kill.changed() => continue,
                read = half.read_buf(&mut buffer) => read,
            };
            match read {
                Ok(0) => break ReadEnd::Eof,
                Ok(_) => {}
                Err(e) => break ReadEnd::Failed(e),
            }

            while !buffer.is_empty() {
                if receiving.is_none() {
                    receiving = self.watchdog.watch(WatchPhase::Receive, self.watch_target(), None);
                }
                match parser.parse(&mut buffer) {
                    Ok(Some(frame)) => {
                        receiving = None;
                        self.on_frame(frame);
                    }
                    Ok(None) => {
                        if let (Some(watch), Some(id)) = (&receiving, parser.message_id()) {
                            watch.set_message_id(id);
                        }
                        break;
                    }
                    Err(e) => break 'read ReadEnd::Protocol(e),
                }
            }
            if parser.is_idle() && buffer.is_empty() {
                receiving = None;
            }
        };
        drop(receiving);
        self.finish_receiving(end);
    }

    fn on_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response { id, error, result } => {
                let outcome = Response { id, error, result }
                    .into_result()
                    .map_err(MsgRpcError::Remote);
                self.settle(id, outcome, false);
            }
            other => {
                tracing::warn!(peer = %self.peer, message_type = %other.message_type(), "ignoring frame from server")
            }
        }
    }

    fn finish_receiving(&self, end: ReadEnd) {
        match end {
            ReadEnd::Eof => {
                tracing::debug!(peer = %self.peer, "server closed the connection");
                self.fail_pending(|| MsgRpcError::Transport("connection closed by server".to_string()));
                self.begin_shutdown(ShutdownSource::Server);
            }
            ReadEnd::Killed => {}
            ReadEnd::Failed(e) => {
                tracing::error!(peer = %self.peer, error = %e, "receive failed");
                let message = e.to_string();
                self.fail_pending(|| MsgRpcError::Transport(message.clone()));
                self.begin_shutdown(ShutdownSource::Disposing);
            }
            ReadEnd::Protocol(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "malformed frame from server");
                self.abort(|| MsgRpcError::Framing(e.clone()));
            }
        }
        if self.state.mark_receiving_shutdown() {
            self.log_closed();
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut half: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
        mut kill: watch::Receiver<bool>,
    ) {
        let mut context = SendContext::new();
        loop {
            if *kill.borrow_and_update() {
                abort_socket(half);
                break;
            }

            let next = tokio::select! {
                biased;
                _ = kill.changed() => continue,
                next = queue.recv() => next,
            };
            match next {
                Some(Outbound::Call { id, method, params }) => {
                    if let Err(e) = context.encode_request(id, &method, &params) {
                        self.settle(id, Err(e), false);
                        continue;
                    }
                    if let Err(Some(e)) = self.write_frame(&mut half, &context, &mut kill).await {
                        self.write_failed(e);
                    }
                }
                Some(Outbound::Notify {
                    method,
                    params,
                    handle,
                    exchange,
                }) => {
                    let outcome = match context.encode_notification(&method, &params) {
                        Ok(()) => match self.write_frame(&mut half, &context, &mut kill).await {
                            Ok(()) => Ok(()),
                            Err(None) => Err(MsgRpcError::Transport("connection reset".to_string())),
                            Err(Some(e)) => {
                                let message = e.to_string();
                                self.write_failed(e);
                                Err(MsgRpcError::Transport(message))
                            }
                        },
                        Err(e) => Err(e),
                    };
                    handle.complete(outcome, false);
                    drop(exchange);
                }
                Some(Outbound::ShutdownSending) => {
                    if let Err(e) = half.shutdown().await {
                        tracing::debug!(peer = %self.peer, error = %e, "half-close failed");
                    }
                    tracing::debug!(peer = %self.peer, "sending half shut down");
                    break;
                }
                None => {
                    abort_socket(half);
                    break;
                }
            }
        }
        if self.state.mark_sending_shutdown() {
            self.log_closed();
        }
    }

    /// `Err(None)` means the connection was reset while writing.
    async fn write_frame(
        &self,
        half: &mut OwnedWriteHalf,
        context: &SendContext,
        kill: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), Option<io::Error>> {
        let watch = self
            .watchdog
            .watch(WatchPhase::Send, self.watch_target(), context.message_id());
        tokio::select! {
            biased;
            _ = kill.changed() => return Err(None),
            written = half.write_all(context.as_bytes()) => written.map_err(Some)?,
        }
        drop(watch);
        Ok(())
    }

    fn write_failed(&self, error: io::Error) {
        tracing::error!(peer = %self.peer, error = %error, "send failed");
        let message = error.to_string();
        self.abort(|| MsgRpcError::Transport(message.clone()));
    }

    fn log_closed(&self) {
        tracing::debug!(
            peer = %self.peer,
            source = %self.state.source(),
            "client transport closed"
        );
    }
}

impl Drainable for Connection {
    fn shutdown_state(&self) -> &ShutdownState {
        &self.state
    }

    fn on_drained(&self) {
        let _ = self.outbound.send(Outbound::ShutdownSending);
    }
}

impl WatchTarget for Connection {
    fn on_timeout(&self, phase: WatchPhase, message_id: Option<MessageId>) {
        tracing::warn!(peer = %self.peer, phase = %phase, message_id, "client timeout");
        if let (WatchPhase::Execute, Some(id)) = (phase, message_id) {
            let entry = self.pending.lock().remove(&id);
            if let Some(call) = entry {
                call.handle
                    .complete(Err(MsgRpcError::Timeout(format!("{} timeout exceeded", phase))), false);
            }
        }
        self.abort(|| MsgRpcError::Transport(format!("connection reset after {} timeout", phase)));
    }
}

/// Closes the socket with an RST instead of a FIN.
fn abort_socket(half: OwnedWriteHalf) {
    if let Err(e) = socket2::SockRef::from(half.as_ref()).set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %e, "failed to set linger");
    }
    half.forget();
}
