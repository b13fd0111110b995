//! Server transport session.
//!
//! # Architecture
//!
//! One session per accepted connection, driven by two tasks:
//!
//! - **reader**: reads into the pooled session buffer, feeds the frame parser
//!   and spawns one execution per completed frame
//! - **writer**: drains the outbound queue in order and owns the sending half
//!   of the socket
//!
//! Every request holds an [`ExchangeGuard`] from the moment it is parsed
//! until its response has been written, so the in-flight counter covers the
//! whole exchange. Shutdown stops the reader immediately and queues the FIN
//! behind the last in-flight response. A reset (timeouts, disposal) aborts
//! the socket with `SO_LINGER = 0` and discards anything still queued.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use msgrpc_common::codec::{Arguments, FrameError, FrameParser, InboundFrame};
use msgrpc_common::config::TransportConfig;
use msgrpc_common::context::{SendContext, SessionContext};
use msgrpc_common::pool::{ObjectPool, Pooled};
use msgrpc_common::shutdown::{Drainable, ExchangeGuard, ShutdownSource, ShutdownState};
use msgrpc_common::watchdog::{TimeoutWatchdog, WatchGuard, WatchPhase, WatchTarget};
use msgrpc_common::{ErrorCategory, MessageId, MsgRpcError, RpcError};
use msgrpc_metrics::{MetricsRegistry, TimeoutKind};
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

use crate::dispatch::Dispatcher;

const READ_CHUNK: usize = 8 * 1024;

/// Collaborators shared by every session of one manager.
pub(crate) struct SessionShared {
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) parsers: ObjectPool<FrameParser>,
    pub(crate) send_contexts: ObjectPool<SendContext>,
    pub(crate) watchdog: TimeoutWatchdog,
    pub(crate) config: TransportConfig,
    pub(crate) metrics: Arc<MetricsRegistry>,
}

/// Work item for the writer task.
pub(crate) enum Outbound {
    Frame {
        context: Pooled<SendContext>,
        exchange: Option<ExchangeGuard<ServerSession>>,
    },
    /// Half-close once everything queued before it has been written.
    ShutdownSending,
    /// Abort the connection once everything queued before it has been written.
    Reset,
}

enum ReadEnd {
    Eof,
    Stopped,
    Killed,
    Failed(io::Error),
    Protocol {
        error: FrameError,
        message_id: Option<MessageId>,
    },
}

/// Parser context and receive timer of the frame currently being read.
#[derive(Default)]
struct Inbound {
    parser: Option<Pooled<FrameParser>>,
    watch: Option<WatchGuard>,
}

/// One accepted connection.
pub struct ServerSession {
    id: u64,
    peer: SocketAddr,
    state: ShutdownState,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop_receiving: watch::Sender<bool>,
    kill: watch::Sender<bool>,
    shared: Arc<SessionShared>,
    this: Weak<ServerSession>,
}

impl ServerSession {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        shared: Arc<SessionShared>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|this| ServerSession {
            id,
            peer,
            state: ShutdownState::new(),
            outbound,
            stop_receiving: watch::channel(false).0,
            kill: watch::channel(false).0,
            shared,
            this: this.clone(),
        });
        (session, queue)
    }

    /// Starts the reader and writer tasks.
    ///
    /// `slot` stays borrowed until both tasks have finished; `on_closed` runs
    /// right after it is returned.
    pub(crate) fn spawn<F>(
        self: &Arc<Self>,
        stream: TcpStream,
        slot: Pooled<SessionContext>,
        queue: mpsc::UnboundedReceiver<Outbound>,
        on_closed: F,
    ) where
        F: FnOnce(u64) + Send + 'static,
    {
        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(self.clone().read_loop(
            read_half,
            slot,
            self.stop_receiving.subscribe(),
            self.kill.subscribe(),
        ));
        let writer = tokio::spawn(self.clone().write_loop(write_half, queue, self.kill.subscribe()));

        let id = self.id;
        tokio::spawn(async move {
            let (read, write) = tokio::join!(reader, writer);
            // the slot is the connection permit; it goes back only once both halves are done
            match read {
                Ok(slot) => drop(slot),
                Err(e) => tracing::error!(session = id, error = %e, "session task failed"),
            }
            if let Err(e) = write {
                tracing::error!(session = id, error = %e, "session task failed");
            }
            on_closed(id);
        });
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Number of exchanges parsed but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.state.processing()
    }

    pub fn shutdown_source(&self) -> ShutdownSource {
        self.state.source()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_completed()
    }

    /// Resolves once both halves of the session have shut down.
    pub async fn closed(&self) {
        self.state.closed().await
    }

    /// Begins a graceful, server-initiated shutdown.
    ///
    /// Receiving stops at once; the FIN follows the last in-flight response.
    pub fn shutdown(&self) {
        self.begin_shutdown(ShutdownSource::Server);
    }

    /// Aborts the connection, discarding queued output.
    pub fn reset(&self) {
        self.state.initiate(ShutdownSource::Disposing);
        if !self.kill.send_replace(true) {
            self.shared.metrics.record_reset();
            tracing::debug!(session = self.id, peer = %self.peer, "resetting connection");
        }
    }

    fn begin_shutdown(&self, source: ShutdownSource) {
        let initiation = self.state.initiate(source);
        if initiation.accepted {
            tracing::debug!(
                session = self.id,
                source = %source,
                in_flight = self.state.processing(),
                "shutdown initiated"
            );
        }
        self.stop_receiving.send_replace(true);
        if initiation.drain_complete {
            self.start_sending_shutdown();
        }
    }

    fn start_sending_shutdown(&self) {
        let _ = self.outbound.send(Outbound::ShutdownSending);
    }

    fn watch_target(&self) -> Weak<dyn WatchTarget> {
        self.this.clone()
    }

    fn log_closed(&self) {
        tracing::info!(
            session = self.id,
            peer = %self.peer,
            source = %self.state.source(),
            "session closed"
        );
    }

    async fn read_loop(
        self: Arc<Self>,
        mut half: OwnedReadHalf,
        mut slot: Pooled<SessionContext>,
        mut stop: watch::Receiver<bool>,
        mut kill: watch::Receiver<bool>,
    ) -> Pooled<SessionContext> {
        let mut inbound = Inbound::default();
        let end = loop {
            if *kill.borrow_and_update() {
                break ReadEnd::Killed;
            }
            if *stop.borrow_and_update() {
                break ReadEnd::Stopped;
            }

            let buffer = &mut slot.read_buffer;
            buffer.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = kill.changed() => continue,
                _ = stop.changed() => continue,
                read = half.read_buf(buffer) => read,
            };
            match read {
                Ok(0) => {
                    if !slot.read_buffer.is_empty() || inbound.parser.is_some() {
                        tracing::debug!(session = self.id, "peer closed mid-frame");
                    }
                    break ReadEnd::Eof;
                }
                Ok(n) => self.shared.metrics.record_bytes_received(n),
                Err(e) => break ReadEnd::Failed(e),
            }

            let processed = tokio::select! {
                biased;
                _ = kill.changed() => Err(ReadEnd::Killed),
                processed = self.process(&mut slot.read_buffer, &mut inbound, &mut stop) => processed,
            };
            if let Err(end) = processed {
                break end;
            }
        };
        drop(inbound);
        self.finish_receiving(end);
        slot
    }

    /// Parses every complete frame in `buffer`.
    ///
    /// Waiting for a free request context gives up as soon as receiving is
    /// stopped.
    async fn process(
        self: &Arc<Self>,
        buffer: &mut BytesMut,
        inbound: &mut Inbound,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ReadEnd> {
        while !buffer.is_empty() {
            if inbound.parser.is_none() {
                if *stop.borrow_and_update() {
                    return Err(ReadEnd::Stopped);
                }
                let parser = tokio::select! {
                    biased;
                    _ = stop.changed() => return Err(ReadEnd::Stopped),
                    parser = self.shared.parsers.acquire() => parser.map_err(|_| ReadEnd::Stopped)?,
                };
                inbound.parser = Some(parser);
            }
            if inbound.watch.is_none() {
                inbound.watch = self
                    .shared
                    .watchdog
                    .watch(WatchPhase::Receive, self.watch_target(), None);
            }
            let Some(parser) = inbound.parser.as_mut() else {
                break;
            };

            match parser.parse(buffer) {
                Ok(Some(frame)) => {
                    inbound.watch = None;
                    self.shared.metrics.record_frame_received();
                    self.dispatch_frame(frame);
                }
                Ok(None) => {
                    if let (Some(watch), Some(id)) = (&inbound.watch, parser.message_id()) {
                        watch.set_message_id(id);
                    }
                    break;
                }
                Err(error) => {
                    return Err(ReadEnd::Protocol {
                        error,
                        message_id: parser.message_id(),
                    });
                }
            }
        }

        let idle = inbound.parser.as_ref().map_or(true, |parser| parser.is_idle());
        if idle && buffer.is_empty() {
            inbound.parser = None;
            inbound.watch = None;
        }
        Ok(())
    }

    fn dispatch_frame(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Request { id, method, args } => {
                let Some(exchange) = ExchangeGuard::enter(self) else {
                    tracing::debug!(session = self.id, message_id = id, "request dropped during shutdown");
                    return;
                };
                tracing::debug!(session = self.id, message_id = id, method = %method, "dispatching request");
                self.execute(Some(id), method, args, exchange);
            }
            InboundFrame::Notification { method, args } => {
                let Some(exchange) = ExchangeGuard::enter(self) else {
                    tracing::debug!(session = self.id, method = %method, "notification dropped during shutdown");
                    return;
                };
                self.shared.metrics.record_notification();
                tracing::debug!(session = self.id, method = %method, "dispatching notification");
                self.execute(None, method, args, exchange);
            }
            InboundFrame::Response { id, .. } => {
                tracing::warn!(session = self.id, message_id = id, "ignoring response sent to server");
            }
        }
    }

    fn execute(
        self: &Arc<Self>,
        message_id: Option<MessageId>,
        method: String,
        args: Arguments,
        exchange: ExchangeGuard<ServerSession>,
    ) {
        let started = Instant::now();
        let execution = tokio::spawn(self.shared.dispatcher.dispatch(&method, message_id, args));
        let watch = self
            .shared
            .watchdog
            .watch(WatchPhase::Execute, self.watch_target(), message_id);
        if let Some(watch) = &watch {
            watch.attach_execution(execution.abort_handle());
        }

        let session = self.clone();
        tokio::spawn(async move {
            let joined = execution.await;
            if let Some(watch) = watch {
                if !watch.disarm() {
                    // the watchdog already answered and reset the connection
                    session.shared.metrics.record_call(&method, started, false);
                    return;
                }
            }

            let result = joined.unwrap_or_else(|e| Err(execution_failure(&method, e)));
            session.shared.metrics.record_call(&method, started, result.is_ok());
            match message_id {
                Some(id) => session.respond(id, &method, result, exchange).await,
                None => {
                    if let Err(error) = result {
                        tracing::debug!(session = session.id, method = %method, error = %error, "notification failed");
                    }
                }
            }
        });
    }

    async fn respond(
        &self,
        id: MessageId,
        method: &str,
        result: Result<Value, RpcError>,
        exchange: ExchangeGuard<ServerSession>,
    ) {
        let Ok(mut context) = self.shared.send_contexts.acquire().await else {
            return;
        };
        let debug_mode = self.shared.config.debug_mode;
        let encoded = match &result {
            Ok(value) => context.encode_success(id, value),
            Err(error) => {
                tracing::debug!(
                    session = self.id,
                    message_id = id,
                    method = %method,
                    error = %error,
                    "method returned an error"
                );
                context.encode_failure(id, error, debug_mode)
            }
        };
        if let Err(e) = encoded {
            let fallback = RpcError::unexpected(format!("response cannot be encoded: {}", e));
            if context.encode_failure(id, &fallback, debug_mode).is_err() {
                return;
            }
        }
        let _ = self.outbound.send(Outbound::Frame {
            context,
            exchange: Some(exchange),
        });
    }

    /// Queues an error response outside any exchange, if a context is free.
    fn send_error(&self, id: MessageId, error: &RpcError) {
        let Some(mut context) = self.shared.send_contexts.try_acquire() else {
            tracing::debug!(session = self.id, message_id = id, "no context free for error response");
            return;
        };
        if context
            .encode_failure(id, error, self.shared.config.debug_mode)
            .is_ok()
        {
            let _ = self.outbound.send(Outbound::Frame {
                context,
                exchange: None,
            });
        }
    }

    fn finish_receiving(&self, end: ReadEnd) {
        match end {
            ReadEnd::Eof => {
                tracing::debug!(session = self.id, "peer closed its sending side");
                self.begin_shutdown(ShutdownSource::Client);
            }
            ReadEnd::Stopped | ReadEnd::Killed => {}
            ReadEnd::Failed(e) => {
                tracing::error!(session = self.id, peer = %self.peer, error = %e, "receive failed");
                self.begin_shutdown(ShutdownSource::Disposing);
            }
            ReadEnd::Protocol { error, message_id } => {
                let quota = error.category() == ErrorCategory::Quota;
                tracing::warn!(
                    session = self.id,
                    peer = %self.peer,
                    message_id = ?message_id,
                    error = %error,
                    "protocol error, closing session"
                );
                self.shared.metrics.record_protocol_error(quota);
                if let Some(id) = message_id {
                    self.send_error(id, &MsgRpcError::Framing(error).to_rpc_error());
                }
                self.begin_shutdown(ShutdownSource::Server);
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
        let mut broken = false;
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
                Some(Outbound::Frame { context, exchange }) => {
                    if !broken {
                        match self.write_frame(&mut half, &context, &mut kill).await {
                            Ok(()) => {}
                            Err(None) => continue,
                            Err(Some(e)) => {
                                tracing::error!(session = self.id, peer = %self.peer, error = %e, "send failed");
                                broken = true;
                                self.begin_shutdown(ShutdownSource::Disposing);
                            }
                        }
                    }
                    drop(context);
                    drop(exchange);
                }
                Some(Outbound::ShutdownSending) => {
                    if !broken {
                        if let Err(e) = half.shutdown().await {
                            tracing::debug!(session = self.id, error = %e, "half-close failed");
                        }
                    }
                    tracing::debug!(session = self.id, "sending half shut down");
                    break;
                }
                Some(Outbound::Reset) | None => {
                    self.reset();
                    abort_socket(half);
                    break;
                }
            }
        }
        if self.state.mark_sending_shutdown() {
            self.log_closed();
        }
    }

    /// Writes one frame under the send budget.
    ///
    /// `Err(None)` means the session was killed mid-write.
    async fn write_frame(
        &self,
        half: &mut OwnedWriteHalf,
        context: &SendContext,
        kill: &mut watch::Receiver<bool>,
    ) -> Result<(), Option<io::Error>> {
        let watch = self
            .shared
            .watchdog
            .watch(WatchPhase::Send, self.watch_target(), context.message_id());
        let bytes = context.as_bytes();
        tokio::select! {
            biased;
            _ = kill.changed() => return Err(None),
            written = half.write_all(bytes) => written.map_err(Some)?,
        }
        drop(watch);
        self.shared.metrics.record_frame_sent(bytes.len());
        Ok(())
    }
}

impl Drainable for ServerSession {
    fn shutdown_state(&self) -> &ShutdownState {
        &self.state
    }

    fn on_drained(&self) {
        tracing::debug!(session = self.id, "in-flight exchanges drained");
        self.start_sending_shutdown();
    }
}

impl WatchTarget for ServerSession {
    fn on_timeout(&self, phase: WatchPhase, message_id: Option<MessageId>) {
        self.shared.metrics.record_timeout(match phase {
            WatchPhase::Receive => TimeoutKind::Receive,
            WatchPhase::Send => TimeoutKind::Send,
            WatchPhase::Execute => TimeoutKind::Execute,
        });
        match (phase, message_id) {
            (WatchPhase::Send, _) | (_, None) => self.reset(),
            (_, Some(id)) => {
                self.send_error(id, &RpcError::timeout(format!("{} timeout exceeded", phase)));
                self.state.initiate(ShutdownSource::Disposing);
                if self.outbound.send(Outbound::Reset).is_err() {
                    self.reset();
                }
            }
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("in_flight", &self.state.processing())
            .field("shutdown_source", &self.state.source())
            .finish()
    }
}

/// Closes the socket with a reset instead of a FIN.
///
/// The write half is forgotten rather than dropped so no FIN precedes the
/// reset; the socket closes when the read half goes away.
fn abort_socket(half: OwnedWriteHalf) {
    if let Err(e) = socket2::SockRef::from(half.as_ref()).set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %e, "failed to set linger");
    }
    half.forget();
}

fn execution_failure(method: &str, error: JoinError) -> RpcError {
    if !error.is_panic() {
        return RpcError::unexpected(format!("method '{}' was cancelled", method));
    }
    let panic = error.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(method = %method, panic = %detail, "method panicked");
    RpcError::unexpected(format!("method '{}' failed unexpectedly", method)).with_debug(detail)
}
