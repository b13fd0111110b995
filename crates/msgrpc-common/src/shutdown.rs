//! Shutdown coordination for one transport session.
//!
//! Shutdown has two halves that both must finish before the session is
//! destroyed:
//!
//! - **receiving**: stop reading new inbound data
//! - **sending**: stop emitting outbound data, deferred until every
//!   in-flight exchange has drained
//!
//! The [`ShutdownSource`] is recorded once; the first initiator wins and the
//! value never changes afterwards. The in-flight counter and the
//! "sending shutdown requested" flag are updated with compare-and-set so
//! exactly one party triggers the sending half, whether that is the
//! initiator (nothing in flight) or the last exchange to finish.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Which party initiated teardown.
///
/// On a server session `Client` is recorded for a zero-length read and
/// `Server` for a local shutdown request; a client transport records the
/// mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShutdownSource {
    None = 0,
    Client = 1,
    Server = 2,
    /// A fatal local error forced the session down.
    Disposing = 3,
}

impl ShutdownSource {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ShutdownSource::Client,
            2 => ShutdownSource::Server,
            3 => ShutdownSource::Disposing,
            _ => ShutdownSource::None,
        }
    }
}

impl fmt::Display for ShutdownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSource::None => "none",
            ShutdownSource::Client => "client",
            ShutdownSource::Server => "server",
            ShutdownSource::Disposing => "disposing",
        };
        f.write_str(name)
    }
}

/// Result of [`ShutdownState::initiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initiation {
    /// This call recorded the source.
    pub accepted: bool,
    /// Nothing was in flight; the caller must start the sending half now.
    pub drain_complete: bool,
}

/// Shutdown flags and in-flight counter of one session.
#[derive(Debug, Default)]
pub struct ShutdownState {
    source: AtomicU8,
    processing: AtomicUsize,
    receiving_shutdown: AtomicBool,
    sending_requested: AtomicBool,
    sending_shutdown: AtomicBool,
    completed: AtomicBool,
    closed: Notify,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self) -> ShutdownSource {
        ShutdownSource::from_u8(self.source.load(Ordering::SeqCst))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.source() != ShutdownSource::None
    }

    /// Number of in-flight exchanges.
    pub fn processing(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    /// Records `source` if none is set yet and checks for an immediate drain.
    pub fn initiate(&self, source: ShutdownSource) -> Initiation {
        let accepted = self
            .source
            .compare_exchange(
                ShutdownSource::None as u8,
                source as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        let drain_complete = self.processing.load(Ordering::SeqCst) == 0 && self.request_sending();
        Initiation {
            accepted,
            drain_complete,
        }
    }

    /// Counts a new exchange.
    ///
    /// # Returns
    ///
    /// `false` if shutdown already began. The exchange is still counted and
    /// must be released with [`ShutdownState::exit_exchange`]; use
    /// [`ExchangeGuard`] rather than calling this directly.
    pub fn enter_exchange(&self) -> bool {
        self.processing.fetch_add(1, Ordering::SeqCst);
        !self.is_shutting_down()
    }

    /// Releases an exchange.
    ///
    /// # Returns
    ///
    /// `true` if this was the last exchange of a shutting-down session and
    /// the caller must start the sending half.
    pub fn exit_exchange(&self) -> bool {
        let previous = self.processing.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "exchange released twice");
        previous == 1 && self.is_shutting_down() && self.request_sending()
    }

    fn request_sending(&self) -> bool {
        self.sending_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn sending_requested(&self) -> bool {
        self.sending_requested.load(Ordering::SeqCst)
    }

    /// Marks the receiving half done.
    ///
    /// # Returns
    ///
    /// `true` if this completed the whole shutdown.
    pub fn mark_receiving_shutdown(&self) -> bool {
        self.receiving_shutdown.store(true, Ordering::SeqCst);
        self.try_complete()
    }

    /// Marks the sending half done.
    ///
    /// # Returns
    ///
    /// `true` if this completed the whole shutdown.
    pub fn mark_sending_shutdown(&self) -> bool {
        self.sending_shutdown.store(true, Ordering::SeqCst);
        self.try_complete()
    }

    pub fn is_receiving_shutdown(&self) -> bool {
        self.receiving_shutdown.load(Ordering::SeqCst)
    }

    pub fn is_sending_shutdown(&self) -> bool {
        self.sending_shutdown.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn try_complete(&self) -> bool {
        if !(self.is_receiving_shutdown() && self.is_sending_shutdown()) {
            return false;
        }
        let completed = self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if completed {
            self.closed.notify_waiters();
        }
        completed
    }

    /// Resolves once both halves have shut down.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }
}

/// Something that owns a [`ShutdownState`] and can start its sending half.
pub trait Drainable: Send + Sync + 'static {
    fn shutdown_state(&self) -> &ShutdownState;

    /// Called exactly once, when the sending half may begin.
    fn on_drained(&self);
}

/// Counts one in-flight exchange for as long as it lives.
///
/// Dropping the guard decrements the counter exactly once and, for the last
/// exchange of a shutting-down session, triggers
/// [`Drainable::on_drained`].
pub struct ExchangeGuard<T: Drainable> {
    target: Arc<T>,
}

impl<T: Drainable> ExchangeGuard<T> {
    /// Enters an exchange, or returns `None` if shutdown already began.
    pub fn enter(target: &Arc<T>) -> Option<Self> {
        let guard = ExchangeGuard {
            target: target.clone(),
        };
        if guard.target.shutdown_state().enter_exchange() {
            Some(guard)
        } else {
            // dropping releases the count and may complete the drain
            None
        }
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }
}

impl<T: Drainable> fmt::Debug for ExchangeGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeGuard")
            .field("processing", &self.target.shutdown_state().processing())
            .finish()
    }
}

impl<T: Drainable> Drop for ExchangeGuard<T> {
    fn drop(&mut self) {
        if self.target.shutdown_state().exit_exchange() {
            self.target.on_drained();
        }
    }
}
