//! Timeout watchdog.
//!
//! # Architecture
//!
//! Every timed operation registers a [`WatchGuard`] with a deadline derived
//! from its phase budget. A background task ticks at a fixed interval and
//! sweeps expired entries. An entry is removed from the registry under the
//! lock before anything acts on it, and the side that completes the
//! operation removes it the same way through [`WatchGuard::disarm`], so
//! exactly one of the two wins the race:
//!
//! - the completer wins: the entry is gone and the sweep never sees it
//! - the watchdog wins: `disarm` returns `false` and the completer backs off
//!
//! On expiry the target's [`WatchTarget::on_timeout`] runs first, then the
//! execution unit (if any) is aborted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use crate::protocol::MessageId;

/// The budget an operation is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchPhase {
    /// From the first byte of a frame to its completion.
    Receive,
    /// One write of a frame to the socket.
    Send,
    /// Dispatch (server) or request-to-response (client).
    Execute,
}

impl fmt::Display for WatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchPhase::Receive => "receive",
            WatchPhase::Send => "send",
            WatchPhase::Execute => "execution",
        };
        f.write_str(name)
    }
}

/// Receiver of timeout notifications, usually a transport session.
pub trait WatchTarget: Send + Sync {
    /// Must not block; runs on the watchdog task.
    fn on_timeout(&self, phase: WatchPhase, message_id: Option<MessageId>);
}

/// Per-phase budgets; `None` means infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeoutBudgets {
    pub receive: Option<Duration>,
    pub send: Option<Duration>,
    pub execute: Option<Duration>,
}

impl TimeoutBudgets {
    pub fn budget(&self, phase: WatchPhase) -> Option<Duration> {
        match phase {
            WatchPhase::Receive => self.receive,
            WatchPhase::Send => self.send,
            WatchPhase::Execute => self.execute,
        }
    }
}

struct WatchEntry {
    phase: WatchPhase,
    started: Instant,
    deadline: Instant,
    target: Weak<dyn WatchTarget>,
    message_id: Option<MessageId>,
    execution: Option<AbortHandle>,
}

struct Registry {
    entries: Mutex<HashMap<u64, WatchEntry>>,
    next_key: AtomicU64,
    budgets: TimeoutBudgets,
    interval: Duration,
}

/// Background timer tracking in-flight operations.
#[derive(Clone)]
pub struct TimeoutWatchdog {
    registry: Arc<Registry>,
}

impl fmt::Debug for TimeoutWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutWatchdog")
            .field("budgets", &self.registry.budgets)
            .field("interval", &self.registry.interval)
            .field("watched", &self.watched())
            .finish()
    }
}

impl TimeoutWatchdog {
    pub fn new(budgets: TimeoutBudgets, interval: Duration) -> Self {
        TimeoutWatchdog {
            registry: Arc::new(Registry {
                entries: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(0),
                budgets,
                interval,
            }),
        }
    }

    pub fn budgets(&self) -> TimeoutBudgets {
        self.registry.budgets
    }

    /// Starts timing an operation.
    ///
    /// # Returns
    ///
    /// `None` when the phase has an infinite budget.
    pub fn watch(
        &self,
        phase: WatchPhase,
        target: Weak<dyn WatchTarget>,
        message_id: Option<MessageId>,
    ) -> Option<WatchGuard> {
        let budget = self.registry.budgets.budget(phase)?;
        let started = Instant::now();
        let key = self.registry.next_key.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.lock().insert(
            key,
            WatchEntry {
                phase,
                started,
                deadline: started + budget,
                target,
                message_id,
                execution: None,
            },
        );
        Some(WatchGuard {
            registry: Arc::downgrade(&self.registry),
            key,
        })
    }

    /// Number of operations currently timed.
    pub fn watched(&self) -> usize {
        self.registry.entries.lock().len()
    }

    /// Fires every entry whose deadline is at or before `now`.
    ///
    /// # Returns
    ///
    /// The number of entries that expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<WatchEntry> = {
            let mut entries = self.registry.entries.lock();
            let keys: Vec<u64> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter().filter_map(|key| entries.remove(&key)).collect()
        };

        let count = expired.len();
        for entry in expired {
            tracing::warn!(
                phase = %entry.phase,
                message_id = ?entry.message_id,
                elapsed_ms = now.saturating_duration_since(entry.started).as_millis() as u64,
                "operation timed out"
            );
            if let Some(target) = entry.target.upgrade() {
                target.on_timeout(entry.phase, entry.message_id);
            }
            if let Some(execution) = entry.execution {
                execution.abort();
            }
        }
        count
    }

    /// Spawns the ticking task.
    ///
    /// The task holds only a weak reference and exits once every
    /// `TimeoutWatchdog` clone is dropped.
    pub fn spawn(&self) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.registry);
        let period = self.registry.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                TimeoutWatchdog { registry }.sweep(Instant::now());
            }
            tracing::debug!("timeout watchdog stopped");
        })
    }
}

/// Registration of one timed operation.
///
/// Dropping the guard stops timing the operation.
pub struct WatchGuard {
    registry: Weak<Registry>,
    key: u64,
}

impl WatchGuard {
    /// Stops timing the operation.
    ///
    /// # Returns
    ///
    /// `false` if the watchdog already fired for it; the caller must then
    /// leave the outcome to the timeout handling.
    pub fn disarm(self) -> bool {
        self.remove()
    }

    /// Whether the watchdog has not fired yet.
    pub fn is_armed(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.entries.lock().contains_key(&self.key),
            None => false,
        }
    }

    /// Attaches the unit the watchdog aborts on expiry.
    pub fn attach_execution(&self, execution: AbortHandle) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(entry) = registry.entries.lock().get_mut(&self.key) {
                entry.execution = Some(execution);
            }
        }
    }

    pub fn set_message_id(&self, message_id: MessageId) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(entry) = registry.entries.lock().get_mut(&self.key) {
                entry.message_id = Some(message_id);
            }
        }
    }

    fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.entries.lock().remove(&self.key).is_some(),
            None => false,
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard").field("key", &self.key).finish()
    }
}
