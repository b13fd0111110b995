//! Completion handles for outstanding asynchronous operations.
//!
//! A [`CompletionHandle`] moves through three states:
//!
//! ```text
//! Pending -> Completed { synchronously } -> Finished
//! ```
//!
//! The transport completes a handle when a send is confirmed, a send fails
//! or a correlated response arrives. The initiating caller then finishes it,
//! which hands out the stored result or raises the stored error. Completing
//! is first-writer-wins; finishing is allowed once and only by the owner.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::protocol::{MsgRpcError, Result};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Opaque token identifying who may finish a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleOwner(u64);

impl HandleOwner {
    /// Allocates a process-unique owner token.
    pub fn new() -> Self {
        HandleOwner(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleOwner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Pending,
    Completed { synchronously: bool },
    Finished,
}

/// Ownership verification failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    #[error("completion handle was already finished")]
    AlreadyFinished,

    #[error("completion handle is not owned by the caller")]
    NotOwned,
}

type Callback<T> = Box<dyn FnOnce(&CompletionHandle<T>) + Send>;

struct Slot<T> {
    status: HandleStatus,
    outcome: Option<Result<T>>,
}

struct Inner<T> {
    owner: HandleOwner,
    slot: Mutex<Slot<T>>,
    signal: Condvar,
    notify: Notify,
    callback: Mutex<Option<Callback<T>>>,
    user_state: OnceLock<Box<dyn Any + Send + Sync>>,
}

/// One pending asynchronous operation.
///
/// Clones share the same state.
///
/// # Example
///
/// ```
/// use msgrpc_common::completion::{CompletionHandle, HandleOwner};
///
/// let owner = HandleOwner::new();
/// let handle = CompletionHandle::<u32>::new(owner);
///
/// assert!(handle.complete(Ok(7), true));
/// assert!(!handle.complete(Ok(8), false));
/// assert_eq!(handle.finish_blocking(owner).unwrap(), 7);
/// assert!(handle.finish_blocking(owner).is_err());
/// ```
pub struct CompletionHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        CompletionHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("owner", &self.inner.owner)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + 'static> CompletionHandle<T> {
    pub fn new(owner: HandleOwner) -> Self {
        CompletionHandle {
            inner: Arc::new(Inner {
                owner,
                slot: Mutex::new(Slot {
                    status: HandleStatus::Pending,
                    outcome: None,
                }),
                signal: Condvar::new(),
                notify: Notify::new(),
                callback: Mutex::new(None),
                user_state: OnceLock::new(),
            }),
        }
    }

    /// Registers a callback invoked once, right after completion.
    ///
    /// If the handle is already completed the callback runs immediately.
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: FnOnce(&CompletionHandle<T>) + Send + 'static,
    {
        *self.inner.callback.lock() = Some(Box::new(callback));
        if self.is_completed() {
            self.run_callback();
        }
        self
    }

    /// Attaches an opaque caller token. Only the first value is kept.
    pub fn with_user_state<S: Any + Send + Sync>(self, state: S) -> Self {
        let _ = self.inner.user_state.set(Box::new(state));
        self
    }

    pub fn user_state<S: Any>(&self) -> Option<&S> {
        self.inner.user_state.get().and_then(|state| state.downcast_ref())
    }

    pub fn owner(&self) -> HandleOwner {
        self.inner.owner
    }

    pub fn status(&self) -> HandleStatus {
        self.inner.slot.lock().status
    }

    /// Whether the operation has completed, finished or not.
    pub fn is_completed(&self) -> bool {
        self.status() != HandleStatus::Pending
    }

    /// Stores the outcome.
    ///
    /// # Returns
    ///
    /// `true` if this call completed the handle, `false` if an earlier
    /// completion already won; the earlier outcome is never overwritten.
    pub fn complete(&self, outcome: Result<T>, synchronously: bool) -> bool {
        {
            let mut slot = self.inner.slot.lock();
            if slot.status != HandleStatus::Pending {
                return false;
            }
            slot.status = HandleStatus::Completed { synchronously };
            slot.outcome = Some(outcome);
        }
        self.inner.signal.notify_all();
        self.inner.notify.notify_waiters();
        self.run_callback();
        true
    }

    fn run_callback(&self) {
        let callback = self.inner.callback.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Blocks the calling thread until the handle completes.
    pub fn wait(&self) {
        let mut slot = self.inner.slot.lock();
        while slot.status == HandleStatus::Pending {
            self.inner.signal.wait(&mut slot);
        }
    }

    /// Blocks until completion or until `timeout` elapses.
    ///
    /// # Returns
    ///
    /// Whether the handle completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while slot.status == HandleStatus::Pending {
            if self.inner.signal.wait_until(&mut slot, deadline).timed_out() {
                return slot.status != HandleStatus::Pending;
            }
        }
        true
    }

    /// Waits asynchronously until the handle completes.
    pub async fn completed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }

    fn verify_owner(&self, owner: HandleOwner) -> Result<()> {
        if owner != self.inner.owner {
            return Err(MsgRpcError::Handle(HandleError::NotOwned));
        }
        Ok(())
    }

    fn take_outcome(&self) -> Result<T> {
        let mut slot = self.inner.slot.lock();
        if slot.status == HandleStatus::Finished {
            return Err(MsgRpcError::Handle(HandleError::AlreadyFinished));
        }
        slot.status = HandleStatus::Finished;
        slot.outcome
            .take()
            .unwrap_or(Err(MsgRpcError::Handle(HandleError::AlreadyFinished)))
    }

    /// Blocks until completion, then returns the result or raises the error.
    ///
    /// # Errors
    ///
    /// - `HandleError::NotOwned` if `owner` did not create the handle
    /// - `HandleError::AlreadyFinished` on a second finish
    /// - the stored error of a failed operation
    pub fn finish_blocking(&self, owner: HandleOwner) -> Result<T> {
        self.verify_owner(owner)?;
        self.wait();
        self.take_outcome()
    }

    /// Asynchronous form of [`CompletionHandle::finish_blocking`].
    pub async fn finish(&self, owner: HandleOwner) -> Result<T> {
        self.verify_owner(owner)?;
        self.completed().await;
        self.take_outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_first_complete_wins() {
        let owner = HandleOwner::new();
        let handle = CompletionHandle::<&'static str>::new(owner);
        assert_eq!(handle.status(), HandleStatus::Pending);

        assert!(handle.complete(Ok("first"), false));
        assert!(!handle.complete(Ok("second"), true));
        assert!(!handle.complete(Err(MsgRpcError::ShuttingDown), true));
        assert_eq!(
            handle.status(),
            HandleStatus::Completed {
                synchronously: false
            }
        );
        assert_eq!(handle.finish_blocking(owner).unwrap(), "first");
        assert_eq!(handle.status(), HandleStatus::Finished);
    }

    #[test]
    fn test_double_finish_reports_violation() {
        let owner = HandleOwner::new();
        let handle = CompletionHandle::<()>::new(owner);
        handle.complete(Ok(()), true);
        handle.finish_blocking(owner).unwrap();
        assert!(matches!(
            handle.finish_blocking(owner),
            Err(MsgRpcError::Handle(HandleError::AlreadyFinished))
        ));
    }

    #[test]
    fn test_wrong_owner_is_rejected() {
        let handle = CompletionHandle::<()>::new(HandleOwner::new());
        handle.complete(Ok(()), true);
        assert!(matches!(
            handle.finish_blocking(HandleOwner::new()),
            Err(MsgRpcError::Handle(HandleError::NotOwned))
        ));
        // the rightful owner can still finish
        handle.finish_blocking(handle.owner()).unwrap();
    }

    #[test]
    fn test_finish_raises_stored_error() {
        let owner = HandleOwner::new();
        let handle = CompletionHandle::<u8>::new(owner);
        handle.complete(Err(MsgRpcError::Timeout("execution".into())), false);
        assert!(matches!(
            handle.finish_blocking(owner),
            Err(MsgRpcError::Timeout(_))
        ));
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let owner = HandleOwner::new();
        let handle = CompletionHandle::<u32>::new(owner);
        let completer = handle.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(42), false);
        });
        assert_eq!(handle.finish_blocking(owner).unwrap(), 42);
        thread.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let handle = CompletionHandle::<()>::new(HandleOwner::new());
        assert!(!handle.wait_timeout(Duration::from_millis(10)));
        handle.complete(Ok(()), true);
        assert!(handle.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_callback_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = CompletionHandle::<()>::new(HandleOwner::new()).with_callback(move |h| {
            assert!(h.is_completed());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.complete(Ok(()), true);
        handle.complete(Ok(()), true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_registered_after_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = CompletionHandle::<()>::new(HandleOwner::new());
        handle.complete(Ok(()), true);
        let counter = calls.clone();
        let _handle = handle.with_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_user_state() {
        let handle = CompletionHandle::<()>::new(HandleOwner::new())
            .with_user_state(String::from("token"))
            .with_user_state(5u8);
        assert_eq!(handle.user_state::<String>().map(String::as_str), Some("token"));
        assert_eq!(handle.user_state::<u8>(), None);
    }

    #[tokio::test]
    async fn test_async_finish() {
        let owner = HandleOwner::new();
        let handle = CompletionHandle::<u32>::new(owner);
        let completer = handle.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            completer.complete(Ok(9), false);
        });
        assert_eq!(handle.finish(owner).await.unwrap(), 9);
        assert!(handle.finish(owner).await.is_err());
    }
}
