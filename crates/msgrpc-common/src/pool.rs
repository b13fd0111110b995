//! Bounded object pool.
//!
//! Pools hand out exclusive [`Pooled`] guards. A guard returns its object to
//! the pool when dropped, after clearing it, and only then releases its
//! semaphore permit, so the number of borrowed objects never exceeds the
//! configured maximum and no two borrowers ever hold the same instance.
//!
//! # Example
//!
//! ```
//! use msgrpc_common::pool::{ObjectPool, PoolLimits, Poolable};
//!
//! #[derive(Default)]
//! struct Scratch(Vec<u8>);
//!
//! impl Poolable for Scratch {
//!     fn clear(&mut self) {
//!         self.0.clear();
//!     }
//! }
//!
//! # tokio_test_block_on(async {
//! let pool = ObjectPool::new("scratch", PoolLimits::new(1, 4), Scratch::default);
//! let mut scratch = pool.acquire().await.unwrap();
//! scratch.0.extend_from_slice(b"data");
//! drop(scratch);
//! assert_eq!(pool.stats().idle, 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::protocol::{MsgRpcError, Result};

/// An object that can be reset and reused.
pub trait Poolable: Send + 'static {
    /// Restores the object to a state indistinguishable from a fresh one.
    fn clear(&mut self);
}

/// Minimum (prewarmed) and maximum (borrowable) pool sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub min: usize,
    pub max: usize,
}

impl PoolLimits {
    pub fn new(min: usize, max: usize) -> Self {
        PoolLimits { min, max }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub name: &'static str,
    pub idle: usize,
    pub borrowed: usize,
    pub created: usize,
    pub max: usize,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct Shared<T> {
    name: &'static str,
    limits: PoolLimits,
    idle: Mutex<Vec<T>>,
    semaphore: Arc<Semaphore>,
    factory: Factory<T>,
    borrowed: AtomicUsize,
    created: AtomicUsize,
}

/// A multi-producer, multi-consumer pool of reusable objects.
pub struct ObjectPool<T: Poolable> {
    shared: Arc<Shared<T>>,
}

impl<T: Poolable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.shared.name)
            .field("limits", &self.shared.limits)
            .finish()
    }
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates a pool and prewarms `limits.min` objects.
    pub fn new<F>(name: &'static str, limits: PoolLimits, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let prewarmed: Vec<T> = (0..limits.min.min(limits.max)).map(|_| factory()).collect();
        let created = prewarmed.len();
        ObjectPool {
            shared: Arc::new(Shared {
                name,
                limits,
                idle: Mutex::new(prewarmed),
                semaphore: Arc::new(Semaphore::new(limits.max)),
                factory: Box::new(factory),
                borrowed: AtomicUsize::new(0),
                created: AtomicUsize::new(created),
            }),
        }
    }

    /// Borrows an object, waiting while the pool is exhausted.
    ///
    /// # Errors
    ///
    /// `MsgRpcError::PoolClosed` once [`ObjectPool::close`] was called.
    pub async fn acquire(&self) -> Result<Pooled<T>> {
        let permit = self
            .shared
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MsgRpcError::PoolClosed)?;
        Ok(self.checkout(permit))
    }

    /// Borrows an object, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// `MsgRpcError::PoolTimeout` if no object became available in time.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Pooled<T>> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| MsgRpcError::PoolTimeout(timeout.as_millis() as u64))?
    }

    /// Borrows an object only if one is available right now.
    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        match self.shared.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.checkout(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Pooled<T> {
        let item = self.shared.idle.lock().pop().unwrap_or_else(|| {
            self.shared.created.fetch_add(1, Ordering::Relaxed);
            (self.shared.factory)()
        });
        self.shared.borrowed.fetch_add(1, Ordering::AcqRel);
        Pooled {
            item: Some(item),
            shared: self.shared.clone(),
            _permit: permit,
        }
    }

    /// Refuses further borrows and drops idle objects.
    ///
    /// Objects still borrowed are dropped when their guards are.
    pub fn close(&self) {
        self.shared.semaphore.close();
        self.shared.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.semaphore.is_closed()
    }

    pub fn limits(&self) -> PoolLimits {
        self.shared.limits
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.shared.name,
            idle: self.shared.idle.lock().len(),
            borrowed: self.shared.borrowed.load(Ordering::Acquire),
            created: self.shared.created.load(Ordering::Relaxed),
            max: self.shared.limits.max,
        }
    }
}

/// Exclusive borrow of a pooled object.
pub struct Pooled<T: Poolable> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
    // dropped after `Drop::drop` has returned the item
    _permit: OwnedSemaphorePermit,
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item is present until drop")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item is present until drop")
    }
}

impl<T: Poolable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.clear();
            if !self.shared.semaphore.is_closed() {
                self.shared.idle.lock().push(item);
            }
            self.shared.borrowed.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
