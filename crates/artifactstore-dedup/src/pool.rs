//! Bounded object pool for hasher contexts, block buffers and codec workspaces.
//!
//! A pool hands out [`PoolHandle`]s. Dropping a handle (or calling
//! [`PoolHandle::release`]) returns the item; the pool keeps at most
//! `max_to_keep` idle items and discards the rest. The free list is guarded
//! internally, so callers share a pool across threads without any locking of
//! their own.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{DedupError, DedupResult};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items built by the factory
    pub created: u64,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Items put back on the free list
    pub returned: u64,
    /// Items dropped because the free list was full
    pub discarded: u64,
}

/// Generic bounded free list
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Reset<T>,
    max_to_keep: usize,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// Pool of fixed-length byte buffers
pub type ByteArrayPool = Pool<Vec<u8>>;

impl<T: Send + 'static> Pool<T> {
    /// Create a pool. `reset` runs on every item handed out from the free list.
    pub fn new<F, R>(factory: F, reset: R, max_to_keep: usize) -> Arc<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Arc::new(Self {
            items: Mutex::new(Vec::with_capacity(max_to_keep.min(64))),
            factory: Box::new(factory),
            reset: Box::new(reset),
            max_to_keep,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    /// Take an item from the pool, building a new one if none is idle
    pub fn acquire(self: &Arc<Self>) -> PoolHandle<T> {
        let pooled = self.items.lock().pop();
        let item = match pooled {
            Some(mut item) => {
                (self.reset)(&mut item);
                self.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };
        PoolHandle {
            item: Some(item),
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.max_to_keep {
            items.push(item);
            drop(items);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(items);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            trace!(max_to_keep = self.max_to_keep, "Pool full, discarding item");
        }
    }

    /// Number of idle items currently held
    pub fn retained(&self) -> usize {
        self.items.lock().len()
    }

    /// Upper bound on idle items
    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Pool<Vec<u8>> {
    /// Pool of zeroed buffers of exactly `len` bytes
    pub fn byte_arrays(len: usize, max_to_keep: usize) -> Arc<ByteArrayPool> {
        Pool::new(
            move || vec![0u8; len],
            move |buffer: &mut Vec<u8>| buffer.resize(len, 0),
            max_to_keep,
        )
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("max_to_keep", &self.max_to_keep)
            .field("created", &self.created.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An item borrowed from a [`Pool`]. Returns to the pool on drop.
///
/// Dereferencing a released handle panics; use [`PoolHandle::try_get`] where
/// release may already have happened.
pub struct PoolHandle<T: Send + 'static> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T: Send + 'static> PoolHandle<T> {
    /// Borrow the item, or `UseAfterRelease` once released
    pub fn try_get(&self) -> DedupResult<&T> {
        self.item.as_ref().ok_or(DedupError::UseAfterRelease)
    }

    /// Mutably borrow the item, or `UseAfterRelease` once released
    pub fn try_get_mut(&mut self) -> DedupResult<&mut T> {
        self.item.as_mut().ok_or(DedupError::UseAfterRelease)
    }

    /// Return the item to the pool now. A second release fails.
    pub fn release(&mut self) -> DedupResult<()> {
        let item = self.item.take().ok_or(DedupError::UseAfterRelease)?;
        self.pool.give_back(item);
        Ok(())
    }

    /// Whether the item has gone back to the pool
    pub fn is_released(&self) -> bool {
        self.item.is_none()
    }
}

impl<T: Send + 'static> Deref for PoolHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.item.as_ref() {
            Some(item) => item,
            None => panic!("{}", DedupError::UseAfterRelease),
        }
    }
}

impl<T: Send + 'static> DerefMut for PoolHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.item.as_mut() {
            Some(item) => item,
            None => panic!("{}", DedupError::UseAfterRelease),
        }
    }
}

impl<T: Send + 'static> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
