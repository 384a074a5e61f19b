//! Device execution contexts.
//!
//! Creating a context is expensive (device and queue setup on a GPU), so a
//! runtime keeps one per `(device, thread)` pair for the life of the process.
//! The pool uses `parking_lot::RwLock` for concurrent lookups. Contexts are
//! created outside the lock, so a slow device setup on one thread never
//! stalls lookups on another.

use crate::tensor::DeviceId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Key a context is cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub device: DeviceId,
    pub thread: ThreadId,
}

impl ContextKey {
    /// Key of `device` on the calling thread.
    pub fn current(device: DeviceId) -> Self {
        Self { device, thread: thread::current().id() }
    }
}

/// Lazily populated, never torn down context cache.
pub struct ContextPool<C> {
    contexts: RwLock<HashMap<ContextKey, Arc<C>>>,
}

impl<C> Default for ContextPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ContextPool<C> {
    pub fn new() -> Self {
        Self { contexts: RwLock::new(HashMap::new()) }
    }

    /// Returns the calling thread's context for `device`, creating it with
    /// `init` on first use.
    ///
    /// A failed `init` caches nothing; the next call retries.
    pub fn acquire_or_create<E>(
        &self,
        device: DeviceId,
        init: impl FnOnce(DeviceId) -> Result<C, E>,
    ) -> Result<Arc<C>, E> {
        let key = ContextKey::current(device);
        if let Some(ctx) = self.contexts.read().get(&key) {
            return Ok(Arc::clone(ctx));
        }

        // keys are per thread: only this thread ever inserts `key`
        let ctx = Arc::new(init(device)?);
        log::info!("created execution context for {device} on {:?}", key.thread);
        Ok(Arc::clone(self.contexts.write().entry(key).or_insert(ctx)))
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}
