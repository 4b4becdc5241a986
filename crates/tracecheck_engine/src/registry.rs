//! Shard registry.
//!
//! Parallel runs register shards by index up front; serial runs discover
//! them lazily by thread id. Either way the registry owns every
//! [`ShardState`] until reconciliation reads the timelines back.

use crate::shard::ShardState;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracecheck_core::{ShardKey, ThreadId};
use tracecheck_log::StreamMetadata;

/// Handle to one registered shard
///
/// Each shard is driven by a single worker, so the lock is never contended
/// while records flow.
#[derive(Debug, Clone)]
pub struct ShardHandle(Arc<Mutex<ShardState>>);

impl ShardHandle {
    fn new(state: ShardState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    /// Borrow the shard state
    pub fn lock(&self) -> MutexGuard<'_, ShardState> {
        // A panicking worker leaves its own shard half-updated, which the
        // reporter still wants to read.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of all shard states, in registration order
#[derive(Debug, Default)]
pub struct ShardRegistry {
    shards: Mutex<IndexMap<ShardKey, ShardHandle>>,
}

impl ShardRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn shards(&self) -> MutexGuard<'_, IndexMap<ShardKey, ShardHandle>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a shard, replacing any earlier one with the same key
    pub fn init(
        &self,
        key: ShardKey,
        stream: Option<Arc<dyn StreamMetadata>>,
        stream_is_serial: bool,
    ) -> ShardHandle {
        let handle = ShardHandle::new(ShardState::new(key, stream, stream_is_serial));
        let previous = self.shards().insert(key, handle.clone());
        if previous.is_some() {
            tracing::warn!(shard = %key, "shard re-initialized");
        } else {
            tracing::debug!(shard = %key, "shard registered");
        }
        handle
    }

    /// Shard for `thread`, registering it on first sight
    ///
    /// Returns the handle and whether it was just created.
    pub fn lookup_or_create(
        &self,
        thread: ThreadId,
        stream: Option<Arc<dyn StreamMetadata>>,
    ) -> (ShardHandle, bool) {
        let key = ShardKey::Thread(thread);
        let mut shards = self.shards();
        if let Some(handle) = shards.get(&key) {
            return (handle.clone(), false);
        }
        let handle = ShardHandle::new(ShardState::new(key, stream, true));
        shards.insert(key, handle.clone());
        tracing::debug!(shard = %key, "shard discovered");
        (handle, true)
    }

    /// Handle registered under `key`
    #[must_use]
    pub fn get(&self, key: &ShardKey) -> Option<ShardHandle> {
        self.shards().get(key).cloned()
    }

    /// Number of registered shards
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards().len()
    }

    /// Nothing registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards().is_empty()
    }

    /// Every handle, in registration order
    #[must_use]
    pub fn handles(&self) -> Vec<ShardHandle> {
        self.shards().values().cloned().collect()
    }
}
