//! Process-wide registry of timer stores.
//!
//! One [`TimerStore`] exists per `(handler, partition)`; the registry
//! owns the map and the KV pool the stores draw their clients from. The
//! registry lock guards only the map and is never held across KV I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::kv::KvPool;
use crate::store::TimerStore;

fn locator(handler: &str, partn: u16) -> String {
    format!("{handler}:{partn}")
}

pub(crate) struct RegistryInner {
    stores: RwLock<HashMap<String, TimerStore>>,
    pool: Arc<KvPool>,
}

impl RegistryInner {
    pub(crate) fn remove(&self, handler: &str, partn: u16) {
        self.stores.write().remove(&locator(handler, partn));
    }
}

/// Handle to the shared store registry.
///
/// Cheap to clone; all clones see the same stores.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<RegistryInner>,
}

impl TimerRegistry {
    /// Create a registry with its own KV pool.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool(Arc::new(KvPool::new()))
    }

    /// Create a registry over an existing KV pool.
    #[must_use]
    pub fn with_pool(pool: Arc<KvPool>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                stores: RwLock::new(HashMap::new()),
                pool,
            }),
        }
    }

    /// The KV pool stores draw their clients from.
    ///
    /// Hosts register non-`mem://` backends here before calling
    /// [`TimerRegistry::create`].
    #[must_use]
    pub fn pool(&self) -> &Arc<KvPool> {
        &self.inner.pool
    }

    /// Ensure a store exists for `(config.handler, config.partn)`.
    ///
    /// Idempotent: an existing store is reused. Construction runs the
    /// first span reconcile synchronously and spawns the background sync
    /// ticker.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend is unknown or the initial span
    /// reconcile fails; no store is registered in that case.
    pub async fn create(&self, config: StoreConfig) -> Result<()> {
        let loc = locator(&config.handler, config.partn);
        if self.inner.stores.read().contains_key(&loc) {
            warn!(handler = %config.handler, partn = config.partn, "store exists, reusing");
            return Ok(());
        }

        let store =
            TimerStore::connect(config, Arc::downgrade(&self.inner), &self.inner.pool).await?;

        let mut stores = self.inner.stores.write();
        if let Some(previous) = stores.insert(loc, store) {
            // Lost a create race; the replaced store's ticker must not leak.
            previous.stop_sync();
        }
        info!(stores = stores.len(), "store registered");
        Ok(())
    }

    /// Look up the store for `(handler, partn)`.
    #[must_use]
    pub fn fetch(&self, handler: &str, partn: u16) -> Option<TimerStore> {
        self.inner.stores.read().get(&locator(handler, partn)).cloned()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("stores", &self.inner.stores.read().len())
            .finish()
    }
}
