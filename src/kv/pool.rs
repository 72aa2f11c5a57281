//! Process-wide pool of KV clients keyed by connection string.
//!
//! Stores on the same connection string share one client. The `mem://`
//! scheme is built lazily; any other backend must be registered by the
//! host before a store is created against it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StoreError};

use super::{KvClient, MemoryKv};

const MEMORY_SCHEME: &str = "mem://";

/// Shared pool of KV clients.
#[derive(Default)]
pub struct KvPool {
    clients: RwLock<HashMap<String, Arc<dyn KvClient>>>,
}

impl KvPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a client for a connection string.
    ///
    /// Replaces any client previously registered under the same string.
    pub fn register(&self, connstr: impl Into<String>, client: Arc<dyn KvClient>) {
        let connstr = connstr.into();
        debug!(connstr, "registering kv client");
        self.clients.write().insert(connstr, client);
    }

    /// Fetch the shared client for a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownBackend`] when the string uses an
    /// unregistered scheme.
    pub fn fetch(&self, connstr: &str) -> Result<Arc<dyn KvClient>> {
        if let Some(client) = self.clients.read().get(connstr) {
            return Ok(Arc::clone(client));
        }

        if connstr.starts_with(MEMORY_SCHEME) {
            let mut clients = self.clients.write();
            let client = clients
                .entry(connstr.to_string())
                .or_insert_with(|| Arc::new(MemoryKv::new()) as Arc<dyn KvClient>);
            return Ok(Arc::clone(client));
        }

        Err(StoreError::unknown_backend(connstr))
    }
}

impl std::fmt::Debug for KvPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvPool")
            .field("clients", &self.clients.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_scheme_is_built_lazily_and_shared() {
        let pool = KvPool::new();
        let a = pool.fetch("mem://local").expect("fetch");
        let b = pool.fetch("mem://local").expect("fetch");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_connstrs_get_distinct_clients() {
        let pool = KvPool::new();
        let a = pool.fetch("mem://one").expect("fetch");
        let b = pool.fetch("mem://two").expect("fetch");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_scheme_is_an_error() {
        let pool = KvPool::new();
        let err = pool.fetch("couchbase://cluster").expect_err("must fail");
        assert!(matches!(err, StoreError::UnknownBackend { .. }));
    }

    #[test]
    fn test_registered_client_takes_priority() {
        let pool = KvPool::new();
        let custom: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        pool.register("mem://custom", Arc::clone(&custom));

        let fetched = pool.fetch("mem://custom").expect("fetch");
        assert!(Arc::ptr_eq(&fetched, &custom));
    }
}
