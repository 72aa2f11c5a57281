//! Process-local KV engine.
//!
//! Backs the `mem://` connection scheme. Implements the full facade
//! contract, including CAS-conditional replace/remove and the counter's
//! initial-plus-delta first touch, so a store running against it behaves
//! exactly like one running against a remote KV minus the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};

use super::{Cas, InsertOutcome, KvClient, RemoveOutcome, StoreOutcome};

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    cas: Cas,
}

/// In-memory CAS key/value store.
///
/// One instance per connection string; buckets are created on first use.
#[derive(Debug, Default)]
pub struct MemoryKv {
    buckets: Mutex<HashMap<String, HashMap<String, Entry>>>,
    next_cas: AtomicU64,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&self) -> Cas {
        Cas(self.next_cas.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, Cas)>> {
        let buckets = self.buckets.lock();
        Ok(buckets
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .map(|entry| (entry.bytes.clone(), entry.cas)))
    }

    async fn insert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<InsertOutcome> {
        let mut buckets = self.buckets.lock();
        let entries = buckets.entry(bucket.to_string()).or_default();
        if entries.contains_key(key) {
            return Ok(InsertOutcome::Exists);
        }
        let cas = self.mint();
        entries.insert(
            key.to_string(),
            Entry {
                bytes: value.to_vec(),
                cas,
            },
        );
        Ok(InsertOutcome::Created(cas))
    }

    async fn upsert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<Cas> {
        let mut buckets = self.buckets.lock();
        let entries = buckets.entry(bucket.to_string()).or_default();
        let cas = self.mint();
        entries.insert(
            key.to_string(),
            Entry {
                bytes: value.to_vec(),
                cas,
            },
        );
        Ok(cas)
    }

    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        expect: Cas,
    ) -> Result<StoreOutcome> {
        let mut buckets = self.buckets.lock();
        let entries = buckets.entry(bucket.to_string()).or_default();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(StoreOutcome::Absent);
        };
        if !expect.is_zero() && entry.cas != expect {
            return Ok(StoreOutcome::Mismatch);
        }
        let cas = self.mint();
        entry.bytes = value.to_vec();
        entry.cas = cas;
        Ok(StoreOutcome::Stored(cas))
    }

    async fn remove(&self, bucket: &str, key: &str, expect: Cas) -> Result<RemoveOutcome> {
        let mut buckets = self.buckets.lock();
        let Some(entries) = buckets.get_mut(bucket) else {
            return Ok(RemoveOutcome::Absent);
        };
        let Some(entry) = entries.get(key) else {
            return Ok(RemoveOutcome::Absent);
        };
        if !expect.is_zero() && entry.cas != expect {
            return Ok(RemoveOutcome::Mismatch);
        }
        entries.remove(key);
        Ok(RemoveOutcome::Removed)
    }

    async fn counter(
        &self,
        bucket: &str,
        key: &str,
        delta: i64,
        initial: i64,
    ) -> Result<(i64, Cas)> {
        let mut buckets = self.buckets.lock();
        let entries = buckets.entry(bucket.to_string()).or_default();
        let value = match entries.get(key) {
            Some(entry) => {
                let current: i64 = serde_json::from_slice(&entry.bytes).map_err(|err| {
                    StoreError::serialization(format!("counter '{key}' is not numeric: {err}"))
                })?;
                current + delta
            }
            None => initial + delta,
        };
        let cas = self.mint();
        entries.insert(
            key.to_string(),
            Entry {
                bytes: serde_json::to_vec(&value)?,
                cas,
            },
        );
        Ok((value, cas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let kv = MemoryKv::new();
        assert!(kv.get("b", "missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_insert_refuses_existing_key() {
        let kv = MemoryKv::new();
        let outcome = kv.insert("b", "k", b"1").await.expect("insert");
        assert!(matches!(outcome, InsertOutcome::Created(_)));

        let outcome = kv.insert("b", "k", b"2").await.expect("insert");
        assert_eq!(outcome, InsertOutcome::Exists);
    }

    #[tokio::test]
    async fn test_upsert_changes_cas() {
        let kv = MemoryKv::new();
        let first = kv.upsert("b", "k", b"1").await.expect("upsert");
        let second = kv.upsert("b", "k", b"2").await.expect("upsert");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_replace_checks_cas() {
        let kv = MemoryKv::new();
        let cas = kv.upsert("b", "k", b"1").await.expect("upsert");

        let stale = Cas(cas.0 + 1000);
        let outcome = kv.replace("b", "k", b"2", stale).await.expect("replace");
        assert_eq!(outcome, StoreOutcome::Mismatch);

        let outcome = kv.replace("b", "k", b"2", cas).await.expect("replace");
        assert!(matches!(outcome, StoreOutcome::Stored(_)));

        let outcome = kv
            .replace("b", "gone", b"3", Cas::ZERO)
            .await
            .expect("replace");
        assert_eq!(outcome, StoreOutcome::Absent);
    }

    #[tokio::test]
    async fn test_remove_conditional_and_unconditional() {
        let kv = MemoryKv::new();
        let cas = kv.upsert("b", "k", b"1").await.expect("upsert");

        let stale = Cas(cas.0 + 1000);
        assert_eq!(
            kv.remove("b", "k", stale).await.expect("remove"),
            RemoveOutcome::Mismatch
        );
        assert_eq!(
            kv.remove("b", "k", cas).await.expect("remove"),
            RemoveOutcome::Removed
        );
        assert_eq!(
            kv.remove("b", "k", Cas::ZERO).await.expect("remove"),
            RemoveOutcome::Absent
        );
    }

    #[tokio::test]
    async fn test_counter_first_touch_applies_delta() {
        let kv = MemoryKv::new();
        let (value, _) = kv.counter("b", "n", 1, 128).await.expect("counter");
        assert_eq!(value, 129);

        let (value, _) = kv.counter("b", "n", 1, 128).await.expect("counter");
        assert_eq!(value, 130);
    }

    #[tokio::test]
    async fn test_counter_value_readable_as_json() {
        let kv = MemoryKv::new();
        kv.counter("b", "n", 1, 128).await.expect("counter");

        let (bytes, _) = kv.get("b", "n").await.expect("get").expect("present");
        let value: i64 = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(value, 129);
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let kv = MemoryKv::new();
        kv.upsert("b1", "k", b"1").await.expect("upsert");
        assert!(kv.get("b2", "k").await.expect("get").is_none());
    }
}
