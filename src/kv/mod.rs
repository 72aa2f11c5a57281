//! Compare-and-swap key/value facade.
//!
//! The store persists everything through this thin abstraction: six raw
//! operations over bytes, each reporting absence and CAS mismatch as
//! distinct outcomes rather than errors. [`KvHandle`] layers the parts
//! every caller wants on top of a client: bucket scoping, JSON
//! encode/decode, and bounded retries for transient failures.
//!
//! # Key Types
//!
//! - [`KvClient`]: the raw async facade a backend implements
//! - [`KvHandle`]: bucket-scoped, typed, retrying view over a client
//! - [`Cas`]: opaque per-key compare-and-swap token; zero means
//!   "unconditional"
//! - [`KvPool`]: process-wide client pool keyed by connection string

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{Result, StoreError};

mod memory;
mod pool;

pub use memory::MemoryKv;
pub use pool::KvPool;

/// Compare-and-swap token for a KV entry.
///
/// Tokens are opaque and only compared for equality. [`Cas::ZERO`] never
/// matches a stored entry and means "unconditional" when passed to a
/// conditional operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cas(pub(crate) u64);

impl Cas {
    /// The unconditional / absent token.
    pub const ZERO: Self = Self(0);

    /// Check whether this is the unconditional token.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key did not exist and was created.
    Created(Cas),
    /// The key already exists; nothing was written.
    Exists,
}

/// Outcome of a CAS-conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The value was replaced.
    Stored(Cas),
    /// The key vanished before the replace.
    Absent,
    /// The stored CAS no longer matches the expected token.
    Mismatch,
}

/// Outcome of a (possibly CAS-conditional) remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The key was removed.
    Removed,
    /// The key was already gone.
    Absent,
    /// The stored CAS no longer matches the expected token.
    Mismatch,
}

/// Raw async facade over a CAS-capable KV backend.
///
/// All operations are bucket-scoped and safe for concurrent use. Expiry
/// is deliberately absent: timer keys are removed explicitly.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Read a key, returning its bytes and CAS token when present.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, Cas)>>;

    /// Create a key that must not already exist.
    async fn insert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<InsertOutcome>;

    /// Write a key unconditionally.
    async fn upsert(&self, bucket: &str, key: &str, value: &[u8]) -> Result<Cas>;

    /// Replace an existing key, conditional on `expect` unless it is zero.
    async fn replace(
        &self,
        bucket: &str,
        key: &str,
        value: &[u8],
        expect: Cas,
    ) -> Result<StoreOutcome>;

    /// Remove a key, conditional on `expect` unless it is zero.
    async fn remove(&self, bucket: &str, key: &str, expect: Cas) -> Result<RemoveOutcome>;

    /// Atomically adjust a numeric key and return the post-image.
    ///
    /// On first touch the value becomes `initial + delta`; afterwards each
    /// call adds `delta`.
    async fn counter(&self, bucket: &str, key: &str, delta: i64, initial: i64)
        -> Result<(i64, Cas)>;
}

impl std::fmt::Debug for dyn KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn KvClient")
    }
}

/// Retry policy for transient KV failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first before giving up.
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds.
    pub base_backoff_ms: u64,
    /// Cap on any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 3200,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// budget is exhausted.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            None
        } else {
            let exp = attempt.saturating_sub(1).min(20);
            let ms = self
                .base_backoff_ms
                .saturating_mul(2u64.saturating_pow(exp))
                .min(self.max_backoff_ms);
            Some(Duration::from_millis(ms))
        }
    }
}

/// Bucket-scoped, typed, retrying view over a [`KvClient`].
///
/// Absent/mismatch outcomes pass straight through; only errors the backend
/// reports as transient ([`StoreError::is_retryable`]) are retried, and
/// exhaustion surfaces as [`StoreError::RetryTimeout`].
#[derive(Clone)]
pub struct KvHandle {
    client: Arc<dyn KvClient>,
    bucket: String,
    retry: RetryPolicy,
}

impl KvHandle {
    /// Create a handle over `client` scoped to `bucket`.
    #[must_use]
    pub fn new(client: Arc<dyn KvClient>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The bucket this handle writes into.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Read and decode a key, returning the value and its CAS when present.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, Cas)>> {
        let fetched = self
            .retrying("get", key, || self.client.get(&self.bucket, key))
            .await?;
        match fetched {
            Some((bytes, cas)) => {
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some((value, cas)))
            }
            None => Ok(None),
        }
    }

    /// Encode and insert a key that must not already exist.
    pub async fn insert_json<T: Serialize>(&self, key: &str, value: &T) -> Result<InsertOutcome> {
        let bytes = serde_json::to_vec(value)?;
        self.retrying("insert", key, || {
            self.client.insert(&self.bucket, key, &bytes)
        })
        .await
    }

    /// Encode and write a key unconditionally.
    pub async fn upsert_json<T: Serialize>(&self, key: &str, value: &T) -> Result<Cas> {
        let bytes = serde_json::to_vec(value)?;
        self.retrying("upsert", key, || {
            self.client.upsert(&self.bucket, key, &bytes)
        })
        .await
    }

    /// Encode and replace an existing key under CAS.
    pub async fn replace_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expect: Cas,
    ) -> Result<StoreOutcome> {
        let bytes = serde_json::to_vec(value)?;
        self.retrying("replace", key, || {
            self.client.replace(&self.bucket, key, &bytes, expect)
        })
        .await
    }

    /// Remove a key, conditional on `expect` unless it is zero.
    pub async fn remove(&self, key: &str, expect: Cas) -> Result<RemoveOutcome> {
        self.retrying("remove", key, || {
            self.client.remove(&self.bucket, key, expect)
        })
        .await
    }

    /// Atomically adjust a numeric key and return the post-image.
    pub async fn counter(&self, key: &str, delta: i64, initial: i64) -> Result<(i64, Cas)> {
        self.retrying("counter", key, || {
            self.client.counter(&self.bucket, key, delta, initial)
        })
        .await
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(StoreError::retry_timeout(op, key));
                    };
                    warn!(
                        op,
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient kv failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for KvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvHandle")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_zero_is_unconditional() {
        assert!(Cas::ZERO.is_zero());
        assert!(!Cas(7).is_zero());
        assert_eq!(Cas::default(), Cas::ZERO);
    }

    #[test]
    fn test_retry_policy_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 400,
        };
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn test_retry_policy_none_gives_up_immediately() {
        assert_eq!(RetryPolicy::none().next_delay(1), None);
    }

    #[tokio::test]
    async fn test_handle_round_trips_json() {
        let kv = Arc::new(MemoryKv::new());
        let handle = KvHandle::new(kv, "default");

        let cas = handle
            .upsert_json("k", &serde_json::json!({"a": 1}))
            .await
            .expect("upsert");
        assert!(!cas.is_zero());

        let (value, got_cas) = handle
            .get_json::<serde_json::Value>("k")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(value, serde_json::json!({"a": 1}));
        assert_eq!(got_cas, cas);
    }

    #[tokio::test]
    async fn test_handle_decode_failure_is_serialization_error() {
        let kv = Arc::new(MemoryKv::new());
        let handle = KvHandle::new(Arc::clone(&kv) as Arc<dyn KvClient>, "default");

        kv.upsert("default", "k", b"not json")
            .await
            .expect("raw upsert");

        let err = handle
            .get_json::<i64>("k")
            .await
            .expect_err("decode must fail");
        assert!(matches!(err, StoreError::Serialization { .. }));
    }
}
