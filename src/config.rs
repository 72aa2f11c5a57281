//! Store configuration.

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::kv::RetryPolicy;

/// Configuration for one `(handler, partition)` timer store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Key namespace prefix shared by every store of this deployment.
    pub prefix: String,
    /// Handler the timers belong to.
    pub handler: String,
    /// Partition this store owns.
    pub partn: u16,
    /// Connection string of the backing KV.
    pub connstr: String,
    /// Bucket inside the KV where all keys live.
    pub bucket: String,
    pub(crate) retry: RetryPolicy,
    pub(crate) clock: Arc<dyn Clock>,
}

impl StoreConfig {
    /// Create a configuration against an explicit KV backend.
    #[must_use]
    pub fn new(
        prefix: impl Into<String>,
        handler: impl Into<String>,
        partn: u16,
        connstr: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            handler: handler.into(),
            partn,
            connstr: connstr.into(),
            bucket: bucket.into(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a configuration against the process-local `mem://` backend.
    #[must_use]
    pub fn in_memory(prefix: impl Into<String>, handler: impl Into<String>, partn: u16) -> Self {
        Self::new(prefix, handler, partn, "mem://", "default")
    }

    /// Override the KV retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("prefix", &self.prefix)
            .field("handler", &self.handler)
            .field("partn", &self.partn)
            .field("connstr", &self.connstr)
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_in_memory_defaults() {
        let config = StoreConfig::in_memory("ev", "onTick", 3);
        assert_eq!(config.connstr, "mem://");
        assert_eq!(config.bucket, "default");
        assert_eq!(config.partn, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let clock = Arc::new(ManualClock::new(500));
        let config = StoreConfig::in_memory("ev", "onTick", 0)
            .with_retry(RetryPolicy::none())
            .with_clock(clock);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.clock.now_secs(), 500);
    }
}
