//! The per-(handler, partition) timer store.
//!
//! A [`TimerStore`] persists timers through the KV facade, keeps the span
//! of outstanding buckets in memory, and reconciles that span with its
//! persisted copy on a background ticker. All multi-key invariants hold
//! under interleaving because every conditional write goes through CAS
//! and the scanner tolerates the partial states `set`, `cancel` and
//! `delete` can leave behind.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::keys::{round_down, round_up, KeySpace, INIT_SEQ, RESOLUTION};
use crate::kv::{Cas, InsertOutcome, KvHandle, KvPool, RemoveOutcome, StoreOutcome};
use crate::registry::RegistryInner;
use crate::scan::{AlarmRecord, ContextRecord, TimerEntry, TimerScan};
use crate::span::{Span, StoreSpan, SyncAction};

pub(crate) struct StoreInner {
    keys: KeySpace,
    kv: KvHandle,
    span: StoreSpan,
    clock: Arc<dyn Clock>,
    scope: String,
    handler: String,
    partn: u16,
    registry: Weak<RegistryInner>,
    stop: watch::Sender<bool>,
}

/// Durable timer store for one `(handler, partition)`.
///
/// Cheap to clone; all clones share the same state. Created through
/// [`TimerRegistry::create`](crate::TimerRegistry::create), torn down
/// with [`TimerStore::free`].
#[derive(Clone)]
pub struct TimerStore {
    inner: Arc<StoreInner>,
}

impl TimerStore {
    pub(crate) async fn connect(
        config: StoreConfig,
        registry: Weak<RegistryInner>,
        pool: &KvPool,
    ) -> Result<Self> {
        let client = pool.fetch(&config.connstr)?;
        let kv = KvHandle::new(client, config.bucket.clone()).with_retry(config.retry.clone());
        let keys = KeySpace::new(config.prefix.clone(), config.handler.clone(), config.partn);
        let scope = keys.scope();
        let (stop, _) = watch::channel(false);

        let inner = Arc::new(StoreInner {
            keys,
            kv,
            span: StoreSpan::new_empty(scope.clone()),
            clock: Arc::clone(&config.clock),
            scope,
            handler: config.handler,
            partn: config.partn,
            registry,
            stop,
        });

        inner.sync_span().await?;
        spawn_sync(Arc::clone(&inner));

        info!(scope = %inner.scope, "timer store initialized");
        Ok(Self { inner })
    }

    /// Handler this store belongs to.
    #[must_use]
    pub fn handler(&self) -> &str {
        &self.inner.handler
    }

    /// Partition this store owns.
    #[must_use]
    pub fn partition(&self) -> u16 {
        self.inner.partn
    }

    /// Current in-memory span, for diagnostics.
    #[must_use]
    pub fn span(&self) -> Span {
        self.inner.span.read()
    }

    /// Register a firing at `due` carrying `context`, addressable by
    /// `reference`.
    ///
    /// A later `set` with the same `reference` supersedes this one: the
    /// context record is overwritten and the old alarm becomes an orphan
    /// the scanner skips. Due times closer than one resolution period are
    /// pushed out to the next period.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing KV fails. No rollback is
    /// attempted; a half-written timer is invisible to scans and cleaned
    /// up by the usual skip rules.
    pub async fn set(
        &self,
        due: i64,
        reference: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        let inner = &self.inner;
        let now = inner.clock.now_secs();

        let mut due = due;
        if due - now <= RESOLUTION {
            warn!(
                scope = %inner.scope,
                due,
                now,
                "timer too close or past, moving to next period"
            );
            due = now + RESOLUTION;
        }
        let due = round_up(due);

        let (seq, _) = inner.kv.counter(&inner.keys.root(due), 1, INIT_SEQ).await?;

        let akey = inner.keys.alarm(due, seq);
        let ckey = inner.keys.context(reference);

        let alarm = AlarmRecord {
            due,
            context_ref: ckey.clone(),
        };
        inner.kv.upsert_json(&akey, &alarm).await?;

        let crecord = ContextRecord {
            context,
            alarm_ref: akey,
        };
        inner.kv.upsert_json(&ckey, &crecord).await?;

        trace!(scope = %inner.scope, due, seq, reference, "timer created");
        inner.span.expand(due);
        Ok(())
    }

    /// Remove a timer by reference before it fires.
    ///
    /// Unknown references are fine. The bucket counter is never touched;
    /// the scanner skips the removed alarm when it reaches that bucket.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing KV fails.
    pub async fn cancel(&self, reference: &str) -> Result<()> {
        let inner = &self.inner;
        trace!(scope = %inner.scope, reference, "cancelling timer");

        let ckey = inner.keys.context(reference);
        let Some((crecord, _)) = inner.kv.get_json::<ContextRecord>(&ckey).await? else {
            trace!(scope = %inner.scope, reference, "nothing to cancel");
            return Ok(());
        };

        if inner.kv.remove(&crecord.alarm_ref, Cas::ZERO).await? == RemoveOutcome::Absent {
            trace!(scope = %inner.scope, key = %crecord.alarm_ref, "alarm already gone");
        }
        if inner.kv.remove(&ckey, Cas::ZERO).await? == RemoveOutcome::Absent {
            trace!(scope = %inner.scope, key = %ckey, "context already gone");
        }
        Ok(())
    }

    /// Acknowledge a fired entry and remove it from the store.
    ///
    /// When the entry was canceled or overwritten between firing and this
    /// call, the context CAS mismatches and the acknowledgement is
    /// silently dropped so the newer schedule stays intact. When the
    /// entry was the last of its bucket, the bucket counter is removed
    /// under CAS so the sequence restarts fresh.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing KV fails.
    pub async fn delete(&self, entry: &TimerEntry) -> Result<()> {
        let inner = &self.inner;
        trace!(scope = %inner.scope, due = entry.due(), seq = entry.seq(), "deleting timer");

        if inner.kv.remove(entry.alarm_ref(), Cas::ZERO).await? == RemoveOutcome::Absent {
            warn!(
                scope = %inner.scope,
                due = entry.due(),
                seq = entry.seq(),
                "fired timer is missing its alarm record"
            );
        }

        match inner.kv.remove(entry.context_ref(), entry.ctx_cas).await? {
            RemoveOutcome::Mismatch => {
                warn!(
                    scope = %inner.scope,
                    due = entry.due(),
                    seq = entry.seq(),
                    "timer was cancelled or overridden after it fired"
                );
                return Ok(());
            }
            RemoveOutcome::Absent => return Ok(()),
            RemoveOutcome::Removed => {}
        }

        if entry.top_cas.is_zero() {
            return Ok(());
        }

        let pos = inner.keys.root(entry.due());
        debug!(scope = %inner.scope, key = %pos, "last entry in bucket, removing counter");
        match inner.kv.remove(&pos, entry.top_cas).await? {
            RemoveOutcome::Removed => inner.span.shrink(entry.due()),
            outcome => {
                trace!(scope = %inner.scope, key = %pos, ?outcome, "bucket counter moved on, leaving it");
            }
        }
        Ok(())
    }

    /// Begin a scan over the timers due by now.
    ///
    /// Returns `None` when the span proves there is nothing to do: the
    /// span is a point and stale by more than three resolution periods.
    #[must_use]
    pub fn scan_due(&self) -> Option<TimerScan> {
        let inner = &self.inner;
        let span = inner.span.read();
        let now = round_down(inner.clock.now_secs());

        if span.start == span.stop && now - span.stop > 3 * RESOLUTION {
            trace!(scope = %inner.scope, ?span, "no outstanding timers, skipping scan");
            return None;
        }

        let stop = now.min(span.stop);
        trace!(scope = %inner.scope, start = span.start, stop, "starting scan");
        Some(TimerScan::new(
            inner.kv.clone(),
            inner.keys.clone(),
            span.start,
            stop,
        ))
    }

    /// Run one span reconcile cycle immediately instead of waiting for
    /// the ticker (useful in tests and during controlled handoff).
    ///
    /// # Errors
    ///
    /// Returns an error when the backing KV fails.
    pub async fn sync_now(&self) -> Result<()> {
        self.inner.sync_span().await
    }

    /// Stop the background sync and deregister this store.
    pub fn free(&self) {
        self.inner.shutdown();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner.handler, self.inner.partn);
        }
        info!(scope = %self.inner.scope, "timer store freed");
    }

    /// Stop the background sync without touching the registry.
    pub(crate) fn stop_sync(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for TimerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerStore")
            .field("scope", &self.inner.scope)
            .field("span", &self.inner.span.read())
            .finish_non_exhaustive()
    }
}

impl StoreInner {
    /// Reconcile the in-memory span with its persisted copy.
    ///
    /// The KV read and write happen outside the span lock; only the
    /// branch decision runs inside it.
    pub(crate) async fn sync_span(&self) -> Result<()> {
        let key = self.keys.span();
        let remote = self.kv.get_json::<Span>(&key).await?;
        let now = self.clock.now_secs();

        match self.span.decide(remote, now) {
            SyncAction::Noop => Ok(()),
            SyncAction::Insert { span } => {
                match self.kv.insert_json(&key, &span).await? {
                    InsertOutcome::Created(cas) => {
                        self.span.commit(cas);
                        trace!(scope = %self.scope, ?span, "span persisted");
                    }
                    InsertOutcome::Exists => {
                        // Another node won the insert; merge on the next tick.
                        warn!(scope = %self.scope, ?span, "span appeared concurrently, retrying next tick");
                    }
                }
                Ok(())
            }
            SyncAction::Replace { span, expect } => {
                match self.kv.replace_json(&key, &span, expect).await? {
                    StoreOutcome::Stored(cas) => {
                        self.span.commit(cas);
                        trace!(scope = %self.scope, ?span, "span merged and saved");
                    }
                    StoreOutcome::Absent | StoreOutcome::Mismatch => {
                        warn!(
                            scope = %self.scope,
                            ?span,
                            "span changed again externally, not committing merge"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

/// Drive periodic span reconciliation until the store is freed.
///
/// A sync error is terminal: the store is considered dead and the
/// surrounding system is expected to recreate it.
fn spawn_sync(inner: Arc<StoreInner>) {
    let mut stop_rx = inner.stop.subscribe();
    let period = Duration::from_secs(RESOLUTION as u64);

    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = inner.sync_span().await {
                        error!(scope = %inner.scope, error = %err, "span sync failed, stopping store sync");
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        debug!(scope = %inner.scope, "span sync stopped");
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::context_hash;

    async fn test_store(clock: Arc<ManualClock>) -> (TimerStore, KvHandle) {
        let pool = KvPool::new();
        let config = StoreConfig::in_memory("ev", "onTick", 0).with_clock(clock);
        let client = pool.fetch("mem://").expect("mem backend");
        let store = TimerStore::connect(config, Weak::new(), &pool)
            .await
            .expect("connect");
        (store, KvHandle::new(client, "default"))
    }

    #[tokio::test]
    async fn test_set_writes_alarm_context_and_counter() {
        let clock = Arc::new(ManualClock::new(500));
        let (store, kv) = test_store(Arc::clone(&clock)).await;

        store
            .set(1000, "r1", serde_json::json!({"x": 1}))
            .await
            .expect("set");

        // 1000 rounds up to 1001; first sequence in a fresh bucket is 129.
        let (seq, _) = kv
            .get_json::<i64>("ev:timerstore:onTick:0:root:1001")
            .await
            .expect("get")
            .expect("counter present");
        assert_eq!(seq, 129);

        let (alarm, _) = kv
            .get_json::<AlarmRecord>("ev:timerstore:onTick:0:alarm:1001:129")
            .await
            .expect("get")
            .expect("alarm present");
        assert_eq!(alarm.due, 1001);
        assert_eq!(
            alarm.context_ref,
            format!("ev:timerstore:onTick:0:context:{}", context_hash("r1"))
        );

        let (crecord, _) = kv
            .get_json::<ContextRecord>(&alarm.context_ref)
            .await
            .expect("get")
            .expect("context present");
        assert_eq!(crecord.context, serde_json::json!({"x": 1}));
        assert_eq!(crecord.alarm_ref, "ev:timerstore:onTick:0:alarm:1001:129");

        assert_eq!(store.span().stop, 1001);
    }

    #[tokio::test]
    async fn test_set_too_close_moves_to_next_period() {
        let clock = Arc::new(ManualClock::new(500));
        let (store, kv) = test_store(Arc::clone(&clock)).await;

        // due in the past: pushed to now + RESOLUTION, then rounded up.
        store.set(100, "late", serde_json::json!(null)).await.expect("set");

        let due = round_up(500 + RESOLUTION);
        assert!(kv
            .get_json::<i64>(&format!("ev:timerstore:onTick:0:root:{due}"))
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn test_cancel_removes_both_records() {
        let clock = Arc::new(ManualClock::new(500));
        let (store, kv) = test_store(Arc::clone(&clock)).await;

        store.set(1000, "r1", serde_json::json!(1)).await.expect("set");
        store.cancel("r1").await.expect("cancel");

        assert!(kv
            .get_json::<AlarmRecord>("ev:timerstore:onTick:0:alarm:1001:129")
            .await
            .expect("get")
            .is_none());
        let ckey = format!("ev:timerstore:onTick:0:context:{}", context_hash("r1"));
        assert!(kv
            .get_json::<ContextRecord>(&ckey)
            .await
            .expect("get")
            .is_none());

        // counter survives a cancel
        assert!(kv
            .get_json::<i64>("ev:timerstore:onTick:0:root:1001")
            .await
            .expect("get")
            .is_some());
    }

    #[tokio::test]
    async fn test_cancel_unknown_reference_is_ok() {
        let clock = Arc::new(ManualClock::new(500));
        let (store, _) = test_store(clock).await;
        store.cancel("never-set").await.expect("cancel");
    }

    #[tokio::test]
    async fn test_scan_due_on_fresh_store_has_nothing() {
        let clock = Arc::new(ManualClock::new(500));
        let (store, _) = test_store(Arc::clone(&clock)).await;

        // Fresh span covers "now"; a scan exists but yields nothing.
        if let Some(mut scan) = store.scan_due() {
            assert!(scan.next_entry().await.expect("scan").is_none());
        }
    }
}
