//! Due-timer scanning.
//!
//! A scan walks the store's span as a two-level cursor: the outer row
//! cursor steps through time buckets at [`RESOLUTION`](crate::RESOLUTION)
//! granularity, the inner column cursor through sequence numbers within a
//! bucket. Gaps, canceled entries (context gone) and superseded entries
//! (context points at a newer alarm) are skipped, which is what makes
//! partially failed writes harmless.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::Result;
use crate::keys::{KeySpace, INIT_SEQ, RESOLUTION};
use crate::kv::{Cas, KvHandle};

/// Persisted alarm record: one scheduled firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    /// Rounded due time of the firing.
    pub due: i64,
    /// Key of the matching context record.
    pub context_ref: String,
}

/// Persisted context record: the payload a firing carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Opaque caller payload.
    pub context: serde_json::Value,
    /// Key of the alarm this context currently belongs to.
    pub alarm_ref: String,
}

/// A due timer surfaced by a scan, ready to dispatch.
///
/// Carries the CAS tokens `delete` needs to tell an acknowledged firing
/// apart from one that was canceled or overwritten after it fired.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub(crate) alarm: AlarmRecord,
    pub(crate) context: ContextRecord,
    pub(crate) alarm_seq: i64,
    pub(crate) ctx_cas: Cas,
    pub(crate) top_cas: Cas,
}

impl TimerEntry {
    /// Rounded due time of the firing.
    #[must_use]
    pub fn due(&self) -> i64 {
        self.alarm.due
    }

    /// Sequence number within the time bucket.
    #[must_use]
    pub fn seq(&self) -> i64 {
        self.alarm_seq
    }

    /// The caller's opaque payload.
    #[must_use]
    pub fn context(&self) -> &serde_json::Value {
        &self.context.context
    }

    /// Key of the alarm record this entry was read from.
    #[must_use]
    pub fn alarm_ref(&self) -> &str {
        &self.context.alarm_ref
    }

    /// Key of the context record this entry was read from.
    #[must_use]
    pub fn context_ref(&self) -> &str {
        &self.alarm.context_ref
    }

    /// Whether this entry was the last one in its bucket when scanned.
    #[must_use]
    pub fn is_bucket_tail(&self) -> bool {
        !self.top_cas.is_zero()
    }
}

#[derive(Debug)]
struct RowCursor {
    start: i64,
    current: i64,
    stop: i64,
}

#[derive(Debug)]
struct ColCursor {
    current: i64,
    stop: i64,
    top_cas: Cas,
}

/// Cursor over the due timers of one store.
///
/// Produced by [`TimerStore::scan_due`](crate::TimerStore::scan_due);
/// holds no locks, so it may be driven as slowly as dispatch requires.
#[derive(Debug)]
pub struct TimerScan {
    kv: KvHandle,
    keys: KeySpace,
    scope: String,
    row: RowCursor,
    col: Option<ColCursor>,
}

impl TimerScan {
    pub(crate) fn new(kv: KvHandle, keys: KeySpace, start: i64, stop: i64) -> Self {
        let scope = keys.scope();
        Self {
            kv,
            keys,
            scope,
            row: RowCursor {
                start,
                current: start,
                stop,
            },
            col: None,
        }
    }

    /// Next due entry, or `None` when this scan is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing KV fails; the scan may be dropped
    /// and a fresh one started, nothing is lost.
    pub async fn next_entry(&mut self) -> Result<Option<TimerEntry>> {
        loop {
            if let Some(entry) = self.next_column().await? {
                return Ok(Some(entry));
            }
            if !self.next_row().await? {
                return Ok(None);
            }
        }
    }

    /// Step the outer cursor to the next non-empty time bucket.
    async fn next_row(&mut self) -> Result<bool> {
        self.col = None;

        while self.row.current < self.row.stop {
            self.row.current += RESOLUTION;

            let pos = self.keys.root(self.row.current);
            if let Some((stop, cas)) = self.kv.get_json::<i64>(&pos).await? {
                self.col = Some(ColCursor {
                    current: INIT_SEQ,
                    stop,
                    top_cas: cas,
                });
                trace!(scope = %self.scope, bucket = self.row.current, seq_stop = stop, "found row");
                return Ok(true);
            }
        }

        trace!(
            scope = %self.scope,
            start = self.row.start,
            stop = self.row.stop,
            "no rows left"
        );
        Ok(false)
    }

    /// Step the inner cursor to the next live entry in the current bucket.
    async fn next_column(&mut self) -> Result<Option<TimerEntry>> {
        let Some(col) = self.col.as_mut() else {
            return Ok(None);
        };

        while col.current <= col.stop {
            let seq = col.current;
            col.current += 1;

            let akey = self.keys.alarm(self.row.current, seq);
            let Some((alarm, _)) = self.kv.get_json::<AlarmRecord>(&akey).await? else {
                debug!(scope = %self.scope, key = %akey, "skipping gap in bucket");
                continue;
            };

            let fetched = self.kv.get_json::<ContextRecord>(&alarm.context_ref).await?;
            let Some((context, ctx_cas)) = fetched else {
                debug!(scope = %self.scope, key = %akey, "alarm canceled, skipping");
                continue;
            };
            if context.alarm_ref != akey {
                debug!(scope = %self.scope, key = %akey, "alarm superseded, skipping");
                continue;
            }

            let top_cas = if seq == col.stop {
                col.top_cas
            } else {
                Cas::ZERO
            };
            let entry = TimerEntry {
                alarm,
                context,
                alarm_seq: seq,
                ctx_cas,
                top_cas,
            };
            trace!(scope = %self.scope, due = entry.due(), seq, "scan yielding entry");
            return Ok(Some(entry));
        }

        Ok(None)
    }
}
