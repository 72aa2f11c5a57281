//! Span tracking for a timer store.
//!
//! The span `{start, stop}` is a conservative cover of every outstanding
//! alarm's due time: scans walk only the buckets inside it. Each store
//! keeps the span in memory behind a mutex and periodically reconciles it
//! with the persisted copy, merging concurrent writers by widening.
//!
//! Expansion moves both ends; shrinking only moves `start` forward. `stop`
//! marks the furthest point any producer has pushed, and scans cap at
//! `min(now, stop)`, so an over-estimated `stop` is safe where a
//! read-modify-write of it would race concurrent schedulers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::keys::{round_down, round_up};
use crate::kv::Cas;

/// Inclusive range of time buckets that may hold outstanding alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Earliest bucket that may still hold an alarm.
    pub start: i64,
    /// Latest bucket any producer has scheduled into.
    pub stop: i64,
}

/// What the reconcile decision asks the store to do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncAction {
    /// Nothing to write.
    Noop,
    /// The span was never persisted; create it.
    Insert { span: Span },
    /// Write the (possibly merged) span over the observed revision.
    Replace { span: Span, expect: Cas },
}

#[derive(Debug, Clone, Copy)]
struct SpanState {
    span: Span,
    empty: bool,
    cas: Cas,
}

/// Mutex-guarded span state for one store.
///
/// The lock is held only around in-memory reads and the reconcile branch
/// decision; KV I/O happens outside it.
#[derive(Debug)]
pub(crate) struct StoreSpan {
    state: Mutex<SpanState>,
    scope: String,
}

impl StoreSpan {
    /// A span that has seen no data yet; the first reconcile initializes it.
    pub(crate) fn new_empty(scope: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(SpanState {
                span: Span { start: 0, stop: 0 },
                empty: true,
                cas: Cas::ZERO,
            }),
            scope: scope.into(),
        }
    }

    /// Copy of the current span.
    pub(crate) fn read(&self) -> Span {
        self.state.lock().span
    }

    /// Widen the span to include `point`.
    pub(crate) fn expand(&self, point: i64) {
        let mut state = self.state.lock();
        if state.span.start > point {
            state.span.start = point;
        }
        if state.span.stop < point {
            state.span.stop = point;
        }
    }

    /// Move `start` forward to `new_start`; never moves it back, never
    /// touches `stop`.
    pub(crate) fn shrink(&self, new_start: i64) {
        let mut state = self.state.lock();
        if state.span.start < new_start {
            state.span.start = new_start;
        }
    }

    /// Run the reconcile branch table against the persisted copy.
    ///
    /// `remote` is the outcome of reading the span key; `now` seeds a
    /// brand-new span. State is updated under the lock; the caller
    /// performs the returned write outside it and reports success via
    /// [`StoreSpan::commit`].
    pub(crate) fn decide(&self, remote: Option<(Span, Cas)>, now: i64) -> SyncAction {
        let mut state = self.state.lock();
        match remote {
            // Brand new store, nothing persisted: seed from the clock and
            // let the first local change trigger the insert.
            None if state.empty => {
                state.span = Span {
                    start: round_down(now),
                    stop: round_up(now),
                };
                state.empty = false;
                state.cas = Cas::ZERO;
                info!(scope = %self.scope, span = ?state.span, "span initialized");
                SyncAction::Noop
            }

            // Never persisted, but we have local data.
            None => SyncAction::Insert { span: state.span },

            // We have no data, but a span is persisted: adopt it.
            Some((ext, rcas)) if state.empty => {
                state.span = ext;
                state.cas = rcas;
                state.empty = false;
                trace!(scope = %self.scope, span = ?state.span, "span adopted from store");
                SyncAction::Replace {
                    span: state.span,
                    expect: rcas,
                }
            }

            // Someone else moved the persisted span: merge by widening.
            Some((ext, rcas)) if state.cas != rcas => {
                warn!(
                    scope = %self.scope,
                    local = ?state.span,
                    external = ?ext,
                    "span changed externally, merging"
                );
                if state.span.start > ext.start {
                    state.span.start = ext.start;
                }
                if state.span.stop < ext.stop {
                    state.span.stop = ext.stop;
                }
                SyncAction::Replace {
                    span: state.span,
                    expect: rcas,
                }
            }

            // Nothing moved on either side.
            Some((ext, _)) if state.span == ext => {
                trace!(scope = %self.scope, span = ?state.span, "span unchanged");
                SyncAction::Noop
            }

            // Only local changes.
            Some((_, rcas)) => SyncAction::Replace {
                span: state.span,
                expect: rcas,
            },
        }
    }

    /// Record the CAS of a successfully persisted span.
    pub(crate) fn commit(&self, cas: Cas) {
        self.state.lock().cas = cas;
    }
}
