//! # timerstore
//!
//! Durable, partitioned timer store over a compare-and-swap key/value
//! facade. Handlers schedule a callback at an absolute wall-clock time
//! with an opaque context value, addressed by a caller-chosen reference;
//! a scanner surfaces due entries for the host to dispatch and
//! acknowledge.
//!
//! # Architecture
//!
//! - Every timer is two persisted records: an alarm keyed by its rounded
//!   due time and per-bucket sequence, and a content-addressed context
//!   keyed by the hash of its reference. Each record points at the other.
//! - A per-store span `{start, stop}` bounds the buckets a scan must
//!   walk; it is persisted and reconciled under CAS so concurrent owners
//!   of the same partition converge by widening.
//! - There are no transactions and no per-entry timer tasks: the scanner
//!   skips the partial states concurrent `set`, `cancel` and crash can
//!   leave behind, which keeps the store self-healing without a GC pass.
//!
//! # Key Types
//!
//! - [`TimerRegistry`]: process-wide map of stores by `(handler, partition)`
//! - [`TimerStore`]: `set` / `cancel` / `scan_due` / `delete` / `free`
//! - [`TimerScan`] and [`TimerEntry`]: the fire scan and what it yields
//! - [`kv::KvClient`]: the CAS facade a backend implements
//!
//! # Example
//!
//! ```
//! use timerstore::{StoreConfig, TimerRegistry};
//!
//! # async fn demo() -> timerstore::Result<()> {
//! let registry = TimerRegistry::new();
//! registry.create(StoreConfig::in_memory("ev", "onTick", 0)).await?;
//!
//! let store = registry.fetch("onTick", 0).expect("just created");
//! let due = 2_000_000_000;
//! store.set(due, "doc-42", serde_json::json!({"retry": 1})).await?;
//!
//! if let Some(mut scan) = store.scan_due() {
//!     while let Some(entry) = scan.next_entry().await? {
//!         // dispatch the firing, then acknowledge it
//!         store.delete(&entry).await?;
//!     }
//! }
//! store.free();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod clock;
mod config;
mod error;
mod keys;
mod registry;
mod scan;
mod span;
mod store;

/// Compare-and-swap key/value facade and backends.
pub mod kv;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use keys::{context_hash, round_down, round_up, INIT_SEQ, RESOLUTION};
pub use registry::TimerRegistry;
pub use scan::{AlarmRecord, ContextRecord, TimerEntry, TimerScan};
pub use span::Span;
pub use store::TimerStore;
