//! # Fetch orchestration pipeline
//!
//! ```text
//! keys ─▶ scheduler (N workers) ─▶ paginator ─▶ fetch client
//!              │                       └─▶ overflow ledger
//!              └─▶ transform ─▶ accumulate ─▶ checkpoint/save ─▶ warehouse
//! ```
//!
//! ## Module Organization
//!
//! - `query` - logical query keys and key expansion
//! - `record` - raw nested payloads and decoded pages
//! - `fetch` - HTTP fetch client and outcome classification
//! - `paginator` - per-key page state machine
//! - `ledger` - overflow ledger, merged with disk on every save
//! - `scheduler` - bounded worker pool feeding transform and save
//! - `transform` - flattening, coercion and dedup into table batches
//! - `save` - checkpoint saver over the warehouse

pub mod fetch;
pub mod ledger;
pub mod paginator;
pub mod query;
pub mod record;
pub mod save;
pub mod scheduler;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use fetch::{FetchOutcome, Fetcher, HttpFetcher, PageRequest};
pub use ledger::{merge_ledgers, LedgerMap, OverflowLedger};
pub use paginator::{Endpoint, KeyFetcher, KeyOutcome, Paginator};
pub use query::{expand_search_keys, GeoType, QueryKey, SearchFilter};
pub use record::{PageResult, RawRecord, RawValue};
pub use save::{Checkpointer, SaveMode, SaveTarget, Saver};
pub use scheduler::{run_all, RunSummary, SchedulerConfig};
pub use transform::{FlatRow, FlatValue, RecordTransformer, TableBatch, Transform, TransformSpec};
