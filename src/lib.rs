//! Batch harvester for business-registry data
//!
//! Pulls companies, roles and financial statements from the public registry
//! API (plus annual accounts from a commercial API), flattens the nested
//! payloads into rows and upserts them into a SQLite warehouse. Queries whose
//! result set exceeds the search API's paging ceiling are recorded in an
//! overflow ledger so a later run can re-split them.

pub mod config;
pub mod error;
pub mod harvest;
pub mod pipeline;
pub mod sources;
pub mod warehouse;

pub use config::HarvestConfig;
pub use error::{HarvestError, HarvestResult};
pub use harvest::Harvester;
