//! Error taxonomy for a harvest run
//!
//! Only `HarvestError::RateLimited` is allowed to unwind a whole run. Every
//! other per-key failure is caught at the task boundary by the scheduler.
//! Soft outcomes (not found, overflow, transient HTTP errors) are not errors
//! at all: they travel as `FetchOutcome` / `KeyOutcome` variants.

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Column-level violations detected while flattening records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("duplicate column '{column}' after flattening")]
    DuplicateColumn { column: String },
}

#[derive(Debug, Error)]
pub enum HarvestError {
    /// HTTP 429 from upstream. Fatal: the cooldown is unknown, so nothing retries.
    #[error("rate limit exceeded (429) for {context}")]
    RateLimited { context: String },
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("warehouse error: {0}")]
    Warehouse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker task failed: {0}")]
    Task(String),
}

impl HarvestError {
    pub fn rate_limited(context: impl Into<String>) -> Self {
        HarvestError::RateLimited {
            context: context.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, HarvestError::RateLimited { .. })
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::Warehouse(err.to_string())
    }
}

pub type HarvestResult<T> = Result<T, HarvestError>;
