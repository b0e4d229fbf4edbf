//! Warehouse collaborator: read rows with SQL, upsert row sets by key
//!
//! Tables are addressed as `dataset.table`; backends decide how that maps to
//! a physical name.

pub mod sqlite;

pub use sqlite::SqliteWarehouse;

use crate::error::HarvestResult;
use crate::pipeline::transform::{FlatRow, FlatValue};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

/// How a row set lands in its destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Upsert on the key columns, last write wins
    Merge,
    Append,
    /// Drop existing contents, then insert
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: &str, table: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }

    /// Single-namespace name, e.g. `brreg_company_data`
    pub fn qualified(&self) -> String {
        format!("{}_{}", self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Declared storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Integer,
    Real,
    Text,
    Date,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Type implied by a non-null value
    pub fn infer(value: &FlatValue) -> Option<Self> {
        match value {
            FlatValue::Null => None,
            FlatValue::Bool(_) => Some(ColumnType::Boolean),
            FlatValue::Int(_) => Some(ColumnType::Integer),
            FlatValue::Float(_) => Some(ColumnType::Real),
            FlatValue::Text(_) => Some(ColumnType::Text),
            FlatValue::Date(_) => Some(ColumnType::Date),
            FlatValue::Timestamp(_) => Some(ColumnType::Timestamp),
            FlatValue::List(_) => Some(ColumnType::Json),
        }
    }
}

/// Explicit per-column types; columns not listed are inferred from the data
pub type ColumnTypes = BTreeMap<String, ColumnType>;

/// One table's share of a checkpoint write
#[derive(Debug, Clone, Copy)]
pub struct TableWrite<'a> {
    pub table: &'a TableRef,
    pub rows: &'a [FlatRow],
    pub mode: SaveMode,
    pub key_columns: &'a [String],
    pub column_types: &'a ColumnTypes,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn read(&self, sql: &str) -> HarvestResult<Vec<FlatRow>>;

    async fn table_exists(&self, table: &TableRef) -> HarvestResult<bool>;

    /// Write every table in one transaction; returns rows written per table.
    /// Either all writes commit or none do.
    async fn write_all(&self, writes: &[TableWrite<'_>]) -> HarvestResult<Vec<usize>>;

    /// Write `rows` in one transaction; returns the number of rows written
    async fn upsert(
        &self,
        rows: &[FlatRow],
        table: &TableRef,
        mode: SaveMode,
        key_columns: &[String],
        column_types: &ColumnTypes,
    ) -> HarvestResult<usize> {
        let write = TableWrite {
            table,
            rows,
            mode,
            key_columns,
            column_types,
        };
        let counts = self.write_all(&[write]).await?;
        Ok(counts.into_iter().sum())
    }
}
