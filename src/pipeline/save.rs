//! Checkpoint/Save stage
//!
//! Each save cycle:
//! 1. persists the overflow ledger (read-merge-write, independent of rows)
//! 2. drops rows whose key columns are null, with a warning
//! 3. deduplicates merge targets by key, last occurrence winning
//! 4. writes every table of the batch in one warehouse transaction
//!
//! `Replace` targets are replaced by the first save of a run only; later
//! checkpoints of the same run append to what the first one wrote.

use super::ledger::OverflowLedger;
use super::transform::{FlatRow, TableBatch};
use crate::error::{HarvestError, HarvestResult};
use crate::warehouse::{ColumnType, ColumnTypes, TableRef, TableWrite, Warehouse};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use crate::warehouse::SaveMode;

/// Receives accumulated rows at every checkpoint
#[async_trait]
pub trait Saver: Send + Sync {
    /// Returns the number of rows written
    async fn save(&self, batch: TableBatch) -> HarvestResult<usize>;
}

/// Where one batch table is written
#[derive(Debug, Clone)]
pub struct SaveTarget {
    pub table: TableRef,
    pub mode: SaveMode,
    pub key_columns: Vec<String>,
    pub column_types: ColumnTypes,
}

impl SaveTarget {
    pub fn new(table: TableRef, mode: SaveMode, key_columns: &[&str]) -> Self {
        Self {
            table,
            mode,
            key_columns: key_columns.iter().map(|k| k.to_string()).collect(),
            column_types: ColumnTypes::new(),
        }
    }

    pub fn merge(table: TableRef, key_columns: &[&str]) -> Self {
        Self::new(table, SaveMode::Merge, key_columns)
    }

    pub fn append(table: TableRef, key_columns: &[&str]) -> Self {
        Self::new(table, SaveMode::Append, key_columns)
    }

    pub fn with_type(mut self, column: &str, ty: ColumnType) -> Self {
        self.column_types.insert(column.to_string(), ty);
        self
    }

    /// Drop null-key rows and, for merges, keep the last row per key
    pub fn prepare(&self, rows: Vec<FlatRow>) -> Vec<FlatRow> {
        let total = rows.len();
        let keyed: Vec<FlatRow> = rows
            .into_iter()
            .filter(|row| row.key(&self.key_columns).is_some())
            .collect();
        if keyed.len() < total {
            log::warn!(
                "⚠️  Dropped {} rows with null {:?} before saving to {}",
                total - keyed.len(),
                self.key_columns,
                self.table
            );
        }

        if self.mode != SaveMode::Merge {
            return keyed;
        }
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        let mut unique: Vec<FlatRow> = Vec::with_capacity(keyed.len());
        for row in keyed {
            let key = row.key(&self.key_columns).unwrap_or_default();
            match index.get(&key) {
                Some(&i) => unique[i] = row,
                None => {
                    index.insert(key, unique.len());
                    unique.push(row);
                }
            }
        }
        unique
    }
}

/// Saver writing to a warehouse and persisting the overflow ledger every cycle
pub struct Checkpointer {
    warehouse: Arc<dyn Warehouse>,
    targets: BTreeMap<String, SaveTarget>,
    ledger: Arc<OverflowLedger>,
    ledger_path: PathBuf,
    replaced: Mutex<HashSet<String>>,
}

impl Checkpointer {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        ledger: Arc<OverflowLedger>,
        ledger_path: PathBuf,
    ) -> Self {
        Self {
            warehouse,
            targets: BTreeMap::new(),
            ledger,
            ledger_path,
            replaced: Mutex::new(HashSet::new()),
        }
    }

    /// Route batch table `name` to `target`
    pub fn target(mut self, name: &str, target: SaveTarget) -> Self {
        self.targets.insert(name.to_string(), target);
        self
    }

    /// Mode for this write: a replace turns into an append once one has committed
    fn effective_mode(&self, name: &str, mode: SaveMode) -> SaveMode {
        if mode != SaveMode::Replace {
            return mode;
        }
        let replaced = self.replaced.lock().unwrap_or_else(|e| e.into_inner());
        if replaced.contains(name) {
            SaveMode::Append
        } else {
            SaveMode::Replace
        }
    }

    fn mark_replaced(&self, names: impl IntoIterator<Item = String>) {
        let mut replaced = self.replaced.lock().unwrap_or_else(|e| e.into_inner());
        replaced.extend(names);
    }
}

#[async_trait]
impl Saver for Checkpointer {
    async fn save(&self, batch: TableBatch) -> HarvestResult<usize> {
        self.ledger.persist(&self.ledger_path)?;

        let mut prepared = Vec::new();
        for (name, rows) in batch.into_tables() {
            let target = self.targets.get(&name).ok_or_else(|| {
                HarvestError::Warehouse(format!("no save target configured for table {}", name))
            })?;
            let rows = target.prepare(rows);
            if rows.is_empty() {
                continue;
            }
            let mode = self.effective_mode(&name, target.mode);
            prepared.push((name, target, mode, rows));
        }
        if prepared.is_empty() {
            return Ok(0);
        }

        let writes: Vec<TableWrite<'_>> = prepared
            .iter()
            .map(|(_, target, mode, rows)| TableWrite {
                table: &target.table,
                rows,
                mode: *mode,
                key_columns: &target.key_columns,
                column_types: &target.column_types,
            })
            .collect();
        let counts = self.warehouse.write_all(&writes).await?;

        self.mark_replaced(
            prepared
                .iter()
                .filter(|(_, _, mode, _)| *mode == SaveMode::Replace)
                .map(|(name, ..)| name.clone()),
        );
        for (write, count) in writes.iter().zip(&counts) {
            log::info!("💾 Saved {} rows to {} ({:?})", count, write.table, write.mode);
        }
        Ok(counts.iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ledger::load_ledger;
    use crate::pipeline::transform::FlatValue;
    use crate::warehouse::SqliteWarehouse;
    use tempfile::{tempdir, NamedTempFile};

    #[derive(Default)]
    struct RecordingWarehouse {
        writes: Mutex<Vec<(TableRef, SaveMode, Vec<FlatRow>)>>,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn read(&self, _sql: &str) -> HarvestResult<Vec<FlatRow>> {
            Ok(Vec::new())
        }

        async fn table_exists(&self, _table: &TableRef) -> HarvestResult<bool> {
            Ok(false)
        }

        async fn write_all(&self, writes: &[TableWrite<'_>]) -> HarvestResult<Vec<usize>> {
            let mut recorded = self.writes.lock().unwrap();
            for write in writes {
                recorded.push((write.table.clone(), write.mode, write.rows.to_vec()));
            }
            Ok(writes.iter().map(|w| w.rows.len()).collect())
        }
    }

    fn row(id: Option<&str>, value: i64) -> FlatRow {
        let mut row = FlatRow::new();
        row.set(
            "id",
            id.map(|s| FlatValue::Text(s.to_string())).unwrap_or(FlatValue::Null),
        );
        row.set("value", FlatValue::Int(value));
        row
    }

    fn setup(mode: SaveMode) -> (tempfile::TempDir, Arc<RecordingWarehouse>, Arc<OverflowLedger>, Checkpointer) {
        let dir = tempdir().unwrap();
        let warehouse = Arc::new(RecordingWarehouse::default());
        let ledger = Arc::new(OverflowLedger::new());
        let checkpointer = Checkpointer::new(
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::clone(&ledger),
            dir.path().join("ledger.json"),
        )
        .target(
            "items",
            SaveTarget::new(TableRef::new("test", "items"), mode, &["id"]),
        );
        (dir, warehouse, ledger, checkpointer)
    }

    #[tokio::test]
    async fn test_merge_drops_null_keys_and_keeps_last_per_key() {
        let (_dir, warehouse, _ledger, checkpointer) = setup(SaveMode::Merge);
        let batch = TableBatch::single(
            "items",
            vec![row(Some("a"), 1), row(None, 2), row(Some("b"), 3), row(Some("a"), 4)],
        );

        assert_eq!(checkpointer.save(batch).await.unwrap(), 2);

        let writes = warehouse.writes.lock().unwrap();
        let rows = &writes[0].2;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("value"), Some(&FlatValue::Int(4)));
        assert_eq!(rows[1].get("value"), Some(&FlatValue::Int(3)));
    }

    #[tokio::test]
    async fn test_append_keeps_duplicates() {
        let (_dir, warehouse, _ledger, checkpointer) = setup(SaveMode::Append);
        let batch = TableBatch::single("items", vec![row(Some("a"), 1), row(Some("a"), 1)]);

        assert_eq!(checkpointer.save(batch).await.unwrap(), 2);
        assert_eq!(warehouse.writes.lock().unwrap()[0].1, SaveMode::Append);
    }

    #[tokio::test]
    async fn test_replace_only_on_first_checkpoint() {
        let (_dir, warehouse, _ledger, checkpointer) = setup(SaveMode::Replace);
        for value in 0..3 {
            let batch = TableBatch::single("items", vec![row(Some("a"), value)]);
            checkpointer.save(batch).await.unwrap();
        }

        let modes: Vec<SaveMode> = warehouse.writes.lock().unwrap().iter().map(|w| w.1).collect();
        assert_eq!(modes, vec![SaveMode::Replace, SaveMode::Append, SaveMode::Append]);
    }

    #[tokio::test]
    async fn test_ledger_persisted_even_without_rows() {
        let (dir, warehouse, ledger, checkpointer) = setup(SaveMode::Merge);
        ledger.record("nace", "47.111", 12_000);

        assert_eq!(checkpointer.save(TableBatch::new()).await.unwrap(), 0);

        assert!(warehouse.writes.lock().unwrap().is_empty());
        assert_eq!(load_ledger(&dir.path().join("ledger.json"))["nace"]["47.111"], 12_000);
    }

    #[tokio::test]
    async fn test_unknown_table_is_an_error() {
        let (_dir, _warehouse, _ledger, checkpointer) = setup(SaveMode::Merge);
        let batch = TableBatch::single("other", vec![row(Some("a"), 1)]);
        assert!(checkpointer.save(batch).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_commits_all_tables_or_none() {
        let dir = tempdir().unwrap();
        let db = NamedTempFile::new().unwrap();
        let warehouse = Arc::new(SqliteWarehouse::open(db.path().to_str().unwrap()).unwrap());
        let items = TableRef::new("test", "items");
        let notes = TableRef::new("test", "notes");
        let checkpointer = Checkpointer::new(
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::new(OverflowLedger::new()),
            dir.path().join("ledger.json"),
        )
        .target("items", SaveTarget::new(items.clone(), SaveMode::Replace, &["id"]))
        .target("notes", SaveTarget::append(notes.clone(), &["id"]));

        // "Value" and "value" collide in SQLite, so the notes write fails
        let mut clash = row(Some("a"), 1);
        clash.set("Value", FlatValue::Int(2));
        let mut batch = TableBatch::single("items", vec![row(Some("a"), 1)]);
        batch.push_rows("notes", vec![clash]);

        assert!(checkpointer.save(batch).await.is_err());
        assert!(!warehouse.table_exists(&items).await.unwrap());
        assert!(!warehouse.table_exists(&notes).await.unwrap());

        // the failed replace did not count as the run's first one
        let batch = TableBatch::single("items", vec![row(Some("b"), 2)]);
        assert_eq!(checkpointer.save(batch).await.unwrap(), 1);
        assert_eq!(
            checkpointer.effective_mode("items", SaveMode::Replace),
            SaveMode::Append
        );
        let rows = warehouse.read("SELECT id FROM test_items").await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
