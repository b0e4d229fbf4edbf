//! SQLite warehouse backed by rusqlite
//!
//! Tables are created on first write from the column union of the row set
//! and widened with `ALTER TABLE ADD COLUMN` when later rows bring new
//! columns. Merge mode keeps a unique index on the key columns and relies on
//! `INSERT ... ON CONFLICT DO UPDATE`.

use super::{ColumnType, ColumnTypes, SaveMode, TableRef, TableWrite, Warehouse};
use crate::error::{HarvestError, HarvestResult, SchemaError};
use crate::pipeline::transform::{FlatRow, FlatValue};
use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    /// Open (or create) the database file and enable WAL mode
    pub fn open(db_path: &str) -> HarvestResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("📊 Opened SQLite warehouse {} (WAL mode)", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> HarvestResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HarvestError::Warehouse("connection lock poisoned".to_string()))
    }

    /// Column names of `table`, empty if the table does not exist
    fn table_columns(conn: &Connection, table: &str) -> HarvestResult<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Create `table` or add the columns it is missing
    fn ensure_columns(
        tx: &Transaction<'_>,
        table: &str,
        columns: &[(String, ColumnType)],
    ) -> HarvestResult<()> {
        let existing = Self::table_columns(tx, table)?;
        if existing.is_empty() {
            let definitions: Vec<String> = columns
                .iter()
                .map(|(name, ty)| format!("{} {}", quote(name), sql_type(*ty)))
                .collect();
            tx.execute_batch(&format!(
                "CREATE TABLE {} ({})",
                quote(table),
                definitions.join(", ")
            ))?;
            log::info!("🔧 Created table {} with {} columns", table, columns.len());
            return Ok(());
        }

        // SQLite column names are case-insensitive
        let known: HashSet<String> = existing.iter().map(|c| c.to_lowercase()).collect();
        for (name, ty) in columns {
            if !known.contains(&name.to_lowercase()) {
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote(table),
                    quote(name),
                    sql_type(*ty)
                ))?;
                log::info!("   ├─ Added column {}.{}", table, name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn read(&self, sql: &str) -> HarvestResult<Vec<FlatRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let rows = stmt
            .query_map([], |row| {
                let mut flat = FlatRow::new();
                for (i, name) in names.iter().enumerate() {
                    flat.set(name.clone(), from_sql(row.get_ref(i)?));
                }
                Ok(flat)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn table_exists(&self, table: &TableRef) -> HarvestResult<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")?;
        Ok(stmt.exists([table.qualified()])?)
    }

    async fn write_all(&self, writes: &[TableWrite<'_>]) -> HarvestResult<Vec<usize>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut counts = Vec::with_capacity(writes.len());
        for write in writes {
            counts.push(Self::write_table(&tx, write)?);
        }
        tx.commit()?;
        Ok(counts)
    }
}

impl SqliteWarehouse {
    /// Apply one table write inside the caller's transaction
    fn write_table(tx: &Transaction<'_>, write: &TableWrite<'_>) -> HarvestResult<usize> {
        let TableWrite {
            table,
            rows,
            mode,
            key_columns,
            column_types,
        } = *write;
        if rows.is_empty() {
            return Ok(0);
        }
        let name = table.qualified();
        let columns = column_union(rows, column_types)?;

        if mode == SaveMode::Merge {
            if key_columns.is_empty() {
                return Err(HarvestError::Warehouse(format!(
                    "merge into {} needs key columns",
                    table
                )));
            }
            if let Some(missing) = key_columns
                .iter()
                .find(|k| !columns.iter().any(|(c, _)| c == *k))
            {
                return Err(HarvestError::Warehouse(format!(
                    "key column {} missing from rows for {}",
                    missing, table
                )));
            }
        }

        if mode == SaveMode::Replace {
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&name)))?;
        }
        Self::ensure_columns(tx, &name, &columns)?;

        let column_list: Vec<String> = columns.iter().map(|(c, _)| quote(c)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&name),
            column_list.join(", "),
            placeholders
        );

        if mode == SaveMode::Merge {
            let keys: Vec<String> = key_columns.iter().map(|k| quote(k)).collect();
            tx.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("ux_{}_key", name)),
                quote(&name),
                keys.join(", ")
            ))?;

            let updates: Vec<String> = columns
                .iter()
                .filter(|(c, _)| !key_columns.contains(c))
                .map(|(c, _)| format!("{0} = excluded.{0}", quote(c)))
                .collect();
            if updates.is_empty() {
                sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", keys.join(", ")));
            } else {
                sql.push_str(&format!(
                    " ON CONFLICT({}) DO UPDATE SET {}",
                    keys.join(", "),
                    updates.join(", ")
                ));
            }
        }

        let mut written = 0;
        let mut stmt = tx.prepare(&sql)?;
        for row in rows {
            let values: Vec<Value> = columns
                .iter()
                .map(|(c, _)| row.get(c).map(to_sql).unwrap_or(Value::Null))
                .collect();
            written += stmt.execute(rusqlite::params_from_iter(values))?;
        }

        log::debug!("✅ Wrote {} rows to {} ({:?})", written, name, mode);
        Ok(written)
    }
}

/// Every column in `rows` with its declared or inferred type. SQLite folds
/// column names case-insensitively, so names differing only in case collide.
fn column_union(
    rows: &[FlatRow],
    declared: &ColumnTypes,
) -> Result<Vec<(String, ColumnType)>, SchemaError> {
    let mut columns: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();
    for row in rows {
        for (name, value) in row.cells() {
            let slot = columns.entry(name.clone()).or_insert(None);
            if slot.is_none() {
                *slot = ColumnType::infer(value);
            }
        }
    }

    let mut folded = HashSet::new();
    for name in columns.keys() {
        if !folded.insert(name.to_lowercase()) {
            return Err(SchemaError::DuplicateColumn {
                column: name.clone(),
            });
        }
    }

    Ok(columns
        .into_iter()
        .map(|(name, inferred)| {
            let ty = declared
                .get(&name)
                .copied()
                .or(inferred)
                .unwrap_or(ColumnType::Text);
            (name, ty)
        })
        .collect())
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Boolean | ColumnType::Integer => "INTEGER",
        ColumnType::Real => "REAL",
        ColumnType::Text | ColumnType::Date | ColumnType::Timestamp | ColumnType::Json => "TEXT",
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(value: &FlatValue) -> Value {
    match value {
        FlatValue::Null => Value::Null,
        FlatValue::Bool(b) => Value::Integer(i64::from(*b)),
        FlatValue::Int(i) => Value::Integer(*i),
        FlatValue::Float(f) => Value::Real(*f),
        FlatValue::Text(s) => Value::Text(s.clone()),
        other => other.as_text().map(Value::Text).unwrap_or(Value::Null),
    }
}

fn from_sql(value: ValueRef<'_>) -> FlatValue {
    match value {
        ValueRef::Null => FlatValue::Null,
        ValueRef::Integer(i) => FlatValue::Int(i),
        ValueRef::Real(f) => FlatValue::Float(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            FlatValue::Text(String::from_utf8_lossy(t).into_owned())
        }
    }
}
