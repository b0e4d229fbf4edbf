//! Transform stage: nested records into flat, typed, deduplicated rows
//!
//! Flattening joins nested object keys with `_` (`forretningsadresse.kommune`
//! becomes `forretningsadresse_kommune`). Lists stay whole and are stored as
//! JSON text. Two paths that flatten to the same column name are a
//! `SchemaError`: the row set is rejected instead of one value silently
//! replacing the other.

use super::paginator::KeyOutcome;
use super::query::QueryKey;
use super::record::{RawRecord, RawValue};
use crate::error::{HarvestResult, SchemaError};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use std::collections::{BTreeMap, HashMap};

pub const SEPARATOR: &str = "_";

/// Fixed-width UTC rendering (`2026-10-14T08:00:00.000000Z`) so stored
/// timestamps sort as text
pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One cell of a flat row
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    List(Vec<RawValue>),
}

impl FlatValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FlatValue::Null)
    }

    /// Text rendering used for keys and TEXT storage; `None` for null
    pub fn as_text(&self) -> Option<String> {
        match self {
            FlatValue::Null => None,
            FlatValue::Bool(b) => Some(b.to_string()),
            FlatValue::Int(i) => Some(i.to_string()),
            FlatValue::Float(f) => Some(f.to_string()),
            FlatValue::Text(s) => Some(s.clone()),
            FlatValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            FlatValue::Timestamp(ts) => Some(timestamp_text(ts)),
            FlatValue::List(items) => Some(RawValue::List(items.clone()).to_json_string()),
        }
    }

    fn from_raw(value: &RawValue) -> Self {
        match value {
            RawValue::Null => FlatValue::Null,
            RawValue::Bool(b) => FlatValue::Bool(*b),
            RawValue::Int(i) => FlatValue::Int(*i),
            RawValue::Float(f) => FlatValue::Float(*f),
            RawValue::Text(s) => FlatValue::Text(s.clone()),
            RawValue::List(items) => FlatValue::List(items.clone()),
            // only reached for empty maps; non-empty ones are flattened
            RawValue::Map(_) => FlatValue::Null,
        }
    }
}

/// A single-level row keyed by column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatRow {
    cells: BTreeMap<String, FlatValue>,
}

impl FlatRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&FlatValue> {
        self.cells.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: FlatValue) {
        self.cells.insert(column.into(), value);
    }

    pub fn remove(&mut self, column: &str) -> Option<FlatValue> {
        self.cells.remove(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(|k| k.as_str())
    }

    pub fn cells(&self) -> &BTreeMap<String, FlatValue> {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether `column` is absent or null
    pub fn is_null(&self, column: &str) -> bool {
        self.cells.get(column).map_or(true, FlatValue::is_null)
    }

    /// Rendered values of `columns`, or `None` if any of them is null
    pub fn key(&self, columns: &[String]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| self.cells.get(c).and_then(FlatValue::as_text))
            .collect()
    }

    fn set_unique(&mut self, column: String, value: FlatValue) -> Result<(), SchemaError> {
        if self.cells.contains_key(&column) {
            return Err(SchemaError::DuplicateColumn { column });
        }
        self.cells.insert(column, value);
        Ok(())
    }
}

/// Flatten a nested record into one row
pub fn flatten(record: &RawRecord) -> Result<FlatRow, SchemaError> {
    flatten_with(record, &[])
}

/// Flatten, keeping the values of `opaque` columns whole as JSON text
pub fn flatten_with(record: &RawRecord, opaque: &[String]) -> Result<FlatRow, SchemaError> {
    let mut row = FlatRow::new();
    flatten_into(&mut row, None, record, opaque)?;
    Ok(row)
}

fn flatten_into(
    row: &mut FlatRow,
    prefix: Option<&str>,
    record: &RawRecord,
    opaque: &[String],
) -> Result<(), SchemaError> {
    for (key, value) in record {
        let key = key.replace('.', SEPARATOR);
        let column = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, SEPARATOR, key),
            None => key,
        };
        let keep_whole = opaque.iter().any(|c| *c == column);
        match value {
            RawValue::Null => row.set_unique(column, FlatValue::Null)?,
            other if keep_whole => row.set_unique(column, FlatValue::Text(other.to_json_string()))?,
            RawValue::Map(nested) if !nested.is_empty() => {
                flatten_into(row, Some(&column), nested, opaque)?
            }
            other => row.set_unique(column, FlatValue::from_raw(other))?,
        }
    }
    Ok(())
}

/// Which columns are coerced to numbers
#[derive(Debug, Clone, PartialEq)]
pub enum NumericColumns {
    None,
    Listed(Vec<String>),
    /// Every column not declared string, bool, date, key or injected
    AllOther { bool_columns: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    /// Last row per natural key wins
    ByKey,
    /// Drop rows identical in every column
    WholeRow,
}

/// Per-table shaping rules applied after flattening
#[derive(Debug, Clone)]
pub struct TransformSpec {
    pub key_columns: Vec<String>,
    pub dedup: Dedup,
    /// Columns holding nested or variant data, stored as their JSON text
    pub string_columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub numeric: NumericColumns,
    pub country: Option<String>,
    pub inject_page: bool,
}

fn owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

impl TransformSpec {
    pub fn keyed(key_columns: &[&str]) -> Self {
        Self {
            key_columns: owned(key_columns),
            dedup: Dedup::ByKey,
            string_columns: Vec::new(),
            date_columns: Vec::new(),
            numeric: NumericColumns::None,
            country: None,
            inject_page: false,
        }
    }

    pub fn dedup(mut self, dedup: Dedup) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn string_columns(mut self, columns: &[&str]) -> Self {
        self.string_columns = owned(columns);
        self
    }

    pub fn date_columns(mut self, columns: &[&str]) -> Self {
        self.date_columns = owned(columns);
        self
    }

    pub fn numeric(mut self, numeric: NumericColumns) -> Self {
        self.numeric = numeric;
        self
    }

    pub fn country(mut self, country: &str) -> Self {
        self.country = Some(country.to_string());
        self
    }

    pub fn with_page(mut self) -> Self {
        self.inject_page = true;
        self
    }

    fn is_numeric(&self, column: &str) -> bool {
        let listed = |columns: &[String]| columns.iter().any(|c| c == column);
        match &self.numeric {
            NumericColumns::None => false,
            NumericColumns::Listed(columns) => listed(columns),
            NumericColumns::AllOther { bool_columns } => {
                !listed(&self.string_columns)
                    && !listed(&self.date_columns)
                    && !listed(&self.key_columns)
                    && !listed(bool_columns)
                    && !matches!(column, "country" | "fetch_date" | "page")
            }
        }
    }

    /// Flatten, coerce, stamp and deduplicate `(page, record)` pairs
    pub fn apply(
        &self,
        records: Vec<(Option<u32>, RawRecord)>,
        fetch_date: DateTime<Utc>,
    ) -> Result<Vec<FlatRow>, SchemaError> {
        let mut rows = Vec::with_capacity(records.len());
        for (page, record) in records {
            let mut row = flatten_with(&record, &self.string_columns)?;
            self.coerce(&mut row);
            if let Some(country) = &self.country {
                row.set("country", FlatValue::Text(country.clone()));
            }
            if let (true, Some(page)) = (self.inject_page, page) {
                row.set("page", FlatValue::Int(i64::from(page)));
            }
            row.set("fetch_date", FlatValue::Timestamp(fetch_date));
            rows.push(row);
        }
        Ok(self.deduplicate(rows))
    }

    fn coerce(&self, row: &mut FlatRow) {
        for column in &self.string_columns {
            if let Some(value) = row.cells.get_mut(column) {
                if let Some(text) = value.as_text() {
                    *value = FlatValue::Text(text);
                }
            }
        }
        for column in &self.date_columns {
            if let Some(value) = row.cells.get_mut(column) {
                *value = coerce_date(value);
            }
        }
        for (column, value) in row.cells.iter_mut() {
            if self.is_numeric(column) {
                *value = coerce_numeric(value);
            }
        }
    }

    fn deduplicate(&self, rows: Vec<FlatRow>) -> Vec<FlatRow> {
        let mut seen: HashMap<Vec<String>, usize> = HashMap::new();
        let mut unique: Vec<FlatRow> = Vec::with_capacity(rows.len());

        for row in rows {
            let key = match self.dedup {
                Dedup::ByKey => row.key(&self.key_columns),
                Dedup::WholeRow => Some(
                    row.cells
                        .iter()
                        .filter(|(column, _)| column.as_str() != "fetch_date")
                        // Debug keeps null apart from the empty string
                        .map(|(column, value)| format!("{:?}", (column, value.as_text())))
                        .collect(),
                ),
            };
            match key {
                Some(key) => match seen.get(&key) {
                    Some(&index) => unique[index] = row,
                    None => {
                        seen.insert(key, unique.len());
                        unique.push(row);
                    }
                },
                // null keys are left for the save stage to reject
                None => unique.push(row),
            }
        }
        unique
    }
}

/// Permissive numeric parse: anything unparseable becomes zero
pub fn coerce_numeric(value: &FlatValue) -> FlatValue {
    match value {
        FlatValue::Int(_) | FlatValue::Float(_) => value.clone(),
        FlatValue::Bool(b) => FlatValue::Int(i64::from(*b)),
        FlatValue::Text(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                FlatValue::Int(i)
            } else if let Ok(f) = s.parse::<f64>() {
                if f.is_finite() {
                    FlatValue::Float(f)
                } else {
                    FlatValue::Int(0)
                }
            } else {
                FlatValue::Int(0)
            }
        }
        _ => FlatValue::Int(0),
    }
}

/// Parse `YYYY-MM-DD` or RFC 3339 text to a date; anything else is null
pub fn coerce_date(value: &FlatValue) -> FlatValue {
    match value {
        FlatValue::Date(_) => value.clone(),
        FlatValue::Timestamp(ts) => FlatValue::Date(ts.date_naive()),
        FlatValue::Text(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|ts| ts.date_naive()))
                .map(FlatValue::Date)
                .unwrap_or(FlatValue::Null)
        }
        _ => FlatValue::Null,
    }
}

/// Rows grouped by destination table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableBatch {
    tables: BTreeMap<String, Vec<FlatRow>>,
}

impl TableBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(table: &str, rows: Vec<FlatRow>) -> Self {
        let mut batch = Self::new();
        batch.push_rows(table, rows);
        batch
    }

    pub fn push_rows(&mut self, table: &str, rows: Vec<FlatRow>) {
        if rows.is_empty() {
            return;
        }
        self.tables.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn extend(&mut self, other: TableBatch) {
        for (table, rows) in other.tables {
            self.tables.entry(table).or_default().extend(rows);
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn rows(&self, table: &str) -> &[FlatRow] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_tables(self) -> BTreeMap<String, Vec<FlatRow>> {
        self.tables
    }
}

/// Converts one batch of key results into rows
pub trait Transform: Send + Sync {
    fn transform(&self, results: Vec<(QueryKey, KeyOutcome)>) -> HarvestResult<TableBatch>;
}

/// Drop unusable outcomes, keeping `(page, record)` pairs in result order
pub fn usable_records(results: Vec<(QueryKey, KeyOutcome)>) -> Vec<(QueryKey, Vec<(Option<u32>, RawRecord)>)> {
    let total = results.len();
    let usable: Vec<_> = results
        .into_iter()
        .filter_map(|(key, outcome)| match outcome {
            KeyOutcome::Pages(pages) if pages.iter().any(|p| !p.records.is_empty()) => {
                let records = pages
                    .into_iter()
                    .flat_map(|page| {
                        let index = page.page_index;
                        page.records.into_iter().map(move |r| (Some(index), r))
                    })
                    .collect();
                Some((key, records))
            }
            KeyOutcome::Marker(marker) => Some((key, vec![(None, marker)])),
            _ => None,
        })
        .collect();

    let dropped = total - usable.len();
    if dropped > 0 {
        log::info!("Dropped {} of {} entries without usable payload", dropped, total);
    }
    usable
}

/// Single-table transform driven by a `TransformSpec`
pub struct RecordTransformer {
    table: String,
    spec: TransformSpec,
}

impl RecordTransformer {
    pub fn new(table: &str, spec: TransformSpec) -> Self {
        Self {
            table: table.to_string(),
            spec,
        }
    }
}

impl Transform for RecordTransformer {
    fn transform(&self, results: Vec<(QueryKey, KeyOutcome)>) -> HarvestResult<TableBatch> {
        let records = usable_records(results)
            .into_iter()
            .flat_map(|(_, records)| records)
            .collect();
        let rows = self.spec.apply(records, Utc::now())?;
        Ok(TableBatch::single(&self.table, rows))
    }
}
