//! Commercial annual-accounts API
//!
//! One request per organisation number returns every reported year. Each
//! yearly entry is split into per-topic tables keyed by
//! `(org_nr, accounting_year)`; company and accounts-type details come from
//! the first entry and are keyed by `org_nr` alone.

use crate::error::HarvestResult;
use crate::pipeline::fetch::PageRequest;
use crate::pipeline::paginator::{Endpoint, KeyOutcome};
use crate::pipeline::query::QueryKey;
use crate::pipeline::record::{record_from_json, RawRecord, RawValue};
use crate::pipeline::save::SaveTarget;
use crate::pipeline::transform::{usable_records, NumericColumns, TableBatch, Transform, TransformSpec};
use crate::warehouse::{ColumnType, TableRef};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;

pub const DATASET: &str = "enin";

/// Tables filled from every yearly entry
pub const YEARLY_TABLES: [&str; 4] = [
    "accounts",
    "accounts_highlights",
    "accounts_income_statement",
    "accounts_balance_sheet",
];

/// Tables filled from the first entry only
pub const COMPANY_TABLES: [&str; 2] = ["company", "accounts_type"];

const STRING_COLUMNS: [&str; 8] = [
    "company_uuid",
    "accounts_type_uuid",
    "app_url",
    "uuid",
    "accounts_uuid",
    "currency_code",
    "accounting_schema",
    "income_statement__currency_code",
];
const BOOL_COLUMNS: [&str; 2] = ["corporate_group_accounts_flag", "estimated_accounting_period_flag"];
const DATE_COLUMNS: [&str; 3] = [
    "accounting_announcement_date",
    "accounting_from_date",
    "accounting_to_date",
];

pub struct AccountsComposite {
    base_url: String,
}

impl AccountsComposite {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Endpoint for AccountsComposite {
    fn kind(&self) -> String {
        "enin_accounts".to_string()
    }

    fn request(&self, key: &QueryKey, _page: u32) -> PageRequest {
        PageRequest::new(format!(
            "{}/analysis/v1/company/NO{}/accounts-composite",
            self.base_url,
            key.code()
        ))
        .param("accounts_type_identifier", Some("annual_company_accounts"))
    }

    fn decode(&self, _key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        match payload {
            Value::Array(years) => Ok(years.into_iter().filter_map(record_from_json).collect()),
            Value::Null => Ok(Vec::new()),
            _ => Err("accounts payload is not a list".to_string()),
        }
    }
}

fn yearly_spec() -> TransformSpec {
    TransformSpec::keyed(&["org_nr", "accounting_year"])
        .string_columns(&STRING_COLUMNS)
        .date_columns(&DATE_COLUMNS)
        .numeric(NumericColumns::AllOther {
            bool_columns: BOOL_COLUMNS.iter().map(|c| c.to_string()).collect(),
        })
}

fn company_spec() -> TransformSpec {
    TransformSpec::keyed(&["org_nr"])
}

/// Save targets for every table the transformer emits
pub fn save_targets() -> Vec<(&'static str, SaveTarget)> {
    let yearly = YEARLY_TABLES.iter().map(|table| {
        let mut target = SaveTarget::merge(TableRef::new(DATASET, table), &["org_nr", "accounting_year"]);
        for column in DATE_COLUMNS {
            target = target.with_type(column, ColumnType::Date);
        }
        for column in BOOL_COLUMNS {
            target = target.with_type(column, ColumnType::Boolean);
        }
        (*table, target)
    });
    let company = COMPANY_TABLES
        .iter()
        .map(|table| (*table, SaveTarget::merge(TableRef::new(DATASET, table), &["org_nr"])));
    yearly.chain(company).collect()
}

/// Org numbers are stored as integers when they parse as one
fn org_nr_value(key: &QueryKey) -> RawValue {
    key.code()
        .parse::<i64>()
        .map(RawValue::Int)
        .unwrap_or_else(|_| RawValue::Text(key.code().to_string()))
}

fn sub_record(entry: &RawRecord, table: &str, org_nr: &RawValue) -> Option<RawRecord> {
    let mut record = entry.get(table)?.as_map()?.clone();
    record.insert("org_nr".to_string(), org_nr.clone());
    Some(record)
}

/// Splits yearly account entries into the per-topic tables
pub struct AccountsTransformer {
    yearly: TransformSpec,
    company: TransformSpec,
}

impl Default for AccountsTransformer {
    fn default() -> Self {
        Self {
            yearly: yearly_spec(),
            company: company_spec(),
        }
    }
}

impl AccountsTransformer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transform for AccountsTransformer {
    fn transform(&self, results: Vec<(QueryKey, KeyOutcome)>) -> HarvestResult<TableBatch> {
        let mut tables: BTreeMap<&str, Vec<(Option<u32>, RawRecord)>> = BTreeMap::new();

        for (key, entries) in usable_records(results) {
            let org_nr = org_nr_value(&key);
            for (_, entry) in &entries {
                for table in YEARLY_TABLES {
                    if let Some(record) = sub_record(entry, table, &org_nr) {
                        tables.entry(table).or_default().push((None, record));
                    }
                }
            }
            if let Some((_, first)) = entries.first() {
                for table in COMPANY_TABLES {
                    if let Some(record) = sub_record(first, table, &org_nr) {
                        tables.entry(table).or_default().push((None, record));
                    }
                }
            }
        }

        let fetch_date = Utc::now();
        let mut batch = TableBatch::new();
        for (table, records) in tables {
            let spec = if COMPANY_TABLES.contains(&table) {
                &self.company
            } else {
                &self.yearly
            };
            batch.push_rows(table, spec.apply(records, fetch_date)?);
        }
        Ok(batch)
    }
}
