//! Public business registry (Enhetsregisteret / Regnskapsregisteret)
//!
//! Endpoints:
//! - company search `enhetsregisteret/api/enheter` (paged, `_embedded.enheter`)
//! - company lookup `enhetsregisteret/api/enheter/{orgnr}`
//! - roles `enhetsregisteret/api/enheter/{orgnr}/roller`
//! - financial statements `regnskapsregisteret/regnskap/{orgnr}`

use crate::error::HarvestResult;
use crate::pipeline::fetch::PageRequest;
use crate::pipeline::ledger::LedgerMap;
use crate::pipeline::paginator::Endpoint;
use crate::pipeline::query::{GeoType, QueryKey, SearchFilter};
use crate::pipeline::record::{record_from_json, RawRecord, RawValue};
use crate::pipeline::save::SaveTarget;
use crate::pipeline::transform::{timestamp_text, Dedup, FlatRow, FlatValue, TransformSpec};
use crate::warehouse::{ColumnType, TableRef, Warehouse};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DATASET: &str = "brreg";
pub const COMPANY_TABLE: &str = "company_data";
pub const ROLES_TABLE: &str = "roles";
pub const FINANCIAL_TABLE: &str = "financial";
pub const NACE_TABLE: &str = "nace_codes";

const COUNTRY: &str = "NO";

fn enheter_url(base_url: &str) -> String {
    format!("{}/enhetsregisteret/api/enheter", base_url.trim_end_matches('/'))
}

/// Paged company search by NACE code and/or geography
pub struct CompanySearch {
    base_url: String,
    filter: SearchFilter,
    page_size: u32,
}

impl CompanySearch {
    pub fn new(base_url: &str, filter: SearchFilter, page_size: u32) -> Self {
        Self {
            base_url: base_url.to_string(),
            filter,
            page_size,
        }
    }

    fn filters<'a>(&self, key: &'a QueryKey) -> (Option<&'a str>, Option<(GeoType, &'a str)>) {
        match self.filter {
            SearchFilter::Nace => (Some(key.code()), None),
            SearchFilter::Geo(geo) => (None, Some((geo, key.code()))),
            SearchFilter::NaceGeo(geo) => (Some(key.code()), key.geo().map(|g| (geo, g))),
        }
    }
}

impl Endpoint for CompanySearch {
    fn kind(&self) -> String {
        self.filter.kind()
    }

    fn request(&self, key: &QueryKey, page: u32) -> PageRequest {
        let (nace, geo) = self.filters(key);
        let mut request = PageRequest::new(enheter_url(&self.base_url))
            .param("page", Some(page))
            .param("size", Some(self.page_size))
            .param("naeringskode", nace);
        if let Some((geo_type, value)) = geo {
            request = request.param(geo_type.param_name(), Some(value));
        }
        request
    }

    fn paginated(&self) -> bool {
        true
    }

    fn total_elements(&self, payload: &Value) -> Option<u64> {
        payload["page"]["totalElements"].as_u64()
    }

    fn decode(&self, _key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        // `_embedded` is omitted entirely when a page has no hits
        match payload.pointer("/_embedded/enheter") {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.iter().cloned().filter_map(record_from_json).collect()),
            Some(_) => Err("_embedded.enheter is not a list".to_string()),
        }
    }
}

/// Single company by organisation number
pub struct CompanyLookup {
    base_url: String,
}

impl CompanyLookup {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

impl Endpoint for CompanyLookup {
    fn kind(&self) -> String {
        "orgnr".to_string()
    }

    fn request(&self, key: &QueryKey, _page: u32) -> PageRequest {
        PageRequest::new(format!("{}/{}", enheter_url(&self.base_url), key.code()))
    }

    fn decode(&self, _key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        record_from_json(payload)
            .map(|record| vec![record])
            .ok_or_else(|| "company payload is not an object".to_string())
    }
}

/// Role groups of one company, one record per role
pub struct Roles {
    base_url: String,
}

impl Roles {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

impl Endpoint for Roles {
    fn kind(&self) -> String {
        "roles".to_string()
    }

    fn request(&self, key: &QueryKey, _page: u32) -> PageRequest {
        PageRequest::new(format!("{}/{}/roller", enheter_url(&self.base_url), key.code()))
    }

    fn decode(&self, key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        let groups = match payload.get("rollegrupper") {
            Some(Value::Array(groups)) => groups,
            _ => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for group in groups {
            let roles = group.get("roller").and_then(Value::as_array);
            for role in roles.into_iter().flatten() {
                if let Some(mut record) = record_from_json(role.clone()) {
                    record.insert(
                        "organisasjonsnummer".to_string(),
                        RawValue::Text(key.code().to_string()),
                    );
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// A company without registered roles is still recorded as fetched
    fn empty_marker(&self, key: &QueryKey) -> Option<RawRecord> {
        record_from_json(serde_json::json!({ "organisasjonsnummer": key.code() }))
    }
}

/// Latest annual financial statement of one company
pub struct Financials {
    base_url: String,
}

impl Financials {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

impl Endpoint for Financials {
    fn kind(&self) -> String {
        "financial".to_string()
    }

    fn request(&self, key: &QueryKey, _page: u32) -> PageRequest {
        PageRequest::new(format!(
            "{}/regnskapsregisteret/regnskap/{}",
            self.base_url.trim_end_matches('/'),
            key.code()
        ))
    }

    fn decode(&self, _key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        match payload {
            Value::Array(statements) => Ok(statements
                .into_iter()
                .next()
                .and_then(record_from_json)
                .into_iter()
                .collect()),
            _ => Err("financial payload is not a list".to_string()),
        }
    }

    fn empty_marker(&self, key: &QueryKey) -> Option<RawRecord> {
        record_from_json(serde_json::json!({
            "virksomhet": { "organisasjonsnummer": key.code() }
        }))
    }
}

/// Entity fetched by organisation number
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Entity {
    Companies,
    Roles,
    Financials,
}

impl Entity {
    pub fn endpoint(&self, base_url: &str) -> Arc<dyn Endpoint> {
        match self {
            Entity::Companies => Arc::new(CompanyLookup::new(base_url)),
            Entity::Roles => Arc::new(Roles::new(base_url)),
            Entity::Financials => Arc::new(Financials::new(base_url)),
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Entity::Companies => COMPANY_TABLE,
            Entity::Roles => ROLES_TABLE,
            Entity::Financials => FINANCIAL_TABLE,
        }
    }

    pub fn transform_spec(&self) -> TransformSpec {
        match self {
            Entity::Companies => company_spec(),
            Entity::Roles => TransformSpec::keyed(&["organisasjonsnummer"])
                .dedup(Dedup::WholeRow)
                .string_columns(&["stadfestetFremtidsfullmakt", "begrensetRettsligHandleevne"])
                .country(COUNTRY),
            Entity::Financials => TransformSpec::keyed(&["virksomhet_organisasjonsnummer"])
                .date_columns(&["regnskapsperiode_fraDato", "regnskapsperiode_tilDato"])
                .country(COUNTRY),
        }
    }

    pub fn save_target(&self) -> SaveTarget {
        let table = TableRef::new(DATASET, self.table());
        match self {
            Entity::Companies => company_target(),
            Entity::Roles => SaveTarget::append(table, &["organisasjonsnummer"]),
            Entity::Financials => SaveTarget::merge(table, &["virksomhet_organisasjonsnummer"])
                .with_type("regnskapsperiode_fraDato", ColumnType::Date)
                .with_type("regnskapsperiode_tilDato", ColumnType::Date),
        }
    }
}

fn company_spec() -> TransformSpec {
    TransformSpec::keyed(&["organisasjonsnummer"])
        .string_columns(&["paategninger"])
        .country(COUNTRY)
}

/// Rows from company search carry the page they were found on
pub fn company_search_spec() -> TransformSpec {
    company_spec().with_page()
}

pub fn company_target() -> SaveTarget {
    SaveTarget::merge(TableRef::new(DATASET, COMPANY_TABLE), &["organisasjonsnummer"])
        .with_type("fetch_date", ColumnType::Timestamp)
}

/// How organisation numbers for an identifier run are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Explicit(Vec<String>),
    /// Known companies whose last fetch is older than this many days
    Stale { days: i64 },
    MissingRoles,
    MissingFinancials { year: i32, limit: Option<usize> },
}

fn table_name(table: &str) -> String {
    TableRef::new(DATASET, table).qualified()
}

/// SQL selecting the organisation numbers for `selection`
///
/// `dependent_exists` tells whether the table the selection anti-joins
/// against exists yet; without it every known company qualifies.
pub fn selection_sql(selection: &Selection, dependent_exists: bool) -> Option<String> {
    let companies = table_name(COMPANY_TABLE);
    let sql = match selection {
        Selection::Explicit(_) => return None,
        Selection::Stale { days } => {
            let cutoff = timestamp_text(&(Utc::now() - Duration::days(*days)));
            // unparseable or missing timestamps count as never fetched
            format!(
                "SELECT organisasjonsnummer FROM {} \
                 WHERE coalesce(julianday(fetch_date), 0) < julianday('{}')",
                companies, cutoff
            )
        }
        Selection::MissingRoles if !dependent_exists => {
            format!("SELECT DISTINCT organisasjonsnummer FROM {}", companies)
        }
        Selection::MissingRoles => format!(
            "SELECT DISTINCT c.organisasjonsnummer FROM {} c \
             LEFT JOIN {} r ON c.organisasjonsnummer = r.organisasjonsnummer \
             WHERE r.organisasjonsnummer IS NULL",
            companies,
            table_name(ROLES_TABLE)
        ),
        Selection::MissingFinancials { year, limit } => {
            let mut sql = if dependent_exists {
                format!(
                    "SELECT c.organisasjonsnummer FROM {} c WHERE NOT EXISTS (\
                     SELECT 1 FROM {} f \
                     WHERE f.virksomhet_organisasjonsnummer = c.organisasjonsnummer \
                     AND f.regnskapsperiode_fraDato = '{}-01-01')",
                    companies,
                    table_name(FINANCIAL_TABLE),
                    year
                )
            } else {
                format!("SELECT c.organisasjonsnummer FROM {} c", companies)
            };
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            sql
        }
    };
    Some(sql)
}

/// Resolve a selection to organisation numbers
pub async fn select_org_numbers(
    warehouse: &dyn Warehouse,
    selection: &Selection,
) -> HarvestResult<Vec<String>> {
    if let Selection::Explicit(org_numbers) = selection {
        return Ok(org_numbers.clone());
    }
    if !warehouse.table_exists(&TableRef::new(DATASET, COMPANY_TABLE)).await? {
        log::warn!("⚠️  No {} table yet, nothing to select", table_name(COMPANY_TABLE));
        return Ok(Vec::new());
    }

    let dependent = match selection {
        Selection::MissingRoles => Some(ROLES_TABLE),
        Selection::MissingFinancials { .. } => Some(FINANCIAL_TABLE),
        _ => None,
    };
    let dependent_exists = match dependent {
        Some(table) => warehouse.table_exists(&TableRef::new(DATASET, table)).await?,
        None => true,
    };

    let sql = match selection_sql(selection, dependent_exists) {
        Some(sql) => sql,
        None => return Ok(Vec::new()),
    };
    let org_numbers = column_values(warehouse.read(&sql).await?, "organisasjonsnummer");
    log::info!("Found {} companies for {:?}", org_numbers.len(), selection);
    Ok(org_numbers)
}

/// Every dotted NACE code in the code table, minus codes already known to
/// overflow a plain NACE search
pub async fn all_nace_codes(warehouse: &dyn Warehouse, ledger: &LedgerMap) -> HarvestResult<Vec<String>> {
    let sql = format!(
        "SELECT code FROM {} WHERE code LIKE '%.%'",
        table_name(NACE_TABLE)
    );
    let codes = column_values(warehouse.read(&sql).await?, "code");
    let overflowing = ledger.get(&SearchFilter::Nace.kind());

    let (skipped, codes): (Vec<String>, Vec<String>) = codes
        .into_iter()
        .partition(|code| overflowing.map_or(false, |keys| keys.contains_key(code)));
    if !skipped.is_empty() {
        log::info!(
            "Skipping {} NACE codes recorded as overflowing; rerun them with resplit",
            skipped.len()
        );
    }
    Ok(codes)
}

/// NACE × geography pairs for every code the ledger records under `kind`
pub fn resplit_keys(ledger: &LedgerMap, kind: &str, geo_values: &[String]) -> Vec<QueryKey> {
    let codes: BTreeSet<String> = ledger
        .get(kind)
        .into_iter()
        .flat_map(|keys| keys.keys())
        .map(|key| QueryKey::from(key.as_str()).code().to_string())
        .collect();
    codes
        .iter()
        .flat_map(|code| geo_values.iter().map(move |geo| QueryKey::pair(code.as_str(), geo.as_str())))
        .collect()
}

fn column_values(rows: Vec<FlatRow>, column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(FlatValue::as_text))
        .collect()
}
