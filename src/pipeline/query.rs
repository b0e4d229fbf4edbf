//! Logical query keys and their expansion into fetch units

use serde::{Deserialize, Serialize};
use std::fmt;

/// One logical fetch unit
///
/// `Single` carries one code or identifier (NACE code, organisation number,
/// geography value). `Pair` is a NACE code restricted to one geography value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryKey {
    Single(String),
    Pair { code: String, geo: String },
}

impl QueryKey {
    pub fn single(value: impl Into<String>) -> Self {
        QueryKey::Single(value.into())
    }

    pub fn pair(code: impl Into<String>, geo: impl Into<String>) -> Self {
        QueryKey::Pair {
            code: code.into(),
            geo: geo.into(),
        }
    }

    /// Primary code or identifier of the key
    pub fn code(&self) -> &str {
        match self {
            QueryKey::Single(value) => value,
            QueryKey::Pair { code, .. } => code,
        }
    }

    pub fn geo(&self) -> Option<&str> {
        match self {
            QueryKey::Single(_) => None,
            QueryKey::Pair { geo, .. } => Some(geo),
        }
    }
}

/// Ledger and log representation: `code` or `code:geo`
impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Single(value) => write!(f, "{}", value),
            QueryKey::Pair { code, geo } => write!(f, "{}:{}", code, geo),
        }
    }
}

/// Inverse of `Display`
impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        match s.split_once(':') {
            Some((code, geo)) => QueryKey::pair(code, geo),
            None => QueryKey::single(s),
        }
    }
}

/// Address field used as a geography filter on company search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GeoType {
    Kommune,
    Kommunenummer,
    Postnummer,
    Poststed,
}

impl GeoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoType::Kommune => "kommune",
            GeoType::Kommunenummer => "kommunenummer",
            GeoType::Postnummer => "postnummer",
            GeoType::Poststed => "poststed",
        }
    }

    /// Query parameter name on the search endpoint
    pub fn param_name(&self) -> String {
        format!("forretningsadresse.{}", self.as_str())
    }
}

/// Which filters a company search key carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFilter {
    Nace,
    Geo(GeoType),
    NaceGeo(GeoType),
}

impl SearchFilter {
    /// Ledger kind: `nace`, `{geo}` or `nace_{geo}`
    pub fn kind(&self) -> String {
        match self {
            SearchFilter::Nace => "nace".to_string(),
            SearchFilter::Geo(geo) => geo.as_str().to_string(),
            SearchFilter::NaceGeo(geo) => format!("nace_{}", geo.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("either NACE codes or geography values must be provided")]
pub struct EmptySearch;

/// Expand NACE codes × geography values into search keys
///
/// Both lists present gives the cross product as `Pair` keys, a single list
/// gives one `Single` key per value.
pub fn expand_search_keys(
    nace_codes: &[String],
    geo_values: &[String],
    geo_type: GeoType,
) -> Result<(SearchFilter, Vec<QueryKey>), EmptySearch> {
    match (nace_codes.is_empty(), geo_values.is_empty()) {
        (false, false) => {
            let keys = nace_codes
                .iter()
                .flat_map(|nace| geo_values.iter().map(move |geo| QueryKey::pair(nace, geo)))
                .collect();
            Ok((SearchFilter::NaceGeo(geo_type), keys))
        }
        (false, true) => Ok((
            SearchFilter::Nace,
            nace_codes.iter().map(QueryKey::single).collect(),
        )),
        (true, false) => Ok((
            SearchFilter::Geo(geo_type),
            geo_values.iter().map(QueryKey::single).collect(),
        )),
        (true, true) => Err(EmptySearch),
    }
}
