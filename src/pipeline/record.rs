//! Raw API payloads as a closed structural type

use serde_json::Value;
use std::collections::BTreeMap;

/// One JSON value from the API, restricted to the cases flattening handles
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<RawValue>),
    Map(RawRecord),
}

/// An untyped nested record (business entity, role, statement)
pub type RawRecord = BTreeMap<String, RawValue>;

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Int(i),
                None => RawValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => RawValue::Text(s),
            Value::Array(items) => RawValue::List(items.into_iter().map(RawValue::from).collect()),
            Value::Object(map) => RawValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&RawValue> for Value {
    fn from(value: &RawValue) -> Self {
        match value {
            RawValue::Null => Value::Null,
            RawValue::Bool(b) => Value::Bool(*b),
            RawValue::Int(i) => Value::from(*i),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RawValue::Text(s) => Value::String(s.clone()),
            RawValue::List(items) => Value::Array(items.iter().map(Value::from).collect()),
            RawValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl RawValue {
    pub fn as_map(&self) -> Option<&RawRecord> {
        match self {
            RawValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RawValue]> {
        match self {
            RawValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// JSON text of the value, used when a column is forced to a string
    pub fn to_json_string(&self) -> String {
        match self {
            RawValue::Text(s) => s.clone(),
            other => Value::from(other).to_string(),
        }
    }
}

/// Convert a JSON object into a record; non-objects yield `None`
pub fn record_from_json(value: Value) -> Option<RawRecord> {
    match RawValue::from(value) {
        RawValue::Map(map) => Some(map),
        _ => None,
    }
}

/// Look up a nested value by a path of object keys
pub fn lookup<'a>(record: &'a RawRecord, path: &[&str]) -> Option<&'a RawValue> {
    let (first, rest) = path.split_first()?;
    let value = record.get(*first)?;
    if rest.is_empty() {
        Some(value)
    } else {
        lookup(value.as_map()?, rest)
    }
}

/// One decoded response page
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub records: Vec<RawRecord>,
    pub page_index: u32,
    /// Total result count reported by the endpoint, when it reports one
    pub total_elements: Option<u64>,
    /// Final page of a completed key
    pub is_last: bool,
}
