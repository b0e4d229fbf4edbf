//! Scripted fetchers shared by the pipeline unit tests

use super::fetch::{FetchOutcome, Fetcher, PageRequest};
use super::paginator::{Endpoint, KeyFetcher, KeyOutcome};
use super::query::QueryKey;
use super::record::{record_from_json, PageResult, RawRecord};
use crate::error::{HarvestError, HarvestResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn items_url(key: &QueryKey) -> String {
    format!("test://items/{}", key)
}

/// Page payload in the shape `ItemsEndpoint` decodes
pub fn items_page(ids: &[&str], total: Option<u64>) -> FetchOutcome {
    let items: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
    FetchOutcome::Ok(json!({ "items": items, "total": total }))
}

/// Fetcher answering from a `(key, page) -> outcome` script
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<HashMap<(String, String), FetchOutcome>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, key: &QueryKey, page: u32, outcome: FetchOutcome) {
        self.script
            .lock()
            .unwrap()
            .insert((items_url(key), page.to_string()), outcome);
    }

    pub fn requested_pages(&self, key: &QueryKey) -> Vec<u32> {
        let url = items_url(key);
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| *u == url)
            .filter_map(|(_, page)| page.parse().ok())
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &PageRequest) -> FetchOutcome {
        let page = request
            .query_pairs()
            .iter()
            .find(|(name, _)| *name == "page")
            .map(|(_, value)| value.to_string())
            .unwrap_or_else(|| "0".to_string());
        let id = (request.url.clone(), page);
        self.requests.lock().unwrap().push(id.clone());
        self.script
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or(FetchOutcome::Transient {
                status: None,
                message: format!("unscripted request {:?}", id),
            })
    }
}

/// Endpoint reading `items[]` and `total` from the payload
pub struct ItemsEndpoint {
    paginated: bool,
    marker: bool,
}

impl ItemsEndpoint {
    pub fn search() -> Self {
        Self {
            paginated: true,
            marker: false,
        }
    }

    pub fn lookup() -> Self {
        Self {
            paginated: false,
            marker: false,
        }
    }

    pub fn lookup_with_marker() -> Self {
        Self {
            paginated: false,
            marker: true,
        }
    }
}

impl Endpoint for ItemsEndpoint {
    fn kind(&self) -> String {
        "items".to_string()
    }

    fn request(&self, key: &QueryKey, page: u32) -> PageRequest {
        PageRequest::new(items_url(key)).param("page", Some(page))
    }

    fn paginated(&self) -> bool {
        self.paginated
    }

    fn total_elements(&self, payload: &Value) -> Option<u64> {
        payload["total"].as_u64()
    }

    fn decode(&self, _key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String> {
        match payload.get("items").cloned() {
            Some(Value::Array(items)) => Ok(items.into_iter().filter_map(record_from_json).collect()),
            _ => Err("payload has no items".to_string()),
        }
    }

    fn empty_marker(&self, key: &QueryKey) -> Option<RawRecord> {
        if self.marker {
            record_from_json(json!({ "id": key.code() }))
        } else {
            None
        }
    }
}

/// Behaviour of one key in `ScriptedKeyFetcher`
#[derive(Clone)]
pub enum KeyScript {
    Rows(Vec<Value>),
    Outcome(KeyOutcome),
    RateLimited,
    Error(String),
    Panic,
}

/// KeyFetcher answering per key, tracking call order and peak concurrency
pub struct ScriptedKeyFetcher {
    scripts: HashMap<QueryKey, KeyScript>,
    delay: Duration,
    fetched: Mutex<Vec<QueryKey>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedKeyFetcher {
    pub fn new(scripts: Vec<(QueryKey, KeyScript)>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            delay: Duration::from_millis(0),
            fetched: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetched(&self) -> Vec<QueryKey> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyFetcher for ScriptedKeyFetcher {
    async fn fetch_key(&self, key: &QueryKey) -> HarvestResult<KeyOutcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(key.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.scripts.get(key).cloned() {
            Some(KeyScript::Rows(rows)) => Ok(KeyOutcome::Pages(vec![PageResult {
                records: rows.into_iter().filter_map(record_from_json).collect(),
                page_index: 0,
                total_elements: None,
                is_last: true,
            }])),
            Some(KeyScript::Outcome(outcome)) => Ok(outcome),
            Some(KeyScript::RateLimited) => Err(HarvestError::rate_limited(key.to_string())),
            Some(KeyScript::Error(reason)) => Err(HarvestError::Task(reason)),
            Some(KeyScript::Panic) => panic!("scripted panic for {}", key),
            None => Ok(KeyOutcome::Failed("unscripted".to_string())),
        }
    }
}
