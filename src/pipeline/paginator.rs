//! Paginator: drives one logical query through the fetch client
//!
//! Per key the paginator runs a small state machine:
//!
//! ```text
//! Fetching(n) ──records──▶ Fetching(n+1)
//!      │ ──empty page──▶ Exhausted      (all pages returned)
//!      │ ──total > ceiling──▶ Overflow  (ledger entry, no data)
//!      │ ──transient / decode error──▶ Failed (no data)
//!      │ ──not found──▶ Marker | Failed
//!      └ ──429──▶ Err(RateLimited)     (propagates, never caught here)
//! ```
//!
//! Pages are requested strictly one after another: the empty page is the only
//! end-of-results signal, and it wins over any count metadata.

use super::fetch::{FetchOutcome, Fetcher, PageRequest};
use super::ledger::OverflowLedger;
use super::query::QueryKey;
use super::record::{PageResult, RawRecord};
use crate::error::{HarvestError, HarvestResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Endpoint-specific request building and payload decoding
pub trait Endpoint: Send + Sync {
    /// Ledger kind under which overflowing keys are recorded
    fn kind(&self) -> String;

    fn request(&self, key: &QueryKey, page: u32) -> PageRequest;

    /// Search endpoints page until empty; lookups return one document
    fn paginated(&self) -> bool {
        false
    }

    /// Total result count reported by a payload, if the endpoint reports one
    fn total_elements(&self, _payload: &Value) -> Option<u64> {
        None
    }

    fn decode(&self, key: &QueryKey, payload: Value) -> Result<Vec<RawRecord>, String>;

    /// Row standing in for a key the API reports as not found.
    /// `None` drops the key instead.
    fn empty_marker(&self, _key: &QueryKey) -> Option<RawRecord> {
        None
    }
}

/// What one key produced
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Pages(Vec<PageResult>),
    Marker(RawRecord),
    Overflow(u64),
    Failed(String),
}

impl KeyOutcome {
    pub fn record_count(&self) -> usize {
        match self {
            KeyOutcome::Pages(pages) => pages.iter().map(|p| p.records.len()).sum(),
            KeyOutcome::Marker(_) => 1,
            KeyOutcome::Overflow(_) | KeyOutcome::Failed(_) => 0,
        }
    }

    /// Whether the outcome carries rows for the transform stage
    pub fn is_usable(&self) -> bool {
        self.record_count() > 0
    }
}

/// Unit of work the scheduler runs per key
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Only `HarvestError::RateLimited` is expected to escape; any other error
    /// is logged by the scheduler and the key dropped.
    async fn fetch_key(&self, key: &QueryKey) -> HarvestResult<KeyOutcome>;
}

enum PageState {
    Fetching(u32),
    Exhausted,
    Overflow(u64),
    Marker(RawRecord),
    Failed(String),
}

pub struct Paginator {
    fetcher: Arc<dyn Fetcher>,
    endpoint: Arc<dyn Endpoint>,
    ledger: Arc<OverflowLedger>,
    page_size: u32,
    ceiling: u64,
}

impl Paginator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        endpoint: Arc<dyn Endpoint>,
        ledger: Arc<OverflowLedger>,
        page_size: u32,
        ceiling: u64,
    ) -> Self {
        Self {
            fetcher,
            endpoint,
            ledger,
            page_size: page_size.max(1),
            ceiling,
        }
    }

    /// Fetch page `index` and decide the next state
    async fn step(
        &self,
        key: &QueryKey,
        index: u32,
        pages: &mut Vec<PageResult>,
    ) -> HarvestResult<PageState> {
        let paginated = self.endpoint.paginated();

        // The ceiling page cannot be served. A reported total within the
        // ceiling means every record was already returned; without one the
        // query is at least as large as the API can serve.
        if paginated && u64::from(index) * u64::from(self.page_size) >= self.ceiling {
            let reported = pages.iter().find_map(|p| p.total_elements);
            if matches!(reported, Some(total) if total <= self.ceiling) {
                return Ok(PageState::Exhausted);
            }
            let seen = pages.iter().map(|p| p.records.len() as u64).sum();
            return Ok(PageState::Overflow(seen));
        }

        let request = self.endpoint.request(key, index);
        let outcome = self
            .fetcher
            .fetch(&request)
            .await
            .with_ceiling(|payload| self.endpoint.total_elements(payload), self.ceiling);

        let state = match outcome {
            FetchOutcome::Ok(payload) => {
                let total_elements = self.endpoint.total_elements(&payload);
                match self.endpoint.decode(key, payload) {
                    Ok(records) if records.is_empty() => PageState::Exhausted,
                    Ok(records) => {
                        log::debug!(
                            "Found {} records for {} on page {}",
                            records.len(),
                            key,
                            index
                        );
                        pages.push(PageResult {
                            records,
                            page_index: index,
                            total_elements,
                            is_last: !paginated,
                        });
                        if paginated {
                            PageState::Fetching(index + 1)
                        } else {
                            PageState::Exhausted
                        }
                    }
                    Err(reason) => PageState::Failed(format!("decode error: {}", reason)),
                }
            }
            FetchOutcome::NotFound if !pages.is_empty() => PageState::Exhausted,
            FetchOutcome::NotFound => match self.endpoint.empty_marker(key) {
                Some(marker) => PageState::Marker(marker),
                None => PageState::Failed("not found".to_string()),
            },
            FetchOutcome::Overflow(total) => PageState::Overflow(total),
            FetchOutcome::RateLimited(body) => {
                log::error!("error code 429 for {} {}: {}", self.endpoint.kind(), key, body);
                return Err(HarvestError::rate_limited(format!(
                    "{} {}",
                    self.endpoint.kind(),
                    key
                )));
            }
            FetchOutcome::Transient { status, message } => PageState::Failed(format!(
                "status {}: {}",
                status.map(|s| s.to_string()).unwrap_or_else(|| "n/a".to_string()),
                message
            )),
        };
        Ok(state)
    }
}

#[async_trait]
impl KeyFetcher for Paginator {
    async fn fetch_key(&self, key: &QueryKey) -> HarvestResult<KeyOutcome> {
        let mut pages = Vec::new();
        let mut state = PageState::Fetching(0);

        loop {
            state = match state {
                PageState::Fetching(index) => self.step(key, index, &mut pages).await?,
                PageState::Exhausted => {
                    if pages.is_empty() && !self.endpoint.paginated() {
                        return Ok(KeyOutcome::Failed("empty response".to_string()));
                    }
                    if let Some(last) = pages.last_mut() {
                        last.is_last = true;
                    }
                    return Ok(KeyOutcome::Pages(pages));
                }
                PageState::Overflow(total) => {
                    let kind = self.endpoint.kind();
                    log::warn!(
                        "📈 {} {} overflows the page ceiling ({} > {}), recorded for re-splitting",
                        kind,
                        key,
                        total,
                        self.ceiling
                    );
                    self.ledger.record(&kind, &key.to_string(), total);
                    return Ok(KeyOutcome::Overflow(total));
                }
                PageState::Marker(marker) => return Ok(KeyOutcome::Marker(marker)),
                PageState::Failed(reason) => {
                    log::error!(
                        "❌ Could not fetch {} {}: {}",
                        self.endpoint.kind(),
                        key,
                        reason
                    );
                    return Ok(KeyOutcome::Failed(reason));
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{items_page, ItemsEndpoint, ScriptedFetcher};

    fn paginator(
        fetcher: Arc<ScriptedFetcher>,
        endpoint: ItemsEndpoint,
        ceiling: u64,
    ) -> (Paginator, Arc<OverflowLedger>) {
        let ledger = Arc::new(OverflowLedger::new());
        let paginator = Paginator::new(fetcher, Arc::new(endpoint), Arc::clone(&ledger), 2, ceiling);
        (paginator, ledger)
    }

    #[tokio::test]
    async fn test_pages_until_empty_page() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("01.100");
        fetcher.script(&key, 0, items_page(&["a", "b"], Some(3)));
        fetcher.script(&key, 1, items_page(&["c"], Some(3)));
        fetcher.script(&key, 2, items_page(&[], Some(3)));

        let (paginator, ledger) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 10_000);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        match outcome {
            KeyOutcome::Pages(pages) => {
                assert_eq!(pages.len(), 2);
                assert_eq!(pages[0].page_index, 0);
                assert_eq!(pages[1].page_index, 1);
                assert!(!pages[0].is_last);
                assert!(pages[1].is_last);
                let ids: Vec<_> = pages
                    .iter()
                    .flat_map(|p| p.records.iter())
                    .map(|r| r["id"].to_json_string())
                    .collect();
                assert_eq!(ids, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fetcher.requested_pages(&key), vec![0, 1, 2]);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_on_first_page_records_and_returns_no_data() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("47.111");
        fetcher.script(&key, 0, items_page(&["a", "b"], Some(15_000)));

        let (paginator, ledger) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 10_000);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert_eq!(outcome, KeyOutcome::Overflow(15_000));
        assert_eq!(outcome.record_count(), 0);
        assert_eq!(fetcher.requested_pages(&key), vec![0]);
        assert_eq!(ledger.snapshot()["items"]["47.111"], 15_000);
    }

    #[tokio::test]
    async fn test_empty_page_is_authoritative_over_total() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("01.100");
        fetcher.script(&key, 0, items_page(&["a", "b"], Some(9)));
        fetcher.script(&key, 1, items_page(&[], Some(9)));

        let (paginator, _) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 10_000);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert_eq!(outcome.record_count(), 2);
        assert_eq!(fetcher.requested_pages(&key), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_page_ceiling_without_total_is_overflow() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("01.100");
        for page in 0..3 {
            fetcher.script(&key, page, items_page(&["x", "y"], None));
        }

        // page size 2, ceiling 6: pages 0..=2 are servable, page 3 is not
        let (paginator, ledger) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 6);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert_eq!(outcome, KeyOutcome::Overflow(6));
        assert_eq!(fetcher.requested_pages(&key), vec![0, 1, 2]);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_total_just_under_ceiling_completes() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("01.100");
        fetcher.script(&key, 0, items_page(&["a", "b"], Some(3)));
        fetcher.script(&key, 1, items_page(&["c"], Some(3)));
        fetcher.script(&key, 2, items_page(&[], Some(3)));

        // page size 2, ceiling 4: page 2 would start at the ceiling
        let (paginator, ledger) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 4);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert!(matches!(&outcome, KeyOutcome::Pages(pages) if pages[1].is_last));
        assert_eq!(outcome.record_count(), 3);
        assert_eq!(fetcher.requested_pages(&key), vec![0, 1]);
        assert!(ledger.is_empty());

        // a total exactly at the ceiling is still complete
        let key = QueryKey::single("01.200");
        fetcher.script(&key, 0, items_page(&["a", "b"], Some(4)));
        fetcher.script(&key, 1, items_page(&["c", "d"], Some(4)));
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert_eq!(outcome.record_count(), 4);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_fails_the_key_without_partial_data() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("01.100");
        fetcher.script(&key, 0, items_page(&["a", "b"], None));
        fetcher.script(
            &key,
            1,
            FetchOutcome::Transient {
                status: Some(502),
                message: "bad gateway".to_string(),
            },
        );

        let (paginator, _) = paginator(fetcher, ItemsEndpoint::search(), 10_000);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert!(matches!(outcome, KeyOutcome::Failed(ref reason) if reason.contains("502")));
        assert!(!outcome.is_usable());
    }

    #[tokio::test]
    async fn test_rate_limit_propagates_and_stops_paging() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::pair("01.100", "0301");
        fetcher.script(&key, 0, items_page(&["a", "b"], None));
        fetcher.script(&key, 1, FetchOutcome::RateLimited("Too Many Requests".to_string()));
        fetcher.script(&key, 2, items_page(&["c"], None));

        let (paginator, ledger) = paginator(Arc::clone(&fetcher), ItemsEndpoint::search(), 10_000);
        let err = paginator.fetch_key(&key).await.unwrap_err();

        assert!(err.is_rate_limit());
        assert!(err.to_string().contains("01.100:0301"));
        assert_eq!(fetcher.requested_pages(&key), vec![0, 1]);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_not_found_yields_marker_or_failure() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("912345678");
        fetcher.script(&key, 0, FetchOutcome::NotFound);

        let (with_marker, _) =
            paginator(Arc::clone(&fetcher), ItemsEndpoint::lookup_with_marker(), 10_000);
        match with_marker.fetch_key(&key).await.unwrap() {
            KeyOutcome::Marker(marker) => {
                assert_eq!(marker["id"].to_json_string(), "912345678")
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let (without_marker, _) = paginator(fetcher, ItemsEndpoint::lookup(), 10_000);
        assert!(matches!(
            without_marker.fetch_key(&key).await.unwrap(),
            KeyOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_lookup_fetches_exactly_one_page() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let key = QueryKey::single("912345678");
        fetcher.script(&key, 0, items_page(&["912345678"], None));

        let (paginator, _) = paginator(Arc::clone(&fetcher), ItemsEndpoint::lookup(), 10_000);
        let outcome = paginator.fetch_key(&key).await.unwrap();

        assert_eq!(outcome.record_count(), 1);
        assert_eq!(fetcher.requested_pages(&key), vec![0]);
    }
}
