//! HTTP fetch client
//!
//! Issues one page request and classifies the response into a `FetchOutcome`.
//! There is no retry at this layer: a 429 is surfaced as `RateLimited` and
//! every caller must unwind the run on it.
//!
//! ## Status mapping
//!
//! - 200 with a JSON body → `Ok(payload)`
//! - 404 → `NotFound`
//! - 429 → `RateLimited`
//! - 500 whose body names an unsupported statement plan → `NotFound`
//! - anything else, including connection failures → `Transient`

use crate::config::BasicCredentials;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

/// Body fragment the financial statements endpoint returns with HTTP 500 for
/// statements it cannot render. Treated as "no data" rather than a failure.
pub const UNSUPPORTED_STATEMENT_PLAN: &str =
    "Regnskapet inneholder en oppstillingsplan som ikke er stottet";

const ERROR_SNIPPET_CHARS: usize = 200;

/// Result of one page request
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ok(Value),
    NotFound,
    /// The query matches more results than the endpoint can page through
    Overflow(u64),
    RateLimited(String),
    Transient {
        status: Option<u16>,
        message: String,
    },
}

impl FetchOutcome {
    /// Turn a successful payload into `Overflow` when its reported total
    /// exceeds `ceiling`
    pub fn with_ceiling<F>(self, total_of: F, ceiling: u64) -> Self
    where
        F: FnOnce(&Value) -> Option<u64>,
    {
        match self {
            FetchOutcome::Ok(payload) => match total_of(&payload) {
                Some(total) if total > ceiling => FetchOutcome::Overflow(total),
                _ => FetchOutcome::Ok(payload),
            },
            other => other,
        }
    }
}

/// A GET request against a base URL with optional query parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    params: Vec<(String, Option<String>)>,
}

impl PageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter; `None` values are never transmitted
    pub fn param<V: ToString>(mut self, name: impl Into<String>, value: Option<V>) -> Self {
        self.params
            .push((name.into(), value.map(|v| v.to_string())));
        self
    }

    /// Parameters that will be sent, absent values stripped
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        self.params
            .iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (k.as_str(), v)))
            .collect()
    }
}

/// Anything that can execute a page request
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> FetchOutcome;

    /// Release the network session
    async fn close(&self) {}
}

/// Classify a raw HTTP response
pub fn classify_response(status: u16, body: &str) -> FetchOutcome {
    match status {
        200 => match serde_json::from_str(body) {
            Ok(payload) => FetchOutcome::Ok(payload),
            Err(e) => FetchOutcome::Transient {
                status: Some(status),
                message: format!("invalid JSON body: {}", e),
            },
        },
        404 => FetchOutcome::NotFound,
        429 => FetchOutcome::RateLimited(snippet(body)),
        500 if body.contains(UNSUPPORTED_STATEMENT_PLAN) => FetchOutcome::NotFound,
        _ => FetchOutcome::Transient {
            status: Some(status),
            message: snippet(body),
        },
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(ERROR_SNIPPET_CHARS).collect()
}

/// reqwest-backed fetcher with one lazily created session per run
pub struct HttpFetcher {
    session: Mutex<Option<Client>>,
    timeout: Duration,
    credentials: Option<BasicCredentials>,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            session: Mutex::new(None),
            timeout: Duration::from_secs(timeout_secs),
            credentials: None,
        }
    }

    /// Authenticate every request with HTTP basic auth
    pub fn with_credentials(mut self, credentials: BasicCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Get the open session, creating it if absent or closed
    async fn ensure_session(&self) -> Result<Client, reqwest::Error> {
        let mut session = self.session.lock().await;
        if let Some(client) = session.as_ref() {
            return Ok(client.clone());
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()?;

        log::debug!("🔌 Opened HTTP session (timeout {}s)", self.timeout.as_secs());
        *session = Some(client.clone());
        Ok(client)
    }

    /// Drop the current session and open a fresh one
    pub async fn reset_session(&self) -> Result<(), reqwest::Error> {
        self.close().await;
        self.ensure_session().await.map(|_| ())
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &PageRequest) -> FetchOutcome {
        let client = match self.ensure_session().await {
            Ok(client) => client,
            Err(e) => {
                return FetchOutcome::Transient {
                    status: None,
                    message: format!("could not create HTTP session: {}", e),
                }
            }
        };

        let mut builder = client.get(&request.url).query(&request.query_pairs());
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.client_id, Some(&creds.client_secret));
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                log::error!("❌ Connection error for {}: {}", request.url, e);
                return FetchOutcome::Transient {
                    status: None,
                    message: e.to_string(),
                };
            }
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => classify_response(status, &body),
            Err(e) => FetchOutcome::Transient {
                status: Some(status),
                message: format!("could not read body: {}", e),
            },
        }
    }

    async fn close(&self) {
        if self.session.lock().await.take().is_some() {
            log::debug!("🔌 Closed HTTP session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_success_and_soft_failures() {
        assert_eq!(
            classify_response(200, r#"{"a": 1}"#),
            FetchOutcome::Ok(json!({"a": 1}))
        );
        assert_eq!(classify_response(404, "Not Found"), FetchOutcome::NotFound);

        let body = format!("{{\"feilmelding\": \"{}\"}}", UNSUPPORTED_STATEMENT_PLAN);
        assert_eq!(classify_response(500, &body), FetchOutcome::NotFound);
    }

    #[test]
    fn test_classify_rate_limit_and_transient() {
        assert!(matches!(
            classify_response(429, "slow down"),
            FetchOutcome::RateLimited(msg) if msg == "slow down"
        ));
        assert!(matches!(
            classify_response(500, "internal error"),
            FetchOutcome::Transient { status: Some(500), .. }
        ));
        assert!(matches!(
            classify_response(400, "bad request"),
            FetchOutcome::Transient { status: Some(400), .. }
        ));
        // A 200 with a broken body is not a success
        assert!(matches!(
            classify_response(200, "<html>"),
            FetchOutcome::Transient { status: Some(200), .. }
        ));
    }

    #[test]
    fn test_error_snippet_is_truncated() {
        let body = "x".repeat(1000);
        match classify_response(503, &body) {
            FetchOutcome::Transient { message, .. } => assert_eq!(message.len(), 200),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_absent_params_are_stripped() {
        let request = PageRequest::new("https://example.test/enheter")
            .param("page", Some(0))
            .param("size", Some(100))
            .param("naeringskode", None::<String>)
            .param("forretningsadresse.kommunenummer", Some("0301"))
            .param("empty", Some(""));

        assert_eq!(
            request.query_pairs(),
            vec![
                ("page", "0"),
                ("size", "100"),
                ("forretningsadresse.kommunenummer", "0301"),
                ("empty", ""),
            ]
        );
    }

    #[test]
    fn test_with_ceiling() {
        let total = |v: &Value| v["page"]["totalElements"].as_u64();

        let big = FetchOutcome::Ok(json!({"page": {"totalElements": 15000}}));
        assert_eq!(big.with_ceiling(total, 10_000), FetchOutcome::Overflow(15000));

        let exact = FetchOutcome::Ok(json!({"page": {"totalElements": 10000}}));
        assert!(matches!(exact.with_ceiling(total, 10_000), FetchOutcome::Ok(_)));

        let no_total = FetchOutcome::Ok(json!({}));
        assert!(matches!(no_total.with_ceiling(total, 10_000), FetchOutcome::Ok(_)));

        assert_eq!(
            FetchOutcome::NotFound.with_ceiling(total, 10_000),
            FetchOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_session_is_lazy_and_recreated_after_close() {
        let fetcher = HttpFetcher::new(5);
        assert!(!fetcher.is_open().await);

        fetcher.reset_session().await.unwrap();
        assert!(fetcher.is_open().await);

        fetcher.close().await;
        assert!(!fetcher.is_open().await);

        fetcher.ensure_session().await.unwrap();
        assert!(fetcher.is_open().await);
    }

    #[tokio::test]
    #[ignore] // Run only when testing with live API
    async fn test_live_registry_lookup() {
        let fetcher = HttpFetcher::new(10);
        let request = PageRequest::new("https://data.brreg.no/enhetsregisteret/api/enheter/923609016");
        assert!(matches!(fetcher.fetch(&request).await, FetchOutcome::Ok(_)));
    }
}
