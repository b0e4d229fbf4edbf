//! Harvest configuration from environment variables

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for a harvest run
///
/// Loaded from environment variables with defaults tuned to the public
/// registry API.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Path to SQLite warehouse file
    pub db_path: String,

    /// Path to the overflow ledger JSON document
    pub ledger_path: PathBuf,

    /// Maximum number of simultaneous in-flight fetches
    pub concurrency: usize,

    /// Number of key results transformed together
    pub batch_size: usize,

    /// Accumulated row count that triggers a checkpoint
    pub save_interval: usize,

    /// Records requested per page from paginated search
    pub page_size: u32,

    /// Result-count ceiling beyond which the search API cannot page
    pub page_ceiling: u64,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    pub brreg_base_url: String,
    pub enin_base_url: String,
    pub enin_credentials_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Could not load credentials from {path}: {reason}")]
    Credentials { path: String, reason: String },
}

impl HarvestConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `HARVEST_DB_PATH` (default: harvest.db)
    /// - `HARVEST_LEDGER_PATH` (default: overflow_ledger.json)
    /// - `HARVEST_CONCURRENCY` (default: 20)
    /// - `HARVEST_BATCH_SIZE` (default: 200)
    /// - `HARVEST_SAVE_INTERVAL` (default: 50000)
    /// - `HARVEST_PAGE_SIZE` (default: 100)
    /// - `HARVEST_PAGE_CEILING` (default: 10000)
    /// - `HARVEST_TIMEOUT_SECS` (default: 30)
    /// - `BRREG_BASE_URL` (default: https://data.brreg.no)
    /// - `ENIN_BASE_URL` (default: https://api.enin.ai)
    /// - `ENIN_CREDENTIALS_PATH` (optional)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse().ok());

        Self {
            db_path: lookup("HARVEST_DB_PATH").unwrap_or_else(|| "harvest.db".to_string()),

            ledger_path: lookup("HARVEST_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("overflow_ledger.json")),

            concurrency: parsed("HARVEST_CONCURRENCY").unwrap_or(20),

            batch_size: parsed("HARVEST_BATCH_SIZE").unwrap_or(200),

            save_interval: parsed("HARVEST_SAVE_INTERVAL").unwrap_or(50_000),

            page_size: lookup("HARVEST_PAGE_SIZE")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(100),

            page_ceiling: lookup("HARVEST_PAGE_CEILING")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(10_000),

            timeout_secs: lookup("HARVEST_TIMEOUT_SECS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(30),

            brreg_base_url: lookup("BRREG_BASE_URL")
                .unwrap_or_else(|| "https://data.brreg.no".to_string()),

            enin_base_url: lookup("ENIN_BASE_URL")
                .unwrap_or_else(|| "https://api.enin.ai".to_string()),

            enin_credentials_path: lookup("ENIN_CREDENTIALS_PATH").map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "HARVEST_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "HARVEST_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.save_interval == 0 {
            return Err(ConfigError::InvalidValue(
                "HARVEST_SAVE_INTERVAL must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 || self.page_ceiling == 0 {
            return Err(ConfigError::InvalidValue(
                "HARVEST_PAGE_SIZE and HARVEST_PAGE_CEILING must be positive".to_string(),
            ));
        }
        for (name, url) in [
            ("BRREG_BASE_URL", &self.brreg_base_url),
            ("ENIN_BASE_URL", &self.enin_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }
        if self.batch_size < self.concurrency {
            log::warn!(
                "⚠️  Batch size {} is smaller than concurrency {}; the worker pool will idle between batches",
                self.batch_size,
                self.concurrency
            );
        }
        Ok(())
    }
}

/// Client credentials for HTTP basic auth
#[derive(Clone, Deserialize)]
pub struct BasicCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

/// Read `{"client_id": ..., "client_secret": ...}` from a JSON file
pub fn load_credentials(path: &Path) -> Result<BasicCredentials, ConfigError> {
    let fail = |reason: String| ConfigError::Credentials {
        path: path.display().to_string(),
        reason,
    };
    let json = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    serde_json::from_str(&json).map_err(|e| fail(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> HarvestConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HarvestConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);

        assert_eq!(config.db_path, "harvest.db");
        assert_eq!(config.ledger_path, PathBuf::from("overflow_ledger.json"));
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.save_interval, 50_000);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.page_ceiling, 10_000);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.brreg_base_url, "https://data.brreg.no");
        assert!(config.enin_credentials_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        let config = config_from(&[
            ("HARVEST_DB_PATH", "/tmp/test.db"),
            ("HARVEST_CONCURRENCY", "15"),
            ("HARVEST_SAVE_INTERVAL", "100000"),
            ("HARVEST_PAGE_CEILING", "5000"),
            ("ENIN_CREDENTIALS_PATH", "/etc/enin.json"),
        ]);

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.concurrency, 15);
        assert_eq!(config.save_interval, 100_000);
        assert_eq!(config.page_ceiling, 5_000);
        assert_eq!(
            config.enin_credentials_path,
            Some(PathBuf::from("/etc/enin.json"))
        );
    }

    #[test]
    fn test_unparseable_values_fall_back_to_defaults() {
        let config = config_from(&[("HARVEST_CONCURRENCY", "lots"), ("HARVEST_BATCH_SIZE", "")]);
        assert_eq!(config.concurrency, 20);
        assert_eq!(config.batch_size, 200);
    }

    #[test]
    fn test_validate_rejects_zero_and_bad_urls() {
        let config = config_from(&[("HARVEST_CONCURRENCY", "0")]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let config = config_from(&[("BRREG_BASE_URL", "data.brreg.no")]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_load_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, r#"{"client_id": "abc", "client_secret": "s3cret"}"#).unwrap();

        let creds = load_credentials(&path).unwrap();
        assert_eq!(creds.client_id, "abc");
        assert_eq!(creds.client_secret, "s3cret");
        assert!(!format!("{:?}", creds).contains("s3cret"));

        let missing = load_credentials(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Credentials { .. })));
    }
}
