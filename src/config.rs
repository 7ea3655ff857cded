//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section falls back to the built-in defaults, so a missing or
//! partial file is valid. Secrets (API keys) are referenced by env-var
//! name in the config and resolved when the endpoint client is built.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::pricing::{CostParameters, ExchangeRates};
use crate::scheduler::Cadence;
use crate::types::ArbError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub sources: SourcesConfig,
    pub valuation: ValuationConfig,
    pub pricing: PricingConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub retention: RetentionConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub source_currency: String,
    pub destination_currency: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "CARBITRAGE-JP-AF".to_string(),
            source_currency: "JPY".to_string(),
            destination_currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    /// Skip every live provider and go straight to synthetic listings.
    pub synthetic_only: bool,
    /// Synthetic batch size when running synthetic-only.
    pub synthetic_count: usize,
    /// Synthetic batch size when live providers yielded nothing.
    pub fallback_count: usize,
    pub goonet: EndpointConfig,
    pub uss: EndpointConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            synthetic_only: false,
            synthetic_count: 30,
            fallback_count: 25,
            goonet: EndpointConfig::new("https://www.goo-net.com", 60),
            uss: EndpointConfig::new("https://www.ussnet.co.jp", 30),
        }
    }
}

/// A remote endpoint that can be switched off.
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Env var holding an API key, if the endpoint takes one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl EndpointConfig {
    fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            enabled: true,
            base_url: base_url.to_string(),
            timeout_secs,
            api_key_env: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the configured API key, if any.
    pub fn api_key(&self) -> Option<SecretString> {
        self.api_key_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|k| !k.is_empty())
            .map(SecretString::new)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValuationConfig {
    pub api: EndpointConfig,
    pub web: EndpointConfig,
    /// Minimum spacing between live valuation requests (rate ceiling).
    pub courtesy_delay_ms: u64,
    /// Maximum in-flight valuations in a batch.
    pub max_concurrency: usize,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            api: EndpointConfig::new("https://api.classic.com", 15),
            web: EndpointConfig::new("https://classic.com", 20),
            courtesy_delay_ms: 1000,
            max_concurrency: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PricingConfig {
    pub costs: CostParameters,
    pub exchange_rates: ExchangeRates,
    /// Snapshot endpoint returning `{"rates": {"JPY": ...}}` against USD.
    pub rate_url: String,
    pub rate_timeout_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            costs: CostParameters::default(),
            exchange_rates: ExchangeRates::default(),
            rate_url: "https://api.exchangerate-api.com/v4/latest/USD".to_string(),
            rate_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Json,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Listing document file (json backend).
    pub path: String,
    /// Append-only job log (json backend).
    pub audit_path: String,
    /// Connection string (sqlite backend).
    pub sqlite_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            path: "data/listings.json".to_string(),
            audit_path: "data/job_log.jsonl".to_string(),
            sqlite_url: "sqlite://data/carbitrage.db".to_string(),
        }
    }
}

/// A cron rule (seconds field first) evaluated in an IANA timezone.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct JobSchedule {
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl JobSchedule {
    fn new(cron: &str, timezone: &str) -> Self {
        Self {
            cron: cron.to_string(),
            timezone: timezone.to_string(),
        }
    }

    pub fn cadence(&self) -> Result<Cadence, ArbError> {
        Cadence::cron(&self.cron, &self.timezone)
    }
}

/// Wall-clock schedule of each standing job.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub full_scrape: JobSchedule,
    pub refresh: JobSchedule,
    pub exchange_rate: JobSchedule,
    pub cleanup: JobSchedule,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_scrape: JobSchedule::new("0 0 2 * * *", "Asia/Tokyo"),
            refresh: JobSchedule::new("0 0 */4 * * *", "UTC"),
            exchange_rate: JobSchedule::new("0 0 * * * *", "UTC"),
            cleanup: JobSchedule::new("0 0 3 * * Sun", "UTC"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// Active records not updated for this long are deactivated.
    pub stale_days: i64,
    /// Inactive records not updated for this long are deleted.
    pub purge_days: i64,
    /// Active records older than this are refresh candidates.
    pub refresh_after_hours: i64,
    pub refresh_batch: usize,
    pub refresh_delay_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stale_days: 30,
            purge_days: 90,
            refresh_after_hours: 24,
            refresh_batch: 50,
            refresh_delay_ms: 2000,
        }
    }
}

impl RetentionConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.stale_days)
    }

    pub fn purge_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.purge_days)
    }

    pub fn refresh_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.refresh_after_hours)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    /// Environment overrides are applied and the result validated.
    pub fn load_or_default(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::load(path)?
        } else {
            info!(path, "No config file found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// `CARBITRAGE_SYNTHETIC_ONLY` and `CARBITRAGE_STORAGE_PATH` win over
    /// the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CARBITRAGE_SYNTHETIC_ONLY") {
            self.sources.synthetic_only = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(path) = std::env::var("CARBITRAGE_STORAGE_PATH") {
            if !path.is_empty() {
                self.storage.path = path;
            }
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ArbError> {
        let s = &self.schedule;
        for (name, job) in [
            ("full_scrape", &s.full_scrape),
            ("refresh", &s.refresh),
            ("exchange_rate", &s.exchange_rate),
            ("cleanup", &s.cleanup),
        ] {
            if let Err(ArbError::InvalidConfig(reason)) = job.cadence() {
                return Err(ArbError::InvalidConfig(format!("schedule.{name}: {reason}")));
            }
        }

        let r = &self.retention;
        if r.stale_days <= 0 {
            return Err(ArbError::InvalidConfig("retention.stale_days must be > 0".into()));
        }
        if r.purge_days <= r.stale_days {
            return Err(ArbError::InvalidConfig(format!(
                "retention.purge_days ({}) must exceed stale_days ({})",
                r.purge_days, r.stale_days
            )));
        }
        if r.refresh_after_hours <= 0 {
            return Err(ArbError::InvalidConfig("retention.refresh_after_hours must be > 0".into()));
        }
        if r.refresh_batch == 0 {
            return Err(ArbError::InvalidConfig("retention.refresh_batch must be > 0".into()));
        }
        if self.valuation.max_concurrency == 0 {
            return Err(ArbError::InvalidConfig("valuation.max_concurrency must be > 0".into()));
        }

        self.pricing.costs.validate()?;
        self.pricing.exchange_rates.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.service.source_currency, "JPY");
        assert_eq!(cfg.schedule.refresh.cron, "0 0 */4 * * *");
        assert_eq!(cfg.schedule.full_scrape.timezone, "Asia/Tokyo");
        assert_eq!(cfg.retention.stale_days, 30);
        assert_eq!(cfg.retention.purge_days, 90);
        assert_eq!(cfg.pricing.costs.shipping, dec!(1500));
        assert_eq!(cfg.storage.backend, StorageBackend::Json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let cfg = AppConfig::parse(
            r#"
            [sources]
            synthetic_only = true

            [schedule.refresh]
            cron = "0 */15 * * * *"

            [storage]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        assert!(cfg.sources.synthetic_only);
        assert_eq!(cfg.sources.synthetic_count, 30);
        assert_eq!(cfg.schedule.refresh.cron, "0 */15 * * * *");
        assert_eq!(cfg.schedule.refresh.timezone, "UTC");
        assert_eq!(cfg.schedule.full_scrape, ScheduleConfig::default().full_scrape);
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_validate_rejects_bad_schedule() {
        let mut cfg = AppConfig::default();
        cfg.schedule.cleanup.cron = "weekly".into();
        match cfg.validate() {
            Err(ArbError::InvalidConfig(reason)) => assert!(reason.starts_with("schedule.cleanup:"), "{reason}"),
            other => panic!("unexpected {other:?}"),
        }

        let mut cfg = AppConfig::default();
        cfg.schedule.full_scrape.timezone = "Asia/Atlantis".into();
        assert!(matches!(cfg.validate(), Err(ArbError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_empty_refresh_window() {
        let mut cfg = AppConfig::default();
        cfg.retention.refresh_after_hours = 0;
        assert!(matches!(cfg.validate(), Err(ArbError::InvalidConfig(_))));

        let mut cfg = AppConfig::default();
        cfg.retention.refresh_batch = 0;
        assert!(matches!(cfg.validate(), Err(ArbError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_purge_before_stale() {
        let mut cfg = AppConfig::default();
        cfg.retention.purge_days = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let mut cfg = AppConfig::default();
        cfg.pricing.exchange_rates.source_to_destination = dec!(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(AppConfig::load("/tmp/carbitrage_no_such_config.toml").is_err());
    }
}
