use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

/// Which extractor strategy the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Http,
    Browser,
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Strategy::Http),
            "browser" | "rendered" => Ok(Strategy::Browser),
            other => bail!("unknown extractor strategy '{}' (expected 'http' or 'browser')", other),
        }
    }
}

const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;
const MAX_TIMEOUT_SECS: u64 = 10 * 60;
const MAX_DELAY_MS: u64 = 60_000;
const MAX_RETRIES: u64 = 10;
const MAX_CONCURRENT_RUNS: u64 = 1024;

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        bail!("{} = {} is out of range ({}..={})", name, value, min, max);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: String,
    pub bind: String,
    pub base_url: String,
    pub strategy: String,
    pub request_timeout_secs: u64,
    pub render_settle_ms: u64,
    pub cache_ttl_secs: u64,
    pub status_ttl_secs: u64,
    pub max_concurrent_runs: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Settings {
    /// Defaults overridden by `SCRAPER_*` environment variables.
    pub fn load() -> Result<Self> {
        let cfg = Config::builder()
            .set_default("db_path", "data/companies.sqlite")?
            .set_default("bind", "127.0.0.1:8003")?
            .set_default("base_url", "https://openmoney.md")?
            .set_default("strategy", "http")?
            .set_default("request_timeout_secs", 30)?
            .set_default("render_settle_ms", 3000)?
            .set_default("cache_ttl_secs", 24 * 60 * 60)?
            .set_default("status_ttl_secs", 30 * 60)?
            .set_default("max_concurrent_runs", 8)?
            .set_default("max_retries", 2)?
            .set_default("retry_backoff_ms", 1000)?
            .add_source(Environment::with_prefix("SCRAPER").try_parsing(true))
            .build()
            .context("Failed to build settings")?;

        let settings: Settings = cfg.try_deserialize().context("Invalid settings")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would overflow deadline or backoff arithmetic.
    pub fn validate(&self) -> Result<()> {
        self.strategy()?;
        check_range("cache_ttl_secs", self.cache_ttl_secs, 1, MAX_TTL_SECS)?;
        check_range("status_ttl_secs", self.status_ttl_secs, 1, MAX_TTL_SECS)?;
        check_range("request_timeout_secs", self.request_timeout_secs, 1, MAX_TIMEOUT_SECS)?;
        check_range("render_settle_ms", self.render_settle_ms, 0, MAX_DELAY_MS)?;
        check_range("retry_backoff_ms", self.retry_backoff_ms, 0, MAX_DELAY_MS)?;
        check_range("max_retries", u64::from(self.max_retries), 0, MAX_RETRIES)?;
        check_range("max_concurrent_runs", self.max_concurrent_runs as u64, 1, MAX_CONCURRENT_RUNS)?;
        Ok(())
    }

    pub fn strategy(&self) -> Result<Strategy> {
        self.strategy.parse()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn render_settle(&self) -> Duration {
        Duration::from_millis(self.render_settle_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
