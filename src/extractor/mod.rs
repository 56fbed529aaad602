pub mod browser;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::error::ExtractionError;
use crate::settings::{Settings, Strategy};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Raw page as received. `status_code` is passed through uninterpreted.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub raw_html: String,
    pub status_code: u16,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// One fetch per call; implementations keep no session between identifiers.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, idno: &str) -> Result<FetchedPage, ExtractionError>;
}

pub fn company_url(base_url: &str, idno: &str) -> String {
    format!("{}/companies/{}", base_url.trim_end_matches('/'), idno)
}

/// Build the configured strategy wrapped in the retry policy.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn Fetcher>> {
    let inner: Arc<dyn Fetcher> = match settings.strategy()? {
        Strategy::Http => Arc::new(http::HttpFetcher::new(
            &settings.base_url,
            settings.request_timeout(),
        )),
        Strategy::Browser => Arc::new(browser::BrowserFetcher::new(
            &settings.base_url,
            settings.request_timeout(),
            settings.render_settle(),
        )),
    };
    Ok(Arc::new(RetryingFetcher::new(
        inner,
        settings.max_retries,
        settings.retry_backoff(),
    )))
}

/// Retries retryable extraction failures with exponential backoff.
pub struct RetryingFetcher {
    inner: Arc<dyn Fetcher>,
    max_retries: u32,
    base_backoff: Duration,
}

impl RetryingFetcher {
    pub fn new(inner: Arc<dyn Fetcher>, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff,
        }
    }
}

#[async_trait]
impl Fetcher for RetryingFetcher {
    async fn fetch(&self, idno: &str) -> Result<FetchedPage, ExtractionError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch(idno).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self
                        .base_backoff
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_BACKOFF);
                    warn!(
                        "Fetch failed for {} (attempt {}/{}): {}, backing off {:.1}s",
                        idno,
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Tests ──
