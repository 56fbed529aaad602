use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::redirect::Policy;
use tracing::{debug, info};

use super::{company_url, FetchedPage, Fetcher};
use crate::error::ExtractionError;

const MAX_REDIRECTS: usize = 10;

// Recent desktop Chrome builds.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Plain GET with redirects, a randomized browser user agent and a fixed timeout.
pub struct HttpFetcher {
    base_url: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout,
        }
    }

    fn map_error(&self, e: reqwest::Error) -> ExtractionError {
        if e.is_timeout() {
            ExtractionError::Timeout(self.timeout.as_secs())
        } else {
            ExtractionError::from(e)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, idno: &str) -> Result<FetchedPage, ExtractionError> {
        let url = company_url(&self.base_url, idno);

        // Fresh client per call: nothing is shared between identifiers.
        let client = reqwest::Client::builder()
            .user_agent(random_user_agent())
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true)
            .build()?;

        debug!("GET {}", url);
        let response = client.get(&url).send().await.map_err(|e| self.map_error(e))?;
        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let raw_html = response.text().await.map_err(|e| self.map_error(e))?;

        info!(
            idno = %idno,
            status = status_code,
            bytes = raw_html.len(),
            "fetched {}",
            final_url
        );
        Ok(FetchedPage {
            url: final_url,
            raw_html,
            status_code,
        })
    }
}
