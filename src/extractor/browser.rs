use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventResponseReceived};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::http::random_user_agent;
use super::{company_url, FetchedPage, Fetcher};
use crate::error::ExtractionError;

/// How long to wait for the navigation response event once the page has rendered.
const STATUS_EVENT_WAIT: Duration = Duration::from_millis(250);

/// Headless Chrome render: DOM ready, fixed settle delay, then capture.
///
/// There is no check that client-side rendering actually finished; the settle
/// delay is the only wait after the load event.
pub struct BrowserFetcher {
    base_url: String,
    timeout: Duration,
    settle: Duration,
}

impl BrowserFetcher {
    pub fn new(base_url: &str, timeout: Duration, settle: Duration) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout,
            settle,
        }
    }
}

/// A launched browser process and the task driving its CDP connection.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(timeout: Duration) -> Result<Self, ExtractionError> {
        let config = BrowserConfig::builder()
            .request_timeout(timeout)
            .arg(format!("--user-agent={}", random_user_agent()))
            .arg("--disable-gpu")
            .build()
            .map_err(ExtractionError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ExtractionError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self { browser, handler })
    }

    /// Shut the process down. Runs on every exit path of `fetch`; if this is
    /// skipped by a panic, dropping `Browser` still kills the child process.
    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Failed to reap browser process: {}", e);
        }
        self.handler.abort();
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    async fn fetch(&self, idno: &str) -> Result<FetchedPage, ExtractionError> {
        let url = company_url(&self.base_url, idno);
        let session = BrowserSession::launch(self.timeout).await?;

        let budget = self.timeout.saturating_add(self.settle);
        let result = match tokio::time::timeout(budget, render(&session.browser, &url, self.settle))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(ExtractionError::Timeout(budget.as_secs())),
        };

        session.close().await;

        let page = result?;
        info!(
            idno = %idno,
            status = page.status_code,
            bytes = page.raw_html.len(),
            "rendered {}",
            page.url
        );
        Ok(page)
    }
}

async fn render(browser: &Browser, url: &str, settle: Duration) -> Result<FetchedPage, ExtractionError> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| ExtractionError::Render(e.to_string()))?;

    let captured = capture(&page, url, settle).await;

    if let Err(e) = page.close().await {
        warn!("Failed to close page for {}: {}", url, e);
    }
    captured
}

async fn capture(page: &Page, url: &str, settle: Duration) -> Result<FetchedPage, ExtractionError> {
    let render_err = |e: chromiumoxide::error::CdpError| ExtractionError::Render(e.to_string());

    page.execute(EnableParams::default()).await.map_err(render_err)?;
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(render_err)?;

    debug!("navigating to {}", url);
    page.goto(url).await.map_err(render_err)?;
    page.wait_for_navigation().await.map_err(render_err)?;
    tokio::time::sleep(settle).await;

    let raw_html = page.content().await.map_err(render_err)?;
    let final_url = page
        .url()
        .await
        .map_err(render_err)?
        .unwrap_or_else(|| url.to_string());

    // First HTML document response is the navigation (after redirects).
    let mut status_code = None;
    while let Ok(Some(event)) = tokio::time::timeout(STATUS_EVENT_WAIT, responses.next()).await {
        let mime = event.response.mime_type.to_ascii_lowercase();
        if mime.starts_with("text/html") || mime.starts_with("application/xhtml+xml") {
            status_code = u16::try_from(event.response.status).ok();
            break;
        }
    }
    let status_code = status_code.unwrap_or_else(|| {
        debug!("no document response observed for {}, assuming 200", url);
        200
    });

    Ok(FetchedPage {
        url: final_url,
        raw_html,
        status_code,
    })
}
