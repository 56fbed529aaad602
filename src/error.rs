use thiserror::Error;

/// Transport-level fetch failure. A non-2xx response is not an extraction error.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("render failed: {0}")]
    Render(String),
}

impl ExtractionError {
    /// Launch failures are configuration problems; retrying them only burns time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExtractionError::Launch(_))
    }
}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        ExtractionError::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {}", e))
    }
}

/// Errors surfaced synchronously to the caller of `Orchestrator::request`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}
