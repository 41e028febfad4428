use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExposureError {
    /// Network failure or a non-429 error status from an upstream service.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream or local throttling. Retry the same request after the delay.
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Upstream output that no parse strategy could interpret.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Scan aborted")]
    Aborted,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
