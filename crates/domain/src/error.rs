/// Shared error type used across all VaultPilot crates.
///
/// Variants are error *kinds*, not sources: the gateway maps them onto HTTP
/// statuses, the pipeline maps them onto retry decisions.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Transient upstream failure — network error, 5xx, timeout. Retryable
    /// in pipeline and scheduler context.
    #[error("upstream: {0}")]
    UpstreamTransient(String),

    /// Malformed upstream response or logical impossibility. Never retried.
    #[error("upstream: {0}")]
    UpstreamFatal(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the pipeline/scheduler may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UpstreamTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
