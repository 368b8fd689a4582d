//! Upstream failure classification.

use vp_domain::Error as DomainError;

/// Classified upstream failure. The pipeline retries transport errors and
/// 5xx responses; everything else surfaces as-is.
#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("upstream unauthorized")]
    Unauthorized,

    #[error("upstream forbidden")]
    Forbidden,

    #[error("upstream not found: {0}")]
    NotFound(String),

    /// Network-level failure: connect, DNS, TLS, timeout.
    #[error("upstream transport: {0}")]
    Transport(String),

    /// Any other non-success response, with status and body excerpt.
    #[error("upstream returned {status}: {message}")]
    Other { status: u16, message: String },
}

impl UpstreamError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound(message),
            _ => Self::Other { status, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Other { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), e.to_string());
        }
        Self::Transport(e.to_string())
    }
}

impl From<UpstreamError> for DomainError {
    fn from(e: UpstreamError) -> Self {
        match &e {
            UpstreamError::Unauthorized => DomainError::Unauthorized(e.to_string()),
            UpstreamError::Forbidden => DomainError::Forbidden(e.to_string()),
            UpstreamError::NotFound(_) => DomainError::NotFound(e.to_string()),
            UpstreamError::Transport(_) => DomainError::UpstreamTransient(e.to_string()),
            UpstreamError::Other { status, .. } => {
                if *status >= 500 {
                    DomainError::UpstreamTransient(e.to_string())
                } else {
                    DomainError::UpstreamFatal(e.to_string())
                }
            }
        }
    }
}

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;
