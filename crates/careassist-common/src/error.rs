use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("token budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single call to a remote language-model backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned status={status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("provider returned an empty response")]
    EmptyResponse,
}

impl ProviderError {
    /// Timeouts, connection failures, 5xx and 429 are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Decode(_) | Self::EmptyResponse => false,
        }
    }

    /// Stable machine-readable code stored on failed assistant messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network(_) => "network_error",
            Self::Status { status: 429, .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "upstream_unavailable",
            Self::Status { status: 401 | 403, .. } => "auth_failed",
            Self::Status { status: 400 | 422, body } if mentions_policy(body) => {
                "content_rejected"
            }
            Self::Status { status: 400, .. } => "bad_request",
            Self::Status { .. } => "upstream_error",
            Self::Decode(_) | Self::EmptyResponse => "invalid_response",
        }
    }
}

fn mentions_policy(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["content_policy", "content policy", "safety", "content_filter"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ProviderError {
        ProviderError::Status {
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("connection reset".into()).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!ProviderError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn error_codes() {
        assert_eq!(ProviderError::Timeout.code(), "timeout");
        assert_eq!(status(429).code(), "rate_limited");
        assert_eq!(status(502).code(), "upstream_unavailable");
        assert_eq!(status(401).code(), "auth_failed");
        assert_eq!(status(400).code(), "bad_request");
        assert_eq!(
            ProviderError::Status {
                status: 400,
                body: r#"{"error":{"code":"content_policy_violation"}}"#.into()
            }
            .code(),
            "content_rejected"
        );
        assert_eq!(status(404).code(), "upstream_error");
        assert_eq!(ProviderError::EmptyResponse.code(), "invalid_response");
    }

    #[test]
    fn provider_error_converts_into_error() {
        let err: Error = ProviderError::Timeout.into();
        assert!(matches!(err, Error::Provider(ProviderError::Timeout)));
        assert_eq!(err.to_string(), "provider request timed out");
    }
}
