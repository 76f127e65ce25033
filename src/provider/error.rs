use std::time::Duration;

/// Error taxonomy for provider VM API operations.
///
/// Every provider call is funnelled through [`classify`] at the HTTP
/// boundary so callers never match on status codes directly.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::RateLimited { .. })
    }
}

/// Maps a transport outcome onto the taxonomy. Centralised here so every
/// call site (ListVMs, CreateVM, ...) classifies identically.
pub fn classify(status: reqwest::StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(body.to_string()),
        404 => ProviderError::NotFound(body.to_string()),
        409 => ProviderError::Conflict(body.to_string()),
        422 | 400 => ProviderError::Invalid(body.to_string()),
        429 => ProviderError::RateLimited { retry_after },
        402 => ProviderError::QuotaExceeded(body.to_string()),
        500..=599 => ProviderError::Transient(body.to_string()),
        _ => ProviderError::Invalid(format!("unexpected status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_5xx_as_transient() {
        let err = classify(reqwest::StatusCode::BAD_GATEWAY, None, "boom");
        assert!(matches!(err, ProviderError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_429_as_rate_limited() {
        let err = classify(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(5)), "");
        assert!(matches!(err, ProviderError::RateLimited { retry_after: Some(_) }));
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_401_as_auth_and_not_retryable() {
        let err = classify(reqwest::StatusCode::UNAUTHORIZED, None, "bad token");
        assert!(matches!(err, ProviderError::Auth(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn classifies_404_as_not_found() {
        let err = classify(reqwest::StatusCode::NOT_FOUND, None, "");
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn classifies_409_as_conflict() {
        let err = classify(reqwest::StatusCode::CONFLICT, None, "");
        assert!(matches!(err, ProviderError::Conflict(_)));
    }

    #[test]
    fn classifies_402_as_quota_exceeded() {
        let err = classify(reqwest::StatusCode::PAYMENT_REQUIRED, None, "");
        assert!(matches!(err, ProviderError::QuotaExceeded(_)));
    }

    #[test]
    fn classifies_422_as_invalid() {
        let err = classify(reqwest::StatusCode::UNPROCESSABLE_ENTITY, None, "bad field");
        assert!(matches!(err, ProviderError::Invalid(_)));
    }
}
