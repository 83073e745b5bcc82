use crate::config::ValidationError;
use thiserror::Error;

/// Why a routing config fetch produced no response.
///
/// Cloneable so a single outcome can be logged, counted and handed to the
/// controller without re-fetching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("config endpoint is not configured")]
    NotConfigured,

    #[error("invalid config endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to encode request body: {0}")]
    Encoding(String),

    #[error("failed to decode response body: {0}")]
    Decode(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// Connectivity errors keep the gate in loading until a retry trigger
    /// arrives. Everything else is terminal for the cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Connectivity(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Connectivity(_) => "connectivity",
            FetchError::NotConfigured => "not_configured",
            FetchError::InvalidEndpoint(_) => "invalid_endpoint",
            FetchError::Encoding(_) => "encoding",
            FetchError::Decode(_) => "decode",
            FetchError::Request(_) => "request",
        }
    }
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(FetchError::Connectivity("reset".into()).is_retryable());

        for error in [
            FetchError::NotConfigured,
            FetchError::InvalidEndpoint("ftp://x".into()),
            FetchError::Encoding("bad".into()),
            FetchError::Decode("eof".into()),
            FetchError::Request("builder".into()),
        ] {
            assert!(!error.is_retryable(), "{} should not be retryable", error.kind());
        }
    }
}
