//! Error types for provider calls.

use thiserror::Error;

/// Errors returned by [`crate::ScmClient`] implementations.
#[derive(Debug, Error)]
pub enum ScmError {
    /// HTTP transport failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status code
    #[error("{provider} API returned {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    /// Repository name is not of the form `owner/name`
    #[error("Invalid repository name: {0}")]
    InvalidRepo(String),

    /// Provider kind is not supported
    #[error("Unsupported SCM driver: {0}")]
    UnsupportedDriver(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScmError {
    /// HTTP status code returned by the provider, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ScmError::Api { status, .. } => Some(*status),
            ScmError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True for failures worth retrying later (rate limits, 5xx, transport).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ScmError::Http(_) => true,
            ScmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result alias for provider calls.
pub type Result<T> = std::result::Result<T, ScmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = ScmError::Api {
            provider: "GitHub",
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(err.is_transient());
        assert_eq!(err.status_code(), Some(502));

        let err = ScmError::Api {
            provider: "GitHub",
            status: 422,
            message: "validation failed".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!ScmError::InvalidRepo("x".to_string()).is_transient());
    }
}
