//! Error types for Jenkins calls.

use thiserror::Error;

/// Errors returned by [`crate::JenkinsApi`] implementations.
#[derive(Debug, Error)]
pub enum JenkinsError {
    /// HTTP transport failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Jenkins answered with a non-success status code
    #[error("Jenkins returned {status} for {path}: {message}")]
    Api {
        path: String,
        status: u16,
        message: String,
    },

    /// Job does not exist on the server
    #[error("Jenkins job not found: {0}")]
    JobNotFound(String),

    /// Parameter definitions never appeared after the priming build
    #[error("Timed out waiting for parameters of Jenkins job {0}")]
    ParametersTimeout(String),

    /// Response body did not match the expected shape
    #[error("Invalid Jenkins response: {0}")]
    InvalidResponse(String),
}

impl JenkinsError {
    /// True for failures worth retrying on the next sync.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            JenkinsError::Http(_) | JenkinsError::ParametersTimeout(_) => true,
            JenkinsError::Api { status, .. } => *status == 429 || *status >= 500,
            JenkinsError::JobNotFound(_) | JenkinsError::InvalidResponse(_) => false,
        }
    }
}

/// Result alias for Jenkins calls.
pub type Result<T> = std::result::Result<T, JenkinsError>;
