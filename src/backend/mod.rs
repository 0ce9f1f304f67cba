//! Client for the external database REST service

mod client;
mod retry;

pub use client::DatabaseClient;
pub use retry::RetryPolicy;

use crate::types::McpError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("database service did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("database service unavailable: {0}")]
    Unavailable(String),

    #[error("database service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("database service rejected the request: {0}")]
    Rejected(String),

    #[error("invalid response from database service: {0}")]
    Decode(String),

    #[error("invalid database service URL: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// Connection failures and server-side errors are worth another try.
    /// Timeouts are not; the caller already waited the full deadline.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(timeout)
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

impl From<BackendError> for McpError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout(_) | BackendError::Unavailable(_) => {
                McpError::ServiceUnavailable(err.to_string())
            }
            _ => McpError::ToolExecutionFailed(err.to_string()),
        }
    }
}
