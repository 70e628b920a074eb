use thiserror::Error;

use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Gateway error: {operation} returned code {code}")]
    Gateway { operation: String, code: i32 },

    #[error("Retries exhausted for {operation} after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("Timed out after {waited_ms}ms waiting for {waiting_for}")]
    Timeout { waiting_for: String, waited_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    pub fn gateway(operation: impl Into<String>, code: i32) -> Self {
        Self::Gateway {
            operation: operation.into(),
            code,
        }
    }

    /// Only configuration and initial-connection failures end the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Connection(_))
    }

    /// Gateway rejections and error completions are worth another attempt.
    /// Timeouts are not: the request already had its full window.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
