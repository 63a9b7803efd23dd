//! Error types for the market breadth service.
//!
//! All fallible operations return [`Result`]; variants carry the
//! originating layer so callers can log or map them precisely.

use thiserror::Error;

/// Main error type for the market breadth service.
#[derive(Error, Debug)]
pub enum MarketBreadthError {
    /// Outbound HTTP errors (exchange REST calls)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database connection and query errors
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Database pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected exchange responses (non-success status, malformed payload)
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Client-supplied query parameters that fail validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MarketBreadthError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an exchange error with a message.
    pub fn exchange(msg: impl Into<String>) -> Self {
        Self::Exchange(msg.into())
    }

    /// Create an input-validation error with a message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Result type alias using MarketBreadthError.
pub type Result<T> = std::result::Result<T, MarketBreadthError>;
