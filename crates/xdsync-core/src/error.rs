//! Error types for xdsync

use thiserror::Error;

/// Main error type for xdsync
#[derive(Error, Debug)]
pub enum XdsError {
    // Stream errors
    #[error("discovery request timed out")]
    Timeout,

    #[error("discovery stream closed: {0}")]
    StreamClosed(String),

    #[error("transport error: {0}")]
    Transport(String),

    // Decode errors
    #[error("failed to decode {type_url}: {reason}")]
    Decode { type_url: String, reason: String },

    #[error("type url mismatch, expected {expected}, got {actual}")]
    TypeUrlMismatch { expected: String, actual: String },

    // Configuration errors
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl XdsError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::StreamClosed(_) | Self::Transport(_)
        )
    }
}

impl From<serde_json::Error> for XdsError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for xdsync
pub type Result<T> = std::result::Result<T, XdsError>;
