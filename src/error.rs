//! Error taxonomy for the ingestion subsystem
//!
//! None of these are fatal. Transport errors drive reconnects, protocol and
//! data errors are dropped frames, request errors become empty history and
//! callback errors are isolated where the callback is invoked.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Socket open/close/error
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unparseable frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame missing required fields
    #[error("data error: {0}")]
    Data(String),

    /// History fetch failure or non-success response
    #[error("request error: {0}")]
    Request(String),

    /// Consumer-supplied handler failed or panicked
    #[error("callback error in {callback}: {message}")]
    Callback {
        callback: &'static str,
        message: String,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        FeedError::Request(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Protocol(e.to_string())
    }
}
