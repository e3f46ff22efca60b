//! Error types for peerdrop

use crate::types::PeerId;

/// Main error type for relay, negotiation and transfer operations
#[derive(Debug, thiserror::Error)]
pub enum PeerdropError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session with {0} already active")]
    SessionExists(PeerId),

    #[error("No session with {0}")]
    NoSession(PeerId),

    #[error("Session with {0} is not connected")]
    NotConnected(PeerId),

    #[error("{0} description already set")]
    DescriptionAlreadySet(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PeerdropError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for PeerdropError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PeerdropError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<base64::DecodeError> for PeerdropError {
    fn from(err: base64::DecodeError) -> Self {
        Self::Protocol(format!("chunk decode error: {}", err))
    }
}

impl From<hyper::Error> for PeerdropError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

/// Result type alias for peerdrop operations
pub type Result<T> = std::result::Result<T, PeerdropError>;
