use thiserror::Error;
use trellis_core::DocumentError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Channel already registered: {0}")]
    DuplicateChannel(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
    #[error("Invalid session config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PresenceError>;
