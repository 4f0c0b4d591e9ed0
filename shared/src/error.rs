//! Error types for RevTun.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Reasons an inbound message could not be turned into an envelope
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message has no type discriminant")]
    MissingType,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Invalid {kind} envelope: {source}")]
    InvalidEnvelope {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// True when the message parsed but is simply not an envelope we know.
    /// These are ignored quietly rather than reported as malformed.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, DecodeError::MissingType | DecodeError::UnknownType(_))
    }
}
