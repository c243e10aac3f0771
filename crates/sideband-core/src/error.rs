use thiserror::Error;

/// Errors produced by the sideband protocol layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("secure RNG unavailable")]
    Rng,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        SignalError::Codec(e.to_string())
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
