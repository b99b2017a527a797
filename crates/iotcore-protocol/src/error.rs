//! Protocol-level error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown api topic '{0}'")]
    UnknownApiTopic(String),

    #[error("reported state must be a JSON object, got {0}")]
    ReportedNotObject(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
