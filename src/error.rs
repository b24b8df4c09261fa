use crate::types::EventKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Frame parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Handler for {kind} failed: {reason}")]
    Dispatch { kind: EventKind, reason: String },

    #[error("Maximum reconnection attempts exceeded ({attempts})")]
    ReconnectAttemptsExhausted { attempts: u32 },

    #[error("Channel already started")]
    AlreadyStarted,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Token refresh failed: {0}")]
    Token(String),

    #[error("Metrics server error: {0}")]
    Metrics(String),
}

/// Why a single inbound frame could not be turned into an event.
///
/// A parse error never affects other frames on the same stream.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{tag} frame is missing field `{field}`")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },

    #[error("field `{field}` is not a finite number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("nested payload is not a valid status record: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("frame exceeds {max} bytes without a line terminator")]
    FrameTooLong { max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}
