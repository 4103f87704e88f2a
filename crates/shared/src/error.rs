use thiserror::Error;

/// A frame the channel delivered that cannot be applied as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid `{event}` payload: {reason}")]
    InvalidPayload { event: String, reason: String },
    #[error("unknown connection status `{0}`")]
    UnknownStatus(String),
    #[error("failed to encode `{event}` frame: {reason}")]
    Encode { event: &'static str, reason: String },
}

impl ProtocolError {
    pub fn invalid_payload(event: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            event: event.into(),
            reason: reason.to_string(),
        }
    }
}
