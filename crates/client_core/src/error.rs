use thiserror::Error;

use crate::connection::ConnectionState;

/// Transient channel failures. These drive reconnection and surface as status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid server url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect websocket {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("websocket receive failed: {0}")]
    Receive(String),
    #[error("websocket send failed: {0}")]
    Send(String),
    #[error("server reported a connection error")]
    ServerReported,
    #[error("gave up reconnecting after {attempts} failed attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("a connection task is already running")]
    AlreadyRunning,
    #[error("connection task failed: {0}")]
    TaskFailed(String),
}

/// Audio fetch or playback failure. Contained by the cue handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("audio fetch failed: {0}")]
    Fetch(String),
    #[error("audio endpoint returned status {0}")]
    Status(u16),
    #[error("audio playback failed: {0}")]
    Playback(String),
}

impl From<reqwest::Error> for ResourceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Fetch(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("message is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("channel is {0:?}; messages can only be sent while connected")]
    NotConnected(ConnectionState),
    #[error("outbound channel for the current session is closed")]
    ChannelClosed,
    #[error(transparent)]
    Protocol(#[from] shared::error::ProtocolError),
}
