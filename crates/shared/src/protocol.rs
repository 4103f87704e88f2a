use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{MessageId, Segment},
    error::ProtocolError,
};

/// Event names the server uses for the out-of-band audio cue.
pub const AUDIO_CUE_EVENTS: &[&str] = &["audio_cue", "gemini_response"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Connecting,
    Connected,
    Active,
    Disconnected,
    ConnectionError,
}

impl ServerStatus {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "active" => Ok(Self::Active),
            "disconnected" => Ok(Self::Disconnected),
            "connection_error" => Ok(Self::ConnectionError),
            _ => Err(ProtocolError::UnknownStatus(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPayload {
    #[serde(alias = "transcription")]
    pub text: String,
    #[serde(alias = "start_time")]
    pub start: f64,
    #[serde(alias = "end_time")]
    pub end: f64,
}

impl From<SegmentPayload> for Segment {
    fn from(value: SegmentPayload) -> Self {
        Segment::new(value.text, value.start, value.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub text: String,
    pub timestamp: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SttChunkPayload {
    pub sid: String,
    pub real_time: bool,
    pub audio_data: String,
    pub audio_format: String,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Closed set of inbound events. Anything else is a [`ProtocolError`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ConfirmConnect { sid: String },
    StatusUpdate { status: ServerStatus },
    SegmentUpdate(Segment),
    SegmentCreation(Segment),
    AudioCue,
    MessageReceived(MessagePayload),
    MessageAck { id: MessageId },
    Error { message: String },
    Disconnect { reason: Option<String> },
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ConfirmConnectPayload {
    sid: String,
}

#[derive(Deserialize)]
struct StatusPayload {
    status: String,
}

#[derive(Deserialize)]
struct AckPayload {
    id: MessageId,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::invalid_payload(event, err))
}

fn disconnect_reason(data: Value) -> Option<String> {
    match data {
        Value::String(reason) => Some(reason),
        Value::Object(map) => ["reason", "message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str).map(str::to_string)),
        _ => None,
    }
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)
            .map_err(|err| ProtocolError::MalformedFrame(err.to_string()))?;
        Self::from_parts(&frame.event, frame.data)
    }

    pub fn from_parts(event: &str, data: Value) -> Result<Self, ProtocolError> {
        match event {
            "confirm_connect" => {
                let body: ConfirmConnectPayload = payload(event, data)?;
                Ok(Self::ConfirmConnect { sid: body.sid })
            }
            "status_update" => {
                let body: StatusPayload = payload(event, data)?;
                Ok(Self::StatusUpdate {
                    status: ServerStatus::parse(&body.status)?,
                })
            }
            "segment_update" => {
                let body: SegmentPayload = payload(event, data)?;
                Ok(Self::SegmentUpdate(body.into()))
            }
            "segment_creation" => {
                let body: SegmentPayload = payload(event, data)?;
                Ok(Self::SegmentCreation(body.into()))
            }
            "receive_message" => Ok(Self::MessageReceived(payload(event, data)?)),
            "message_ack" => {
                let body: AckPayload = payload(event, data)?;
                Ok(Self::MessageAck { id: body.id })
            }
            "error" => {
                if let Value::String(message) = data {
                    return Ok(Self::Error { message });
                }
                let body: ErrorPayload = payload(event, data)?;
                Ok(Self::Error {
                    message: body
                        .message
                        .unwrap_or_else(|| "An error occurred".to_string()),
                })
            }
            "disconnect" => Ok(Self::Disconnect {
                reason: disconnect_reason(data),
            }),
            name if AUDIO_CUE_EVENTS.contains(&name) => Ok(Self::AudioCue),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfirmConnect { .. } => "confirm_connect",
            Self::StatusUpdate { .. } => "status_update",
            Self::SegmentUpdate(_) => "segment_update",
            Self::SegmentCreation(_) => "segment_creation",
            Self::AudioCue => "audio_cue",
            Self::MessageReceived(_) => "receive_message",
            Self::MessageAck { .. } => "message_ack",
            Self::Error { .. } => "error",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage(MessagePayload),
    Configuration {
        sid: String,
        target_model_path: String,
    },
    RealTimeSttRequest(SttChunkPayload),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::Configuration { .. } => "configuration",
            Self::RealTimeSttRequest(_) => "real_time_stt_request",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Encode {
            event: self.name(),
            reason: err.to_string(),
        })
    }
}
