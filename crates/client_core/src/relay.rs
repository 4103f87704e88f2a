use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Local;
use shared::{
    domain::{ChatMessage, Delivery, MessageId, SessionId},
    protocol::{ClientRequest, MessagePayload, SttChunkPayload},
};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::{
    connection::ConnectionState,
    error::{InputError, RelayError},
    events::ClientEvent,
    lock,
    session::SessionTracker,
    transport::OutboundSlot,
};

pub const DEFAULT_SENDER_LABEL: &str = "User";

/// Raw captured audio to forward for server-side transcription.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
    pub format: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub real_time: bool,
}

/// Outbound chat plus the local message history.
///
/// Sends are optimistic: the message is appended as [`Delivery::Pending`]
/// right away and only flips to acknowledged if the server sends a
/// `message_ack` for its id. Nothing is retried or deduplicated.
pub struct MessageRelay {
    sender_label: String,
    status: watch::Receiver<ConnectionState>,
    outbound: OutboundSlot,
    sessions: SessionTracker,
    history: Mutex<Vec<ChatMessage>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessageRelay {
    pub fn new(
        sender_label: impl Into<String>,
        status: watch::Receiver<ConnectionState>,
        outbound: OutboundSlot,
        sessions: SessionTracker,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            sender_label: sender_label.into(),
            status,
            outbound,
            sessions,
            history: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn send(&self, text: &str) -> Result<ChatMessage, RelayError> {
        if text.trim().is_empty() {
            debug!("ignoring empty chat message");
            return Err(InputError::Empty.into());
        }
        let state = *self.status.borrow();
        if !state.can_send() {
            debug!(?state, "ignoring chat message while not connected");
            return Err(RelayError::NotConnected(state));
        }

        let message = ChatMessage {
            id: MessageId::new(),
            text: text.to_string(),
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            sender: self.sender_label.clone(),
            delivery: Delivery::Pending,
        };
        let session = self.outbound.send(ClientRequest::SendMessage(MessagePayload {
            id: Some(message.id),
            text: message.text.clone(),
            timestamp: message.timestamp.clone(),
            sender: message.sender.clone(),
        }))?;
        debug!(session = session.0, message_id = %message.id, "queued chat message");

        lock(&self.history).push(message.clone());
        let _ = self.events.send(ClientEvent::MessageAppended(message.clone()));
        Ok(message)
    }

    /// Appends a message the server relayed to us.
    pub fn receive(&self, session: SessionId, payload: MessagePayload) -> Option<ChatMessage> {
        if !self.sessions.is_current(session) {
            debug!(session = session.0, "dropping relayed message from stale session");
            return None;
        }
        let message = ChatMessage {
            id: payload.id.unwrap_or_default(),
            text: payload.text,
            timestamp: payload.timestamp,
            sender: payload.sender,
            delivery: Delivery::Received,
        };
        lock(&self.history).push(message.clone());
        let _ = self.events.send(ClientEvent::MessageAppended(message.clone()));
        Some(message)
    }

    pub fn acknowledge(&self, id: MessageId) -> bool {
        let acknowledged = {
            let mut history = lock(&self.history);
            match history
                .iter_mut()
                .find(|message| message.id == id && message.delivery == Delivery::Pending)
            {
                Some(message) => {
                    message.delivery = Delivery::Acknowledged;
                    true
                }
                None => false,
            }
        };
        if acknowledged {
            let _ = self.events.send(ClientEvent::MessageAcknowledged(id));
        } else {
            debug!(message_id = %id, "ack for unknown or already acknowledged message");
        }
        acknowledged
    }

    pub fn send_audio_chunk(&self, sid: &str, chunk: &AudioChunk) -> Result<(), RelayError> {
        let state = *self.status.borrow();
        if !state.can_send() {
            return Err(RelayError::NotConnected(state));
        }
        self.outbound
            .send(ClientRequest::RealTimeSttRequest(SttChunkPayload {
                sid: sid.to_string(),
                real_time: chunk.real_time,
                audio_data: STANDARD.encode(&chunk.pcm),
                audio_format: chunk.format.clone(),
                channels: chunk.channels,
                sample_rate: chunk.sample_rate,
            }))
            .map(|_| ())
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.history).clone()
    }
}
