use shared::domain::{ChatMessage, MessageId};

use crate::{connection::StatusChange, reconciler::TranscriptSegment};

/// Push notifications for a rendering layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChanged(StatusChange),
    SegmentAppended {
        index: usize,
        segment: TranscriptSegment,
    },
    SegmentRewritten {
        index: usize,
        segment: TranscriptSegment,
    },
    TranscriptReset,
    MessageAppended(ChatMessage),
    MessageAcknowledged(MessageId),
    /// `error` event from the server. Non-fatal.
    ServerError(String),
    /// Frame dropped at the channel boundary.
    ProtocolError(String),
    ReconnectExhausted {
        attempts: u32,
    },
}
