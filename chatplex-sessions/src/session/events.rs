//! Internal per-session event stream.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::status::SessionStatus;
use crate::message::InboundMessage;

/// Kind of session event, as named in webhook filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "engine.start")]
    EngineStart,
    #[serde(rename = "session.qr")]
    Qr,
    #[serde(rename = "session.status")]
    StatusChange,
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "message.media_downloaded")]
    MediaDownloaded,
}

impl EventKind {
    pub const ALL: [Self; 5] = [
        Self::EngineStart,
        Self::Qr,
        Self::StatusChange,
        Self::Message,
        Self::MediaDownloaded,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EngineStart => "engine.start",
            Self::Qr => "session.qr",
            Self::StatusChange => "session.status",
            Self::Message => "message",
            Self::MediaDownloaded => "message.media_downloaded",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by a session, in emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The engine transport was built and is connecting
    EngineStart,
    /// A pairing QR code is waiting to be scanned
    Qr { value: String },
    /// Status moved from one state to another
    StatusChange {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Inbound message, with `media_url` filled when media was stored
    Message(InboundMessage),
    /// An attachment was stored for a message
    MediaDownloaded {
        message_id: String,
        url: String,
        mimetype: Option<String>,
    },
}

impl SessionEvent {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::EngineStart => EventKind::EngineStart,
            Self::Qr { .. } => EventKind::Qr,
            Self::StatusChange { .. } => EventKind::StatusChange,
            Self::Message(_) => EventKind::Message,
            Self::MediaDownloaded { .. } => EventKind::MediaDownloaded,
        }
    }

    /// Event-specific webhook payload.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::EngineStart => json!({}),
            Self::Qr { value } => json!({ "qr": value }),
            Self::StatusChange { from, to } => json!({ "from": from, "status": to }),
            Self::Message(message) => serde_json::to_value(message).unwrap_or_default(),
            Self::MediaDownloaded {
                message_id,
                url,
                mimetype,
            } => json!({ "messageId": message_id, "url": url, "mimetype": mimetype }),
        }
    }
}
