//! Message types shared by sessions, engines and the HTTP API.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Inbound message as reported by an engine.
///
/// `raw` keeps the engine-native payload; engines inspect it to decide whether the
/// message carries media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Message ID (engine-specific)
    pub id: String,
    /// Sender chat ID
    pub from: String,
    /// Recipient chat ID
    #[serde(default)]
    pub to: Option<String>,
    /// Text body or caption
    #[serde(default)]
    pub body: Option<String>,
    /// Timestamp (Unix seconds)
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
    /// Public URL of the stored attachment, once downloaded
    #[serde(default)]
    pub media_url: Option<String>,
    /// Engine-native payload
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Attachment supplied by an API caller: either a remote URL or inline base64 data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachmentFile {
    #[serde(default)]
    pub url: Option<String>,
    /// Base64-encoded content
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl AttachmentFile {
    /// Check that the attachment names a source.
    pub fn validate(&self) -> SessionResult<()> {
        let has_url = self.url.as_deref().is_some_and(|u| !u.is_empty());
        let has_data = self.data.as_deref().is_some_and(|d| !d.is_empty());
        if has_url || has_data {
            Ok(())
        } else {
            Err(SessionError::InvalidAttachment(
                "Either file.url or file.data must be specified.".into(),
            ))
        }
    }

    /// Decode the inline base64 data.
    pub fn decode_data(&self) -> SessionResult<Vec<u8>> {
        let data = self.data.as_deref().unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| SessionError::InvalidAttachment(format!("file.data is not base64: {e}")))
    }
}

/// Send a text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTextRequest {
    pub session: String,
    pub chat_id: String,
    pub text: String,
}

/// Send an image, file or voice message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFileRequest {
    pub session: String,
    pub chat_id: String,
    pub file: AttachmentFile,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Kind of media being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Document,
    Audio,
}

/// Where outbound media bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MediaSource {
    /// Engine fetches the URL itself
    Url(String),
    /// Raw bytes, base64 on the wire
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Base64 string without a prefix
    Base64(String),
    /// `data:<mime>;base64,<data>` URI
    DataUri(String),
}

/// Engine-ready outbound media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub source: MediaSource,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Send audio as a voice note
    #[serde(default)]
    pub ptt: bool,
    /// Send as a document instead of inline media
    #[serde(default)]
    pub as_document: bool,
}

/// Content handed to an engine transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundContent {
    Text { text: String },
    Media(OutboundMedia),
}

/// Media bytes downloaded by an engine.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub mimetype: Option<String>,
    pub data: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
