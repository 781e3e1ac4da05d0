//! Multi-device socket engine.

use std::path::Path;

use chatplex_common::ProxyConfig;
use serde_json::{json, Value};

use crate::error::SessionResult;
use crate::message::{AttachmentFile, MediaKind, MediaSource, OutboundMedia};

/// Message kinds whose content can be downloaded.
const MEDIA_MESSAGE_TYPES: &[&str] = &["imageMessage", "audioMessage", "videoMessage"];

pub(super) fn settings(auth_dir: &Path, proxy: Option<&ProxyConfig>) -> Value {
    json!({
        "auth": { "folder": auth_dir },
        "printQRInTerminal": false,
        "agent": proxy.and_then(ProxyConfig::url),
    })
}

pub(super) fn prepare_attachment(
    kind: MediaKind,
    file: &AttachmentFile,
    caption: Option<String>,
) -> SessionResult<OutboundMedia> {
    let source = match file.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => MediaSource::Url(url.to_string()),
        None => MediaSource::Bytes(file.decode_data()?),
    };

    Ok(OutboundMedia {
        kind,
        source,
        mimetype: file.mimetype.clone(),
        filename: file.filename.clone(),
        // Voice notes carry no caption
        caption: if kind == MediaKind::Audio { None } else { caption },
        ptt: kind == MediaKind::Audio,
        as_document: false,
    })
}

/// Media kind key inside `message`; context keys may sit next to it.
fn media_type(raw: &Value) -> Option<&str> {
    raw.get("message")?
        .as_object()?
        .keys()
        .map(String::as_str)
        .find(|key| MEDIA_MESSAGE_TYPES.contains(key))
}

pub(super) fn has_media(raw: &Value) -> bool {
    media_type(raw).is_some()
}

pub(super) fn mimetype(raw: &Value) -> Option<String> {
    let kind = media_type(raw)?;
    raw["message"][kind]
        .get("mimetype")
        .and_then(Value::as_str)
        .map(str::to_string)
}
