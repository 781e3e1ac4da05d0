//! Browser automation engine with folder-token credential layout.

use std::path::Path;

use chatplex_common::ProxyConfig;
use serde_json::{json, Value};

use crate::error::SessionResult;
use crate::message::{AttachmentFile, MediaKind, MediaSource, OutboundMedia};

/// Close the browser when pairing does not finish in time (ms).
const AUTO_CLOSE_MS: u64 = 60_000;

pub(super) fn settings(session: &str, auth_dir: &Path, proxy: Option<&ProxyConfig>) -> Value {
    // <root>/<engine>/<session>: the client rebuilds this path from the tokens
    let engine_dir = auth_dir.parent().unwrap_or(auth_dir);
    let folder_name_token = engine_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mkdir_folder_token = engine_dir.parent().unwrap_or(engine_dir);

    let mut browser_args = vec!["--no-sandbox".to_string()];
    if let Some(proxy) = proxy {
        browser_args.push(format!("--proxy-server={}", proxy.server));
    }

    json!({
        "session": session,
        "headless": true,
        "devtools": false,
        "debug": false,
        "logQR": false,
        "browserArgs": browser_args,
        "autoClose": AUTO_CLOSE_MS,
        "folderNameToken": folder_name_token,
        "mkdirFolderToken": mkdir_folder_token,
        "proxy": proxy.map(|p| json!({
            "url": p.server,
            "username": p.username,
            "password": p.password,
        })),
    })
}

pub(super) fn prepare_attachment(
    kind: MediaKind,
    file: &AttachmentFile,
    caption: Option<String>,
) -> SessionResult<OutboundMedia> {
    let source = match file.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => MediaSource::Url(url.to_string()),
        None => {
            // Validate the payload before wrapping it
            file.decode_data()?;
            let mimetype = file
                .mimetype
                .as_deref()
                .unwrap_or("application/octet-stream");
            MediaSource::DataUri(format!(
                "data:{mimetype};base64,{}",
                file.data.as_deref().unwrap_or_default()
            ))
        }
    };

    Ok(OutboundMedia {
        kind,
        source,
        mimetype: file.mimetype.clone(),
        filename: file.filename.clone(),
        caption,
        ptt: false,
        as_document: false,
    })
}

pub(super) fn has_media(raw: &Value) -> bool {
    let flag = |key: &str| raw.get(key).and_then(Value::as_bool).unwrap_or(false);
    flag("isMMS") && flag("isMedia")
}

pub(super) fn mimetype(raw: &Value) -> Option<String> {
    raw.get("mimetype").and_then(Value::as_str).map(str::to_string)
}
