//! Browser-backed web client engine.

use std::path::Path;

use base64::Engine as _;
use chatplex_common::ProxyConfig;
use serde_json::{json, Value};

use crate::error::{SessionError, SessionResult};
use crate::media::sniff_mimetype;
use crate::message::{AttachmentFile, MediaKind, MediaSource, OutboundMedia};

const BROWSER_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
];

pub(super) fn settings(auth_dir: &Path, proxy: Option<&ProxyConfig>) -> Value {
    let mut args: Vec<String> = BROWSER_ARGS.iter().map(|a| (*a).to_string()).collect();
    let mut proxy_auth = Value::Null;
    if let Some(proxy) = proxy {
        args.push(format!("--proxy-server={}", proxy.server));
        if let Some(username) = &proxy.username {
            proxy_auth = json!({ "username": username, "password": proxy.password });
        }
    }

    json!({
        "authStrategy": {
            "type": "local",
            "dataPath": auth_dir,
        },
        "puppeteer": {
            "headless": true,
            "args": args,
        },
        "proxyAuthentication": proxy_auth,
    })
}

/// Remote files are fetched here and sent inline.
pub(super) async fn prepare_attachment(
    http: &reqwest::Client,
    kind: MediaKind,
    file: &AttachmentFile,
    caption: Option<String>,
) -> SessionResult<OutboundMedia> {
    let (data, mimetype) = match file.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => {
            let (bytes, fetched_mimetype) = fetch(http, url).await?;
            // The caller's mimetype wins over the server's
            let mimetype = file.mimetype.clone().or(fetched_mimetype);
            (base64::engine::general_purpose::STANDARD.encode(bytes), mimetype)
        }
        None => {
            let data = file.data.clone().unwrap_or_default();
            let mimetype = match &file.mimetype {
                Some(m) => Some(m.clone()),
                None => sniff_mimetype(&file.decode_data()?).map(str::to_string),
            };
            (data, mimetype)
        }
    };

    Ok(OutboundMedia {
        kind,
        source: MediaSource::Base64(data),
        mimetype,
        filename: file.filename.clone(),
        caption,
        ptt: kind == MediaKind::Audio,
        as_document: kind == MediaKind::Document,
    })
}

async fn fetch(http: &reqwest::Client, url: &str) -> SessionResult<(Vec<u8>, Option<String>)> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| SessionError::InvalidAttachment(format!("failed to fetch {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(SessionError::InvalidAttachment(format!(
            "failed to fetch {url}: HTTP {}",
            response.status()
        )));
    }

    let mimetype = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|e| SessionError::InvalidAttachment(format!("failed to read {url}: {e}")))?;

    Ok((bytes.to_vec(), mimetype))
}

pub(super) fn has_media(raw: &Value) -> bool {
    raw.get("hasMedia").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_settings_with_proxy() {
        let proxy = ProxyConfig {
            server: "proxy:3128".into(),
            username: Some("u".into()),
            password: Some("p".into()),
        };
        let settings = settings(Path::new("/s/webjs/alice"), Some(&proxy));

        assert_eq!(settings["authStrategy"]["dataPath"], "/s/webjs/alice");
        let args = settings["puppeteer"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--proxy-server=proxy:3128"));
        assert_eq!(settings["proxyAuthentication"]["username"], "u");
    }

    #[test]
    fn test_settings_without_proxy() {
        let settings = settings(Path::new("/s/webjs/bob"), None);
        let args = settings["puppeteer"]["args"].as_array().unwrap();
        assert!(!args.iter().any(|a| a.as_str().unwrap().starts_with("--proxy-server")));
        assert!(settings["proxyAuthentication"].is_null());
    }

    #[tokio::test]
    async fn test_remote_file_is_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cat.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"png".to_vec()),
            )
            .mount(&server)
            .await;

        let file = AttachmentFile {
            url: Some(format!("{}/cat.png", server.uri())),
            ..Default::default()
        };
        let media = prepare_attachment(&reqwest::Client::new(), MediaKind::Image, &file, None)
            .await
            .unwrap();

        assert_eq!(media.source, MediaSource::Base64("cG5n".into()));
        assert_eq!(media.mimetype.as_deref(), Some("image/png"));
        assert!(!media.as_document);
    }

    #[tokio::test]
    async fn test_remote_fetch_failure_is_invalid_attachment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let file = AttachmentFile {
            url: Some(format!("{}/missing.pdf", server.uri())),
            ..Default::default()
        };
        let result =
            prepare_attachment(&reqwest::Client::new(), MediaKind::Document, &file, None).await;
        assert!(matches!(result, Err(SessionError::InvalidAttachment(_))));
    }

    #[tokio::test]
    async fn test_inline_voice_note() {
        let file = AttachmentFile {
            data: Some("T2dnUw==".into()),
            ..Default::default()
        };
        let media = prepare_attachment(&reqwest::Client::new(), MediaKind::Audio, &file, None)
            .await
            .unwrap();

        assert!(media.ptt);
        assert_eq!(media.mimetype.as_deref(), Some("audio/ogg"));
        assert_eq!(media.source, MediaSource::Base64("T2dnUw==".into()));
    }
}
