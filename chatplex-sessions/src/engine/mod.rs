//! Engine variants and the transport collaborator boundary.
//!
//! An [`Engine`] decides how a session talks to its engine-native client: which
//! options the transport is built with, how outbound attachments are shaped and how
//! inbound media is detected. The client itself sits behind [`Transport`], built by a
//! [`TransportConnector`].
//!
//! ```text
//! Session ── Engine::build_transport ──▶ TransportConnector ──▶ Transport
//!    ▲                                                            │
//!    └──────────────── TransportEvent (mpsc) ◀────────────────────┘
//! ```

pub mod bridge;
mod noweb;
mod venom;
mod webjs;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chatplex_common::ProxyConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::media::MediaStore;
use crate::message::{
    AttachmentFile, InboundMessage, MediaKind, MediaPayload, OutboundContent, OutboundMedia,
};

pub use bridge::{BridgeConnector, BridgeTransport};

/// Engine backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "WEBJS")]
    WebJs,
    #[serde(rename = "NOWEB")]
    NoWeb,
    #[serde(rename = "VENOM")]
    Venom,
}

impl Engine {
    pub const ALL: [Self; 3] = [Self::WebJs, Self::NoWeb, Self::Venom];

    /// Look up an engine by its configured name (case-insensitive).
    pub fn from_name(name: &str) -> SessionResult<Self> {
        Self::ALL
            .into_iter()
            .find(|engine| engine.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| SessionError::EngineNotFound(name.to_string()))
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebJs => "WEBJS",
            Self::NoWeb => "NOWEB",
            Self::Venom => "VENOM",
        }
    }

    /// Folder under the sessions root holding this engine's sessions.
    pub const fn folder_name(self) -> &'static str {
        match self {
            Self::WebJs => "webjs",
            Self::NoWeb => "noweb",
            Self::Venom => "venom",
        }
    }

    /// Credential folder for one session.
    pub fn auth_dir(self, sessions_root: &Path, session: &str) -> PathBuf {
        sessions_root.join(self.folder_name()).join(session)
    }

    /// Engine-native client options.
    pub fn transport_settings(
        self,
        session: &str,
        auth_dir: &Path,
        proxy: Option<&ProxyConfig>,
    ) -> serde_json::Value {
        match self {
            Self::WebJs => webjs::settings(auth_dir, proxy),
            Self::NoWeb => noweb::settings(auth_dir, proxy),
            Self::Venom => venom::settings(session, auth_dir, proxy),
        }
    }

    /// Build the engine-native client for a session.
    pub async fn build_transport(
        self,
        connector: &dyn TransportConnector,
        session: &str,
        auth_dir: PathBuf,
        proxy: Option<ProxyConfig>,
    ) -> SessionResult<Arc<dyn Transport>> {
        let settings = self.transport_settings(session, &auth_dir, proxy.as_ref());
        connector
            .build(TransportOptions {
                engine: self,
                session: session.to_string(),
                auth_dir,
                proxy,
                settings,
            })
            .await
    }

    /// Turn an API attachment into engine-ready media.
    pub async fn prepare_attachment(
        self,
        http: &reqwest::Client,
        kind: MediaKind,
        file: &AttachmentFile,
        caption: Option<String>,
    ) -> SessionResult<OutboundMedia> {
        file.validate()?;
        match self {
            Self::WebJs => webjs::prepare_attachment(http, kind, file, caption).await,
            Self::NoWeb => noweb::prepare_attachment(kind, file, caption),
            Self::Venom => venom::prepare_attachment(kind, file, caption),
        }
    }

    /// Whether the engine-native payload carries downloadable media.
    pub fn has_media(self, message: &InboundMessage) -> bool {
        match self {
            Self::WebJs => webjs::has_media(&message.raw),
            Self::NoWeb => noweb::has_media(&message.raw),
            Self::Venom => venom::has_media(&message.raw),
        }
    }

    fn media_mimetype(self, message: &InboundMessage, payload: &MediaPayload) -> Option<String> {
        match self {
            Self::WebJs => payload.mimetype.clone(),
            Self::NoWeb => noweb::mimetype(&message.raw).or_else(|| payload.mimetype.clone()),
            Self::Venom => venom::mimetype(&message.raw).or_else(|| payload.mimetype.clone()),
        }
    }

    /// Download an inbound attachment into the media store.
    ///
    /// Returns the message with `media_url` set when something was stored. Download
    /// failures are logged and leave the message without media.
    pub async fn download_media(
        self,
        transport: &dyn Transport,
        store: &MediaStore,
        mut message: InboundMessage,
    ) -> (InboundMessage, Option<StoredMedia>) {
        if !self.has_media(&message) {
            return (message, None);
        }

        let payload = match transport.download_media(&message).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return (message, None),
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to download media"
                );
                return (message, None);
            }
        };

        let mimetype = self.media_mimetype(&message, &payload);
        let url = store
            .save(&message.id, mimetype.as_deref(), &payload.data)
            .await;
        if url.is_empty() {
            return (message, None);
        }

        message.media_url = Some(url.clone());
        (message, Some(StoredMedia { url, mimetype }))
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of storing an inbound attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub url: String,
    pub mimetype: Option<String>,
}

/// Options handed to a [`TransportConnector`].
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub engine: Engine,
    pub session: String,
    /// Credential folder; kept on stop, removed on logout
    pub auth_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
    /// Engine-native client options
    pub settings: serde_json::Value,
}

/// Event reported by an engine-native client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// Pairing code to show the user
    Qr { value: String },
    /// Pairing accepted, still syncing
    Authenticated,
    /// Connected and able to send
    Ready {
        #[serde(default)]
        me: Option<String>,
    },
    Message(InboundMessage),
    /// Connection lost and not coming back
    Disconnected {
        #[serde(default)]
        reason: String,
    },
}

/// Engine-native client of one session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection; events flow into `events` until the transport is closed.
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> SessionResult<()>;

    /// Send content to a chat, returning the engine's response.
    async fn send(&self, chat_id: &str, content: OutboundContent)
        -> SessionResult<serde_json::Value>;

    /// Fetch the attachment of an inbound message.
    async fn download_media(&self, message: &InboundMessage)
        -> SessionResult<Option<MediaPayload>>;

    /// Revoke the pairing on the engine side.
    async fn logout(&self) -> SessionResult<()>;

    /// Close the connection, keeping credentials.
    async fn close(&self) -> SessionResult<()>;
}

/// Builds engine-native clients.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn build(&self, options: TransportOptions) -> SessionResult<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatplex_common::FilesConfig;
    use serde_json::json;

    struct MediaTransport {
        payload: Option<MediaPayload>,
    }

    #[async_trait]
    impl Transport for MediaTransport {
        async fn connect(&self, _events: mpsc::Sender<TransportEvent>) -> SessionResult<()> {
            Ok(())
        }

        async fn send(
            &self,
            _chat_id: &str,
            _content: OutboundContent,
        ) -> SessionResult<serde_json::Value> {
            Ok(json!({}))
        }

        async fn download_media(
            &self,
            _message: &InboundMessage,
        ) -> SessionResult<Option<MediaPayload>> {
            Ok(self.payload.clone())
        }

        async fn logout(&self) -> SessionResult<()> {
            Ok(())
        }

        async fn close(&self) -> SessionResult<()> {
            Ok(())
        }
    }

    fn message(raw: serde_json::Value) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            from: "123@c.us".into(),
            to: None,
            body: None,
            timestamp: 0,
            from_me: false,
            media_url: None,
            raw,
        }
    }

    fn store(dir: &Path) -> MediaStore {
        MediaStore::new(&FilesConfig {
            folder: dir.to_path_buf(),
            url: "http://files/".into(),
            lifetime_secs: 60,
            mimetypes: None,
        })
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Engine::from_name("WEBJS").unwrap(), Engine::WebJs);
        assert_eq!(Engine::from_name("noweb").unwrap(), Engine::NoWeb);
        assert_eq!(Engine::from_name(" Venom ").unwrap(), Engine::Venom);
        assert!(matches!(
            Engine::from_name("TELEGRAM"),
            Err(SessionError::EngineNotFound(_))
        ));
    }

    #[test]
    fn test_auth_dir_layout() {
        let dir = Engine::NoWeb.auth_dir(Path::new("/data"), "alice");
        assert_eq!(dir, PathBuf::from("/data/noweb/alice"));
    }

    #[test]
    fn test_has_media_per_engine() {
        let webjs = message(json!({ "hasMedia": true }));
        assert!(Engine::WebJs.has_media(&webjs));
        assert!(!Engine::NoWeb.has_media(&webjs));

        let noweb = message(json!({ "message": { "imageMessage": { "mimetype": "image/jpeg" } } }));
        assert!(Engine::NoWeb.has_media(&noweb));
        assert!(!Engine::WebJs.has_media(&noweb));

        let venom = message(json!({ "isMMS": true, "isMedia": true }));
        assert!(Engine::Venom.has_media(&venom));
        assert!(!Engine::Venom.has_media(&message(json!({ "isMMS": true }))));
    }

    #[tokio::test]
    async fn test_download_media_sets_url() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MediaTransport {
            payload: Some(MediaPayload {
                mimetype: Some("image/png".into()),
                data: b"\x89PNG\r\n\x1a\n".to_vec(),
            }),
        };

        let (enriched, stored) = Engine::WebJs
            .download_media(&transport, &store(dir.path()), message(json!({ "hasMedia": true })))
            .await;

        assert_eq!(enriched.media_url.as_deref(), Some("http://files/m1.png"));
        assert_eq!(stored.unwrap().mimetype.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_download_media_skips_plain_messages() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MediaTransport { payload: None };

        let (enriched, stored) = Engine::WebJs
            .download_media(&transport, &store(dir.path()), message(json!({ "hasMedia": false })))
            .await;

        assert!(enriched.media_url.is_none());
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_noweb_prefers_message_mimetype() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MediaTransport {
            payload: Some(MediaPayload {
                mimetype: None,
                data: b"OggS".to_vec(),
            }),
        };
        let raw = json!({ "message": { "audioMessage": { "mimetype": "audio/ogg; codecs=opus" } } });

        let (enriched, _) = Engine::NoWeb
            .download_media(&transport, &store(dir.path()), message(raw))
            .await;

        assert_eq!(enriched.media_url.as_deref(), Some("http://files/m1.oga"));
    }
}
