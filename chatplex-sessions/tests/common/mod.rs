//! Shared helpers for chatplex-sessions integration tests.
//!
//! `FakeConnector` stands in for the engine bridge. Its transports pair on first use
//! (emitting a QR code), store a credential file in the session's auth folder and
//! reconnect silently when that file is still there.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatplex_common::{FilesConfig, ProxySettings, WebhookConfig};
use chatplex_sessions::{
    FileSessionRepository, InboundMessage, ManagerSettings, MediaPayload, OutboundContent,
    SessionError, SessionManager, SessionResult, Transport, TransportConnector, TransportEvent,
    TransportOptions,
};
use serde_json::json;
use tokio::sync::mpsc;

pub const CREDS_FILE: &str = "creds.json";
pub const WAIT: Duration = Duration::from_secs(3);
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// Observations shared by every transport a connector builds.
#[derive(Default)]
pub struct Recorder {
    pub built: Mutex<Vec<TransportOptions>>,
    pub qr_shown: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<(String, OutboundContent)>>,
    pub logouts: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Recorder {
    pub fn qr_count(&self, name: &str) -> usize {
        self.qr_shown
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    pub fn sent(&self) -> Vec<(String, OutboundContent)> {
        self.sent.lock().unwrap().clone()
    }
}

pub struct FakeConnector {
    pub recorder: Arc<Recorder>,
    /// Session names whose transport cannot be built
    pub fail_for: Vec<String>,
    /// Messages delivered once the session is ready
    pub inbound: Vec<InboundMessage>,
    /// Transports report an error when closed
    pub close_fails: bool,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            recorder: Arc::new(Recorder::default()),
            fail_for: Vec::new(),
            inbound: Vec::new(),
            close_fails: false,
        }
    }

    pub fn failing_for(mut self, name: &str) -> Self {
        self.fail_for.push(name.to_string());
        self
    }

    pub fn with_inbound(mut self, message: InboundMessage) -> Self {
        self.inbound.push(message);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.close_fails = true;
        self
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn build(&self, options: TransportOptions) -> SessionResult<Arc<dyn Transport>> {
        self.recorder.built.lock().unwrap().push(options.clone());
        if self.fail_for.contains(&options.session) {
            return Err(SessionError::TransportFailure(format!(
                "browser crashed for {}",
                options.session
            )));
        }
        Ok(Arc::new(FakeTransport {
            options,
            recorder: self.recorder.clone(),
            inbound: self.inbound.clone(),
            close_fails: self.close_fails,
        }))
    }
}

pub struct FakeTransport {
    options: TransportOptions,
    recorder: Arc<Recorder>,
    inbound: Vec<InboundMessage>,
    close_fails: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> SessionResult<()> {
        let creds = self.options.auth_dir.join(CREDS_FILE);
        let mut script = Vec::new();
        if !creds.exists() {
            self.recorder
                .qr_shown
                .lock()
                .unwrap()
                .push(self.options.session.clone());
            script.push(TransportEvent::Qr {
                value: format!("2@{}", self.options.session),
            });
            std::fs::create_dir_all(&self.options.auth_dir)?;
            std::fs::write(&creds, b"{}")?;
        }
        script.push(TransportEvent::Authenticated);
        script.push(TransportEvent::Ready {
            me: Some(format!("{}@c.us", self.options.session)),
        });
        script.extend(self.inbound.iter().cloned().map(TransportEvent::Message));

        tokio::spawn(async move {
            for event in script {
                if events.send(event).await.is_err() {
                    return;
                }
            }
            // Stay connected until the session closes us
            events.closed().await;
        });
        Ok(())
    }

    async fn send(&self, chat_id: &str, content: OutboundContent) -> SessionResult<serde_json::Value> {
        self.recorder
            .sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), content));
        Ok(json!({ "id": "true_out_1" }))
    }

    async fn download_media(&self, _message: &InboundMessage) -> SessionResult<Option<MediaPayload>> {
        Ok(Some(MediaPayload {
            mimetype: Some("image/png".into()),
            data: PNG.to_vec(),
        }))
    }

    async fn logout(&self) -> SessionResult<()> {
        self.recorder.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        if self.close_fails {
            return Err(SessionError::TransportFailure("bridge went away".into()));
        }
        Ok(())
    }
}

/// Manager settings rooted in a temp dir.
pub fn settings(root: &Path) -> ManagerSettings {
    let files = root.join("files");
    std::fs::create_dir_all(&files).unwrap();
    ManagerSettings {
        default_engine: "WEBJS".into(),
        restart_all: true,
        start: Vec::new(),
        files: FilesConfig {
            folder: files,
            url: "http://localhost:3000/api/files/".into(),
            lifetime_secs: 180,
            mimetypes: None,
        },
        webhook: None,
        proxy: ProxySettings::default(),
    }
}

pub fn repository(root: &Path) -> Arc<FileSessionRepository> {
    Arc::new(FileSessionRepository::new(root.join("sessions")))
}

pub fn manager(root: &Path, settings: ManagerSettings, connector: FakeConnector) -> SessionManager {
    SessionManager::new(settings, repository(root), Arc::new(connector))
}

pub fn webhook(url: String, events: &[&str]) -> WebhookConfig {
    WebhookConfig {
        url,
        events: events.iter().map(|e| e.to_string()).collect(),
        hmac: None,
        custom_headers: vec![],
    }
}

pub fn media_message(id: &str) -> InboundMessage {
    serde_json::from_value(json!({
        "id": id,
        "from": "123@c.us",
        "body": "look",
        "raw": { "hasMedia": true }
    }))
    .unwrap()
}
