//! A single chat session and its lifecycle.
//!
//! A [`Session`] owns the engine transport for one account, drives the status state
//! machine from transport events and republishes everything on a broadcast channel:
//!
//! ```text
//! STOPPED → STARTING → [SCAN_QR_CODE → STARTING →] WORKING
//!     any → FAILED            WORKING | FAILED | SCAN_QR_CODE → STOPPED
//! ```
//!
//! Status changes are written back to the session repository so that boot recovery
//! knows which sessions were running.

mod config;
mod events;
mod status;

use std::sync::Arc;
use std::time::Duration;

use chatplex_common::ProxyConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

pub use config::SessionConfig;
pub use events::{EventKind, SessionEvent};
pub use status::SessionStatus;

use crate::engine::{Engine, Transport, TransportConnector, TransportEvent};
use crate::error::{SessionError, SessionResult};
use crate::media::MediaStore;
use crate::message::{MediaKind, OutboundContent, SendFileRequest};
use crate::storage::{SessionConfigRepository, SessionRecord};

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Buffered transport events.
const TRANSPORT_CAPACITY: usize = 64;

/// How long stop waits for the event pump to finish its current event.
const PUMP_GRACE: Duration = Duration::from_secs(5);

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub status: SessionStatus,
    pub config: Option<SessionConfig>,
}

/// Everything a session is built from.
pub struct SessionParams {
    pub name: String,
    pub engine: Engine,
    pub config: Option<SessionConfig>,
    pub proxy: Option<ProxyConfig>,
    pub media: Arc<MediaStore>,
    pub repository: Arc<dyn SessionConfigRepository>,
    pub connector: Arc<dyn TransportConnector>,
    pub http: reqwest::Client,
}

/// One running chat session.
pub struct Session {
    name: String,
    engine: Engine,
    config: Option<SessionConfig>,
    proxy: Option<ProxyConfig>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    media: Arc<MediaStore>,
    repository: Arc<dyn SessionConfigRepository>,
    connector: Arc<dyn TransportConnector>,
    http: reqwest::Client,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stop_signal: Notify,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let (status, _) = watch::channel(SessionStatus::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: params.name,
            engine: params.engine,
            config: params.config,
            proxy: params.proxy,
            status,
            events,
            media: params.media,
            repository: params.repository,
            connector: params.connector,
            http: params.http,
            transport: RwLock::new(None),
            pump: Mutex::new(None),
            stop_signal: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            status: self.status(),
            config: self.config.clone(),
        }
    }

    /// Receive every event emitted from now on, in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the session reaches `target`, or give up after `timeout`.
    pub async fn wait_for_status(&self, target: SessionStatus, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Move to `next` if the state machine allows it.
    fn apply_status(&self, next: SessionStatus) -> bool {
        let mut from = next;
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                tracing::warn!(from = %current, to = %next, "Ignoring invalid status transition");
                return false;
            }
            from = *current;
            *current = next;
            true
        });

        if changed {
            tracing::info!(from = %from, to = %next, "Session status changed");
            self.emit(SessionEvent::StatusChange { from, to: next });
        }
        changed
    }

    /// Persist `next`, then make it visible.
    async fn transition(&self, next: SessionStatus) {
        let current = self.status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "Ignoring invalid status transition");
            return;
        }
        self.persist_status(next).await;
        self.apply_status(next);
    }

    async fn persist_status(&self, status: SessionStatus) {
        if let Err(e) = self
            .repository
            .update_status(&self.name, self.engine, status)
            .await
        {
            tracing::warn!(status = %status, error = %e, "Failed to persist session status");
        }
    }

    /// Build the transport and start connecting.
    ///
    /// Connection problems do not fail the call; they move the session to FAILED.
    pub async fn start(self: &Arc<Self>) {
        let span = chatplex_common::session_span!(self.name, self.engine);
        self.start_inner().instrument(span).await;
    }

    async fn start_inner(self: &Arc<Self>) {
        let record = SessionRecord {
            name: self.name.clone(),
            engine: self.engine,
            config: self.config.clone(),
            status: SessionStatus::Starting,
        };
        if let Err(e) = self.repository.save(&record).await {
            tracing::warn!(error = %e, "Failed to persist session record");
        }

        self.emit(SessionEvent::EngineStart);
        self.apply_status(SessionStatus::Starting);

        let auth_dir = self.repository.auth_dir(self.engine, &self.name);
        let transport = match self
            .engine
            .build_transport(self.connector.as_ref(), &self.name, auth_dir, self.proxy.clone())
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build engine transport");
                self.transition(SessionStatus::Failed).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(TRANSPORT_CAPACITY);
        *self.transport.write().await = Some(transport.clone());

        let pump = tokio::spawn(
            Arc::clone(self)
                .pump(transport.clone(), rx)
                .in_current_span(),
        );
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }

        if let Err(e) = transport.connect(tx).await {
            tracing::error!(error = %e, "Failed to connect engine transport");
            self.transition(SessionStatus::Failed).await;
        }
    }

    /// Map transport events onto status changes and session events.
    async fn pump(self: Arc<Self>, transport: Arc<dyn Transport>, mut rx: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.stop_signal.notified() => return,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                TransportEvent::Qr { value } => {
                    self.transition(SessionStatus::ScanQrCode).await;
                    self.emit(SessionEvent::Qr { value });
                }
                TransportEvent::Authenticated => {
                    self.transition(SessionStatus::Starting).await;
                }
                TransportEvent::Ready { me } => {
                    tracing::info!(me = ?me, "Session is ready");
                    self.transition(SessionStatus::Working).await;
                }
                TransportEvent::Message(message) => {
                    let (message, stored) = self
                        .engine
                        .download_media(transport.as_ref(), &self.media, message)
                        .await;
                    if let Some(stored) = stored {
                        tracing::info!(
                            message_id = %message.id,
                            url = %stored.url,
                            "Media saved"
                        );
                        self.emit(SessionEvent::MediaDownloaded {
                            message_id: message.id.clone(),
                            url: stored.url,
                            mimetype: stored.mimetype,
                        });
                    }
                    self.emit(SessionEvent::Message(message));
                }
                TransportEvent::Disconnected { reason } => {
                    tracing::warn!(reason = %reason, "Engine connection lost");
                    self.transition(SessionStatus::Failed).await;
                    return;
                }
            }
        }

        // Transport went away without saying why
        if self.status() != SessionStatus::Stopped {
            tracing::warn!("Engine event stream closed");
            self.transition(SessionStatus::Failed).await;
        }
    }

    /// Stop the session and record it as STOPPED.
    ///
    /// `logout` also revokes the pairing on the engine side. Safe to call repeatedly.
    pub async fn stop(&self, logout: bool) -> SessionResult<()> {
        let span = chatplex_common::session_span!(self.name, self.engine);
        self.halt(logout, true).instrument(span).await
    }

    /// Stop for process shutdown, leaving the persisted status as it was.
    pub async fn shutdown(&self) -> SessionResult<()> {
        let span = chatplex_common::session_span!(self.name, self.engine);
        self.halt(false, false).instrument(span).await
    }

    async fn halt(&self, logout: bool, persist: bool) -> SessionResult<()> {
        if let Some(mut pump) = self.pump.lock().await.take() {
            self.stop_signal.notify_one();
            if tokio::time::timeout(PUMP_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        let mut result = Ok(());
        if let Some(transport) = self.transport.write().await.take() {
            if logout {
                if let Err(e) = transport.logout().await {
                    tracing::warn!(error = %e, "Engine logout failed");
                }
            }
            result = transport.close().await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Engine transport did not close cleanly");
            }
        }

        self.apply_status(SessionStatus::Stopped);
        if persist {
            self.persist_status(SessionStatus::Stopped).await;
        }
        result
    }

    async fn ready_transport(&self) -> SessionResult<Arc<dyn Transport>> {
        let transport = self.transport.read().await.clone();
        match transport {
            Some(transport) if self.status() == SessionStatus::Working => Ok(transport),
            _ => Err(SessionError::NotReady(self.name.clone())),
        }
    }

    pub async fn send_text(&self, chat_id: &str, text: &str) -> SessionResult<serde_json::Value> {
        let transport = self.ready_transport().await?;
        transport
            .send(
                chat_id,
                OutboundContent::Text {
                    text: text.to_string(),
                },
            )
            .await
    }

    pub async fn send_image(&self, request: &SendFileRequest) -> SessionResult<serde_json::Value> {
        self.send_media(MediaKind::Image, request).await
    }

    /// Send as a document.
    pub async fn send_file(&self, request: &SendFileRequest) -> SessionResult<serde_json::Value> {
        self.send_media(MediaKind::Document, request).await
    }

    /// Send as a voice note.
    pub async fn send_voice(&self, request: &SendFileRequest) -> SessionResult<serde_json::Value> {
        self.send_media(MediaKind::Audio, request).await
    }

    async fn send_media(
        &self,
        kind: MediaKind,
        request: &SendFileRequest,
    ) -> SessionResult<serde_json::Value> {
        request.file.validate()?;
        let transport = self.ready_transport().await?;
        let media = self
            .engine
            .prepare_attachment(&self.http, kind, &request.file, request.caption.clone())
            .await?;
        transport
            .send(&request.chat_id, OutboundContent::Media(media))
            .await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AttachmentFile, InboundMessage, MediaPayload};
    use crate::storage::FileSessionRepository;
    use async_trait::async_trait;
    use chatplex_common::FilesConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits a scripted list of events on connect.
    struct ScriptedTransport {
        script: Vec<TransportEvent>,
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> SessionResult<()> {
            let script = self.script.clone();
            tokio::spawn(async move {
                for event in script {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                // Keep the stream open
                std::future::pending::<()>().await;
            });
            Ok(())
        }

        async fn send(&self, _chat_id: &str, _content: OutboundContent) -> SessionResult<serde_json::Value> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "id": "out" }))
        }

        async fn download_media(&self, _message: &InboundMessage) -> SessionResult<Option<MediaPayload>> {
            Ok(Some(MediaPayload {
                mimetype: Some("image/png".into()),
                data: b"\x89PNG\r\n\x1a\n".to_vec(),
            }))
        }

        async fn logout(&self) -> SessionResult<()> {
            Ok(())
        }

        async fn close(&self) -> SessionResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: Vec<TransportEvent>,
        fail: bool,
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        async fn build(&self, _options: crate::engine::TransportOptions) -> SessionResult<Arc<dyn Transport>> {
            if self.fail {
                return Err(SessionError::TransportFailure("no browser".into()));
            }
            Ok(Arc::new(ScriptedTransport {
                script: self.script.clone(),
                sent: self.sent.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        session: Arc<Session>,
        repository: Arc<FileSessionRepository>,
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    fn fixture(script: Vec<TransportEvent>, fail: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();
        let repository = Arc::new(FileSessionRepository::new(dir.path().join("sessions")));
        let sent = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let session = Arc::new(Session::new(SessionParams {
            name: "alice".into(),
            engine: Engine::WebJs,
            config: Some(SessionConfig::default()),
            proxy: None,
            media: Arc::new(MediaStore::new(&FilesConfig {
                folder: files,
                url: "http://files/".into(),
                lifetime_secs: 60,
                mimetypes: None,
            })),
            repository: repository.clone(),
            connector: Arc::new(ScriptedConnector {
                script,
                fail,
                sent: sent.clone(),
                closed: closed.clone(),
            }),
            http: reqwest::Client::new(),
        }));

        Fixture {
            _dir: dir,
            session,
            repository,
            sent,
            closed,
        }
    }

    fn message(id: &str) -> InboundMessage {
        serde_json::from_value(json!({ "id": id, "from": "1@c.us", "raw": { "hasMedia": true } }))
            .unwrap()
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_start_reaches_working() {
        let f = fixture(
            vec![
                TransportEvent::Qr { value: "2@qr".into() },
                TransportEvent::Authenticated,
                TransportEvent::Ready { me: None },
            ],
            false,
        );
        let mut events = f.session.subscribe();

        f.session.start().await;
        assert!(f.session.wait_for_status(SessionStatus::Working, WAIT).await);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds.first(), Some(&EventKind::EngineStart));
        assert!(kinds.contains(&EventKind::Qr));
        assert_eq!(kinds.last(), Some(&EventKind::StatusChange));

        let record = f.repository.get("alice").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Working);
    }

    #[tokio::test]
    async fn test_build_failure_marks_failed() {
        let f = fixture(vec![], true);
        f.session.start().await;

        assert_eq!(f.session.status(), SessionStatus::Failed);
        let record = f.repository.get("alice").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_marks_failed() {
        let f = fixture(
            vec![
                TransportEvent::Ready { me: None },
                TransportEvent::Disconnected {
                    reason: "conflict".into(),
                },
            ],
            false,
        );
        f.session.start().await;
        assert!(f.session.wait_for_status(SessionStatus::Failed, WAIT).await);
    }

    #[tokio::test]
    async fn test_inbound_media_is_stored() {
        let f = fixture(
            vec![
                TransportEvent::Ready { me: None },
                TransportEvent::Message(message("m1")),
            ],
            false,
        );
        let mut events = f.session.subscribe();
        f.session.start().await;

        let deadline = tokio::time::Instant::now() + WAIT;
        let mut downloaded = None;
        let mut delivered = None;
        while delivered.is_none() {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                SessionEvent::MediaDownloaded { url, .. } => downloaded = Some(url),
                SessionEvent::Message(message) => delivered = Some(message),
                _ => {}
            }
        }

        assert_eq!(downloaded.as_deref(), Some("http://files/m1.png"));
        assert_eq!(
            delivered.unwrap().media_url.as_deref(),
            Some("http://files/m1.png")
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_persisted() {
        let f = fixture(vec![TransportEvent::Ready { me: None }], false);
        f.session.start().await;
        assert!(f.session.wait_for_status(SessionStatus::Working, WAIT).await);

        f.session.stop(false).await.unwrap();
        f.session.stop(false).await.unwrap();

        assert_eq!(f.session.status(), SessionStatus::Stopped);
        assert_eq!(f.closed.load(Ordering::SeqCst), 1);
        let record = f.repository.get("alice").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_persisted_status() {
        let f = fixture(vec![TransportEvent::Ready { me: None }], false);
        f.session.start().await;
        assert!(f.session.wait_for_status(SessionStatus::Working, WAIT).await);

        f.session.shutdown().await.unwrap();

        assert_eq!(f.session.status(), SessionStatus::Stopped);
        let record = f.repository.get("alice").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Working);
    }

    #[tokio::test]
    async fn test_send_requires_working_session() {
        let f = fixture(vec![], false);
        let result = f.session.send_text("1@c.us", "hi").await;
        assert!(matches!(result, Err(SessionError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_send_validates_attachment_first() {
        let f = fixture(vec![], false);
        let request = SendFileRequest {
            session: "alice".into(),
            chat_id: "1@c.us".into(),
            file: AttachmentFile::default(),
            caption: None,
        };
        let result = f.session.send_image(&request).await;
        assert!(matches!(result, Err(SessionError::InvalidAttachment(_))));
    }

    #[tokio::test]
    async fn test_send_when_working() {
        let f = fixture(vec![TransportEvent::Ready { me: None }], false);
        f.session.start().await;
        assert!(f.session.wait_for_status(SessionStatus::Working, WAIT).await);

        f.session.send_text("1@c.us", "hi").await.unwrap();
        let request = SendFileRequest {
            session: "alice".into(),
            chat_id: "1@c.us".into(),
            file: AttachmentFile {
                data: Some("aGk=".into()),
                mimetype: Some("text/plain".into()),
                ..Default::default()
            },
            caption: Some("note".into()),
        };
        f.session.send_file(&request).await.unwrap();
        assert_eq!(f.sent.load(Ordering::SeqCst), 2);
    }
}
