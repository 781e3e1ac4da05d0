//! Session registry and lifecycle API.
//!
//! The [`SessionManager`] creates sessions, wires a media store and a webhook
//! conductor into each one, recovers persisted sessions at boot and exposes the
//! start/stop/logout/list operations used by the HTTP layer.
//!
//! Operations on the same name are serialized by a per-name lock; different names
//! proceed independently.

use std::sync::Arc;

use chatplex_common::util::redact_url_credentials;
use chatplex_common::{Config, FilesConfig, ProxyConfig, ProxySettings, WebhookConfig};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::engine::bridge::BridgeConfig;
use crate::engine::{BridgeConnector, Engine, TransportConnector};
use crate::error::{SessionError, SessionResult};
use crate::media::MediaStore;
use crate::proxy::{self, LiveProxy};
use crate::session::{Session, SessionConfig, SessionEvent, SessionInfo, SessionParams, SessionStatus};
use crate::storage::{FileSessionRepository, SessionConfigRepository};
use crate::webhook::WebhookConductor;

/// `POST /api/sessions/start` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub name: String,
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

/// `POST /api/sessions/stop` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub name: String,
    #[serde(default)]
    pub logout: bool,
}

/// `POST /api/sessions/logout` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub name: String,
}

/// Outcome of [`SessionManager::boot`].
#[derive(Debug, Default)]
pub struct BootReport {
    /// Persisted sessions restarted
    pub recovered: Vec<String>,
    /// Pre-declared sessions started
    pub started: Vec<String>,
    /// Sessions that could not be started (name, error)
    pub failed: Vec<(String, String)>,
}

/// Process-level settings the manager needs.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub default_engine: String,
    pub restart_all: bool,
    pub start: Vec<String>,
    pub files: FilesConfig,
    pub webhook: Option<WebhookConfig>,
    pub proxy: ProxySettings,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_engine: config.engine.default.clone(),
            restart_all: config.sessions.restart_all,
            start: config.sessions.start.clone(),
            files: config.files.clone(),
            webhook: config.webhook.clone(),
            proxy: config.proxy.clone(),
        }
    }
}

/// Registry of live sessions.
pub struct SessionManager {
    settings: ManagerSettings,
    sessions: DashMap<String, Arc<Session>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    repository: Arc<dyn SessionConfigRepository>,
    connector: Arc<dyn TransportConnector>,
    http: reqwest::Client,
}

impl SessionManager {
    pub fn new(
        settings: ManagerSettings,
        repository: Arc<dyn SessionConfigRepository>,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            settings,
            sessions: DashMap::new(),
            locks: DashMap::new(),
            repository,
            connector,
            http: reqwest::Client::new(),
        }
    }

    /// Manager backed by the session folder and the engine bridge from `config`.
    pub fn from_config(config: &Config) -> Self {
        let repository = Arc::new(FileSessionRepository::new(config.sessions.folder.clone()));
        let connector = Arc::new(BridgeConnector::new(BridgeConfig {
            endpoint: config.engine.bridge_url.clone(),
            ..Default::default()
        }));
        Self::new(ManagerSettings::from(config), repository, connector)
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-name lock once no other caller holds or awaits it.
    fn release_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(name, |_, entry| Arc::strong_count(entry) == 1);
    }

    /// Start a session.
    ///
    /// Returns once the engine is connecting; the status may still be STARTING.
    pub async fn start(&self, request: StartRequest) -> SessionResult<SessionInfo> {
        validate_name(&request.name)?;
        let name = request.name.clone();
        let lock = self.lock_for(&name);
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(request).await
        };
        self.release_lock(&name, lock);
        result
    }

    async fn start_locked(&self, request: StartRequest) -> SessionResult<SessionInfo> {
        let name = request.name;
        if self.sessions.contains_key(&name) {
            return Err(SessionError::DuplicateSession(name));
        }

        let engine_name = request
            .config
            .as_ref()
            .and_then(|c| c.engine.as_deref())
            .unwrap_or(&self.settings.default_engine);
        let engine = Engine::from_name(engine_name)?;

        let requested_proxy = request.config.as_ref().and_then(|c| c.proxy.as_ref());
        let proxy = proxy::resolve(
            requested_proxy,
            &self.settings.proxy,
            &self.live_proxies(),
            &name,
        );
        let webhooks = self.webhooks_for(request.config.as_ref());

        tracing::info!(
            session = %name,
            engine = %engine,
            proxy = ?proxy
                .as_ref()
                .and_then(ProxyConfig::url)
                .map(|url| redact_url_credentials(&url)),
            "Starting session..."
        );
        let media = MediaStore::new(&self.settings.files).with_scope(format!("storage - {name}"));
        let session = Arc::new(Session::new(SessionParams {
            name: name.clone(),
            engine,
            config: request.config,
            proxy,
            media: Arc::new(media),
            repository: self.repository.clone(),
            connector: self.connector.clone(),
            http: self.http.clone(),
        }));
        self.sessions.insert(name, session.clone());

        if !webhooks.is_empty() {
            self.wire_webhooks(&session, webhooks);
        }

        session.start().await;
        Ok(session.info())
    }

    /// Session webhooks first, the global one appended.
    fn webhooks_for(&self, config: Option<&SessionConfig>) -> Vec<WebhookConfig> {
        let mut webhooks: Vec<WebhookConfig> =
            config.map(|c| c.webhooks.clone()).unwrap_or_default();
        if let Some(global) = self.settings.webhook.as_ref().filter(|w| !w.url.is_empty()) {
            webhooks.push(global.clone());
        }
        webhooks
    }

    /// Hand the event stream to a conductor once the engine starts.
    fn wire_webhooks(&self, session: &Arc<Session>, webhooks: Vec<WebhookConfig>) {
        let mut events = session.subscribe();
        let conductor = Arc::new(WebhookConductor::with_client(
            session.name(),
            session.engine(),
            webhooks,
            self.http.clone(),
        ));
        let span = chatplex_common::session_span!(session.name(), session.engine());

        tokio::spawn(
            async move {
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::EngineStart) => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return,
                    }
                }
                conductor.dispatch(&SessionEvent::EngineStart);
                conductor.configure(events);
            }
            .instrument(span),
        );
    }

    fn live_proxies(&self) -> Vec<LiveProxy> {
        self.sessions
            .iter()
            .map(|entry| LiveProxy {
                name: entry.key().clone(),
                proxy: entry.value().proxy().cloned(),
            })
            .collect()
    }

    /// Stop a session and drop it from the registry.
    ///
    /// The session leaves the registry even when the engine fails to stop cleanly.
    pub async fn stop(&self, request: StopRequest) -> SessionResult<()> {
        // Unknown names are rejected without allocating a lock.
        self.get_session(&request.name)?;
        let name = request.name.clone();
        let lock = self.lock_for(&name);
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(request).await
        };
        self.release_lock(&name, lock);
        result
    }

    async fn stop_locked(&self, request: StopRequest) -> SessionResult<()> {
        let name = request.name;
        // A concurrent stop may have won the lock first.
        let session = self.get_session(&name)?;
        tracing::info!(session = %name, logout = request.logout, "Stopping session...");

        if let Err(e) = session.stop(request.logout).await {
            tracing::warn!(session = %name, error = %e, "Session stopped with errors");
        }
        self.sessions.remove(&name);
        tracing::info!(session = %name, "Session has been stopped");

        if request.logout {
            self.repository.clean(&name).await?;
        }
        Ok(())
    }

    /// Forget a session's credentials and record. The session need not be running.
    pub async fn logout(&self, request: LogoutRequest) -> SessionResult<()> {
        validate_name(&request.name)?;
        let lock = self.lock_for(&request.name);
        let result = {
            let _guard = lock.lock().await;
            self.repository.clean(&request.name).await
        };
        self.release_lock(&request.name, lock);
        result
    }

    /// Live session by name.
    pub fn get_session(&self, name: &str) -> SessionResult<Arc<Session>> {
        self.try_get_session(name)
            .ok_or_else(|| SessionError::SessionNotFound(name.to_string()))
    }

    /// Live session by name, `None` when absent.
    pub fn try_get_session(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.get(name).map(|entry| entry.value().clone())
    }

    /// Live session, or the persisted one reported as STOPPED.
    pub async fn get_session_info(&self, name: &str) -> SessionResult<SessionInfo> {
        if let Some(session) = self.try_get_session(name) {
            return Ok(session.info());
        }
        match self.repository.get(name).await? {
            Some(record) => Ok(SessionInfo {
                name: record.name,
                status: SessionStatus::Stopped,
                config: record.config,
            }),
            None => Err(SessionError::SessionNotFound(name.to_string())),
        }
    }

    /// Live sessions, plus persisted ones as STOPPED when `all` is set.
    pub async fn get_sessions(&self, all: bool) -> SessionResult<Vec<SessionInfo>> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));

        if all {
            let mut stopped: Vec<SessionInfo> = self
                .repository
                .list()
                .await?
                .into_iter()
                .filter(|record| !self.sessions.contains_key(&record.name))
                .map(|record| SessionInfo {
                    name: record.name,
                    status: SessionStatus::Stopped,
                    config: record.config,
                })
                .collect();
            stopped.sort_by(|a, b| a.name.cmp(&b.name));
            infos.extend(stopped);
        }
        Ok(infos)
    }

    /// Purge media, recover persisted sessions and start pre-declared ones.
    ///
    /// One session failing never stops the others.
    pub async fn boot(&self) -> BootReport {
        MediaStore::new(&self.settings.files).purge().await;

        if let Err(e) = self.repository.init().await {
            tracing::error!(error = %e, "Failed to prepare session storage");
        }

        let mut report = BootReport::default();
        if self.settings.restart_all {
            let requests = self.recovery_requests().await;
            for (name, result) in self.start_all(requests).await {
                match result {
                    Ok(()) => report.recovered.push(name),
                    Err(e) => report.failed.push((name, e)),
                }
            }
        }

        let mut predefined = Vec::new();
        for name in &self.settings.start {
            // Already running, possibly recovered above
            if self.sessions.contains_key(name) {
                continue;
            }
            let config = match self.repository.get(name).await {
                Ok(record) => record.and_then(|r| r.config),
                Err(e) => {
                    tracing::warn!(session = %name, error = %e, "Failed to read session record");
                    None
                }
            };
            predefined.push(StartRequest {
                name: name.clone(),
                config,
            });
        }
        for (name, result) in self.start_all(predefined).await {
            match result {
                Ok(()) => report.started.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }

        tracing::info!(
            recovered = report.recovered.len(),
            started = report.started.len(),
            failed = report.failed.len(),
            "Session boot finished"
        );
        report
    }

    /// Persisted sessions that were running when the process went down.
    async fn recovery_requests(&self) -> Vec<StartRequest> {
        let records = match self.repository.list().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list persisted sessions");
                return Vec::new();
            }
        };

        records
            .into_iter()
            .filter(|record| record.status.should_recover())
            .map(|record| {
                // Keep the engine the credentials belong to
                let mut config = record.config.unwrap_or_default();
                if config.engine.is_none() {
                    config.engine = Some(record.engine.as_str().to_string());
                }
                tracing::info!(session = %record.name, "Restarting session...");
                StartRequest {
                    name: record.name,
                    config: Some(config),
                }
            })
            .collect()
    }

    /// Start sessions concurrently; a session ending up FAILED counts as an error.
    async fn start_all(&self, requests: Vec<StartRequest>) -> Vec<(String, Result<(), String>)> {
        let starts = requests.into_iter().map(|request| async move {
            let name = request.name.clone();
            let result = match self.start(request).await {
                Ok(info) if info.status == SessionStatus::Failed => {
                    Err("engine transport failed".to_string())
                }
                Ok(_) => Ok(()),
                // Already live: nothing to recover
                Err(SessionError::DuplicateSession(_)) => {
                    tracing::debug!(session = %name, "Session already running");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(session = %name, error = %e, "Failed to start session");
                    Err(e.to_string())
                }
            };
            (name, result)
        });
        join_all(starts).await
    }

    /// Stop every live session without marking it STOPPED, so the next boot resumes it.
    pub async fn shutdown(&self) {
        tracing::info!("Stop all sessions...");
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.shutdown().await {
                tracing::warn!(session = %session.name(), error = %e, "Session shutdown failed");
            }
        }))
        .await;
        self.sessions.clear();
    }
}

/// Names become folder names, so keep them to a single path segment.
fn validate_name(name: &str) -> SessionResult<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SessionError::InvalidRequest(format!(
            "invalid session name '{name}'"
        )));
    }
    Ok(())
}
