//! Configuration management for chatplex.
//!
//! The service reads a single configuration file at `~/.chatplex/config.json`,
//! with credentials optionally split out into `~/.chatplex/secrets.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CHATPLEX_* prefix)
//! 2. `secrets.json` values
//! 3. `config.json` values
//! 4. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Server
//! - `CHATPLEX_HOST` → server.host
//! - `CHATPLEX_PORT` → server.port
//!
//! ## Engines and sessions
//! - `CHATPLEX_DEFAULT_ENGINE` → engine.default
//! - `CHATPLEX_ENGINE_BRIDGE_URL` → engine.bridge_url
//! - `CHATPLEX_SESSIONS_FOLDER` → sessions.folder
//! - `CHATPLEX_RESTART_ALL_SESSIONS` → sessions.restart_all
//! - `CHATPLEX_START_SESSION` → sessions.start (comma separated)
//!
//! ## Media files
//! - `CHATPLEX_FILES_FOLDER` → files.folder
//! - `CHATPLEX_FILES_URL` → files.url
//! - `CHATPLEX_FILES_LIFETIME` → files.lifetime_secs
//! - `CHATPLEX_FILES_MIMETYPES` → files.mimetypes (comma separated)
//!
//! ## Webhook and proxy
//! - `CHATPLEX_WEBHOOK_URL`, `CHATPLEX_WEBHOOK_EVENTS`, `CHATPLEX_WEBHOOK_HMAC_KEY` → webhook
//! - `CHATPLEX_PROXY_SERVER` (comma separated), `CHATPLEX_PROXY_USERNAME`,
//!   `CHATPLEX_PROXY_PASSWORD` → proxy
//!
//! ## Logging
//! - `CHATPLEX_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

use crate::config_loader::load_layered_config;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".chatplex"),
        |dirs| dirs.home_dir().join(".chatplex"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration for the chatplex service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine selection and bridge endpoint
    #[serde(default)]
    pub engine: EngineConfig,

    /// Session persistence and boot behaviour
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Media file store
    #[serde(default)]
    pub files: FilesConfig,

    /// Global webhook, appended to every session's own webhooks
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,

    /// Global proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default directory, then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(config_dir())
    }

    /// Load configuration from a specific directory, then apply env overrides.
    pub fn load_from_dir(dir: PathBuf) -> Result<Self> {
        let value = load_layered_config(&dir)?;
        let mut config: Self = if value.as_object().map_or(true, |o| o.is_empty()) {
            tracing::info!("Config file not found, using defaults");
            Self::default()
        } else {
            serde_json::from_value(value)
                .with_context(|| format!("Failed to parse config from {}", dir.display()))?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CHATPLEX_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CHATPLEX_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        if let Some(engine) = lookup("CHATPLEX_DEFAULT_ENGINE") {
            self.engine.default = engine;
        }
        if let Some(url) = lookup("CHATPLEX_ENGINE_BRIDGE_URL") {
            self.engine.bridge_url = url;
        }

        if let Some(folder) = lookup("CHATPLEX_SESSIONS_FOLDER") {
            self.sessions.folder = PathBuf::from(folder);
        }
        if let Some(flag) = lookup("CHATPLEX_RESTART_ALL_SESSIONS") {
            self.sessions.restart_all = parse_flag(&flag);
        }
        if let Some(names) = lookup("CHATPLEX_START_SESSION") {
            self.sessions.start = split_list(&names);
        }

        if let Some(folder) = lookup("CHATPLEX_FILES_FOLDER") {
            self.files.folder = PathBuf::from(folder);
        }
        if let Some(url) = lookup("CHATPLEX_FILES_URL") {
            self.files.url = url;
        }
        if let Some(secs) = lookup("CHATPLEX_FILES_LIFETIME").and_then(|s| s.parse().ok()) {
            self.files.lifetime_secs = secs;
        }
        if let Some(types) = lookup("CHATPLEX_FILES_MIMETYPES") {
            let types = split_list(&types);
            self.files.mimetypes = (!types.is_empty()).then_some(types);
        }

        if let Some(url) = lookup("CHATPLEX_WEBHOOK_URL") {
            let events = lookup("CHATPLEX_WEBHOOK_EVENTS")
                .map(|e| split_list(&e))
                .unwrap_or_else(|| vec!["*".to_string()]);
            let hmac = lookup("CHATPLEX_WEBHOOK_HMAC_KEY").map(|key| HmacConfig { key });
            self.webhook = Some(WebhookConfig {
                url,
                events,
                hmac,
                custom_headers: vec![],
            });
        }

        if let Some(servers) = lookup("CHATPLEX_PROXY_SERVER") {
            let mut servers = split_list(&servers);
            self.proxy.server = match servers.len() {
                0 => None,
                1 => servers.pop().map(ProxyServers::Single),
                _ => Some(ProxyServers::Pool(servers)),
            };
        }
        if let Some(username) = lookup("CHATPLEX_PROXY_USERNAME") {
            self.proxy.username = Some(username);
        }
        if let Some(password) = lookup("CHATPLEX_PROXY_PASSWORD") {
            self.proxy.password = Some(password);
        }

        if let Some(level) = lookup("CHATPLEX_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }

    /// Socket address string the HTTP server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(s: &str) -> bool {
    matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// ============================================================================
// Sections
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine used when a session's own config does not name one
    #[serde(default = "default_engine")]
    pub default: String,

    /// Base URL of the out-of-process engine bridge
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default: default_engine(),
            bridge_url: default_bridge_url(),
        }
    }
}

/// Session persistence and boot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Root folder for engine credentials and persisted session records
    #[serde(default = "default_sessions_folder")]
    pub folder: PathBuf,

    /// Restart every session that was running when the process went down
    #[serde(default)]
    pub restart_all: bool,

    /// Session names started on boot
    #[serde(default)]
    pub start: Vec<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            folder: default_sessions_folder(),
            restart_all: false,
            start: vec![],
        }
    }
}

/// Media file store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Directory holding downloaded media, shared by all sessions
    #[serde(default = "default_files_folder")]
    pub folder: PathBuf,

    /// Public base URL; the file name is appended to it
    #[serde(default = "default_files_url")]
    pub url: String,

    /// Seconds a saved file lives before it is removed
    #[serde(default = "default_files_lifetime")]
    pub lifetime_secs: u64,

    /// Mimetype prefixes worth storing (`None` stores everything)
    #[serde(default)]
    pub mimetypes: Option<Vec<String>>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            folder: default_files_folder(),
            url: default_files_url(),
            lifetime_secs: default_files_lifetime(),
            mimetypes: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Webhook and proxy wire types
// ============================================================================

/// A webhook endpoint receiving session events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Endpoint receiving the POST
    pub url: String,

    /// Event names to deliver; `"*"` matches everything
    #[serde(default)]
    pub events: Vec<String>,

    /// Optional body signing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<HmacConfig>,

    /// Extra headers sent with every delivery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_headers: Vec<WebhookHeader>,
}

/// HMAC signing key for webhook bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacConfig {
    pub key: String,
}

/// A single custom webhook header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookHeader {
    pub name: String,
    pub value: String,
}

/// Effective proxy for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` or a full URL
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Proxy URL with credentials embedded, as HTTP agents expect it.
    ///
    /// Credentials are percent-encoded. Returns `None` when `server` is not
    /// a usable host.
    pub fn url(&self) -> Option<String> {
        let raw = if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("http://{}", self.server)
        };
        let mut url = Url::parse(&raw).ok()?;
        if let Some(user) = &self.username {
            url.set_username(user).ok()?;
            url.set_password(self.password.as_deref()).ok()?;
        }
        Some(url.to_string())
    }
}

/// Global proxy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    /// One server for every session, or a rotation pool
    #[serde(default)]
    pub server: Option<ProxyServers>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Either a single proxy server or a pool to rotate over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyServers {
    Single(String),
    Pool(Vec<String>),
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}
fn default_engine() -> String {
    "WEBJS".into()
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:3100".into()
}
fn default_sessions_folder() -> PathBuf {
    PathBuf::from(".sessions")
}
fn default_files_folder() -> PathBuf {
    PathBuf::from("/tmp/chatplex-files")
}
fn default_files_url() -> String {
    "http://localhost:3000/api/files/".into()
}
fn default_files_lifetime() -> u64 {
    180
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
