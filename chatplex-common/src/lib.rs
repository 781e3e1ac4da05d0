//! Chatplex Common - Shared configuration, logging and utilities for chatplex services.
//!
//! This crate provides:
//! - Configuration types and layered loading (`config.json` + `secrets.json`)
//! - Webhook and proxy wire types shared by every session
//! - Logging setup and structured logging helpers
//! - Small utility functions

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod config_loader;
pub mod logging;
pub mod util;

pub use config::{
    Config, EngineConfig, FilesConfig, HmacConfig, ObservabilityConfig, ProxyConfig,
    ProxyServers, ProxySettings, ServerConfig, SessionsConfig, WebhookConfig, WebhookHeader,
};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, FilesConfig, ProxyConfig, ProxySettings, WebhookConfig};
    pub use crate::logging::init_logging;
}
