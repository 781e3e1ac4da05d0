//! Chatplex Sessions - Multi-session chat orchestration.
//!
//! This crate runs any number of chat sessions side by side, each backed by one of
//! the supported engines:
//! - WEBJS (browser web client)
//! - NOWEB (multi-device socket)
//! - VENOM (browser automation)
//!
//! ## Architecture
//!
//! ```text
//! HTTP API → SessionManager → Session ── Transport (engine bridge)
//!                                │
//!                                ├── MediaStore (downloaded attachments)
//!                                └── events → WebhookConductor → webhooks
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod engine;
pub mod error;
pub mod manager;
pub mod media;
pub mod message;
pub mod proxy;
pub mod routes;
pub mod session;
pub mod storage;
pub mod webhook;

// Re-export commonly used types
pub use engine::{
    BridgeConnector, Engine, StoredMedia, Transport, TransportConnector, TransportEvent,
    TransportOptions,
};
pub use error::{SessionError, SessionResult};
pub use manager::{BootReport, LogoutRequest, ManagerSettings, SessionManager, StartRequest, StopRequest};
pub use media::{MediaFile, MediaStore};
pub use message::{
    AttachmentFile, InboundMessage, MediaKind, MediaPayload, MediaSource, OutboundContent,
    OutboundMedia, SendFileRequest, SendTextRequest,
};
pub use routes::{build_router, create_state, AppState};
pub use session::{EventKind, Session, SessionConfig, SessionEvent, SessionInfo, SessionStatus};
pub use storage::{FileSessionRepository, SessionConfigRepository, SessionRecord};
pub use webhook::WebhookConductor;

use chatplex_common::config::Config;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the API router with CORS middleware.
pub fn build_app(manager: Arc<SessionManager>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    build_router(create_state(manager)).layer(cors)
}

/// Boot the session manager and serve the API until ctrl-c.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = config.bind_address();

    let manager = Arc::new(SessionManager::from_config(config));
    let report = manager.boot().await;
    for (name, error) in &report.failed {
        tracing::warn!(session = %name, error = %error, "Session did not start at boot");
    }

    let router = build_app(manager.clone());

    tracing::info!("Starting Chatplex on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Sessions stay recoverable on the next boot
    manager.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
