//! Webhook delivery of session events.
//!
//! One [`WebhookConductor`] per session. It reads the session's event stream and
//! POSTs every event whose kind is in a webhook's filter. Each delivery runs on its
//! own task, so a slow endpoint never holds up the session. Failures are logged and
//! not retried.

use std::sync::Arc;
use std::time::Duration;

use chatplex_common::logging::generate_request_id;
use chatplex_common::WebhookConfig;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha512;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::engine::Engine;
use crate::session::{EventKind, SessionEvent};

type HmacSha512 = Hmac<Sha512>;

/// Filter entry matching every event.
pub const ALL_EVENTS: &str = "*";

pub const REQUEST_ID_HEADER: &str = "X-Webhook-Request-Id";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const HMAC_HEADER: &str = "X-Webhook-Hmac";
pub const HMAC_ALGORITHM_HEADER: &str = "X-Webhook-Hmac-Algorithm";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Body POSTed to webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub id: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub event: EventKind,
    pub session: String,
    pub engine: Engine,
    pub payload: serde_json::Value,
}

/// Delivers one session's events to its webhooks.
pub struct WebhookConductor {
    session: String,
    engine: Engine,
    webhooks: Vec<WebhookConfig>,
    http: reqwest::Client,
}

impl WebhookConductor {
    pub fn new(session: impl Into<String>, engine: Engine, webhooks: Vec<WebhookConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(session, engine, webhooks, http)
    }

    pub fn with_client(
        session: impl Into<String>,
        engine: Engine,
        webhooks: Vec<WebhookConfig>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            session: session.into(),
            engine,
            webhooks,
            http,
        }
    }

    pub fn webhooks(&self) -> &[WebhookConfig] {
        &self.webhooks
    }

    /// Consume the session's event stream until it closes.
    pub fn configure(self: Arc<Self>, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let span = chatplex_common::session_span!(self.session, self.engine, component = "webhook");
        tokio::spawn(
            async move {
                for webhook in &self.webhooks {
                    tracing::info!(url = %webhook.url, events = ?webhook.events, "Configuring webhook");
                }
                loop {
                    match events.recv().await {
                        Ok(event) => self.dispatch(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Webhook conductor lagging, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                tracing::debug!("Session event stream closed");
            }
            .instrument(span),
        )
    }

    /// Start a delivery for every webhook interested in `event`.
    pub fn dispatch(&self, event: &SessionEvent) {
        let kind = event.kind();
        let targets: Vec<&WebhookConfig> =
            self.webhooks.iter().filter(|w| matches(w, kind)).collect();
        if targets.is_empty() {
            return;
        }

        let payload = self.payload(event);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = %kind, error = %e, "Failed to encode webhook payload");
                return;
            }
        };

        for webhook in targets {
            let request = self.request(webhook, &body, payload.timestamp);
            let url = webhook.url.clone();
            tokio::spawn(
                async move {
                    match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            tracing::debug!(url = %url, event = %kind, "Webhook delivered");
                        }
                        Ok(response) => tracing::warn!(
                            url = %url,
                            event = %kind,
                            status = %response.status(),
                            "Webhook endpoint rejected delivery"
                        ),
                        Err(e) => tracing::warn!(
                            url = %url,
                            event = %kind,
                            error = %e,
                            "Webhook delivery failed"
                        ),
                    }
                }
                .in_current_span(),
            );
        }
    }

    fn payload(&self, event: &SessionEvent) -> WebhookPayload {
        WebhookPayload {
            id: generate_request_id(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            event: event.kind(),
            session: self.session.clone(),
            engine: self.engine,
            payload: event.payload(),
        }
    }

    fn request(&self, webhook: &WebhookConfig, body: &[u8], timestamp: i64) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, generate_request_id())
            .header(TIMESTAMP_HEADER, timestamp.to_string());

        if let Some(hmac) = &webhook.hmac {
            if let Some(signature) = sign(&hmac.key, body) {
                request = request
                    .header(HMAC_HEADER, signature)
                    .header(HMAC_ALGORITHM_HEADER, "sha512");
            }
        }
        for header in &webhook.custom_headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        request.body(body.to_vec())
    }
}

/// Whether a webhook wants events of this kind.
pub fn matches(webhook: &WebhookConfig, kind: EventKind) -> bool {
    webhook
        .events
        .iter()
        .any(|e| e == ALL_EVENTS || e == kind.as_str())
}

/// Hex HMAC-SHA512 of a body.
pub fn sign(key: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(key.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}
