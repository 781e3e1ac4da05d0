//! HTTP bridge to an out-of-process engine runtime.
//!
//! The bridge hosts the engine-native clients. Each session is driven through a small
//! REST surface and reports back over Server-Sent Events:
//!
//! ```text
//! POST {endpoint}/sessions/{name}/start    body: TransportOptions
//! GET  {endpoint}/sessions/{name}/events   SSE stream of TransportEvent
//! POST {endpoint}/sessions/{name}/send     body: { chatId, content }
//! GET  {endpoint}/sessions/{name}/messages/{id}/media
//! POST {endpoint}/sessions/{name}/logout
//! POST {endpoint}/sessions/{name}/stop
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatplex_common::util::truncate_with_ellipsis;
use eventsource_client::{Client, SSE};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::{Transport, TransportConnector, TransportEvent, TransportOptions};
use crate::error::{SessionError, SessionResult};
use crate::message::{InboundMessage, MediaPayload, OutboundContent};

/// Bridge client settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge base URL (e.g., "http://127.0.0.1:3100")
    pub endpoint: String,
    /// Timeout for REST calls
    pub request_timeout: Duration,
    /// Event stream reconnect attempts before the session is reported lost
    pub max_retries: u32,
    /// Initial backoff between reconnects
    pub initial_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3100".to_string(),
            request_timeout: Duration::from_secs(30),
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Builds [`BridgeTransport`]s against one bridge.
pub struct BridgeConnector {
    config: BridgeConfig,
    http: reqwest::Client,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self::new(BridgeConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl TransportConnector for BridgeConnector {
    async fn build(&self, options: TransportOptions) -> SessionResult<Arc<dyn Transport>> {
        let endpoint = Url::parse(&self.config.endpoint).map_err(|e| {
            SessionError::TransportFailure(format!(
                "invalid bridge endpoint {}: {e}",
                self.config.endpoint
            ))
        })?;
        Ok(Arc::new(BridgeTransport {
            base: join_segments(&endpoint, &["sessions", options.session.as_str()])?,
            config: self.config.clone(),
            http: self.http.clone(),
            options,
            stream: Mutex::new(None),
        }))
    }
}

/// One session hosted by the bridge.
pub struct BridgeTransport {
    base: Url,
    config: BridgeConfig,
    http: reqwest::Client,
    options: TransportOptions,
    stream: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeTransport {
    async fn post(&self, path: &str, body: serde_json::Value) -> SessionResult<reqwest::Response> {
        let url = join_segments(&self.base, &[path])?;
        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::TransportFailure(format!("POST {url}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SessionError::TransportFailure(format!(
                "POST {url}: HTTP {status}: {}",
                truncate_with_ellipsis(&text, 200)
            )));
        }
        Ok(response)
    }

    async fn stop_stream(&self) {
        if let Some(handle) = self.stream.lock().await.take() {
            handle.abort();
        }
    }

    /// Follow the event stream, reconnecting with backoff.
    ///
    /// The retry budget and backoff start over whenever a connection delivers
    /// at least one event, so only consecutive failures count toward
    /// `max_retries`.
    async fn follow_events(config: BridgeConfig, url: String, tx: mpsc::Sender<TransportEvent>) {
        let mut retries = 0;
        let mut backoff = config.initial_backoff;

        let reason = loop {
            let mut delivered = false;
            let end = Self::connect_and_stream(&url, &tx, &mut delivered).await;
            if delivered {
                retries = 0;
                backoff = config.initial_backoff;
            }
            match end {
                Ok(StreamEnd::ReceiverDropped) => return,
                Ok(StreamEnd::Disconnected) => return,
                Ok(StreamEnd::Closed) => {
                    retries += 1;
                    if retries > config.max_retries {
                        break "event stream closed".to_string();
                    }
                    tracing::warn!(url = %url, retry = retries, "Bridge event stream ended, reconnecting...");
                }
                Err(e) => {
                    retries += 1;
                    if retries > config.max_retries {
                        break e;
                    }
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Bridge event stream error, reconnecting..."
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
        };

        tracing::error!(url = %url, reason = %reason, "Bridge event stream lost");
        let _ = tx.send(TransportEvent::Disconnected { reason }).await;
    }

    /// Stream one connection. `delivered` is set once an event reaches the session.
    async fn connect_and_stream(
        url: &str,
        tx: &mpsc::Sender<TransportEvent>,
        delivered: &mut bool,
    ) -> Result<StreamEnd, String> {
        let client = eventsource_client::ClientBuilder::for_url(url)
            .map_err(|e| format!("invalid event stream URL: {e}"))?
            .build();
        let mut stream = client.stream();

        while let Some(event) = stream.next().await {
            match event {
                Ok(SSE::Event(ev)) => match serde_json::from_str::<TransportEvent>(&ev.data) {
                    Ok(event) => {
                        let disconnected = matches!(event, TransportEvent::Disconnected { .. });
                        if tx.send(event).await.is_err() {
                            tracing::debug!("Transport event receiver dropped");
                            return Ok(StreamEnd::ReceiverDropped);
                        }
                        *delivered = true;
                        if disconnected {
                            return Ok(StreamEnd::Disconnected);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            event_type = %ev.event_type,
                            error = %e,
                            "Failed to parse bridge event"
                        );
                    }
                },
                // Heartbeats
                Ok(SSE::Comment(_)) => {}
                Ok(SSE::Connected(_)) => {
                    tracing::debug!(url = %url, "Bridge event stream connected");
                }
                Err(e) => return Err(format!("event stream error: {e}")),
            }
        }

        Ok(StreamEnd::Closed)
    }
}

enum StreamEnd {
    Closed,
    Disconnected,
    ReceiverDropped,
}

/// Append percent-encoded path segments to `base`.
fn join_segments(base: &Url, segments: &[&str]) -> SessionResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| {
            SessionError::TransportFailure(format!("bridge endpoint cannot take a path: {base}"))
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> SessionResult<()> {
        self.post(
            "start",
            json!({
                "engine": self.options.engine,
                "authDir": self.options.auth_dir,
                "proxy": self.options.proxy,
                "settings": self.options.settings,
            }),
        )
        .await?;

        let url = join_segments(&self.base, &["events"])?;
        let handle = tokio::spawn(Self::follow_events(
            self.config.clone(),
            url.to_string(),
            events,
        ));
        if let Some(previous) = self.stream.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(
        &self,
        chat_id: &str,
        content: OutboundContent,
    ) -> SessionResult<serde_json::Value> {
        let response = self
            .post("send", json!({ "chatId": chat_id, "content": content }))
            .await?;
        response
            .json()
            .await
            .map_err(|e| SessionError::TransportFailure(format!("invalid send response: {e}")))
    }

    async fn download_media(
        &self,
        message: &InboundMessage,
    ) -> SessionResult<Option<MediaPayload>> {
        let url = join_segments(&self.base, &["messages", message.id.as_str(), "media"])?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| SessionError::TransportFailure(format!("GET {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SessionError::TransportFailure(format!(
                "GET {url}: HTTP {}",
                response.status()
            )));
        }

        let mimetype = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response
            .bytes()
            .await
            .map_err(|e| SessionError::TransportFailure(format!("GET {url}: {e}")))?;

        Ok(Some(MediaPayload {
            mimetype,
            data: data.to_vec(),
        }))
    }

    async fn logout(&self) -> SessionResult<()> {
        self.post("logout", json!({})).await?;
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.stop_stream().await;
        self.post("stop", json!({})).await?;
        Ok(())
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            if let Some(handle) = stream.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::message::MediaKind;
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(session: &str) -> TransportOptions {
        TransportOptions {
            engine: Engine::NoWeb,
            session: session.to_string(),
            auth_dir: PathBuf::from("/tmp/noweb/alice"),
            proxy: None,
            settings: json!({}),
        }
    }

    async fn transport(server: &MockServer) -> Arc<dyn Transport> {
        BridgeConnector::with_endpoint(server.uri())
            .build(options("alice"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_posts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/alice/send"))
            .and(body_partial_json(json!({
                "chatId": "123@c.us",
                "content": { "type": "text", "text": "hi" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "out1" })))
            .expect(1)
            .mount(&server)
            .await;

        let result = transport(&server)
            .await
            .send("123@c.us", OutboundContent::Text { text: "hi".into() })
            .await
            .unwrap();
        assert_eq!(result["id"], "out1");
    }

    #[tokio::test]
    async fn test_send_media_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/alice/send"))
            .and(body_partial_json(json!({
                "content": { "type": "media", "kind": "audio", "ptt": true }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let media = crate::message::OutboundMedia {
            kind: MediaKind::Audio,
            source: crate::message::MediaSource::Url("https://example.com/a.ogg".into()),
            mimetype: None,
            filename: None,
            caption: None,
            ptt: true,
            as_document: false,
        };
        transport(&server)
            .await
            .send("123@c.us", OutboundContent::Media(media))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bridge_error_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/alice/start"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (tx, _rx) = mpsc::channel(8);
        let result = transport(&server).await.connect(tx).await;
        assert!(matches!(result, Err(SessionError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_download_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/alice/messages/m1/media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"\xff\xd8\xff".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sessions/alice/messages/m2/media"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        let mut message: InboundMessage =
            serde_json::from_value(json!({ "id": "m1", "from": "1@c.us" })).unwrap();

        let payload = transport.download_media(&message).await.unwrap().unwrap();
        assert_eq!(payload.mimetype.as_deref(), Some("image/jpeg"));
        assert_eq!(payload.data, b"\xff\xd8\xff");

        message.id = "m2".into();
        assert!(transport.download_media(&message).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_media_escapes_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/alice/messages/true_1@c.us_3A%2FB%3Fx%23y/media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"\x89PNG".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let message: InboundMessage =
            serde_json::from_value(json!({ "id": "true_1@c.us_3A/B?x#y", "from": "1@c.us" }))
                .unwrap();
        let payload = transport(&server)
            .await
            .download_media(&message)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.mimetype.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_transport_failure() {
        let result = BridgeConnector::with_endpoint("not a url")
            .build(options("alice"))
            .await;
        assert!(matches!(result, Err(SessionError::TransportFailure(_))));
    }

    fn fast_retry_config(server: &MockServer, max_retries: u32) -> BridgeConfig {
        BridgeConfig {
            endpoint: server.uri(),
            max_retries,
            initial_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_event_stream_retries_reset_after_delivery() {
        let server = MockServer::start().await;
        // Every connection delivers one event and then closes.
        Mock::given(method("GET"))
            .and(path("/sessions/alice/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"type\":\"ready\"}\n\n"),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let url = format!("{}/sessions/alice/events", server.uri());
        let handle = tokio::spawn(BridgeTransport::follow_events(
            fast_retry_config(&server, 1),
            url,
            tx,
        ));

        // More reconnects than max_retries allows in a row.
        for _ in 0..4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(
                matches!(event, TransportEvent::Ready { .. }),
                "unexpected event {event:?}"
            );
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_event_stream_lost_after_consecutive_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/alice/events"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let url = format!("{}/sessions/alice/events", server.uri());
        tokio::spawn(BridgeTransport::follow_events(
            fast_retry_config(&server, 2),
            url,
            tx,
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Disconnected { .. }));
    }

    #[test]
    fn test_event_wire_format() {
        let qr: TransportEvent = serde_json::from_str(r#"{"type":"qr","value":"2@abc"}"#).unwrap();
        assert!(matches!(qr, TransportEvent::Qr { value } if value == "2@abc"));

        let ready: TransportEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(ready, TransportEvent::Ready { me: None }));

        let message: TransportEvent =
            serde_json::from_str(r#"{"type":"message","id":"m1","from":"1@c.us"}"#).unwrap();
        assert!(matches!(message, TransportEvent::Message(m) if m.id == "m1"));
    }
}
