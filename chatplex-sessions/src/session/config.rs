//! Per-session configuration supplied at start.

use chatplex_common::{ProxyConfig, WebhookConfig};
use serde::{Deserialize, Serialize};

/// Configuration of one session.
///
/// The known fields drive the manager; anything else is kept verbatim and handed
/// back in API responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Engine name; the process default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Explicit proxy for this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Session-specific webhooks, delivered before the global one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookConfig>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
