//! Proxy selection per session.
//!
//! An explicit proxy in the start request always wins. Otherwise the global settings
//! apply: a single server is shared by every session, a pool is spread over sessions
//! by load with a per-name stable tie-break.

use chatplex_common::{ProxyConfig, ProxyServers, ProxySettings};
use sha2::{Digest, Sha256};

/// A live session and the proxy it was started with.
#[derive(Debug, Clone)]
pub struct LiveProxy {
    pub name: String,
    pub proxy: Option<ProxyConfig>,
}

/// Pick the effective proxy for `name`.
pub fn resolve(
    requested: Option<&ProxyConfig>,
    settings: &ProxySettings,
    live: &[LiveProxy],
    name: &str,
) -> Option<ProxyConfig> {
    if let Some(proxy) = requested {
        return Some(proxy.clone());
    }

    let server = match settings.server.as_ref()? {
        ProxyServers::Single(server) => server.clone(),
        ProxyServers::Pool(pool) => pick_from_pool(pool, live, name)?,
    };

    Some(ProxyConfig {
        server,
        username: settings.username.clone(),
        password: settings.password.clone(),
    })
}

fn pick_from_pool(pool: &[String], live: &[LiveProxy], name: &str) -> Option<String> {
    if pool.is_empty() {
        return None;
    }

    // Sticky: a session already running keeps its proxy
    if let Some(current) = live
        .iter()
        .find(|s| s.name == name)
        .and_then(|s| s.proxy.as_ref())
        .filter(|p| pool.contains(&p.server))
    {
        return Some(current.server.clone());
    }

    let load = |server: &String| {
        live.iter()
            .filter(|s| s.name != name)
            .filter(|s| s.proxy.as_ref().is_some_and(|p| &p.server == server))
            .count()
    };

    let offset = stable_offset(name, pool.len());
    (0..pool.len())
        .map(|i| &pool[(offset + i) % pool.len()])
        .min_by_key(|server| load(server))
        .cloned()
}

/// Deterministic start index for a session name.
fn stable_offset(name: &str, len: usize) -> usize {
    let digest = Sha256::digest(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % len as u64) as usize
}
