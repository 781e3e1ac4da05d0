//! Layered configuration loader.
//!
//! Loads configuration from up to two files in the config directory:
//! - `config.json` - Core configuration
//! - `secrets.json` - Credentials (webhook HMAC keys, proxy passwords)
//!
//! `secrets.json` is deep-merged over `config.json`, so it may carry any subset of the
//! same structure (e.g. `{ "proxy": { "password": "..." } }`).

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration file names, lowest priority first
pub const CONFIG_FILES: &[&str] = &["config.json", "secrets.json"];

/// Load a JSON file and return its contents as a Value.
/// Returns None if file doesn't exist.
fn load_json_file(path: &PathBuf) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(value))
}

/// Deep merge two JSON values.
/// Source values override target values, with object merging at each level.
pub fn merge_json(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(&key) {
                    Some(target_value) => {
                        merge_json(target_value, source_value);
                    }
                    None => {
                        target_map.insert(key, source_value);
                    }
                }
            }
        }
        (target, source) => {
            *target = source;
        }
    }
}

/// Load every configuration layer from `dir` and merge them.
///
/// Returns an empty object when no file exists.
pub fn load_layered_config(dir: &Path) -> Result<Value> {
    let mut config = Value::Object(Default::default());

    tracing::debug!("Loading config from {}", dir.display());

    for file in CONFIG_FILES {
        if let Some(layer) = load_json_file(&dir.join(file))? {
            // Filter out meta-fields ($schema, _comment, etc.)
            let layer = match layer {
                Value::Object(map) => Value::Object(
                    map.into_iter()
                        .filter(|(key, _)| !key.starts_with('$') && !key.starts_with('_'))
                        .collect(),
                ),
                other => other,
            };
            merge_json(&mut config, layer);
            tracing::debug!("Loaded {file}");
        }
    }

    Ok(config)
}
