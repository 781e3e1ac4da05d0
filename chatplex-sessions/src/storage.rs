//! Persisted session records.
//!
//! Records live next to the engine credentials:
//!
//! ```text
//! <sessions folder>/<engine>/<name>/            engine credential folder
//! <sessions folder>/<engine>/<name>/session.json { name, engine, config, status }
//! ```
//!
//! A session folder without `session.json` still counts as a known, stopped session.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::SessionResult;
use crate::session::{SessionConfig, SessionStatus};

const RECORD_FILE: &str = "session.json";

/// Durable state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    pub engine: Engine,
    #[serde(default)]
    pub config: Option<SessionConfig>,
    #[serde(default)]
    pub status: SessionStatus,
}

/// Durable store of session records, the source of truth for recovery.
#[async_trait]
pub trait SessionConfigRepository: Send + Sync {
    /// Prepare the backing store.
    async fn init(&self) -> SessionResult<()>;

    /// Every known session, live or not.
    async fn list(&self) -> SessionResult<Vec<SessionRecord>>;

    async fn get(&self, name: &str) -> SessionResult<Option<SessionRecord>>;

    async fn save(&self, record: &SessionRecord) -> SessionResult<()>;

    /// Record a status change, creating the record when missing.
    async fn update_status(
        &self,
        name: &str,
        engine: Engine,
        status: SessionStatus,
    ) -> SessionResult<()>;

    /// Forget a session together with its credentials.
    async fn clean(&self, name: &str) -> SessionResult<()>;

    /// Credential folder handed to the engine.
    fn auth_dir(&self, engine: Engine, name: &str) -> PathBuf;
}

/// File-system repository rooted at the sessions folder.
#[derive(Debug, Clone)]
pub struct FileSessionRepository {
    root: PathBuf,
}

impl FileSessionRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, engine: Engine, name: &str) -> PathBuf {
        self.auth_dir(engine, name).join(RECORD_FILE)
    }

    async fn read_record(&self, engine: Engine, name: &str) -> SessionResult<Option<SessionRecord>> {
        let path = self.record_path(engine, name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Unreadable session record, treating session as stopped"
                    );
                    Ok(Some(Self::bare_record(engine, name)))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Credentials without a record
                if tokio::fs::try_exists(self.auth_dir(engine, name)).await? {
                    Ok(Some(Self::bare_record(engine, name)))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn bare_record(engine: Engine, name: &str) -> SessionRecord {
        SessionRecord {
            name: name.to_string(),
            engine,
            config: None,
            status: SessionStatus::Stopped,
        }
    }

    async fn session_names(&self, engine: Engine) -> SessionResult<Vec<String>> {
        let dir = self.root.join(engine.folder_name());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn write_record(&self, record: &SessionRecord) -> SessionResult<()> {
        let dir = self.auth_dir(record.engine, &record.name);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(RECORD_FILE);
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        let content = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionConfigRepository for FileSessionRepository {
    async fn init(&self) -> SessionResult<()> {
        for engine in Engine::ALL {
            tokio::fs::create_dir_all(self.root.join(engine.folder_name())).await?;
        }
        Ok(())
    }

    async fn list(&self) -> SessionResult<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = Vec::new();
        for engine in Engine::ALL {
            for name in self.session_names(engine).await? {
                let Some(record) = self.read_record(engine, &name).await? else {
                    continue;
                };
                match records.iter_mut().find(|r| r.name == name) {
                    // Same name under two engines: the one with a config wins
                    Some(existing) if existing.config.is_none() && record.config.is_some() => {
                        *existing = record;
                    }
                    Some(_) => {}
                    None => records.push(record),
                }
            }
        }
        Ok(records)
    }

    async fn get(&self, name: &str) -> SessionResult<Option<SessionRecord>> {
        let mut found = None;
        for engine in Engine::ALL {
            if let Some(record) = self.read_record(engine, name).await? {
                if record.config.is_some() {
                    return Ok(Some(record));
                }
                found.get_or_insert(record);
            }
        }
        Ok(found)
    }

    async fn save(&self, record: &SessionRecord) -> SessionResult<()> {
        self.write_record(record).await
    }

    async fn update_status(
        &self,
        name: &str,
        engine: Engine,
        status: SessionStatus,
    ) -> SessionResult<()> {
        let mut record = self
            .read_record(engine, name)
            .await?
            .unwrap_or_else(|| Self::bare_record(engine, name));
        record.status = status;
        self.write_record(&record).await
    }

    async fn clean(&self, name: &str) -> SessionResult<()> {
        for engine in Engine::ALL {
            let dir = self.auth_dir(engine, name);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::info!(session = %name, path = %dir.display(), "Session data removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn auth_dir(&self, engine: Engine, name: &str) -> PathBuf {
        engine.auth_dir(&self.root, name)
    }
}
