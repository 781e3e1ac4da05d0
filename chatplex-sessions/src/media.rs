//! Media file store shared by every session.
//!
//! Downloaded attachments are written to a single folder and served back through a
//! public base URL. Each saved file removes itself after the configured lifetime.
//! Pending removals live in memory only; files still on disk when the process dies
//! are cleared by [`MediaStore::purge`] on the next boot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chatplex_common::util::format_bytes;
use chatplex_common::FilesConfig;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

/// Mimetype used when neither the caller nor the content tells us anything.
const FALLBACK_MIMETYPE: &str = "application/octet-stream";

/// Upper bound on `<id>-<n>` name attempts for a single save.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// A file written by the store.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub message_id: String,
    pub mimetype: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Time-bounded media cache.
#[derive(Debug, Clone)]
pub struct MediaStore {
    folder: PathBuf,
    base_url: String,
    lifetime: Duration,
    mimetypes: Option<Vec<String>>,
    scope: String,
}

impl MediaStore {
    /// Create a store from the files configuration.
    pub fn new(config: &FilesConfig) -> Self {
        Self {
            folder: config.folder.clone(),
            base_url: config.url.clone(),
            lifetime: Duration::from_secs(config.lifetime_secs),
            mimetypes: config.mimetypes.clone(),
            scope: "storage".to_string(),
        }
    }

    /// Tag log lines with the owning session.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Override the file lifetime.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Check that files with this mimetype are worth storing.
    pub fn need_to_download(&self, mimetype: &str) -> bool {
        match &self.mimetypes {
            // No allow-list (or an empty one) - store everything
            None => true,
            Some(types) if types.is_empty() => true,
            Some(types) => types.iter().any(|t| mimetype.starts_with(t.as_str())),
        }
    }

    /// Persist a buffer and return its public URL.
    ///
    /// Returns an empty string when the mimetype is filtered out or the write fails;
    /// callers treat that as "not stored".
    pub async fn save(&self, message_id: &str, mimetype: Option<&str>, data: &[u8]) -> String {
        match self.store(message_id, mimetype, data).await {
            Ok(Some(file)) => {
                let filename = file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}{}", self.base_url, filename)
            }
            Ok(None) => String::new(),
            Err(e) => {
                tracing::error!(
                    scope = %self.scope,
                    message_id = %message_id,
                    error = %e,
                    "Failed to save media file"
                );
                String::new()
            }
        }
    }

    /// Write the file and schedule its removal.
    ///
    /// `Ok(None)` means the mimetype is not on the allow-list.
    pub async fn store(
        &self,
        message_id: &str,
        mimetype: Option<&str>,
        data: &[u8],
    ) -> std::io::Result<Option<MediaFile>> {
        let mimetype = match mimetype.filter(|m| !m.trim().is_empty()) {
            Some(m) => m.to_string(),
            None => sniff_mimetype(data).unwrap_or(FALLBACK_MIMETYPE).to_string(),
        };

        if !self.need_to_download(&mimetype) {
            tracing::info!(
                scope = %self.scope,
                "The message {message_id} has {mimetype} media, skip it."
            );
            return Ok(None);
        }

        let extension = extension_for(&mimetype);
        let stem = sanitize_stem(message_id);
        let (path, file) = self.create_unique(&stem, &extension).await?;
        write_or_discard(&path, file, data).await?;

        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(self.lifetime).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::debug!(
            scope = %self.scope,
            path = %path.display(),
            size = %format_bytes(data.len() as u64),
            "Media file written"
        );
        self.postpone_removal(path.clone());

        Ok(Some(MediaFile {
            message_id: message_id.to_string(),
            mimetype,
            path,
            created_at,
            expires_at,
        }))
    }

    /// Create `<stem>.<ext>`, or `<stem>-<n>.<ext>` while a previous save is still live.
    async fn create_unique(
        &self,
        stem: &str,
        extension: &str,
    ) -> std::io::Result<(PathBuf, tokio::fs::File)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let filename = if attempt == 0 {
                format!("{stem}.{extension}")
            } else {
                format!("{stem}-{attempt}.{extension}")
            };
            let path = self.folder.join(filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for {stem}.{extension}"),
        ))
    }

    /// Remove the file once its lifetime has passed. Not cancellable.
    fn postpone_removal(&self, path: PathBuf) {
        let lifetime = self.lifetime;
        let scope = self.scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::info!(scope = %scope, "File {} was removed", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::debug!(
                    scope = %scope,
                    path = %path.display(),
                    error = %e,
                    "Expired file could not be removed"
                ),
            }
        });
    }

    /// Empty the media folder, creating it when missing. Never fails.
    pub async fn purge(&self) {
        match tokio::fs::try_exists(&self.folder).await {
            Ok(true) => self.clear_folder().await,
            Ok(false) => match tokio::fs::create_dir_all(&self.folder).await {
                Ok(()) => tracing::info!(
                    "Directory '{}' created from scratch",
                    self.folder.display()
                ),
                Err(e) => tracing::error!(
                    folder = %self.folder.display(),
                    error = %e,
                    "Failed to create media folder"
                ),
            },
            Err(e) => tracing::error!(
                folder = %self.folder.display(),
                error = %e,
                "Failed to inspect media folder"
            ),
        }
    }

    async fn clear_folder(&self) {
        let mut entries = match tokio::fs::read_dir(&self.folder).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(folder = %self.folder.display(), error = %e, "Failed to read media folder");
                return;
            }
        };

        let mut deleted = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list media folder");
                    break;
                }
            };
            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match removed {
                Ok(()) => deleted.push(path.display().to_string()),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete"),
            }
        }

        if !deleted.is_empty() {
            tracing::info!("Deleted files and directories:\n{}", deleted.join("\n"));
        }
    }
}

/// Keep message IDs usable as file names.
fn sanitize_stem(message_id: &str) -> String {
    let stem: String = message_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match stem.trim_start_matches('.') {
        "" => "media".to_string(),
        s => s.to_string(),
    }
}

/// Canonical file extension for a mimetype.
pub fn extension_for(mimetype: &str) -> String {
    let essence = mimetype
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    let preferred = match essence.as_str() {
        "image/jpeg" => Some("jpeg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "audio/ogg" => Some("oga"),
        "audio/mpeg" => Some("mp3"),
        "audio/mp4" => Some("m4a"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        "application/octet-stream" => Some("bin"),
        _ => None,
    };
    if let Some(ext) = preferred {
        return ext.to_string();
    }

    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map_or_else(|| "bin".to_string(), |ext| (*ext).to_string())
}

/// Guess a mimetype from the leading bytes of the content.
pub fn sniff_mimetype(data: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(usize, &[u8], &str)] = &[
        (0, b"\x89PNG\r\n\x1a\n", "image/png"),
        (0, b"\xff\xd8\xff", "image/jpeg"),
        (0, b"GIF87a", "image/gif"),
        (0, b"GIF89a", "image/gif"),
        (0, b"%PDF-", "application/pdf"),
        (0, b"OggS", "audio/ogg"),
        (0, b"ID3", "audio/mpeg"),
        (0, b"\x1a\x45\xdf\xa3", "video/webm"),
        (0, b"PK\x03\x04", "application/zip"),
        (4, b"ftyp", "video/mp4"),
    ];

    for (offset, magic, mimetype) in SIGNATURES {
        if data.len() >= offset + magic.len() && &data[*offset..offset + magic.len()] == *magic {
            return Some(*mimetype);
        }
    }

    // RIFF containers carry their format at offset 8
    if data.len() >= 12 && &data[..4] == b"RIFF" {
        return match &data[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            _ => None,
        };
    }

    // MPEG audio frame sync
    if data.len() >= 2 && data[0] == 0xff && (data[1] & 0xe0) == 0xe0 {
        return Some("audio/mpeg");
    }

    None
}

/// Write `data` to a freshly created file, removing the file if the write fails.
async fn write_or_discard(
    path: &Path,
    mut file: tokio::fs::File,
    data: &[u8],
) -> std::io::Result<()> {
    let written = async {
        file.write_all(data).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        drop(file);
        if let Err(remove) = tokio::fs::remove_file(path).await {
            tracing::debug!(
                path = %path.display(),
                error = %remove,
                "Failed to remove partial media file"
            );
        }
        return Err(e);
    }
    Ok(())
}
