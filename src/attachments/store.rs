//! Attachment storage boundary: write-once uploads returning a durable
//! reference.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::AttachmentError;

/// Durable storage for attachment copies.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Store `bytes` and return a reference. Storing the same file twice
    /// yields two distinct references.
    async fn put(
        &self,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<String, AttachmentError>;
}

/// Stores attachments as files under a root directory.
pub struct LocalAttachmentStore {
    root: PathBuf,
}

impl LocalAttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn put(
        &self,
        filename: &str,
        _content_type: &str,
        bytes: &[u8],
    ) -> Result<String, AttachmentError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let key = format!("{}-{}", Uuid::new_v4(), sanitize_filename(filename));
        let path = self.root.join(&key);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AttachmentError::Storage {
                filename: filename.to_string(),
                reason: e.to_string(),
            })?;
        debug!(path = %path.display(), size = bytes.len(), "Attachment stored");
        Ok(path.display().to_string())
    }
}

/// Replace anything but ASCII alphanumerics, `.`, `-`, `_` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}
