//! Attachment packager: user files to encoded, size-checked payloads.
//!
//! Oversized files are dropped with a reason before anything else happens.
//! Accepted files are base64-encoded and a durable copy is written through
//! the [`AttachmentStore`]. A storage failure drops that file (reported),
//! it never aborts the run.

pub mod store;

use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AttachmentError;

pub use store::{AttachmentStore, LocalAttachmentStore};

/// A file supplied by the user.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    /// Explicit content type; inferred from the extension when `None`.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            bytes,
        }
    }

    /// Read a file from disk.
    pub async fn from_path(path: &Path) -> Result<Self, AttachmentError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::new(filename, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Transmittable form of an accepted file. Contains no recipient data, so
/// one payload is shared by every message in a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Standard base64 of the file content.
    pub data: String,
    /// Durable reference returned by the attachment store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl EncodedAttachment {
    /// Decode the payload back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, AttachmentError> {
        STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| AttachmentError::Decode {
                filename: self.filename.clone(),
                reason: e.to_string(),
            })
    }
}

/// A file left out of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedAttachment {
    pub filename: String,
    pub reason: String,
}

/// Result of packaging a set of files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagedAttachments {
    pub accepted: Vec<EncodedAttachment>,
    pub rejected: Vec<RejectedAttachment>,
}

/// Validates, encodes, and stores user files.
pub struct AttachmentPackager {
    store: Arc<dyn AttachmentStore>,
    max_bytes: u64,
}

impl AttachmentPackager {
    pub fn new(store: Arc<dyn AttachmentStore>, max_bytes: u64) -> Self {
        Self { store, max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Package `files`. Never fails as a whole; per-file problems land in
    /// `rejected`.
    pub async fn package(&self, files: Vec<FileUpload>) -> PackagedAttachments {
        let mut packaged = PackagedAttachments::default();

        for file in files {
            let size = file.size();
            if size > self.max_bytes {
                let err = AttachmentError::TooLarge {
                    filename: file.filename.clone(),
                    size,
                    limit: self.max_bytes,
                };
                warn!(filename = %file.filename, size, limit = self.max_bytes, "Attachment over size limit");
                packaged.rejected.push(RejectedAttachment {
                    filename: file.filename,
                    reason: err.to_string(),
                });
                continue;
            }

            let content_type = file
                .content_type
                .clone()
                .unwrap_or_else(|| infer_content_type(&file.filename));

            let reference = match self
                .store
                .put(&file.filename, &content_type, &file.bytes)
                .await
            {
                Ok(reference) => reference,
                Err(e) => {
                    warn!(filename = %file.filename, error = %e, "Attachment storage failed, dropping file");
                    packaged.rejected.push(RejectedAttachment {
                        filename: file.filename,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            packaged.accepted.push(EncodedAttachment {
                data: STANDARD.encode(&file.bytes),
                filename: file.filename,
                content_type,
                size,
                reference: Some(reference),
            });
        }

        info!(
            accepted = packaged.accepted.len(),
            rejected = packaged.rejected.len(),
            "Attachments packaged"
        );
        packaged
    }
}

/// Guess a MIME type from the file extension.
pub fn infer_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .to_string()
}
