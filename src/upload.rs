//! Upload orchestration.
//!
//! Turns a received file into a blob: validate the name, derive the blob
//! name, then drive the storage backend through authenticate, ensure
//! container and upload.  Steps run strictly in order and the first
//! failure ends the upload; nothing is retried.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;

use crate::errors::UploadError;
use crate::storage::backend::StorageBackend;

/// Name used when sanitizing leaves nothing behind.
const FALLBACK_FILENAME: &str = "file";

/// Content type for files the browser did not label.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A file as received from the form.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Filename as sent by the client.  Untrusted.
    pub filename: String,
    /// Content type sent with the part, if any.
    pub content_type: Option<String>,
    /// File contents.
    pub data: Bytes,
}

/// What a successful upload produced.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub blob_name: BlobName,
    /// The sanitized filename (without the timestamp prefix).
    pub filename: String,
    /// URL of the written blob.
    pub url: String,
    pub size: usize,
}

/// Blob name of the form `{YYYYMMDD_HHMMSS}_{sanitized filename}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobName(String);

impl BlobName {
    /// Build a blob name from an already sanitized filename.
    pub fn new(now: DateTime<Utc>, sanitized: &str) -> Self {
        BlobName(format!("{}_{}", now.format("%Y%m%d_%H%M%S"), sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduce an untrusted filename to a safe, flat blob key component.
///
/// The name is NFKD-normalized first, so `é` becomes `e`.  Remaining
/// non-ASCII characters are dropped, path separators become word breaks,
/// whitespace runs collapse to `_`, anything outside `[A-Za-z0-9_.-]` is
/// removed and leading/trailing `.`/`_` are trimmed.  The result never
/// contains `/` or `\`.
pub fn sanitize_filename(filename: &str) -> String {
    let spaced: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Drives one upload through the storage backend.
#[derive(Clone)]
pub struct Uploader {
    storage: Arc<dyn StorageBackend>,
    max_upload_size: usize,
}

impl Uploader {
    pub fn new(storage: Arc<dyn StorageBackend>, max_upload_size: usize) -> Self {
        Self {
            storage,
            max_upload_size,
        }
    }

    /// Upload `request` with a blob name stamped at `now`.
    pub async fn upload(
        &self,
        request: UploadRequest,
        now: DateTime<Utc>,
    ) -> Result<UploadOutcome, UploadError> {
        // Validated
        if request.filename.is_empty() {
            return Err(UploadError::NoFileSelected);
        }
        if request.data.len() > self.max_upload_size {
            return Err(UploadError::PayloadTooLarge {
                limit: self.max_upload_size,
            });
        }

        let filename = sanitize_filename(&request.filename);
        let blob_name = BlobName::new(now, &filename);
        let size = request.data.len();
        let content_type = request
            .content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        info!("Uploading file: {}, Size: {} bytes", filename, size);

        // Authenticated
        self.storage
            .authenticate()
            .await
            .map_err(UploadError::Authentication)?;

        // ContainerEnsured
        self.storage
            .ensure_container()
            .await
            .map_err(UploadError::Storage)?;
        debug!("Container ready for {}", blob_name);

        // Uploaded
        let url = self
            .storage
            .upload(blob_name.as_str(), request.data, &content_type)
            .await
            .map_err(UploadError::Storage)?;

        info!("File uploaded successfully: {}", url);

        Ok(UploadOutcome {
            blob_name,
            filename,
            url,
            size,
        })
    }
}
