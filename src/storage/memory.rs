//! In-memory storage backend.
//!
//! Blobs are held in a `tokio::sync::RwLock<HashMap<...>>` keyed by blob
//! name.  Used for local development (`storage.backend: memory`) and as
//! the backend under test for the HTTP layer.  Every trait call is
//! counted so callers can check whether the store was touched at all.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::backend::StorageBackend;

/// A stored blob and the content type it was written with.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub content_type: String,
    /// Quoted MD5 hex, like the ETag a real blob service would return.
    pub etag: String,
}

/// In-memory storage backend.
pub struct MemoryBackend {
    /// Name shown in blob URLs.
    container: String,
    /// Whether `ensure_container` has created the container yet.
    container_created: tokio::sync::RwLock<bool>,
    /// blob name -> blob.
    blobs: tokio::sync::RwLock<HashMap<String, StoredBlob>>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    /// Number of trait calls served.
    calls: AtomicUsize,
    /// When set, `authenticate` fails as if no identity were available.
    deny_auth: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend for `container`.
    pub fn new(container: &str, max_size_bytes: u64) -> Self {
        Self {
            container: container.to_string(),
            container_created: tokio::sync::RwLock::new(false),
            blobs: tokio::sync::RwLock::new(HashMap::new()),
            max_size_bytes,
            calls: AtomicUsize::new(0),
            deny_auth: AtomicBool::new(false),
        }
    }

    /// Make subsequent `authenticate` calls fail (or succeed again).
    pub fn set_deny_auth(&self, deny: bool) {
        self.deny_auth.store(deny, Ordering::SeqCst);
    }

    /// Total number of backend calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the container has been created.
    pub async fn container_exists(&self) -> bool {
        *self.container_created.read().await
    }

    /// Fetch a stored blob by name.
    pub async fn get_blob(&self, blob_name: &str) -> Option<StoredBlob> {
        self.blobs.read().await.get(blob_name).cloned()
    }

    /// Number of stored blobs.
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    fn blob_url(&self, blob_name: &str) -> String {
        format!("memory://{}/{}", self.container, blob_name)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl StorageBackend for MemoryBackend {
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.record_call();
            if self.deny_auth.load(Ordering::SeqCst) {
                anyhow::bail!("ManagedIdentityCredential authentication unavailable");
            }
            Ok(())
        })
    }

    fn ensure_container(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.record_call();
            let mut created = self.container_created.write().await;
            if !*created {
                tracing::debug!("Memory container '{}' created", self.container);
                *created = true;
            }
            Ok(())
        })
    }

    fn upload(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let blob_name = blob_name.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            self.record_call();
            if !*self.container_created.read().await {
                anyhow::bail!("The specified container does not exist: {}", self.container);
            }

            let mut blobs = self.blobs.write().await;
            if self.max_size_bytes > 0 {
                let current: u64 = blobs
                    .iter()
                    .filter(|(name, _)| **name != blob_name)
                    .map(|(_, blob)| blob.data.len() as u64)
                    .sum();
                if current + data.len() as u64 > self.max_size_bytes {
                    anyhow::bail!(
                        "Memory limit exceeded: current={current}, additional={}, max={}",
                        data.len(),
                        self.max_size_bytes
                    );
                }
            }

            let etag = Self::compute_etag(&data);
            blobs.insert(
                blob_name.clone(),
                StoredBlob {
                    data,
                    content_type,
                    etag,
                },
            );
            Ok(self.blob_url(&blob_name))
        })
    }

    fn list_blobs(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            self.record_call();
            let mut names: Vec<String> = self.blobs.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
