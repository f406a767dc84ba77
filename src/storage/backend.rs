//! Abstract storage backend trait.
//!
//! Every blob store must implement [`StorageBackend`].  The upload flow
//! drives it one step at a time (authenticate, ensure the container,
//! write the blob) so that a failure can be attributed to the step that
//! produced it.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Async blob container contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Resolve credentials for the next calls.  Errors here mean the
    /// process has no usable identity.
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Create the target container if it does not exist.  Must succeed
    /// when the container is already there, including when a concurrent
    /// request created it first.
    fn ensure_container(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Write `data` to `blob_name`, replacing any existing blob, and
    /// return the blob's URL.
    fn upload(
        &self,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;

    /// Names of all blobs in the container.  A missing container is an
    /// empty listing.
    fn list_blobs(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;
}
