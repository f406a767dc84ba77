//! blobdrop library: a single-file upload form backed by Azure Blob Storage.
//!
//! The crate provides the HTTP front end (form page, upload handler,
//! flash messages), the upload orchestration, managed identity token
//! acquisition and pluggable blob storage backends.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod config;
pub mod credential;
pub mod errors;
pub mod flash;
pub mod metrics;
pub mod pages;
pub mod server;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::flash::FlashSigner;
use crate::storage::backend::StorageBackend;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Blob storage backend (Azure or in-memory).
    pub storage: Arc<dyn StorageBackend>,
    /// Flash cookie signer.
    pub flash: FlashSigner,
    /// Source of the timestamp used in blob names.
    pub clock: fn() -> DateTime<Utc>,
}

impl AppState {
    /// State with the wall clock.
    pub fn new(config: Config, storage: Arc<dyn StorageBackend>, flash: FlashSigner) -> Self {
        Self {
            config,
            storage,
            flash,
            clock: Utc::now,
        }
    }
}
