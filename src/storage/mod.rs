//! Blob storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where uploaded
//! blobs land.  Implementations: Azure Blob Storage authenticated with a
//! managed identity, and an in-process memory store.

pub mod azure;
pub mod backend;
pub mod memory;
