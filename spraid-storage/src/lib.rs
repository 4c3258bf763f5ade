//! spraid Checkpoint Storage
//!
//! Durable rebuild checkpoint persistence:
//! - `CheckpointBackend` trait for pluggable storage
//! - `SledBackend` for on-disk storage that survives a full power cycle
//! - `MemoryBackend` for testing

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{BackendStats, CheckpointBackend, PersistedRaidGroup, SaveOutcome};
pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use spraid_core::error::Result;
use std::sync::Arc;

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Path to the sled directory; in-memory when unset
    pub path: Option<std::path::PathBuf>,
}

impl StorageConfig {
    /// Create a storage config with the given path
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// In-memory storage
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    /// Open the configured backend
    pub fn open(&self) -> Result<Arc<dyn CheckpointBackend>> {
        match &self.path {
            Some(path) => Ok(Arc::new(SledBackend::open(path)?)),
            None => Ok(Arc::new(MemoryBackend::new())),
        }
    }
}
