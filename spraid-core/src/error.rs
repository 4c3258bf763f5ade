//! Error types for spraid
//!
//! Provides a unified error type for storage and configuration plumbing.
//! The rebuild subsystem layers its own per-component errors on top.

use thiserror::Error;

/// Result type alias for spraid operations
pub type Result<T> = std::result::Result<T, SpRaidError>;

/// Unified error type for spraid
#[derive(Error, Debug)]
pub enum SpRaidError {
    // ===== Raid Group Errors =====
    #[error("Raid group not found: {0}")]
    RaidGroupNotFound(u32),

    #[error("Invalid position: {position} (width: {width})")]
    InvalidPosition { position: usize, width: usize },

    #[error("Invalid raid group width: {width} (max: {max})")]
    InvalidWidth { width: usize, max: usize },

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    #[error(
        "Stale record for raid group {raid_group}: \
         stored generation {stored}, offered {offered}"
    )]
    StaleRecord {
        raid_group: u32,
        stored: u64,
        offered: u64,
    },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for SpRaidError {
    fn from(err: bincode::Error) -> Self {
        SpRaidError::Serialization(err.to_string())
    }
}
