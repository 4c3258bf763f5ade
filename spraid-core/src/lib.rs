//! spraid Core Library
//!
//! Core abstractions shared by the spraid crates:
//! - Raid group, position and drive identities
//! - The two storage processors (controllers)
//! - Rebuild checkpoints and percent arithmetic
//! - Common error handling

pub mod checkpoint;
pub mod error;
pub mod raid_group;

pub use checkpoint::{checkpoint_for_percent, Lba, RebuildCheckpoint};
pub use error::{Result, SpRaidError};
pub use raid_group::{
    BindKind, ControllerId, DriveId, Position, RaidGroup, RaidGroupId, RaidGroupState, RaidType,
};

/// Rebuild chunk size in blocks (0x800 blocks of 520 bytes)
pub const DEFAULT_CHUNK_SIZE_BLOCKS: Lba = 0x800;

/// Widest raid group the array supports
pub const MAX_RAID_GROUP_WIDTH: usize = 16;
