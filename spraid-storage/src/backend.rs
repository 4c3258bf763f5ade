//! Checkpoint backend trait
//!
//! Defines the interface every durable checkpoint store must follow. Records
//! are fenced by ownership generation: a write carrying a generation older
//! than the stored one is refused.

use serde::{Deserialize, Serialize};
use spraid_core::error::Result;
use spraid_core::{Lba, RaidGroupId, RebuildCheckpoint};

/// Durable rebuild state of one raid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRaidGroup {
    pub raid_group: RaidGroupId,

    /// Ownership generation of the last accepted writer
    pub generation: u64,

    /// Per-position logical extent
    pub extent: Lba,

    /// One checkpoint per position
    pub checkpoints: Vec<RebuildCheckpoint>,

    /// Positions explicitly marked as rebuilding
    pub in_progress: Vec<bool>,

    /// Unix timestamp of the last accepted write
    pub updated_at: i64,
}

impl PersistedRaidGroup {
    /// Fresh record with every position at checkpoint zero
    pub fn new(raid_group: RaidGroupId, extent: Lba, width: usize) -> Self {
        Self {
            raid_group,
            generation: 0,
            extent,
            checkpoints: vec![RebuildCheckpoint::ZERO; width],
            in_progress: vec![false; width],
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn width(&self) -> usize {
        self.checkpoints.len()
    }

    /// Positions with a rebuild started but not finished
    pub fn interrupted_positions(&self) -> Vec<usize> {
        self.checkpoints
            .iter()
            .zip(self.in_progress.iter())
            .enumerate()
            .filter(|(_, (c, marked))| {
                !c.is_complete(self.extent) && (!c.is_zero() || **marked)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of a fenced write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Record written
    Written,
    /// Writer's generation is older than the stored one; nothing written
    Stale { stored_generation: u64 },
}

impl SaveOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, SaveOutcome::Written)
    }
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Raid groups with a record
    pub record_count: u64,

    /// Accepted writes
    pub writes: u64,

    /// Writes refused for carrying a stale generation
    pub stale_rejections: u64,

    /// Bytes held on disk; zero for volatile backends
    pub bytes_on_disk: u64,
}

/// Durable checkpoint storage
///
/// Implementations must be safe to share between both controllers.
pub trait CheckpointBackend: Send + Sync {
    /// Load a raid group's record
    fn load(&self, raid_group: RaidGroupId) -> Result<Option<PersistedRaidGroup>>;

    /// Create the record if none exists. Returns the stored record.
    fn ensure(&self, record: PersistedRaidGroup) -> Result<PersistedRaidGroup>;

    /// Replace the whole record (generation fenced)
    fn store(&self, record: &PersistedRaidGroup) -> Result<SaveOutcome>;

    /// Write one position's checkpoint (generation fenced)
    fn update_position(
        &self,
        raid_group: RaidGroupId,
        position: usize,
        checkpoint: RebuildCheckpoint,
        in_progress: bool,
        generation: u64,
    ) -> Result<SaveOutcome>;

    /// Raise the stored generation so older writers are refused
    fn fence(&self, raid_group: RaidGroupId, generation: u64) -> Result<SaveOutcome>;

    /// All raid groups with a record
    fn list_raid_groups(&self) -> Result<Vec<RaidGroupId>>;

    /// Backend statistics
    fn stats(&self) -> Result<BackendStats>;

    /// Flush pending writes
    fn flush(&self) -> Result<()>;
}

/// Apply a fenced position update to a record in place
pub(crate) fn apply_position_update(
    record: &mut PersistedRaidGroup,
    position: usize,
    checkpoint: RebuildCheckpoint,
    in_progress: bool,
    generation: u64,
) -> Result<SaveOutcome> {
    if generation < record.generation {
        return Ok(SaveOutcome::Stale {
            stored_generation: record.generation,
        });
    }
    let width = record.checkpoints.len();
    let slot = record
        .checkpoints
        .get_mut(position)
        .ok_or(spraid_core::SpRaidError::InvalidPosition { position, width })?;
    *slot = checkpoint;
    record.in_progress[position] = in_progress;
    record.generation = generation;
    record.updated_at = chrono::Utc::now().timestamp();
    Ok(SaveOutcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_positions() {
        let mut record = PersistedRaidGroup::new(RaidGroupId(3), 1000, 4);
        record.checkpoints[1] = RebuildCheckpoint::new(500);
        record.checkpoints[2] = RebuildCheckpoint::complete(1000);
        record.in_progress[3] = true;
        assert_eq!(record.interrupted_positions(), vec![1, 3]);
    }

    #[test]
    fn test_apply_position_update_fenced() {
        let mut record = PersistedRaidGroup::new(RaidGroupId(3), 1000, 3);
        record.generation = 4;

        let outcome =
            apply_position_update(&mut record, 1, RebuildCheckpoint::new(10), true, 3).unwrap();
        assert_eq!(outcome, SaveOutcome::Stale { stored_generation: 4 });
        assert!(record.checkpoints[1].is_zero());

        let outcome =
            apply_position_update(&mut record, 1, RebuildCheckpoint::new(10), true, 5).unwrap();
        assert!(outcome.is_written());
        assert_eq!(record.generation, 5);
        assert_eq!(record.checkpoints[1].lba(), 10);
        assert!(record.in_progress[1]);

        let outcome = apply_position_update(&mut record, 9, RebuildCheckpoint::new(10), true, 5);
        assert!(outcome.is_err());
    }
}
