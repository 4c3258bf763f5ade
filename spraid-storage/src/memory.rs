//! In-memory checkpoint backend
//!
//! Used for testing and development. Survives controller restarts inside one
//! process but not a process exit.

use crate::backend::{
    apply_position_update, BackendStats, CheckpointBackend, PersistedRaidGroup, SaveOutcome,
};
use parking_lot::RwLock;
use spraid_core::error::{Result, SpRaidError};
use spraid_core::{RaidGroupId, RebuildCheckpoint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory checkpoint backend
pub struct MemoryBackend {
    /// Records by raid group
    records: RwLock<HashMap<RaidGroupId, PersistedRaidGroup>>,

    /// Operation counters
    writes: AtomicU64,
    stale_rejections: AtomicU64,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
        }
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.write().clear();
    }

    fn count(&self, outcome: SaveOutcome) -> SaveOutcome {
        match outcome {
            SaveOutcome::Written => self.writes.fetch_add(1, Ordering::Relaxed),
            SaveOutcome::Stale { .. } => self.stale_rejections.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointBackend for MemoryBackend {
    fn load(&self, raid_group: RaidGroupId) -> Result<Option<PersistedRaidGroup>> {
        Ok(self.records.read().get(&raid_group).cloned())
    }

    fn ensure(&self, record: PersistedRaidGroup) -> Result<PersistedRaidGroup> {
        let mut records = self.records.write();
        Ok(records.entry(record.raid_group).or_insert(record).clone())
    }

    fn store(&self, record: &PersistedRaidGroup) -> Result<SaveOutcome> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&record.raid_group) {
            if record.generation < existing.generation {
                return Ok(self.count(SaveOutcome::Stale {
                    stored_generation: existing.generation,
                }));
            }
        }
        records.insert(record.raid_group, record.clone());
        Ok(self.count(SaveOutcome::Written))
    }

    fn update_position(
        &self,
        raid_group: RaidGroupId,
        position: usize,
        checkpoint: RebuildCheckpoint,
        in_progress: bool,
        generation: u64,
    ) -> Result<SaveOutcome> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&raid_group)
            .ok_or(SpRaidError::RaidGroupNotFound(raid_group.0))?;
        let outcome = apply_position_update(record, position, checkpoint, in_progress, generation)?;
        Ok(self.count(outcome))
    }

    fn fence(&self, raid_group: RaidGroupId, generation: u64) -> Result<SaveOutcome> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&raid_group)
            .ok_or(SpRaidError::RaidGroupNotFound(raid_group.0))?;
        if generation < record.generation {
            return Ok(self.count(SaveOutcome::Stale {
                stored_generation: record.generation,
            }));
        }
        record.generation = generation;
        Ok(self.count(SaveOutcome::Written))
    }

    fn list_raid_groups(&self) -> Result<Vec<RaidGroupId>> {
        let mut ids: Vec<_> = self.records.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn stats(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            record_count: self.records.read().len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            bytes_on_disk: 0,
        })
    }

    fn flush(&self) -> Result<()> {
        // No-op for in-memory storage
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_keeps_existing() {
        let backend = MemoryBackend::new();
        let rg = RaidGroupId(1);

        backend.ensure(PersistedRaidGroup::new(rg, 1000, 3)).unwrap();
        backend
            .update_position(rg, 1, RebuildCheckpoint::new(200), true, 1)
            .unwrap();

        let again = backend.ensure(PersistedRaidGroup::new(rg, 1000, 3)).unwrap();
        assert_eq!(again.checkpoints[1].lba(), 200);
    }

    #[test]
    fn test_update_missing_group() {
        let backend = MemoryBackend::new();
        let result = backend.update_position(RaidGroupId(9), 0, RebuildCheckpoint::ZERO, false, 0);
        assert!(matches!(result, Err(SpRaidError::RaidGroupNotFound(9))));
    }

    #[test]
    fn test_fence_rejects_older_writer() {
        let backend = MemoryBackend::new();
        let rg = RaidGroupId(1);
        backend.ensure(PersistedRaidGroup::new(rg, 1000, 3)).unwrap();

        assert!(backend.fence(rg, 2).unwrap().is_written());
        let outcome = backend
            .update_position(rg, 0, RebuildCheckpoint::new(100), true, 1)
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Stale { stored_generation: 2 });

        let stats = backend.stats().unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.stale_rejections, 1);
        assert_eq!(stats.bytes_on_disk, 0);
    }

    #[test]
    fn test_store_and_list() {
        let backend = MemoryBackend::new();
        for id in [3, 1, 2] {
            let record = PersistedRaidGroup::new(RaidGroupId(id), 1000, 3);
            assert!(backend.store(&record).unwrap().is_written());
        }
        assert_eq!(
            backend.list_raid_groups().unwrap(),
            vec![RaidGroupId(1), RaidGroupId(2), RaidGroupId(3)]
        );

        backend.clear();
        assert!(backend.list_raid_groups().unwrap().is_empty());
    }
}
