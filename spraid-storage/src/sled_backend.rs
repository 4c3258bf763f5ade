//! Sled-based checkpoint storage
//!
//! Durable across a power cycle of both controllers. One bincode-encoded
//! record per raid group in the `rebuild_checkpoints` tree.

use crate::backend::{
    apply_position_update, BackendStats, CheckpointBackend, PersistedRaidGroup, SaveOutcome,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use spraid_core::error::{Result, SpRaidError};
use spraid_core::{RaidGroupId, RebuildCheckpoint};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const CHECKPOINT_TREE: &str = "rebuild_checkpoints";

/// Sled-based checkpoint store
pub struct SledBackend {
    db: sled::Db,

    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,

    writes: AtomicU64,
    stale_rejections: AtomicU64,
}

impl SledBackend {
    /// Open or create a checkpoint store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled checkpoint store");

        let db = sled::open(path.as_ref())
            .map_err(|e| SpRaidError::Storage(format!("Failed to open Sled: {}", e)))?;

        Ok(Self::from_db(db))
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| SpRaidError::Storage(format!("Failed to open Sled: {}", e)))?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
        }
    }

    fn tree(&self) -> Result<sled::Tree> {
        self.db
            .open_tree(CHECKPOINT_TREE)
            .map_err(|e| SpRaidError::Storage(e.to_string()))
    }

    fn key(raid_group: RaidGroupId) -> [u8; 4] {
        raid_group.0.to_be_bytes()
    }

    fn put_value<V: Serialize>(&self, tree: &sled::Tree, key: &[u8], value: &V) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        tree.insert(key, encoded)
            .map_err(|e| SpRaidError::Storage(e.to_string()))?;
        Ok(())
    }

    fn get_value<V: DeserializeOwned>(&self, tree: &sled::Tree, key: &[u8]) -> Result<Option<V>> {
        match tree.get(key).map_err(|e| SpRaidError::Storage(e.to_string()))? {
            Some(bytes) => {
                let value: V = bincode::deserialize(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Load, mutate and write back one record under the write lock
    fn modify<F>(&self, raid_group: RaidGroupId, f: F) -> Result<SaveOutcome>
    where
        F: FnOnce(&mut PersistedRaidGroup) -> Result<SaveOutcome>,
    {
        let _guard = self.write_lock.lock();
        let tree = self.tree()?;
        let key = Self::key(raid_group);
        let mut record: PersistedRaidGroup = self
            .get_value(&tree, &key)?
            .ok_or(SpRaidError::RaidGroupNotFound(raid_group.0))?;

        let outcome = f(&mut record)?;
        match outcome {
            SaveOutcome::Written => {
                self.put_value(&tree, &key, &record)?;
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            SaveOutcome::Stale { stored_generation } => {
                debug!(%raid_group, stored_generation, "Refused stale checkpoint write");
                self.stale_rejections.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(outcome)
    }

    /// Database size estimate
    fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl CheckpointBackend for SledBackend {
    fn load(&self, raid_group: RaidGroupId) -> Result<Option<PersistedRaidGroup>> {
        let tree = self.tree()?;
        self.get_value(&tree, &Self::key(raid_group))
    }

    fn ensure(&self, record: PersistedRaidGroup) -> Result<PersistedRaidGroup> {
        let _guard = self.write_lock.lock();
        let tree = self.tree()?;
        let key = Self::key(record.raid_group);
        if let Some(existing) = self.get_value(&tree, &key)? {
            return Ok(existing);
        }
        self.put_value(&tree, &key, &record)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    fn store(&self, record: &PersistedRaidGroup) -> Result<SaveOutcome> {
        let _guard = self.write_lock.lock();
        let tree = self.tree()?;
        let key = Self::key(record.raid_group);
        if let Some(existing) = self.get_value::<PersistedRaidGroup>(&tree, &key)? {
            if record.generation < existing.generation {
                self.stale_rejections.fetch_add(1, Ordering::Relaxed);
                return Ok(SaveOutcome::Stale {
                    stored_generation: existing.generation,
                });
            }
        }
        self.put_value(&tree, &key, record)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(SaveOutcome::Written)
    }

    fn update_position(
        &self,
        raid_group: RaidGroupId,
        position: usize,
        checkpoint: RebuildCheckpoint,
        in_progress: bool,
        generation: u64,
    ) -> Result<SaveOutcome> {
        self.modify(raid_group, |record| {
            apply_position_update(record, position, checkpoint, in_progress, generation)
        })
    }

    fn fence(&self, raid_group: RaidGroupId, generation: u64) -> Result<SaveOutcome> {
        self.modify(raid_group, |record| {
            if generation < record.generation {
                return Ok(SaveOutcome::Stale {
                    stored_generation: record.generation,
                });
            }
            record.generation = generation;
            Ok(SaveOutcome::Written)
        })
    }

    fn list_raid_groups(&self) -> Result<Vec<RaidGroupId>> {
        let tree = self.tree()?;
        let mut ids = Vec::new();
        for item in tree.iter() {
            let (key, _) = item.map_err(|e| SpRaidError::Storage(e.to_string()))?;
            let bytes: [u8; 4] = key
                .as_ref()
                .try_into()
                .map_err(|_| SpRaidError::Storage(format!("malformed key {:?}", key)))?;
            ids.push(RaidGroupId(u32::from_be_bytes(bytes)));
        }
        Ok(ids)
    }

    fn stats(&self) -> Result<BackendStats> {
        Ok(BackendStats {
            record_count: self.tree()?.len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            bytes_on_disk: self.size_on_disk(),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| SpRaidError::Storage(e.to_string()))?;
        Ok(())
    }
}
