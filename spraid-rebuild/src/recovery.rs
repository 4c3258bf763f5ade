//! Recovery Sequencer
//!
//! Runs after a controller boots. Reloads each raid group's checkpoints from
//! durable storage and records which positions were mid-rebuild, so the
//! controller resumes them when it next becomes active. Recomputing a plan
//! from the same durable state yields the same plan.

use crate::checkpoint_store::{CheckpointStore, Result};
use parking_lot::RwLock;
use serde::Serialize;
use spraid_core::{ControllerId, RaidGroupId, RebuildCheckpoint};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument};

/// Positions to resume for one raid group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryPlan {
    pub raid_group: RaidGroupId,
    pub controller: ControllerId,
    /// Generation found in durable storage
    pub generation: u64,
    pub checkpoints: Vec<RebuildCheckpoint>,
    pub pending_resumptions: BTreeSet<usize>,
}

pub struct RecoverySequencer {
    controller: ControllerId,
    plans: RwLock<HashMap<RaidGroupId, RecoveryPlan>>,
}

impl RecoverySequencer {
    pub fn new(controller: ControllerId) -> Self {
        Self {
            controller,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Reload a group's replica and compute its pending resumptions
    #[instrument(
        skip(self, store),
        fields(raid_group = %store.raid_group(), controller = %self.controller)
    )]
    pub fn recover(&self, store: &CheckpointStore) -> Result<RecoveryPlan> {
        store.reload()?;
        let plan = RecoveryPlan {
            raid_group: store.raid_group(),
            controller: self.controller,
            generation: store.generation(),
            checkpoints: (0..store.width())
                .map(|p| store.get(p))
                .collect::<Result<Vec<_>>>()?,
            pending_resumptions: store.interrupted_positions().into_iter().collect(),
        };
        info!(
            pending = ?plan.pending_resumptions,
            generation = plan.generation,
            "Recovery plan computed"
        );
        self.plans.write().insert(plan.raid_group, plan.clone());
        Ok(plan)
    }

    /// Hand the pending resumptions to a scheduler coming up.
    ///
    /// The plan is consumed. Positions that are no longer interrupted in the
    /// replica (the peer finished them since the plan was made) are dropped.
    pub fn take_pending(&self, store: &CheckpointStore) -> BTreeSet<usize> {
        let planned = self
            .plans
            .write()
            .get_mut(&store.raid_group())
            .map(|p| std::mem::take(&mut p.pending_resumptions))
            .unwrap_or_default();
        let current: BTreeSet<usize> = store.interrupted_positions().into_iter().collect();
        let finished: Vec<usize> = planned.difference(&current).copied().collect();
        if !finished.is_empty() {
            debug!(
                raid_group = %store.raid_group(),
                controller = %self.controller,
                ?finished,
                "Planned resumptions already finished elsewhere"
            );
        }
        planned.intersection(&current).copied().collect()
    }

    /// Drop a group's plan once the peer has resynced this replica
    pub fn forget(&self, raid_group: RaidGroupId) -> bool {
        self.plans.write().remove(&raid_group).is_some()
    }

    /// Forget every plan (controller went down)
    pub fn clear(&self) {
        self.plans.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{LocalPeerLink, MirrorSink};
    use spraid_storage::{CheckpointBackend, MemoryBackend};
    use std::sync::Arc;

    const EXTENT: u64 = 0x10000;

    fn stores() -> (Arc<CheckpointStore>, Arc<CheckpointStore>) {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let open = |controller: ControllerId| {
            Arc::new(
                CheckpointStore::open(
                    RaidGroupId(4),
                    controller,
                    EXTENT,
                    4,
                    backend.clone(),
                    Arc::new(LocalPeerLink::new(controller.peer())),
                )
                .unwrap(),
            )
        };
        (open(ControllerId::A), open(ControllerId::B))
    }

    #[test]
    fn test_recover_finds_interrupted_positions() {
        let (writer, reader) = stores();
        writer.become_active(1).unwrap();
        writer.reset(1).unwrap();
        writer.advance(1, RebuildCheckpoint::new(EXTENT / 2)).unwrap();
        writer.reset(3).unwrap();

        let sequencer = RecoverySequencer::new(ControllerId::B);
        let plan = sequencer.recover(&reader).unwrap();
        assert_eq!(plan.pending_resumptions, BTreeSet::from([1, 3]));
        assert_eq!(plan.checkpoints[1].lba(), EXTENT / 2);
        assert_eq!(plan.generation, 1);
    }

    #[test]
    fn test_recover_is_idempotent() {
        let (writer, reader) = stores();
        writer.become_active(1).unwrap();
        writer.reset(2).unwrap();
        writer.advance(2, RebuildCheckpoint::new(0x800)).unwrap();

        let sequencer = RecoverySequencer::new(ControllerId::A);
        let once = sequencer.recover(&reader).unwrap();
        let twice = sequencer.recover(&reader).unwrap();
        assert_eq!(once, twice);

        assert_eq!(sequencer.take_pending(&reader), BTreeSet::from([2]));
        assert!(sequencer.take_pending(&reader).is_empty());
    }

    #[test]
    fn test_take_pending_drops_positions_finished_elsewhere() {
        let (writer, reader) = stores();
        let peer: Arc<dyn MirrorSink> = reader.clone();
        writer.become_active(1).unwrap();
        writer.reset(1).unwrap();
        writer.reset(2).unwrap();
        writer.advance(2, RebuildCheckpoint::new(0x800)).unwrap();

        let sequencer = RecoverySequencer::new(ControllerId::B);
        let plan = sequencer.recover(&reader).unwrap();
        assert_eq!(plan.pending_resumptions, BTreeSet::from([1, 2]));

        // Writer finishes position 2 and pushes a snapshot to the reader
        writer.advance(2, RebuildCheckpoint::complete(EXTENT)).unwrap();
        peer.apply_snapshot(&writer.snapshot()).unwrap();

        assert_eq!(sequencer.take_pending(&reader), BTreeSet::from([1]));
    }

    #[test]
    fn test_forget_discards_plan() {
        let (writer, reader) = stores();
        writer.become_active(1).unwrap();
        writer.reset(3).unwrap();

        let sequencer = RecoverySequencer::new(ControllerId::B);
        sequencer.recover(&reader).unwrap();
        assert!(sequencer.forget(RaidGroupId(4)));
        assert!(!sequencer.forget(RaidGroupId(4)));
        assert!(sequencer.take_pending(&reader).is_empty());
        assert_eq!(reader.interrupted_positions(), vec![3]);
    }
}
