//! Checkpoint Store
//!
//! One replica per controller per raid group. The replica on the active
//! controller is the only writer: every change is persisted to the durable
//! backend, then mirrored to the peer replica before the call returns. The
//! standby replica only accepts mirrored changes carrying a generation at
//! least as new as its own.

use crate::metrics;
use crate::mirror::{MirrorAck, MirrorError, MirrorSink, MirrorSnapshot, MirrorUpdate, PeerLink};
use parking_lot::RwLock;
use spraid_core::{ControllerId, Lba, RaidGroupId, RebuildCheckpoint, SpRaidError};
use spraid_storage::{CheckpointBackend, PersistedRaidGroup, SaveOutcome};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Checkpoint store errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error(
        "Invalid checkpoint for {raid_group} position {position}: \
         {requested} (current {current}, extent 0x{extent:x})"
    )]
    InvalidCheckpoint {
        raid_group: RaidGroupId,
        position: usize,
        current: RebuildCheckpoint,
        requested: RebuildCheckpoint,
        extent: Lba,
    },

    #[error("Position {position} out of range for width {width}")]
    InvalidPosition { position: usize, width: usize },

    #[error("{controller} is not active for {raid_group}")]
    NotActive {
        raid_group: RaidGroupId,
        controller: ControllerId,
    },

    #[error("Stale generation {offered} for {raid_group} (stored {stored})")]
    StaleGeneration {
        raid_group: RaidGroupId,
        offered: u64,
        stored: u64,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] SpRaidError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Role of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Active,
    Standby,
}

/// How far a checkpoint write got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Persisted and acknowledged by the peer
    Mirrored,
    /// Persisted; peer marked unreachable
    LocalOnly,
    /// A newer generation owns the group; nothing changed
    Superseded { generation: u64 },
}

#[derive(Debug, Clone)]
struct ReplicaState {
    checkpoints: Vec<RebuildCheckpoint>,
    in_progress: Vec<bool>,
    generation: u64,
    role: ReplicaRole,
}

impl ReplicaState {
    fn from_record(record: PersistedRaidGroup) -> Self {
        Self {
            checkpoints: record.checkpoints,
            in_progress: record.in_progress,
            generation: record.generation,
            role: ReplicaRole::Standby,
        }
    }
}

/// Per-controller replica of a raid group's rebuild checkpoints
pub struct CheckpointStore {
    raid_group: RaidGroupId,
    controller: ControllerId,
    extent: Lba,
    state: RwLock<ReplicaState>,
    backend: Arc<dyn CheckpointBackend>,
    peer: Arc<dyn PeerLink>,
}

impl CheckpointStore {
    /// Open the replica, creating the durable record if the group is new.
    ///
    /// A new group starts fully consistent: every checkpoint at the extent.
    pub fn open(
        raid_group: RaidGroupId,
        controller: ControllerId,
        extent: Lba,
        width: usize,
        backend: Arc<dyn CheckpointBackend>,
        peer: Arc<dyn PeerLink>,
    ) -> Result<Self> {
        let mut fresh = PersistedRaidGroup::new(raid_group, extent, width);
        fresh.checkpoints.fill(RebuildCheckpoint::complete(extent));
        let record = backend.ensure(fresh)?;
        if record.width() != width {
            return Err(SpRaidError::Configuration(format!(
                "{} persisted with width {} but configured with {}",
                raid_group,
                record.width(),
                width
            ))
            .into());
        }

        Ok(Self {
            raid_group,
            controller,
            extent,
            state: RwLock::new(ReplicaState::from_record(record)),
            backend,
            peer,
        })
    }

    pub fn raid_group(&self) -> RaidGroupId {
        self.raid_group
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn extent(&self) -> Lba {
        self.extent
    }

    pub fn width(&self) -> usize {
        self.state.read().checkpoints.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.read().role
    }

    pub fn is_active(&self) -> bool {
        self.role() == ReplicaRole::Active
    }

    /// Current checkpoint of a position
    pub fn get(&self, position: usize) -> Result<RebuildCheckpoint> {
        let state = self.state.read();
        state
            .checkpoints
            .get(position)
            .copied()
            .ok_or(CheckpointError::InvalidPosition {
                position,
                width: state.checkpoints.len(),
            })
    }

    pub fn is_in_progress(&self, position: usize) -> Result<bool> {
        let state = self.state.read();
        state
            .in_progress
            .get(position)
            .copied()
            .ok_or(CheckpointError::InvalidPosition {
                position,
                width: state.in_progress.len(),
            })
    }

    /// Positions whose rebuild started and has not finished
    pub fn interrupted_positions(&self) -> Vec<usize> {
        let state = self.state.read();
        state
            .checkpoints
            .iter()
            .zip(state.in_progress.iter())
            .enumerate()
            .filter(|(_, (c, marked))| !c.is_complete(self.extent) && (!c.is_zero() || **marked))
            .map(|(i, _)| i)
            .collect()
    }

    /// Full copy for resyncing the peer
    pub fn snapshot(&self) -> MirrorSnapshot {
        let state = self.state.read();
        MirrorSnapshot {
            raid_group: self.raid_group,
            checkpoints: state.checkpoints.clone(),
            in_progress: state.in_progress.clone(),
            generation: state.generation,
            source: self.controller,
        }
    }

    /// Advance a position's checkpoint.
    ///
    /// Rejects values below the current checkpoint or past the extent.
    /// Reaching the extent clears the in-progress mark.
    pub fn advance(
        &self,
        position: usize,
        new_checkpoint: RebuildCheckpoint,
    ) -> Result<WriteOutcome> {
        let current = self.get(position)?;
        if new_checkpoint < current || new_checkpoint.lba() > self.extent {
            return Err(CheckpointError::InvalidCheckpoint {
                raid_group: self.raid_group,
                position,
                current,
                requested: new_checkpoint,
                extent: self.extent,
            });
        }
        let in_progress = !new_checkpoint.is_complete(self.extent);
        self.write_position(position, new_checkpoint, in_progress)
    }

    /// Set a position back to zero for a brand-new drive
    pub fn reset(&self, position: usize) -> Result<WriteOutcome> {
        self.get(position)?;
        info!(raid_group = %self.raid_group, position, "Resetting rebuild checkpoint");
        self.write_position(position, RebuildCheckpoint::ZERO, true)
    }

    /// Drive pulled from a position.
    ///
    /// A consistent position starts a new rebuild sequence at zero. A rebuild
    /// already underway keeps its checkpoint.
    pub fn mark_degraded(&self, position: usize) -> Result<WriteOutcome> {
        let current = self.get(position)?;
        if current.is_complete(self.extent) {
            self.write_position(position, RebuildCheckpoint::ZERO, true)
        } else {
            self.write_position(position, current, true)
        }
    }

    /// Same drive came back; rebuild continues from the stored checkpoint
    pub fn mark_in_progress(&self, position: usize) -> Result<WriteOutcome> {
        let current = self.get(position)?;
        let in_progress = !current.is_complete(self.extent);
        self.write_position(position, current, in_progress)
    }

    fn write_position(
        &self,
        position: usize,
        checkpoint: RebuildCheckpoint,
        in_progress: bool,
    ) -> Result<WriteOutcome> {
        let generation = {
            let state = self.state.read();
            if state.role != ReplicaRole::Active {
                return Err(CheckpointError::NotActive {
                    raid_group: self.raid_group,
                    controller: self.controller,
                });
            }
            state.generation
        };

        // Durable first so a dual crash never loses an acknowledged chunk
        let saved = self.backend.update_position(
            self.raid_group,
            position,
            checkpoint,
            in_progress,
            generation,
        )?;
        if let SaveOutcome::Stale { stored_generation } = saved {
            return Ok(self.superseded(stored_generation));
        }

        {
            let mut state = self.state.write();
            state.checkpoints[position] = checkpoint;
            state.in_progress[position] = in_progress;
        }

        if !self.peer.is_peer_reachable() {
            return Ok(WriteOutcome::LocalOnly);
        }
        let update = MirrorUpdate {
            raid_group: self.raid_group,
            position,
            checkpoint,
            in_progress,
            generation,
            source: self.controller,
        };
        match self.peer.send_update(update) {
            Ok(MirrorAck::Applied) => Ok(WriteOutcome::Mirrored),
            Ok(MirrorAck::Stale { current_generation }) => Ok(self.superseded(current_generation)),
            Err(MirrorError::PeerUnreachable(peer)) => {
                debug!(
                    raid_group = %self.raid_group,
                    %peer,
                    "Peer unreachable, checkpoint kept local"
                );
                Ok(WriteOutcome::LocalOnly)
            }
            Err(e) => {
                warn!(raid_group = %self.raid_group, position, error = %e, "Mirror update failed");
                Ok(WriteOutcome::LocalOnly)
            }
        }
    }

    fn superseded(&self, generation: u64) -> WriteOutcome {
        let mut state = self.state.write();
        debug!(
            raid_group = %self.raid_group,
            controller = %self.controller,
            ours = state.generation,
            newer = generation,
            "Checkpoint write superseded by newer generation"
        );
        metrics::record_stale_update(self.controller);
        state.role = ReplicaRole::Standby;
        WriteOutcome::Superseded { generation }
    }

    /// Take over as the writing replica under `generation`.
    ///
    /// Fences the durable record so older writers are refused, then adopts
    /// the durable values.
    pub fn become_active(&self, generation: u64) -> Result<()> {
        let fenced = self.backend.fence(self.raid_group, generation)?;
        if let SaveOutcome::Stale { stored_generation } = fenced {
            return Err(CheckpointError::StaleGeneration {
                raid_group: self.raid_group,
                offered: generation,
                stored: stored_generation,
            });
        }

        let durable = self.backend.load(self.raid_group)?;
        let mut state = self.state.write();
        // Durable writes precede mirroring, so the record is never behind the copy
        if let Some(record) = durable {
            if record.width() == state.checkpoints.len() {
                state.checkpoints = record.checkpoints;
                state.in_progress = record.in_progress;
            }
        }
        state.generation = generation;
        state.role = ReplicaRole::Active;
        info!(
            raid_group = %self.raid_group,
            controller = %self.controller,
            generation,
            "Checkpoint replica active"
        );
        Ok(())
    }

    pub fn become_standby(&self) {
        self.state.write().role = ReplicaRole::Standby;
    }

    /// Replace the in-memory copy with the durable record.
    ///
    /// An active replica keeps its role and generation; only its values are
    /// refreshed.
    pub fn reload(&self) -> Result<()> {
        let record = self
            .backend
            .load(self.raid_group)?
            .ok_or(SpRaidError::RaidGroupNotFound(self.raid_group.0))?;
        let mut state = self.state.write();
        if state.role == ReplicaRole::Active {
            if record.width() == state.checkpoints.len() {
                state.checkpoints = record.checkpoints;
                state.in_progress = record.in_progress;
            }
            debug!(
                raid_group = %self.raid_group,
                controller = %self.controller,
                generation = state.generation,
                "Reloaded active replica in place"
            );
            return Ok(());
        }
        *state = ReplicaState::from_record(record);
        Ok(())
    }

    fn stale_ack(&self, offered: u64, current: u64) -> MirrorAck {
        debug!(
            raid_group = %self.raid_group,
            controller = %self.controller,
            offered,
            current,
            "Dropping stale mirrored update"
        );
        metrics::record_stale_update(self.controller);
        MirrorAck::Stale {
            current_generation: current,
        }
    }

    /// Accept a generation for a mirrored write; demotes an outranked active
    fn admit(&self, state: &mut ReplicaState, generation: u64) -> bool {
        let newer_required = state.role == ReplicaRole::Active;
        if generation < state.generation || (newer_required && generation == state.generation) {
            return false;
        }
        if state.role == ReplicaRole::Active {
            warn!(
                raid_group = %self.raid_group,
                controller = %self.controller,
                ours = state.generation,
                theirs = generation,
                "Peer wrote under a newer generation, stepping down"
            );
            state.role = ReplicaRole::Standby;
        }
        state.generation = generation;
        true
    }
}

impl MirrorSink for CheckpointStore {
    fn apply_update(&self, update: &MirrorUpdate) -> std::result::Result<MirrorAck, MirrorError> {
        let mut state = self.state.write();
        if update.position >= state.checkpoints.len() {
            return Err(MirrorError::Rejected(format!(
                "position {} out of range",
                update.position
            )));
        }
        let current = state.generation;
        if !self.admit(&mut state, update.generation) {
            drop(state);
            return Ok(self.stale_ack(update.generation, current));
        }
        state.checkpoints[update.position] = update.checkpoint;
        state.in_progress[update.position] = update.in_progress;
        Ok(MirrorAck::Applied)
    }

    fn apply_snapshot(
        &self,
        snapshot: &MirrorSnapshot,
    ) -> std::result::Result<MirrorAck, MirrorError> {
        let mut state = self.state.write();
        if snapshot.checkpoints.len() != state.checkpoints.len()
            || snapshot.in_progress.len() != state.in_progress.len()
        {
            return Err(MirrorError::Rejected(format!(
                "snapshot width {} does not match {}",
                snapshot.checkpoints.len(),
                state.checkpoints.len()
            )));
        }
        let current = state.generation;
        if !self.admit(&mut state, snapshot.generation) {
            drop(state);
            return Ok(self.stale_ack(snapshot.generation, current));
        }
        state.checkpoints.clone_from(&snapshot.checkpoints);
        state.in_progress.clone_from(&snapshot.in_progress);
        Ok(MirrorAck::Applied)
    }
}
