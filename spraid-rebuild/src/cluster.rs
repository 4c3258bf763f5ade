//! Dual-controller array
//!
//! Wires the two controller contexts to a shared durable backend, the
//! ownership arbiter and the array-wide notification emitter. Stands in for
//! the configuration service (raid group records), the fault layer (failure,
//! boot, dual crash) and the data path (`pump`).

use crate::config::RebuildConfig;
use crate::controller::{ControllerContext, ControllerError, PumpReport};
use crate::hooks::{HookId, PauseHook};
use crate::mirror::{MirrorError, MirrorSink, PeerLink};
use crate::notification::NotificationEmitter;
use crate::ownership::{
    BootOutcome, LifecycleView, OwnershipArbiter, OwnershipError, OwnershipListener,
    OwnershipRecord, TransferOutcome,
};
use parking_lot::RwLock;
use spraid_core::{
    BindKind, ControllerId, DriveId, Lba, RaidGroup, RaidGroupId, RaidGroupState, RaidType,
    RebuildCheckpoint, SpRaidError,
};
use spraid_storage::{CheckpointBackend, StorageConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Array-level errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] SpRaidError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error("Raid group {0} not configured")]
    UnknownRaidGroup(RaidGroupId),

    #[error("Raid group {0} already configured")]
    DuplicateRaidGroup(RaidGroupId),

    #[error("No live controller owns {0}")]
    NoActiveController(RaidGroupId),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

pub struct DualController {
    config: RebuildConfig,
    backend: Arc<dyn CheckpointBackend>,
    emitter: Arc<NotificationEmitter>,
    arbiter: Arc<OwnershipArbiter>,
    spa: Arc<ControllerContext>,
    spb: Arc<ControllerContext>,
    raid_groups: RwLock<BTreeMap<RaidGroupId, RaidGroup>>,
}

impl DualController {
    /// Open the configured backend and bring up both controllers
    pub fn new(config: RebuildConfig) -> Result<Self> {
        let storage = match &config.persistence_path {
            Some(path) => StorageConfig::new(path),
            None => StorageConfig::in_memory(),
        };
        let backend = storage.open()?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: RebuildConfig, backend: Arc<dyn CheckpointBackend>) -> Self {
        let emitter = Arc::new(
            NotificationEmitter::new(config.notification_queue_depth)
                .with_default_timeout(config.notification_timeout()),
        );
        let arbiter = Arc::new(OwnershipArbiter::new(config.primary_controller));
        let context = |id| {
            ControllerContext::new(
                id,
                config.clone(),
                backend.clone(),
                emitter.clone(),
                arbiter.clone(),
            )
        };
        let spa = context(ControllerId::A);
        let spb = context(ControllerId::B);

        for (local, remote) in [(&spa, &spb), (&spb, &spa)] {
            let sink: Arc<dyn MirrorSink> = remote.clone();
            local.peer_link().connect(&sink);
            let listener: Arc<dyn OwnershipListener> = local.clone();
            arbiter.add_listener(local.id(), &listener);
        }

        Self {
            config,
            backend,
            emitter,
            arbiter,
            spa,
            spb,
            raid_groups: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    pub fn emitter(&self) -> &Arc<NotificationEmitter> {
        &self.emitter
    }

    pub fn arbiter(&self) -> &Arc<OwnershipArbiter> {
        &self.arbiter
    }

    pub fn backend(&self) -> &Arc<dyn CheckpointBackend> {
        &self.backend
    }

    pub fn controller(&self, id: ControllerId) -> &Arc<ControllerContext> {
        match id {
            ControllerId::A => &self.spa,
            ControllerId::B => &self.spb,
        }
    }

    fn online_controllers(&self) -> impl Iterator<Item = &Arc<ControllerContext>> {
        [&self.spa, &self.spb].into_iter().filter(|c| c.is_online())
    }

    pub fn raid_group(&self, id: RaidGroupId) -> Result<RaidGroup> {
        self.raid_groups
            .read()
            .get(&id)
            .cloned()
            .ok_or(ClusterError::UnknownRaidGroup(id))
    }

    pub fn owner(&self, id: RaidGroupId) -> Result<ControllerId> {
        Ok(self.arbiter.current_owner(id)?)
    }

    /// Configure a raid group on both controllers; the primary owns it
    pub fn create_raid_group(
        &self,
        id: RaidGroupId,
        raid_type: RaidType,
        extent: Lba,
        drives: &[DriveId],
    ) -> Result<()> {
        let mut raid_group = RaidGroup::new(id, raid_type, extent, drives)?;
        {
            let mut groups = self.raid_groups.write();
            if groups.contains_key(&id) {
                return Err(ClusterError::DuplicateRaidGroup(id));
            }
            raid_group.state = RaidGroupState::Ready;
            raid_group.refresh_state();
            groups.insert(id, raid_group.clone());
        }

        for controller in self.online_controllers() {
            controller.attach_raid_group(&raid_group)?;
            controller.activate_lifecycle(id, raid_group.is_broken())?;
        }

        let primary = self.config.primary_controller;
        let owner = if self.arbiter.is_alive(primary) {
            primary
        } else {
            primary.peer()
        };
        // A group reopened from a durable store continues above its last owner
        let floor = self.backend.load(id)?.map(|r| r.generation).unwrap_or(0);
        let record = self.arbiter.register_raid_group_above(id, owner, floor);
        info!(
            raid_group = %id,
            ?raid_type,
            width = drives.len(),
            owner = %record.active,
            "Raid group created"
        );
        Ok(())
    }

    /// Apply a configuration change and push the lifecycle state to both sides
    fn update_raid_group<T>(
        &self,
        id: RaidGroupId,
        f: impl FnOnce(&mut RaidGroup) -> spraid_core::Result<T>,
    ) -> Result<(T, RaidGroupState)> {
        let (value, state) = {
            let mut groups = self.raid_groups.write();
            let raid_group = groups.get_mut(&id).ok_or(ClusterError::UnknownRaidGroup(id))?;
            let value = f(raid_group)?;
            (value, raid_group.state)
        };
        for controller in self.online_controllers() {
            controller.set_lifecycle(id, state)?;
        }
        Ok((value, state))
    }

    /// Pull the drive at a position
    pub fn remove_drive(&self, id: RaidGroupId, position: usize) -> Result<DriveId> {
        let (drive, state) = self.update_raid_group(id, |rg| rg.remove_drive(position))?;
        info!(raid_group = %id, position, %drive, %state, "Drive removed");
        for controller in self.online_controllers() {
            controller.on_drive_removed(id, position)?;
        }
        Ok(drive)
    }

    /// Bind a drive to a position; same identity is a reinsertion
    pub fn insert_drive(
        &self,
        id: RaidGroupId,
        position: usize,
        drive: DriveId,
    ) -> Result<BindKind> {
        let (kind, state) = self.update_raid_group(id, |rg| rg.bind_drive(position, drive))?;
        info!(raid_group = %id, position, %drive, ?kind, %state, "Drive inserted");
        for controller in self.online_controllers() {
            controller.on_drive_bound(id, position, drive, kind)?;
        }
        Ok(kind)
    }

    /// Controller died; every group it owned moves to the survivor
    #[instrument(skip(self))]
    pub fn fail_controller(&self, id: ControllerId) -> Result<Vec<(RaidGroupId, TransferOutcome)>> {
        self.controller(id).crash();
        self.arbiter.mark_dead(id);
        self.controller(id.peer()).peer_link().set_peer_reachable(false);

        let mut outcomes = Vec::new();
        for raid_group in self.arbiter.raid_groups() {
            outcomes.push((raid_group, self.arbiter.transfer_on_failure(raid_group)?));
        }
        Ok(outcomes)
    }

    /// Controller came back; it rejoins as standby behind a live owner
    #[instrument(skip(self))]
    pub fn boot_controller(&self, id: ControllerId) -> Result<Vec<(RaidGroupId, BootOutcome)>> {
        let raid_groups: Vec<RaidGroup> = self.raid_groups.read().values().cloned().collect();
        let controller = self.controller(id);
        controller.boot(&raid_groups)?;

        let peer_alive = self.arbiter.is_alive(id.peer());
        controller.peer_link().set_peer_reachable(peer_alive);
        if peer_alive {
            self.controller(id.peer()).peer_link().set_peer_reachable(true);
        }

        let mut outcomes = Vec::new();
        for raid_group in raid_groups.iter().map(|rg| rg.id) {
            let outcome = self.arbiter.transfer_on_boot(raid_group, id)?;
            match outcome {
                BootOutcome::Standby { owner, .. } => {
                    self.controller(owner).resync_peer(raid_group)?;
                }
                BootOutcome::AwaitingOwner => {
                    self.assign_owner(raid_group)?;
                }
            }
            outcomes.push((raid_group, outcome));
        }
        Ok(outcomes)
    }

    /// Both controllers lose power at once
    #[instrument(skip(self))]
    pub fn crash_all(&self) {
        for id in ControllerId::all() {
            self.controller(id).crash();
            self.arbiter.mark_dead(id);
        }
        warn!("Array failure: both controllers down");
    }

    /// Both controllers power up after a dual crash; the primary takes every
    /// group once both report Ready, resuming from durable checkpoints.
    #[instrument(skip(self))]
    pub fn boot_all(&self) -> Result<Vec<OwnershipRecord>> {
        let raid_groups: Vec<RaidGroup> = self.raid_groups.read().values().cloned().collect();
        for id in ControllerId::all() {
            self.controller(id).boot(&raid_groups)?;
            self.arbiter.mark_alive(id);
        }
        for id in ControllerId::all() {
            self.controller(id).peer_link().set_peer_reachable(true);
        }

        let mut records = Vec::new();
        for raid_group in raid_groups.iter().map(|rg| rg.id) {
            if let Some(record) = self.assign_owner(raid_group)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn assign_owner(&self, raid_group: RaidGroupId) -> Result<Option<OwnershipRecord>> {
        let floor = self
            .backend
            .load(raid_group)?
            .map(|r| r.generation)
            .unwrap_or(0);
        let Some(record) = self.arbiter.assign_primary(raid_group, self, floor)? else {
            return Ok(None);
        };
        let standby = self.controller(record.active.peer());
        if standby.is_online() {
            self.controller(record.active).resync_peer(raid_group)?;
        }
        Ok(Some(record))
    }

    /// One data-path pass on the owning controller
    pub fn pump(&self, id: RaidGroupId, max_chunks: usize) -> Result<PumpReport> {
        let owner = self.arbiter.current_owner(id)?;
        if !self.arbiter.is_alive(owner) {
            return Err(ClusterError::NoActiveController(id));
        }
        Ok(self.controller(owner).pump(id, max_chunks)?)
    }

    /// Pump until nothing moves: every rebuild finished or held by a hook.
    ///
    /// Returns the merged report.
    pub fn pump_until_stalled(&self, id: RaidGroupId) -> Result<PumpReport> {
        let mut total = PumpReport::default();
        loop {
            let report = self.pump(id, 64)?;
            total.chunks += report.chunks;
            total.started.extend(&report.started);
            total.completed.extend(&report.completed);
            total.paused = report.paused.clone();
            total.superseded |= report.superseded;
            total.idle = report.idle;
            if !report.made_progress() || report.superseded {
                return Ok(total);
            }
        }
    }

    /// Install a pause hook on one controller's running instance
    pub fn add_pause_hook(
        &self,
        controller: ControllerId,
        id: RaidGroupId,
        hook: Arc<dyn PauseHook>,
    ) -> Result<HookId> {
        Ok(self.controller(controller).hooks(id)?.add(hook))
    }

    pub fn remove_pause_hook(
        &self,
        controller: ControllerId,
        id: RaidGroupId,
        hook: HookId,
    ) -> Result<bool> {
        Ok(self.controller(controller).hooks(id)?.remove(hook))
    }

    /// Checkpoint as seen by the owner's replica
    pub fn checkpoint(&self, id: RaidGroupId, position: usize) -> Result<RebuildCheckpoint> {
        let owner = self.arbiter.current_owner(id)?;
        Ok(self.controller(owner).checkpoint(id, position)?)
    }

    /// Controllers running a live scheduler for the group
    pub fn active_controllers(&self, id: RaidGroupId) -> Vec<ControllerId> {
        ControllerId::all()
            .into_iter()
            .filter(|c| self.controller(*c).is_active_for(id))
            .collect()
    }
}

impl LifecycleView for DualController {
    fn lifecycle_state(
        &self,
        controller: ControllerId,
        raid_group: RaidGroupId,
    ) -> Option<RaidGroupState> {
        self.controller(controller).lifecycle(raid_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array() -> DualController {
        let config = RebuildConfig {
            notification_queue_depth: 16,
            ..Default::default()
        };
        let array = DualController::new(config).unwrap();
        let drives = [DriveId(1), DriveId(2), DriveId(3)];
        array.create_raid_group(RaidGroupId(1), RaidType::Raid5, 0x8000, &drives).unwrap();
        array
    }

    #[test]
    fn test_create_assigns_primary() {
        let array = array();
        assert_eq!(array.owner(RaidGroupId(1)).unwrap(), ControllerId::A);
        assert_eq!(array.active_controllers(RaidGroupId(1)), vec![ControllerId::A]);
        assert_eq!(
            array.lifecycle_state(ControllerId::B, RaidGroupId(1)),
            Some(RaidGroupState::Ready)
        );
        let drives = [DriveId(4), DriveId(5), DriveId(6)];
        assert!(matches!(
            array.create_raid_group(RaidGroupId(1), RaidType::Raid5, 0x8000, &drives),
            Err(ClusterError::DuplicateRaidGroup(_))
        ));
    }

    #[test]
    fn test_broken_group_does_not_rebuild() {
        let array = array();
        let rg = RaidGroupId(1);
        array.remove_drive(rg, 0).unwrap();
        array.remove_drive(rg, 1).unwrap();
        assert_eq!(array.raid_group(rg).unwrap().state, RaidGroupState::Failed);
        assert_eq!(
            array.lifecycle_state(ControllerId::A, rg),
            Some(RaidGroupState::Failed)
        );

        let report = array.pump(rg, 8).unwrap();
        assert_eq!(report.chunks, 0);
        assert!(report.started.is_empty());
    }

    #[test]
    fn test_remove_then_reinsert_rebuilds() {
        let array = array();
        let rg = RaidGroupId(1);
        array.remove_drive(rg, 2).unwrap();
        assert!(array.checkpoint(rg, 2).unwrap().is_zero());
        assert_eq!(array.insert_drive(rg, 2, DriveId(3)).unwrap(), BindKind::Reinserted);

        let report = array.pump_until_stalled(rg).unwrap();
        assert_eq!(report.started, vec![2]);
        assert_eq!(report.completed, vec![2]);
        assert!(array.checkpoint(rg, 2).unwrap().is_complete(0x8000));
        // Mirrored to the standby
        assert!(array
            .controller(ControllerId::B)
            .checkpoint(rg, 2)
            .unwrap()
            .is_complete(0x8000));
    }

    #[test]
    fn test_emitter_takes_configured_wait_timeout() {
        let config = RebuildConfig {
            notification_timeout_ms: 750,
            ..Default::default()
        };
        let array = DualController::new(config).unwrap();
        assert_eq!(
            array.emitter().default_timeout(),
            std::time::Duration::from_millis(750)
        );
    }

    #[test]
    fn test_pump_without_owner_alive() {
        let array = array();
        array.crash_all();
        assert!(matches!(
            array.pump(RaidGroupId(1), 1),
            Err(ClusterError::NoActiveController(_))
        ));
    }
}
