//! Controller context
//!
//! Everything one storage processor keeps for the rebuild subsystem: a
//! checkpoint replica, pause hooks and (while active) a scheduler per raid
//! group, plus its recovery sequencer and link to the peer. Two contexts never
//! share mutable state; they talk only through the peer link and the arbiter.

use crate::checkpoint_store::{CheckpointError, CheckpointStore};
use crate::config::RebuildConfig;
use crate::hooks::HookRegistry;
use crate::mirror::{
    LocalPeerLink, MirrorAck, MirrorError, MirrorSink, MirrorSnapshot, MirrorUpdate, PeerLink,
};
use crate::notification::NotificationEmitter;
use crate::ownership::{ClaimOutcome, OwnershipArbiter, OwnershipError, OwnershipListener};
use crate::recovery::{RecoveryPlan, RecoverySequencer};
use crate::scheduler::{ChunkDecision, ChunkOutcome, RebuildScheduler, RebuildState, SchedulerError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use spraid_core::{
    BindKind, ControllerId, DriveId, RaidGroup, RaidGroupId, RaidGroupState, RebuildCheckpoint,
};
use spraid_storage::CheckpointBackend;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("{0} is offline")]
    Offline(ControllerId),

    #[error("{controller} does not know {raid_group}")]
    UnknownRaidGroup {
        controller: ControllerId,
        raid_group: RaidGroupId,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// What one pump pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PumpReport {
    /// Chunks issued and completed
    pub chunks: usize,
    /// Positions that emitted Start
    pub started: Vec<usize>,
    /// Positions that emitted End
    pub completed: Vec<usize>,
    /// Positions held by a pause hook
    pub paused: BTreeSet<usize>,
    /// The scheduler was superseded and aborted
    pub superseded: bool,
    /// Nothing rebuilding and nothing waiting
    pub idle: bool,
}

impl PumpReport {
    pub fn made_progress(&self) -> bool {
        self.chunks > 0 || !self.started.is_empty() || !self.completed.is_empty()
    }
}

struct GroupRuntime {
    store: Arc<CheckpointStore>,
    hooks: Arc<HookRegistry>,
    scheduler: Mutex<Option<RebuildScheduler>>,
    /// Drive bound at each position
    drives: RwLock<Vec<Option<DriveId>>>,
    lifecycle: RwLock<RaidGroupState>,
}

pub struct ControllerContext {
    id: ControllerId,
    config: RebuildConfig,
    backend: Arc<dyn CheckpointBackend>,
    emitter: Arc<NotificationEmitter>,
    arbiter: Arc<OwnershipArbiter>,
    peer: Arc<LocalPeerLink>,
    groups: RwLock<HashMap<RaidGroupId, Arc<GroupRuntime>>>,
    /// Hooks re-installed on every boot
    boot_hooks: RwLock<HashMap<RaidGroupId, Arc<HookRegistry>>>,
    recovery: RecoverySequencer,
    online: AtomicBool,
}

impl ControllerContext {
    pub fn new(
        id: ControllerId,
        config: RebuildConfig,
        backend: Arc<dyn CheckpointBackend>,
        emitter: Arc<NotificationEmitter>,
        arbiter: Arc<OwnershipArbiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            backend,
            emitter,
            arbiter,
            peer: Arc::new(LocalPeerLink::new(id.peer())),
            groups: RwLock::new(HashMap::new()),
            boot_hooks: RwLock::new(HashMap::new()),
            recovery: RecoverySequencer::new(id),
            online: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn peer_link(&self) -> &Arc<LocalPeerLink> {
        &self.peer
    }

    pub fn recovery(&self) -> &RecoverySequencer {
        &self.recovery
    }

    fn check_online(&self) -> Result<()> {
        if !self.is_online() {
            return Err(ControllerError::Offline(self.id));
        }
        Ok(())
    }

    fn group(&self, raid_group: RaidGroupId) -> Result<Arc<GroupRuntime>> {
        self.groups
            .read()
            .get(&raid_group)
            .cloned()
            .ok_or(ControllerError::UnknownRaidGroup {
                controller: self.id,
                raid_group,
            })
    }

    /// Open the replica for a raid group and start its lifecycle
    pub fn attach_raid_group(&self, raid_group: &RaidGroup) -> Result<()> {
        self.check_online()?;
        let peer: Arc<dyn PeerLink> = self.peer.clone();
        let store = CheckpointStore::open(
            raid_group.id,
            self.id,
            raid_group.extent,
            raid_group.width(),
            self.backend.clone(),
            peer,
        )?;

        let hooks = Arc::new(HookRegistry::new());
        if let Some(carried) = self.boot_hooks.read().get(&raid_group.id) {
            carried.install_into(&hooks);
        }

        let runtime = GroupRuntime {
            store: Arc::new(store),
            hooks,
            scheduler: Mutex::new(None),
            drives: RwLock::new(raid_group.positions.iter().map(|p| p.bound).collect()),
            lifecycle: RwLock::new(RaidGroupState::Specialize),
        };
        self.groups.write().insert(raid_group.id, Arc::new(runtime));
        debug!(controller = %self.id, raid_group = %raid_group.id, "Raid group attached");
        Ok(())
    }

    /// Walk the lifecycle from Specialize to Ready, or Failed when broken
    pub fn activate_lifecycle(&self, raid_group: RaidGroupId, broken: bool) -> Result<()> {
        let runtime = self.group(raid_group)?;
        *runtime.lifecycle.write() = RaidGroupState::Activate;
        let state = if broken {
            RaidGroupState::Failed
        } else {
            RaidGroupState::Ready
        };
        *runtime.lifecycle.write() = state;
        info!(controller = %self.id, %raid_group, %state, "Raid group lifecycle settled");
        Ok(())
    }

    pub fn set_lifecycle(&self, raid_group: RaidGroupId, state: RaidGroupState) -> Result<()> {
        *self.group(raid_group)?.lifecycle.write() = state;
        Ok(())
    }

    /// `None` when offline or the group is unknown
    pub fn lifecycle(&self, raid_group: RaidGroupId) -> Option<RaidGroupState> {
        if !self.is_online() {
            return None;
        }
        self.group(raid_group).ok().map(|g| *g.lifecycle.read())
    }

    pub fn store(&self, raid_group: RaidGroupId) -> Result<Arc<CheckpointStore>> {
        Ok(self.group(raid_group)?.store.clone())
    }

    /// Hooks of the running instance
    pub fn hooks(&self, raid_group: RaidGroupId) -> Result<Arc<HookRegistry>> {
        Ok(self.group(raid_group)?.hooks.clone())
    }

    /// Hooks installed again each time this controller boots
    pub fn boot_hooks(&self, raid_group: RaidGroupId) -> Arc<HookRegistry> {
        self.boot_hooks
            .write()
            .entry(raid_group)
            .or_insert_with(|| Arc::new(HookRegistry::new()))
            .clone()
    }

    pub fn checkpoint(
        &self,
        raid_group: RaidGroupId,
        position: usize,
    ) -> Result<RebuildCheckpoint> {
        Ok(self.group(raid_group)?.store.get(position)?)
    }

    pub fn rebuild_state(&self, raid_group: RaidGroupId, position: usize) -> Option<RebuildState> {
        let runtime = self.group(raid_group).ok()?;
        let scheduler = runtime.scheduler.lock();
        scheduler.as_ref().and_then(|s| s.state(position))
    }

    /// A live scheduler instance runs here for the group
    pub fn is_active_for(&self, raid_group: RaidGroupId) -> bool {
        self.group(raid_group)
            .map(|g| g.scheduler.lock().as_ref().is_some_and(|s| !s.is_aborted()))
            .unwrap_or(false)
    }

    pub fn scheduler_generation(&self, raid_group: RaidGroupId) -> Option<u64> {
        let runtime = self.group(raid_group).ok()?;
        let scheduler = runtime.scheduler.lock();
        scheduler.as_ref().map(|s| s.generation())
    }

    pub fn highest_rebuild_position(&self, raid_group: RaidGroupId) -> Result<Option<usize>> {
        let runtime = self.group(raid_group)?;
        let scheduler = runtime.scheduler.lock();
        match scheduler.as_ref() {
            Some(s) => Ok(s.highest_rebuild_position()?),
            None => Ok(runtime.store.interrupted_positions().last().copied()),
        }
    }

    /// Reload a group's checkpoints and plan its resumptions
    pub fn recover(&self, raid_group: RaidGroupId) -> Result<RecoveryPlan> {
        let runtime = self.group(raid_group)?;
        Ok(self.recovery.recover(&runtime.store)?)
    }

    pub fn on_drive_bound(
        &self,
        raid_group: RaidGroupId,
        position: usize,
        drive: DriveId,
        kind: BindKind,
    ) -> Result<()> {
        self.check_online()?;
        let runtime = self.group(raid_group)?;
        if let Some(slot) = runtime.drives.write().get_mut(position) {
            *slot = Some(drive);
        }
        let mut guard = runtime.scheduler.lock();
        if let Some(scheduler) = guard.as_mut() {
            let result = scheduler.on_drive_bound(position, drive, kind);
            self.settle(&mut guard, &runtime.store);
            result?;
        }
        Ok(())
    }

    pub fn on_drive_removed(&self, raid_group: RaidGroupId, position: usize) -> Result<()> {
        self.check_online()?;
        let runtime = self.group(raid_group)?;
        if let Some(slot) = runtime.drives.write().get_mut(position) {
            *slot = None;
        }
        let mut guard = runtime.scheduler.lock();
        if let Some(scheduler) = guard.as_mut() {
            let result = scheduler.on_drive_removed(position);
            self.settle(&mut guard, &runtime.store);
            result?;
        }
        Ok(())
    }

    /// Drop a scheduler that aborted itself
    fn settle(&self, guard: &mut Option<RebuildScheduler>, store: &CheckpointStore) {
        if guard.as_ref().is_some_and(|s| s.is_aborted()) {
            *guard = None;
            store.become_standby();
        }
    }

    /// Data-path pass: start eligible positions and rebuild up to
    /// `max_chunks` chunks, round-robin across rebuilding positions.
    #[instrument(skip(self), fields(controller = %self.id))]
    pub fn pump(&self, raid_group: RaidGroupId, max_chunks: usize) -> Result<PumpReport> {
        self.check_online()?;
        let runtime = self.group(raid_group)?;
        let mut report = PumpReport::default();

        if self.arbiter.current_owner(raid_group)? != self.id {
            return Ok(report);
        }
        if *runtime.lifecycle.read() == RaidGroupState::Failed {
            debug!(%raid_group, "Raid group broken, no rebuild");
            return Ok(report);
        }

        let mut guard = runtime.scheduler.lock();
        let Some(scheduler) = guard.as_mut() else {
            report.idle = true;
            return Ok(report);
        };

        let claim = self.arbiter.claim_active(raid_group, self.id, scheduler.generation())?;
        if let ClaimOutcome::Rejected { owner, generation } = claim {
            warn!(
                %raid_group,
                %owner,
                generation,
                "Lost ownership claim, aborting rebuild"
            );
            scheduler.abort();
            self.settle(&mut guard, &runtime.store);
            report.superseded = true;
            return Ok(report);
        }

        report.started = scheduler.start_eligible()?;
        while report.chunks < max_chunks {
            let mut issued = false;
            for position in scheduler.rebuilding_positions() {
                if report.chunks >= max_chunks {
                    break;
                }
                match scheduler.next_chunk(position)? {
                    ChunkDecision::Issue { end, .. } => {
                        report.chunks += 1;
                        issued = true;
                        match scheduler.chunk_completed(position, RebuildCheckpoint::new(end))? {
                            ChunkOutcome::Completed { .. } => report.completed.push(position),
                            ChunkOutcome::Superseded { .. } => {
                                report.superseded = true;
                                self.settle(&mut guard, &runtime.store);
                                return Ok(report);
                            }
                            ChunkOutcome::Advanced { .. } => {}
                        }
                    }
                    ChunkDecision::Paused { .. } => {
                        report.paused.insert(position);
                    }
                    ChunkDecision::Finished { .. } => report.completed.push(position),
                    ChunkDecision::NotRebuilding => {}
                }
            }
            if !issued {
                break;
            }
            report.started.extend(scheduler.start_eligible()?);
        }
        report.idle = scheduler.is_idle();
        Ok(report)
    }

    /// Push a full snapshot of a group to the peer
    pub fn resync_peer(&self, raid_group: RaidGroupId) -> Result<MirrorAck> {
        let snapshot = self.group(raid_group)?.store.snapshot();
        let ack = self.peer.send_snapshot(snapshot)?;
        info!(controller = %self.id, %raid_group, peer = %self.peer.peer(), ?ack, "Peer resynced");
        Ok(ack)
    }

    /// Power loss: all in-memory state is gone, nothing more is emitted
    pub fn crash(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.peer.set_peer_reachable(false);
        self.groups.write().clear();
        self.recovery.clear();
        warn!(controller = %self.id, "Controller down");
    }

    /// Come back up: reattach every group and compute recovery plans.
    ///
    /// The controller is left standby for every group.
    #[instrument(skip(self, raid_groups), fields(controller = %self.id))]
    pub fn boot(&self, raid_groups: &[RaidGroup]) -> Result<Vec<RecoveryPlan>> {
        self.online.store(true, Ordering::SeqCst);
        let mut plans = Vec::with_capacity(raid_groups.len());
        for raid_group in raid_groups {
            self.attach_raid_group(raid_group)?;
            plans.push(self.recover(raid_group.id)?);
            self.activate_lifecycle(raid_group.id, raid_group.is_broken())?;
        }
        info!(groups = plans.len(), "Controller booted");
        Ok(plans)
    }
}

impl OwnershipListener for ControllerContext {
    fn became_active(&self, raid_group: RaidGroupId, generation: u64) {
        if !self.is_online() {
            return;
        }
        let Ok(runtime) = self.group(raid_group) else {
            warn!(controller = %self.id, %raid_group, "Activated for unknown raid group");
            return;
        };
        if let Err(e) = runtime.store.become_active(generation) {
            warn!(
                controller = %self.id,
                %raid_group,
                error = %e,
                "Could not take over checkpoints"
            );
            return;
        }

        let mut scheduler = RebuildScheduler::new(
            runtime.store.clone(),
            self.emitter.clone(),
            runtime.hooks.clone(),
            &self.config,
        );
        // The replica is current as of `become_active`; a boot-time plan may not be
        let mut resume: BTreeSet<usize> =
            runtime.store.interrupted_positions().into_iter().collect();
        resume.extend(self.recovery.take_pending(&runtime.store));

        let drives = runtime.drives.read().clone();
        for position in resume {
            match drives.get(position).copied().flatten() {
                Some(drive) => {
                    if let Err(e) = scheduler.resume(position, drive) {
                        warn!(%raid_group, position, error = %e, "Resume failed");
                    }
                }
                None => debug!(
                    %raid_group,
                    position,
                    "Interrupted position has no drive, waiting for bind"
                ),
            }
        }

        let previous = runtime.scheduler.lock().replace(scheduler);
        if let Some(mut old) = previous {
            old.abort();
        }
        info!(controller = %self.id, %raid_group, generation, "Controller active for raid group");
    }

    fn lost_active(&self, raid_group: RaidGroupId, generation: u64) {
        let Ok(runtime) = self.group(raid_group) else {
            return;
        };
        if let Some(mut scheduler) = runtime.scheduler.lock().take() {
            scheduler.abort();
        }
        runtime.store.become_standby();
        info!(controller = %self.id, %raid_group, generation, "Controller lost active status");
    }
}

impl MirrorSink for ControllerContext {
    fn apply_update(&self, update: &MirrorUpdate) -> std::result::Result<MirrorAck, MirrorError> {
        if !self.is_online() {
            return Err(MirrorError::PeerUnreachable(self.id));
        }
        let runtime = self
            .group(update.raid_group)
            .map_err(|_| MirrorError::UnknownRaidGroup(update.raid_group))?;
        let ack = runtime.store.apply_update(update)?;
        if let MirrorAck::Stale { .. } = ack {
            return Ok(ack);
        }
        // A newer generation from the peer means any local instance is stale
        let mut guard = runtime.scheduler.lock();
        if guard.as_ref().is_some_and(|s| s.generation() < update.generation) {
            if let Some(mut stale) = guard.take() {
                stale.abort();
            }
        }
        Ok(ack)
    }

    fn apply_snapshot(
        &self,
        snapshot: &MirrorSnapshot,
    ) -> std::result::Result<MirrorAck, MirrorError> {
        if !self.is_online() {
            return Err(MirrorError::PeerUnreachable(self.id));
        }
        let runtime = self
            .group(snapshot.raid_group)
            .map_err(|_| MirrorError::UnknownRaidGroup(snapshot.raid_group))?;
        let ack = runtime.store.apply_snapshot(snapshot)?;
        if ack == MirrorAck::Applied && self.recovery.forget(snapshot.raid_group) {
            debug!(
                controller = %self.id,
                raid_group = %snapshot.raid_group,
                "Resynced by peer, recovery plan dropped"
            );
        }
        Ok(ack)
    }
}
