//! Rebuild Scheduler
//!
//! One instance per raid group on the active controller, bound to the
//! ownership generation it was created under. Drives each degraded position
//! through `Idle -> Starting -> InProgress -> Completing -> Idle`, advancing
//! the checkpoint store on every chunk completion and emitting milestones.
//!
//! The data path asks `next_chunk` what to rebuild and reports back through
//! `chunk_completed`. An instance that loses ownership is aborted: it stops
//! without an End event and its undelivered events are purged.

use crate::checkpoint_store::{CheckpointError, CheckpointStore, WriteOutcome};
use crate::config::RebuildConfig;
use crate::hooks::{HookRegistry, PauseContext, RebuildPhase};
use crate::metrics;
use crate::notification::{
    NotificationEmitter, NotificationEvent, NotificationKind, NotificationStatus,
};
use spraid_core::{BindKind, ControllerId, DriveId, Lba, RaidGroupId, RebuildCheckpoint};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Position {position} is not rebuilding")]
    NotRebuilding { position: usize },

    #[error("Position {position} out of range for width {width}")]
    InvalidPosition { position: usize, width: usize },

    #[error("Scheduler for {raid_group} generation {generation} was aborted")]
    Aborted { raid_group: RaidGroupId, generation: u64 },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Per-position rebuild state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    Idle,
    Starting,
    InProgress,
    Completing,
}

/// What the data path should do next for a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDecision {
    /// Rebuild blocks `start..end`, then report `end`
    Issue { start: Lba, end: Lba },
    /// A pause hook holds the position
    Paused { checkpoint: RebuildCheckpoint },
    /// The position was already rebuilt; End has been emitted
    Finished { percent: u8 },
    NotRebuilding,
}

/// Result of reporting a completed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Advanced { checkpoint: RebuildCheckpoint, percent: u8 },
    Completed { percent: u8 },
    /// A newer generation owns the group; this instance aborted itself
    Superseded { generation: u64 },
}

#[derive(Debug, Clone)]
struct PositionRebuild {
    state: RebuildState,
    drive: Option<DriveId>,
    /// Drive bound, waiting for a start slot
    eligible: bool,
    /// At least one chunk completed by this instance
    work_done: bool,
    last_progress: Option<u8>,
    force_progress: bool,
}

impl PositionRebuild {
    fn idle() -> Self {
        Self {
            state: RebuildState::Idle,
            drive: None,
            eligible: false,
            work_done: false,
            last_progress: None,
            force_progress: false,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, RebuildState::Starting | RebuildState::InProgress)
    }
}

pub struct RebuildScheduler {
    raid_group: RaidGroupId,
    controller: ControllerId,
    generation: u64,
    extent: Lba,
    chunk_size: Lba,
    progress_interval: u8,
    max_parallel: usize,
    store: Arc<CheckpointStore>,
    emitter: Arc<NotificationEmitter>,
    hooks: Arc<HookRegistry>,
    positions: Vec<PositionRebuild>,
    parallel_reported: HashSet<(usize, usize)>,
    aborted: bool,
}

impl RebuildScheduler {
    pub fn new(
        store: Arc<CheckpointStore>,
        emitter: Arc<NotificationEmitter>,
        hooks: Arc<HookRegistry>,
        config: &RebuildConfig,
    ) -> Self {
        let width = store.width();
        Self {
            raid_group: store.raid_group(),
            controller: store.controller(),
            generation: store.generation(),
            extent: store.extent(),
            chunk_size: config.chunk_size_blocks,
            progress_interval: config.progress_interval_percent.max(1),
            max_parallel: config.max_parallel_rebuilds.max(1),
            store,
            emitter,
            hooks,
            positions: vec![PositionRebuild::idle(); width],
            parallel_reported: HashSet::new(),
            aborted: false,
        }
    }

    pub fn raid_group(&self) -> RaidGroupId {
        self.raid_group
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn state(&self, position: usize) -> Option<RebuildState> {
        self.positions.get(position).map(|p| p.state)
    }

    /// Positions in Starting or InProgress
    pub fn rebuilding_positions(&self) -> Vec<usize> {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_busy())
            .map(|(i, _)| i)
            .collect()
    }

    /// Nothing rebuilding and nothing waiting to start
    pub fn is_idle(&self) -> bool {
        self.positions
            .iter()
            .all(|p| p.state == RebuildState::Idle && !p.eligible)
    }

    fn check_live(&self) -> Result<()> {
        if self.aborted {
            return Err(SchedulerError::Aborted {
                raid_group: self.raid_group,
                generation: self.generation,
            });
        }
        Ok(())
    }

    fn check_position(&self, position: usize) -> Result<()> {
        self.check_live()?;
        if position >= self.positions.len() {
            return Err(SchedulerError::InvalidPosition {
                position,
                width: self.positions.len(),
            });
        }
        Ok(())
    }

    /// Abort on a superseded write
    fn check_write(&mut self, outcome: WriteOutcome) -> Result<()> {
        if let WriteOutcome::Superseded { .. } = outcome {
            self.abort();
            return Err(SchedulerError::Aborted {
                raid_group: self.raid_group,
                generation: self.generation,
            });
        }
        Ok(())
    }

    /// A drive was bound to a position.
    ///
    /// A replacement resets the checkpoint for a full rebuild; a reinserted
    /// drive continues from the stored checkpoint.
    pub fn on_drive_bound(
        &mut self,
        position: usize,
        drive: DriveId,
        kind: BindKind,
    ) -> Result<()> {
        self.check_position(position)?;
        let outcome = match kind {
            BindKind::Replacement => self.store.reset(position)?,
            BindKind::Reinserted => self.store.mark_in_progress(position)?,
        };
        self.check_write(outcome)?;

        debug!(
            raid_group = %self.raid_group,
            position,
            %drive,
            ?kind,
            "Drive bound, position eligible for rebuild"
        );
        self.positions[position] = PositionRebuild {
            drive: Some(drive),
            eligible: true,
            ..PositionRebuild::idle()
        };
        Ok(())
    }

    /// The drive left a position. Any rebuild stops without an End event.
    pub fn on_drive_removed(&mut self, position: usize) -> Result<()> {
        self.check_position(position)?;
        let outcome = self.store.mark_degraded(position)?;
        self.check_write(outcome)?;

        if self.positions[position].state != RebuildState::Idle {
            info!(
                raid_group = %self.raid_group,
                position,
                checkpoint = %self.store.get(position)?,
                "Rebuild interrupted by drive removal"
            );
        }
        self.positions[position] = PositionRebuild::idle();
        self.update_gauge();
        Ok(())
    }

    /// Continue an interrupted rebuild from the stored checkpoint.
    ///
    /// No Start is emitted; the next milestone is a Progress or the End.
    pub fn resume(&mut self, position: usize, drive: DriveId) -> Result<()> {
        self.check_position(position)?;
        let checkpoint = self.store.get(position)?;
        info!(
            raid_group = %self.raid_group,
            position,
            %checkpoint,
            controller = %self.controller,
            generation = self.generation,
            "Resuming rebuild"
        );
        self.positions[position] = PositionRebuild {
            state: RebuildState::InProgress,
            drive: Some(drive),
            force_progress: true,
            ..PositionRebuild::idle()
        };
        self.update_gauge();
        Ok(())
    }

    /// Move eligible positions into the rebuild, lowest index first, up to
    /// the parallel limit. Returns the positions that emitted Start.
    pub fn start_eligible(&mut self) -> Result<Vec<usize>> {
        self.check_live()?;
        let mut busy = self.positions.iter().filter(|p| p.is_busy()).count();
        let mut started = Vec::new();

        for position in 0..self.positions.len() {
            let entry = &self.positions[position];
            let held = entry.state == RebuildState::Starting;
            let fresh = entry.eligible && entry.state == RebuildState::Idle;
            if !held && !fresh {
                continue;
            }
            if fresh {
                if busy >= self.max_parallel {
                    continue;
                }
                busy += 1;
                let entry = &mut self.positions[position];
                entry.state = RebuildState::Starting;
                entry.eligible = false;
            }

            let checkpoint = self.store.get(position)?;
            let ctx = self.pause_context(position, RebuildPhase::Start, checkpoint);
            if self.hooks.should_pause(&ctx) {
                debug!(raid_group = %self.raid_group, position, "Rebuild held before start");
                continue;
            }

            let percent = checkpoint.percent_of(self.extent);
            info!(
                raid_group = %self.raid_group,
                position,
                %checkpoint,
                controller = %self.controller,
                "Rebuild started"
            );
            self.emit(position, NotificationKind::Start, percent, NotificationStatus::Ok);
            self.positions[position].last_progress = Some(percent);

            if checkpoint.is_complete(self.extent) {
                self.finish(position);
            } else {
                self.positions[position].state = RebuildState::InProgress;
            }
            started.push(position);
        }

        self.update_gauge();
        Ok(started)
    }

    /// Next chunk to rebuild for a position
    pub fn next_chunk(&mut self, position: usize) -> Result<ChunkDecision> {
        self.check_position(position)?;
        if self.positions[position].state != RebuildState::InProgress {
            return Ok(ChunkDecision::NotRebuilding);
        }

        let checkpoint = self.store.get(position)?;
        if checkpoint.is_complete(self.extent) {
            let percent = self.finish(position);
            return Ok(ChunkDecision::Finished { percent });
        }

        let ctx = self.pause_context(position, RebuildPhase::Chunk, checkpoint);
        if self.hooks.should_pause(&ctx) {
            // Report where the pause point left us once the hook is cleared
            self.positions[position].force_progress = true;
            return Ok(ChunkDecision::Paused { checkpoint });
        }

        let start = checkpoint.lba();
        let end = start.saturating_add(self.chunk_size).min(self.extent);
        Ok(ChunkDecision::Issue { start, end })
    }

    /// The data path finished rebuilding up to `new_checkpoint`.
    ///
    /// The checkpoint is persisted and mirrored before this returns.
    pub fn chunk_completed(
        &mut self,
        position: usize,
        new_checkpoint: RebuildCheckpoint,
    ) -> Result<ChunkOutcome> {
        self.check_position(position)?;
        if self.positions[position].state != RebuildState::InProgress {
            return Err(SchedulerError::NotRebuilding { position });
        }

        let written = self.store.advance(position, new_checkpoint)?;
        if let WriteOutcome::Superseded { generation } = written {
            warn!(
                raid_group = %self.raid_group,
                position,
                ours = self.generation,
                newer = generation,
                "Rebuild superseded by newer owner"
            );
            self.abort();
            return Ok(ChunkOutcome::Superseded { generation });
        }
        metrics::record_chunk(self.raid_group);
        self.positions[position].work_done = true;
        self.detect_parallel(position, new_checkpoint)?;

        if new_checkpoint.is_complete(self.extent) {
            let percent = self.finish(position);
            return Ok(ChunkOutcome::Completed { percent });
        }

        let percent = new_checkpoint.percent_of(self.extent);
        let interval = self.progress_interval;
        let entry = &self.positions[position];
        let crossed = match entry.last_progress {
            Some(last) => percent / interval > last / interval,
            None => true,
        };
        if entry.force_progress || crossed {
            self.emit(position, NotificationKind::Progress, percent, NotificationStatus::Ok);
            let entry = &mut self.positions[position];
            entry.last_progress = Some(percent);
            entry.force_progress = false;
        }

        Ok(ChunkOutcome::Advanced {
            checkpoint: new_checkpoint,
            percent,
        })
    }

    fn finish(&mut self, position: usize) -> u8 {
        self.positions[position].state = RebuildState::Completing;
        let work_done = self.positions[position].work_done;
        let (percent, status) = if work_done {
            (100, NotificationStatus::Ok)
        } else {
            (0, NotificationStatus::NothingToDo)
        };

        info!(
            raid_group = %self.raid_group,
            position,
            percent,
            controller = %self.controller,
            "Rebuild complete"
        );
        self.emit(position, NotificationKind::End, percent, status);

        self.positions[position] = PositionRebuild::idle();
        self.parallel_reported
            .retain(|(a, b)| *a != position && *b != position);
        self.update_gauge();
        percent
    }

    fn detect_parallel(&mut self, position: usize, checkpoint: RebuildCheckpoint) -> Result<()> {
        for other in 0..self.positions.len() {
            if other == position || self.positions[other].state != RebuildState::InProgress {
                continue;
            }
            if self.store.get(other)? != checkpoint {
                continue;
            }
            let pair = (position.min(other), position.max(other));
            if self.parallel_reported.insert(pair) {
                warn!(
                    raid_group = %self.raid_group,
                    position,
                    other,
                    %checkpoint,
                    "Parallel rebuild detected"
                );
                metrics::record_parallel_rebuild(self.raid_group);
            }
        }
        Ok(())
    }

    /// Position with the highest unfinished checkpoint.
    ///
    /// When several positions share it, the last one wins.
    pub fn highest_rebuild_position(&self) -> Result<Option<usize>> {
        let mut best: Option<(usize, RebuildCheckpoint)> = None;
        for position in 0..self.positions.len() {
            let checkpoint = self.store.get(position)?;
            let rebuilding =
                self.positions[position].is_busy() || self.store.is_in_progress(position)?;
            if !rebuilding || checkpoint.is_complete(self.extent) {
                continue;
            }
            match best {
                Some((prev, best_checkpoint)) if checkpoint == best_checkpoint => {
                    info!(
                        raid_group = %self.raid_group,
                        position,
                        other = prev,
                        %checkpoint,
                        "Parallel rebuild at same checkpoint"
                    );
                    best = Some((position, checkpoint));
                }
                Some((_, best_checkpoint)) if checkpoint < best_checkpoint => {}
                _ => best = Some((position, checkpoint)),
            }
        }
        Ok(best.map(|(position, _)| position))
    }

    /// Stop this instance without emitting End for any position
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        let interrupted = self.rebuilding_positions();
        for entry in &mut self.positions {
            *entry = PositionRebuild::idle();
        }
        let discarded = self.emitter.discard_from(self.controller, self.generation);
        info!(
            raid_group = %self.raid_group,
            controller = %self.controller,
            generation = self.generation,
            ?interrupted,
            discarded,
            "Rebuild scheduler aborted"
        );
        metrics::set_positions_rebuilding(self.raid_group, 0);
    }

    fn pause_context(
        &self,
        position: usize,
        phase: RebuildPhase,
        checkpoint: RebuildCheckpoint,
    ) -> PauseContext {
        PauseContext {
            raid_group: self.raid_group,
            position,
            phase,
            checkpoint,
            extent: self.extent,
        }
    }

    fn emit(
        &self,
        position: usize,
        kind: NotificationKind,
        percent: u8,
        status: NotificationStatus,
    ) {
        let Some(drive) = self.positions[position].drive else {
            debug!(
                raid_group = %self.raid_group,
                position,
                "No drive bound, milestone not emitted"
            );
            return;
        };
        self.emitter.emit(NotificationEvent {
            drive,
            raid_group: self.raid_group,
            position,
            kind,
            percent,
            status,
            source: self.controller,
            generation: self.generation,
        });
    }

    fn update_gauge(&self) {
        metrics::set_positions_rebuilding(self.raid_group, self.rebuilding_positions().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{PauseAtCheckpoint, PauseAtStart};
    use crate::mirror::LocalPeerLink;
    use crate::notification::{EventMask, RegistrationHandle};
    use spraid_storage::{CheckpointBackend, MemoryBackend};
    use std::time::Duration;

    const EXTENT: Lba = 0x10000;

    struct Fixture {
        store: Arc<CheckpointStore>,
        emitter: Arc<NotificationEmitter>,
        hooks: Arc<HookRegistry>,
        scheduler: RebuildScheduler,
    }

    fn fixture(width: usize, queue_depth: usize) -> Fixture {
        let backend: Arc<dyn CheckpointBackend> = Arc::new(MemoryBackend::new());
        let link = Arc::new(LocalPeerLink::new(ControllerId::B));
        let rg = RaidGroupId(1);
        let store = CheckpointStore::open(rg, ControllerId::A, EXTENT, width, backend, link);
        let store = Arc::new(store.unwrap());
        store.become_active(1).unwrap();
        let emitter = Arc::new(NotificationEmitter::new(queue_depth));
        let hooks = Arc::new(HookRegistry::new());
        let config = RebuildConfig {
            chunk_size_blocks: 0x800,
            ..Default::default()
        };
        let scheduler =
            RebuildScheduler::new(store.clone(), emitter.clone(), hooks.clone(), &config);
        Fixture {
            store,
            emitter,
            hooks,
            scheduler,
        }
    }

    fn drive(position: usize) -> DriveId {
        DriveId(0x200 + position as u64)
    }

    /// Issue and complete chunks until the position stops issuing
    fn run_position(scheduler: &mut RebuildScheduler, position: usize) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::new();
        while let ChunkDecision::Issue { end, .. } = scheduler.next_chunk(position).unwrap() {
            outcomes.push(
                scheduler
                    .chunk_completed(position, RebuildCheckpoint::new(end))
                    .unwrap(),
            );
        }
        outcomes
    }

    async fn drain(
        emitter: &NotificationEmitter,
        handle: RegistrationHandle,
    ) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        while emitter.pending(handle).unwrap() > 0 {
            events.push(emitter.wait(handle, Duration::from_secs(1)).await.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_full_rebuild_sequence() {
        let mut f = fixture(3, 64);
        let handle = f.emitter.register(drive(1), EventMask::ALL).unwrap();

        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![1]);
        let outcomes = run_position(&mut f.scheduler, 1);
        assert_eq!(outcomes.last(), Some(&ChunkOutcome::Completed { percent: 100 }));
        assert!(f.scheduler.is_idle());

        let events = drain(&f.emitter, handle).await;
        assert_eq!(events.first().map(|e| (e.kind, e.percent)), Some((NotificationKind::Start, 0)));
        assert_eq!(events.last().map(|e| (e.kind, e.percent)), Some((NotificationKind::End, 100)));
        let progress: Vec<u8> = events
            .iter()
            .filter(|e| e.kind == NotificationKind::Progress)
            .map(|e| e.percent)
            .collect();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_chunk_completed_rejects_regression() {
        let mut f = fixture(3, 1);
        f.scheduler.on_drive_bound(0, drive(0), BindKind::Replacement).unwrap();
        f.scheduler.start_eligible().unwrap();
        f.scheduler.chunk_completed(0, RebuildCheckpoint::new(0x1000)).unwrap();

        let result = f.scheduler.chunk_completed(0, RebuildCheckpoint::new(0x800));
        assert!(matches!(
            result,
            Err(SchedulerError::Checkpoint(CheckpointError::InvalidCheckpoint { .. }))
        ));
        assert!(matches!(
            f.scheduler.chunk_completed(2, RebuildCheckpoint::new(0x800)),
            Err(SchedulerError::NotRebuilding { position: 2 })
        ));
    }

    #[test]
    fn test_parallel_limit_lowest_index_first() {
        let mut f = fixture(4, 1);
        for position in [3, 2, 0] {
            f.scheduler
                .on_drive_bound(position, drive(position), BindKind::Replacement)
                .unwrap();
        }
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![0, 2]);
        assert_eq!(f.scheduler.state(3), Some(RebuildState::Idle));

        run_position(&mut f.scheduler, 0);
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![3]);
    }

    #[test]
    fn test_pause_at_start_holds_position() {
        let mut f = fixture(3, 1);
        let hook = f.hooks.add(Arc::new(PauseAtStart::position(1)));
        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();

        assert!(f.scheduler.start_eligible().unwrap().is_empty());
        assert_eq!(f.scheduler.state(1), Some(RebuildState::Starting));
        assert_eq!(f.scheduler.next_chunk(1).unwrap(), ChunkDecision::NotRebuilding);

        f.hooks.remove(hook);
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![1]);
        assert_eq!(f.scheduler.state(1), Some(RebuildState::InProgress));
    }

    #[tokio::test]
    async fn test_pause_at_checkpoint_then_progress() {
        let mut f = fixture(3, 1);
        let pause = PauseAtCheckpoint::from_percent(EXTENT, 10).unwrap();
        let target = pause.lba;
        let hook = f.hooks.add(Arc::new(pause));

        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();
        f.scheduler.start_eligible().unwrap();
        run_position(&mut f.scheduler, 1);
        let paused_at = f.store.get(1).unwrap();
        assert!(paused_at.lba() >= target);
        assert!(matches!(f.scheduler.next_chunk(1).unwrap(), ChunkDecision::Paused { .. }));

        let handle = f.emitter.register(drive(1), EventMask::PROGRESS).unwrap();
        f.hooks.remove(hook);
        let ChunkDecision::Issue { end, .. } = f.scheduler.next_chunk(1).unwrap() else {
            panic!("expected a chunk after the hook was cleared");
        };
        f.scheduler.chunk_completed(1, RebuildCheckpoint::new(end)).unwrap();

        let event = f.emitter.wait(handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.kind, NotificationKind::Progress);
        assert!(event.percent >= paused_at.percent_of(EXTENT));
    }

    #[tokio::test]
    async fn test_reinsert_already_complete_ends_at_zero() {
        let mut f = fixture(3, 4);
        let handle = f.emitter.register(drive(2), EventMask::ALL).unwrap();
        f.scheduler.on_drive_bound(2, drive(2), BindKind::Reinserted).unwrap();
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![2]);

        let events = drain(&f.emitter, handle).await;
        let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.percent, e.status)).collect();
        assert_eq!(
            kinds,
            vec![
                (NotificationKind::Start, 100, NotificationStatus::Ok),
                (NotificationKind::End, 0, NotificationStatus::NothingToDo),
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_emits_progress_not_start() {
        let mut f = fixture(3, 8);
        f.store.reset(1).unwrap();
        f.store.advance(1, RebuildCheckpoint::new(EXTENT / 2)).unwrap();

        let handle = f.emitter.register(drive(1), EventMask::ALL).unwrap();
        f.scheduler.resume(1, drive(1)).unwrap();
        assert!(f.scheduler.start_eligible().unwrap().is_empty());
        let ChunkDecision::Issue { start, end } = f.scheduler.next_chunk(1).unwrap() else {
            panic!("expected a chunk");
        };
        assert_eq!(start, EXTENT / 2);
        f.scheduler.chunk_completed(1, RebuildCheckpoint::new(end)).unwrap();

        let first = f.emitter.wait(handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.kind, NotificationKind::Progress);
        assert!(first.percent >= 50);
    }

    #[test]
    fn test_parallel_rebuild_detected_without_error() {
        let mut f = fixture(6, 1);
        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();
        f.scheduler.on_drive_bound(2, drive(2), BindKind::Replacement).unwrap();
        assert_eq!(f.scheduler.start_eligible().unwrap(), vec![1, 2]);

        for position in [1, 2] {
            f.scheduler
                .chunk_completed(position, RebuildCheckpoint::new(0x800))
                .unwrap();
        }
        assert_eq!(f.scheduler.highest_rebuild_position().unwrap(), Some(2));

        f.scheduler.chunk_completed(1, RebuildCheckpoint::new(0x1000)).unwrap();
        assert_eq!(f.scheduler.highest_rebuild_position().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_abort_purges_without_end() {
        let mut f = fixture(3, 8);
        let handle = f.emitter.register(drive(1), EventMask::ALL).unwrap();
        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();
        f.scheduler.start_eligible().unwrap();
        assert_eq!(f.emitter.pending(handle).unwrap(), 1);

        f.scheduler.abort();
        assert_eq!(f.emitter.pending(handle).unwrap(), 0);
        assert!(matches!(
            f.scheduler.next_chunk(1),
            Err(SchedulerError::Aborted { .. })
        ));
        // Checkpoint survives for the next owner
        assert!(f.store.is_in_progress(1).unwrap());
    }

    #[test]
    fn test_removal_interrupts_without_end() {
        let mut f = fixture(3, 1);
        f.scheduler.on_drive_bound(1, drive(1), BindKind::Replacement).unwrap();
        f.scheduler.start_eligible().unwrap();
        f.scheduler.chunk_completed(1, RebuildCheckpoint::new(0x800)).unwrap();

        f.scheduler.on_drive_removed(1).unwrap();
        assert_eq!(f.scheduler.state(1), Some(RebuildState::Idle));
        assert_eq!(f.store.get(1).unwrap().lba(), 0x800);

        f.scheduler.on_drive_bound(1, drive(1), BindKind::Reinserted).unwrap();
        f.scheduler.start_eligible().unwrap();
        assert_eq!(
            f.scheduler.next_chunk(1).unwrap(),
            ChunkDecision::Issue { start: 0x800, end: 0x1000 }
        );
    }
}
