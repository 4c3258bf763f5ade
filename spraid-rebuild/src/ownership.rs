//! Ownership Arbiter
//!
//! Decides which controller is active for each raid group. Every change of
//! owner bumps the group's generation; the generation travels with every
//! checkpoint write and notification so a deposed owner's in-flight work is
//! recognised and dropped.
//!
//! Listeners registered per controller are told when they gain or lose a
//! group. They are always called with no arbiter lock held.

use crate::metrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spraid_core::{ControllerId, RaidGroupId, RaidGroupState};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Ownership errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("Raid group {0} has no ownership record")]
    UnknownRaidGroup(RaidGroupId),

    #[error(
        "Ownership conflict on {raid_group}: \
         {claimant} claimed generation {claimed}, {owner} holds {current}"
    )]
    OwnershipConflict {
        raid_group: RaidGroupId,
        claimant: ControllerId,
        claimed: u64,
        owner: ControllerId,
        current: u64,
    },

    #[error("{0} is not alive")]
    ControllerDown(ControllerId),
}

pub type Result<T> = std::result::Result<T, OwnershipError>;

/// Active controller and generation of one raid group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub raid_group: RaidGroupId,
    pub active: ControllerId,
    pub generation: u64,
}

/// Told about ownership changes for one controller
pub trait OwnershipListener: Send + Sync {
    fn became_active(&self, raid_group: RaidGroupId, generation: u64);

    fn lost_active(&self, raid_group: RaidGroupId, generation: u64);
}

/// Lifecycle state as reported by each controller
pub trait LifecycleView: Send + Sync {
    /// `None` when the controller is down or does not know the group
    fn lifecycle_state(
        &self,
        controller: ControllerId,
        raid_group: RaidGroupId,
    ) -> Option<RaidGroupState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Transferred {
        from: ControllerId,
        to: ControllerId,
        generation: u64,
    },
    /// The owner is alive; nothing to do
    AlreadyTransferred { owner: ControllerId, generation: u64 },
    /// Neither controller is alive
    NoSurvivor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Joined as standby behind a live owner
    Standby { owner: ControllerId, generation: u64 },
    /// No live owner; the group waits for `assign_primary`
    AwaitingOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted { generation: u64 },
    /// The claimant lost and must abort its scheduler
    Rejected { owner: ControllerId, generation: u64 },
}

pub struct OwnershipArbiter {
    records: RwLock<HashMap<RaidGroupId, OwnershipRecord>>,
    alive: RwLock<HashMap<ControllerId, bool>>,
    listeners: RwLock<HashMap<ControllerId, Weak<dyn OwnershipListener>>>,
    primary: ControllerId,
}

impl OwnershipArbiter {
    pub fn new(primary: ControllerId) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            alive: RwLock::new(ControllerId::all().into_iter().map(|c| (c, true)).collect()),
            listeners: RwLock::new(HashMap::new()),
            primary,
        }
    }

    pub fn primary(&self) -> ControllerId {
        self.primary
    }

    pub fn add_listener(&self, controller: ControllerId, listener: &Arc<dyn OwnershipListener>) {
        self.listeners
            .write()
            .insert(controller, Arc::downgrade(listener));
    }

    fn listener(&self, controller: ControllerId) -> Option<Arc<dyn OwnershipListener>> {
        self.listeners.read().get(&controller).and_then(Weak::upgrade)
    }

    fn notify_active(&self, controller: ControllerId, raid_group: RaidGroupId, generation: u64) {
        if let Some(listener) = self.listener(controller) {
            listener.became_active(raid_group, generation);
        }
    }

    fn notify_lost(&self, controller: ControllerId, raid_group: RaidGroupId, generation: u64) {
        if let Some(listener) = self.listener(controller) {
            listener.lost_active(raid_group, generation);
        }
    }

    pub fn is_alive(&self, controller: ControllerId) -> bool {
        self.alive.read().get(&controller).copied().unwrap_or(false)
    }

    /// Peer-dead signal
    pub fn mark_dead(&self, controller: ControllerId) {
        self.alive.write().insert(controller, false);
        debug!(%controller, "Controller marked dead");
    }

    /// Peer-alive signal
    pub fn mark_alive(&self, controller: ControllerId) {
        self.alive.write().insert(controller, true);
        debug!(%controller, "Controller marked alive");
    }

    /// Start tracking a raid group with `owner` active at generation 1.
    ///
    /// A group already tracked keeps its record.
    pub fn register_raid_group(
        &self,
        raid_group: RaidGroupId,
        owner: ControllerId,
    ) -> OwnershipRecord {
        self.register_raid_group_above(raid_group, owner, 0)
    }

    /// Like `register_raid_group`, starting above a generation already found
    /// in durable storage.
    pub fn register_raid_group_above(
        &self,
        raid_group: RaidGroupId,
        owner: ControllerId,
        floor_generation: u64,
    ) -> OwnershipRecord {
        let (record, created) = {
            let mut records = self.records.write();
            match records.get(&raid_group) {
                Some(existing) => (*existing, false),
                None => {
                    let record = OwnershipRecord {
                        raid_group,
                        active: owner,
                        generation: floor_generation + 1,
                    };
                    records.insert(raid_group, record);
                    (record, true)
                }
            }
        };
        if created {
            info!(%raid_group, owner = %record.active, "Raid group ownership established");
            self.notify_active(record.active, raid_group, record.generation);
        }
        record
    }

    pub fn record(&self, raid_group: RaidGroupId) -> Result<OwnershipRecord> {
        self.records
            .read()
            .get(&raid_group)
            .copied()
            .ok_or(OwnershipError::UnknownRaidGroup(raid_group))
    }

    pub fn current_owner(&self, raid_group: RaidGroupId) -> Result<ControllerId> {
        Ok(self.record(raid_group)?.active)
    }

    pub fn generation(&self, raid_group: RaidGroupId) -> Result<u64> {
        Ok(self.record(raid_group)?.generation)
    }

    pub fn raid_groups(&self) -> Vec<RaidGroupId> {
        let mut ids: Vec<_> = self.records.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Active controller for `raid_group` is dead; hand the group to the
    /// survivor. A repeated signal for a group already handed over is a no-op.
    #[instrument(skip(self))]
    pub fn transfer_on_failure(&self, raid_group: RaidGroupId) -> Result<TransferOutcome> {
        let outcome = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&raid_group)
                .ok_or(OwnershipError::UnknownRaidGroup(raid_group))?;

            if self.is_alive(record.active) {
                return Ok(TransferOutcome::AlreadyTransferred {
                    owner: record.active,
                    generation: record.generation,
                });
            }
            let survivor = record.active.peer();
            if !self.is_alive(survivor) {
                warn!(%raid_group, "No surviving controller");
                return Ok(TransferOutcome::NoSurvivor);
            }

            let from = record.active;
            record.active = survivor;
            record.generation += 1;
            TransferOutcome::Transferred {
                from,
                to: survivor,
                generation: record.generation,
            }
        };

        if let TransferOutcome::Transferred { from, to, generation } = outcome {
            info!(%raid_group, %from, %to, generation, "Ownership transferred on failure");
            metrics::record_transfer(to);
            self.notify_active(to, raid_group, generation);
        }
        Ok(outcome)
    }

    /// A controller rejoined. It only ever comes back as standby.
    #[instrument(skip(self))]
    pub fn transfer_on_boot(
        &self,
        raid_group: RaidGroupId,
        controller: ControllerId,
    ) -> Result<BootOutcome> {
        self.mark_alive(controller);
        let record = self.record(raid_group)?;
        let owner_live = self.is_alive(record.active);

        if record.active != controller && owner_live {
            info!(
                %raid_group,
                %controller,
                owner = %record.active,
                generation = record.generation,
                "Controller joined as standby"
            );
            return Ok(BootOutcome::Standby {
                owner: record.active,
                generation: record.generation,
            });
        }

        let peer = controller.peer();
        if record.active == controller && self.is_alive(peer) {
            // Stale record from before this controller died; the peer took over
            // without a failure transfer, so hand the group to it first.
            self.force_owner(raid_group, peer);
            let record = self.record(raid_group)?;
            return Ok(BootOutcome::Standby {
                owner: record.active,
                generation: record.generation,
            });
        }

        debug!(%raid_group, %controller, "No live owner, waiting for primary assignment");
        Ok(BootOutcome::AwaitingOwner)
    }

    fn force_owner(&self, raid_group: RaidGroupId, owner: ControllerId) {
        let generation = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&raid_group) else {
                return;
            };
            record.active = owner;
            record.generation += 1;
            record.generation
        };
        info!(%raid_group, %owner, generation, "Ownership reassigned");
        metrics::record_transfer(owner);
        self.notify_active(owner, raid_group, generation);
    }

    /// Every live controller reports Ready for the group
    pub fn ready_check(&self, raid_group: RaidGroupId, lifecycle: &dyn LifecycleView) -> bool {
        let live: Vec<ControllerId> = ControllerId::all()
            .into_iter()
            .filter(|c| self.is_alive(*c))
            .collect();
        !live.is_empty()
            && live
                .iter()
                .all(|c| lifecycle.lifecycle_state(*c, raid_group) == Some(RaidGroupState::Ready))
    }

    /// Pick an owner after a dual crash: the primary if alive, else the other.
    ///
    /// Waits for the ready check; returns `None` when it does not pass yet.
    /// `floor_generation` is the highest generation found in durable storage.
    #[instrument(skip(self, lifecycle))]
    pub fn assign_primary(
        &self,
        raid_group: RaidGroupId,
        lifecycle: &dyn LifecycleView,
        floor_generation: u64,
    ) -> Result<Option<OwnershipRecord>> {
        if !self.ready_check(raid_group, lifecycle) {
            debug!(%raid_group, "Ready check not passed, ownership deferred");
            return Ok(None);
        }
        let owner = if self.is_alive(self.primary) {
            self.primary
        } else {
            self.primary.peer()
        };

        let record = {
            let mut records = self.records.write();
            let record = records.entry(raid_group).or_insert(OwnershipRecord {
                raid_group,
                active: owner,
                generation: 0,
            });
            record.active = owner;
            record.generation = record.generation.max(floor_generation) + 1;
            *record
        };

        info!(
            %raid_group,
            %owner,
            generation = record.generation,
            "Primary assigned after recovery"
        );
        metrics::record_transfer(owner);
        self.notify_active(owner, raid_group, record.generation);
        Ok(Some(record))
    }

    /// Resolve a claim of active status.
    ///
    /// The higher generation wins; an equal generation stays with the
    /// incumbent. A displaced owner is told through its listener; a rejected
    /// claimant is expected to abort on its own.
    pub fn claim_active(
        &self,
        raid_group: RaidGroupId,
        claimant: ControllerId,
        generation: u64,
    ) -> Result<ClaimOutcome> {
        let (outcome, displaced) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&raid_group)
                .ok_or(OwnershipError::UnknownRaidGroup(raid_group))?;

            if record.active == claimant && generation == record.generation {
                return Ok(ClaimOutcome::Granted { generation });
            }

            let conflict = OwnershipError::OwnershipConflict {
                raid_group,
                claimant,
                claimed: generation,
                owner: record.active,
                current: record.generation,
            };
            warn!(error = %conflict, "Resolving ownership conflict");
            metrics::record_conflict();

            if generation > record.generation {
                let displaced =
                    (record.active != claimant).then_some((record.active, record.generation));
                record.active = claimant;
                record.generation = generation;
                (ClaimOutcome::Granted { generation }, displaced)
            } else {
                (
                    ClaimOutcome::Rejected {
                        owner: record.active,
                        generation: record.generation,
                    },
                    None,
                )
            }
        };

        if let Some((loser, old_generation)) = displaced {
            self.notify_lost(loser, raid_group, old_generation);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, RaidGroupId, u64)>>,
    }

    impl OwnershipListener for Recorder {
        fn became_active(&self, raid_group: RaidGroupId, generation: u64) {
            self.events.lock().push(("active", raid_group, generation));
        }

        fn lost_active(&self, raid_group: RaidGroupId, generation: u64) {
            self.events.lock().push(("lost", raid_group, generation));
        }
    }

    struct AllReady;

    impl LifecycleView for AllReady {
        fn lifecycle_state(&self, _: ControllerId, _: RaidGroupId) -> Option<RaidGroupState> {
            Some(RaidGroupState::Ready)
        }
    }

    struct NotReady(ControllerId);

    impl LifecycleView for NotReady {
        fn lifecycle_state(
            &self,
            controller: ControllerId,
            _: RaidGroupId,
        ) -> Option<RaidGroupState> {
            if controller == self.0 {
                Some(RaidGroupState::Activate)
            } else {
                Some(RaidGroupState::Ready)
            }
        }
    }

    fn arbiter() -> (OwnershipArbiter, Arc<Recorder>, Arc<Recorder>) {
        let arbiter = OwnershipArbiter::new(ControllerId::A);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let la: Arc<dyn OwnershipListener> = a.clone();
        let lb: Arc<dyn OwnershipListener> = b.clone();
        arbiter.add_listener(ControllerId::A, &la);
        arbiter.add_listener(ControllerId::B, &lb);
        (arbiter, a, b)
    }

    const RG: RaidGroupId = RaidGroupId(7);

    #[test]
    fn test_register_notifies_owner_once() {
        let (arbiter, a, _) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::A);
        arbiter.register_raid_group(RG, ControllerId::B);
        assert_eq!(arbiter.current_owner(RG).unwrap(), ControllerId::A);
        assert_eq!(a.events.lock().as_slice(), &[("active", RG, 1)]);
    }

    #[test]
    fn test_transfer_on_failure_is_idempotent() {
        let (arbiter, _, b) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::A);
        arbiter.mark_dead(ControllerId::A);

        let first = arbiter.transfer_on_failure(RG).unwrap();
        assert_eq!(
            first,
            TransferOutcome::Transferred {
                from: ControllerId::A,
                to: ControllerId::B,
                generation: 2
            }
        );
        let second = arbiter.transfer_on_failure(RG).unwrap();
        assert_eq!(
            second,
            TransferOutcome::AlreadyTransferred {
                owner: ControllerId::B,
                generation: 2
            }
        );
        assert_eq!(b.events.lock().len(), 1);
    }

    #[test]
    fn test_no_survivor() {
        let (arbiter, _, _) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::A);
        arbiter.mark_dead(ControllerId::A);
        arbiter.mark_dead(ControllerId::B);
        assert_eq!(arbiter.transfer_on_failure(RG).unwrap(), TransferOutcome::NoSurvivor);
        assert_eq!(arbiter.generation(RG).unwrap(), 1);
    }

    #[test]
    fn test_boot_joins_as_standby() {
        let (arbiter, a, _) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::A);
        arbiter.mark_dead(ControllerId::A);
        arbiter.transfer_on_failure(RG).unwrap();

        let outcome = arbiter.transfer_on_boot(RG, ControllerId::A).unwrap();
        assert_eq!(
            outcome,
            BootOutcome::Standby {
                owner: ControllerId::B,
                generation: 2
            }
        );
        assert_eq!(arbiter.current_owner(RG).unwrap(), ControllerId::B);
        assert_eq!(a.events.lock().len(), 1);
    }

    #[test]
    fn test_assign_primary_waits_for_ready() {
        let (arbiter, a, _) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::B);
        arbiter.mark_dead(ControllerId::A);
        arbiter.mark_dead(ControllerId::B);
        assert_eq!(
            arbiter.transfer_on_boot(RG, ControllerId::A).unwrap(),
            BootOutcome::AwaitingOwner
        );
        arbiter.mark_alive(ControllerId::B);

        assert_eq!(arbiter.assign_primary(RG, &NotReady(ControllerId::B), 0).unwrap(), None);
        let record = arbiter.assign_primary(RG, &AllReady, 5).unwrap().unwrap();
        assert_eq!(record.active, ControllerId::A);
        assert_eq!(record.generation, 6);
        assert_eq!(a.events.lock().last(), Some(&("active", RG, 6)));
    }

    #[test]
    fn test_claim_higher_generation_wins() {
        let (arbiter, a, _) = arbiter();
        arbiter.register_raid_group(RG, ControllerId::A);

        assert_eq!(
            arbiter.claim_active(RG, ControllerId::B, 1).unwrap(),
            ClaimOutcome::Rejected {
                owner: ControllerId::A,
                generation: 1
            }
        );
        assert_eq!(
            arbiter.claim_active(RG, ControllerId::B, 3).unwrap(),
            ClaimOutcome::Granted { generation: 3 }
        );
        assert_eq!(arbiter.current_owner(RG).unwrap(), ControllerId::B);
        assert_eq!(a.events.lock().last(), Some(&("lost", RG, 1)));

        // The deposed owner's stale claim is refused
        assert!(matches!(
            arbiter.claim_active(RG, ControllerId::A, 1).unwrap(),
            ClaimOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn test_unknown_group() {
        let (arbiter, _, _) = arbiter();
        assert_eq!(
            arbiter.current_owner(RG),
            Err(OwnershipError::UnknownRaidGroup(RG))
        );
    }
}
