//! Notification Emitter
//!
//! Delivers rebuild milestones (Start, Progress, End) to registered waiters.
//! Each registration holds a bounded queue of pending events; with the default
//! depth of one, a second event before the first is consumed replaces it.
//! `wait` is the only suspending operation in the rebuild subsystem.

use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use spraid_core::{ControllerId, DriveId, RaidGroupId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

/// Notification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Registration already exists for {target} with mask {mask}")]
    DuplicateRegistration {
        target: NotificationTarget,
        mask: EventMask,
    },

    #[error("Timed out after {0:?} waiting for notification")]
    Timeout(Duration),

    #[error("Unknown registration {0}")]
    UnknownRegistration(RegistrationHandle),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

/// Milestone kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Start,
    Progress,
    End,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Start => "start",
            NotificationKind::Progress => "progress",
            NotificationKind::End => "end",
        }
    }
}

/// Status attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Ok,
    /// End of a sequence that found the position already rebuilt
    NothingToDo,
}

/// Set of event kinds a registration listens for
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u8);

impl EventMask {
    pub const START: EventMask = EventMask(0b001);
    pub const PROGRESS: EventMask = EventMask(0b010);
    pub const END: EventMask = EventMask(0b100);
    pub const ALL: EventMask = EventMask(0b111);

    pub fn contains(&self, kind: NotificationKind) -> bool {
        let bit = match kind {
            NotificationKind::Start => Self::START.0,
            NotificationKind::Progress => Self::PROGRESS.0,
            NotificationKind::End => Self::END.0,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({})", self)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            NotificationKind::Start,
            NotificationKind::Progress,
            NotificationKind::End,
        ]
        .into_iter()
        .filter(|k| self.contains(*k))
        .map(|k| k.as_str())
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// What a registration listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationTarget {
    /// Events for whichever position this drive is bound to
    Drive(DriveId),
    /// Events for one raid group position
    Position(RaidGroupId, usize),
}

impl NotificationTarget {
    fn matches(&self, event: &NotificationEvent) -> bool {
        match self {
            NotificationTarget::Drive(drive) => event.drive == *drive,
            NotificationTarget::Position(rg, position) => {
                event.raid_group == *rg && event.position == *position
            }
        }
    }
}

impl From<DriveId> for NotificationTarget {
    fn from(drive: DriveId) -> Self {
        NotificationTarget::Drive(drive)
    }
}

impl fmt::Display for NotificationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationTarget::Drive(drive) => write!(f, "{}", drive),
            NotificationTarget::Position(rg, position) => write!(f, "{}/{}", rg, position),
        }
    }
}

/// A rebuild milestone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub drive: DriveId,
    pub raid_group: RaidGroupId,
    pub position: usize,
    pub kind: NotificationKind,
    /// Percent complete, 0..=100
    pub percent: u8,
    pub status: NotificationStatus,
    /// Controller whose scheduler emitted the event
    pub source: ControllerId,
    /// Ownership generation of that scheduler
    pub generation: u64,
}

/// Handle returned by `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(Uuid);

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Registration {
    target: NotificationTarget,
    mask: EventMask,
    pending: Mutex<VecDeque<NotificationEvent>>,
    notify: Notify,
}

/// Wait timeout used by `wait_default` unless configured otherwise
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Emitter shared by both controllers of an array
pub struct NotificationEmitter {
    queue_depth: usize,
    default_timeout: Duration,
    registrations: RwLock<HashMap<RegistrationHandle, Arc<Registration>>>,
}

impl NotificationEmitter {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            default_timeout: DEFAULT_WAIT_TIMEOUT,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Set the timeout `wait_default` uses
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register interest in events for a target
    pub fn register(
        &self,
        target: impl Into<NotificationTarget>,
        mask: EventMask,
    ) -> Result<RegistrationHandle> {
        let target = target.into();
        let mut registrations = self.registrations.write();
        if registrations
            .values()
            .any(|r| r.target == target && r.mask == mask)
        {
            return Err(NotificationError::DuplicateRegistration { target, mask });
        }

        let handle = RegistrationHandle(Uuid::new_v4());
        registrations.insert(
            handle,
            Arc::new(Registration {
                target,
                mask,
                pending: Mutex::new(VecDeque::with_capacity(self.queue_depth)),
                notify: Notify::new(),
            }),
        );
        trace!(%handle, %target, %mask, "Registered for notifications");
        Ok(handle)
    }

    /// Release a registration; pending events are discarded
    pub fn unregister(&self, handle: RegistrationHandle) -> bool {
        self.registrations.write().remove(&handle).is_some()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Events waiting on a registration
    pub fn pending(&self, handle: RegistrationHandle) -> Result<usize> {
        Ok(self.lookup(handle)?.pending.lock().len())
    }

    fn lookup(&self, handle: RegistrationHandle) -> Result<Arc<Registration>> {
        self.registrations
            .read()
            .get(&handle)
            .cloned()
            .ok_or(NotificationError::UnknownRegistration(handle))
    }

    /// Wait for the next event with the configured default timeout
    pub async fn wait_default(&self, handle: RegistrationHandle) -> Result<NotificationEvent> {
        self.wait(handle, self.default_timeout).await
    }

    /// Wait for the next event on a registration.
    ///
    /// On timeout the registration is released.
    pub async fn wait(
        &self,
        handle: RegistrationHandle,
        timeout: Duration,
    ) -> Result<NotificationEvent> {
        let registration = self.lookup(handle)?;

        let next = async {
            loop {
                let queued = registration.pending.lock().pop_front();
                if let Some(event) = queued {
                    return event;
                }
                registration.notify.notified().await;
            }
        };

        match tokio::time::timeout(timeout, next).await {
            Ok(event) => Ok(event),
            Err(_) => {
                self.unregister(handle);
                debug!(%handle, target = %registration.target, "Notification wait timed out");
                Err(NotificationError::Timeout(timeout))
            }
        }
    }

    /// Deliver an event to every matching registration.
    ///
    /// Returns how many registrations received it.
    pub fn emit(&self, event: NotificationEvent) -> usize {
        let matching: Vec<Arc<Registration>> = self
            .registrations
            .read()
            .values()
            .filter(|r| r.mask.contains(event.kind) && r.target.matches(&event))
            .cloned()
            .collect();

        if matching.is_empty() {
            trace!(
                raid_group = %event.raid_group,
                position = event.position,
                kind = event.kind.as_str(),
                "No waiter registered, notification dropped"
            );
            metrics::record_notification_dropped("unregistered");
            return 0;
        }

        for registration in &matching {
            {
                let mut pending = registration.pending.lock();
                if pending.len() >= self.queue_depth {
                    let victim = pending
                        .iter()
                        .position(|e| e.kind == NotificationKind::Progress)
                        .unwrap_or(0);
                    if let Some(evicted) = pending.remove(victim) {
                        debug!(
                            target = %registration.target,
                            evicted = evicted.kind.as_str(),
                            evicted_percent = evicted.percent,
                            incoming = event.kind.as_str(),
                            "Pending notification overwritten"
                        );
                        metrics::record_notification_dropped("overwritten");
                    }
                }
                pending.push_back(event.clone());
            }
            registration.notify.notify_one();
            metrics::record_notification(event.kind.as_str());
        }
        matching.len()
    }

    /// Purge undelivered events emitted by an aborted scheduler instance
    pub fn discard_from(&self, source: ControllerId, generation: u64) -> usize {
        let registrations: Vec<Arc<Registration>> =
            self.registrations.read().values().cloned().collect();
        let mut discarded = 0;
        for registration in registrations {
            let mut pending = registration.pending.lock();
            let before = pending.len();
            pending.retain(|e| !(e.source == source && e.generation == generation));
            discarded += before - pending.len();
        }
        if discarded > 0 {
            debug!(%source, generation, discarded, "Discarded notifications from aborted rebuild");
        }
        discarded
    }
}
