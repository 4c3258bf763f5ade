//! Checkpoint mirroring between the two controllers
//!
//! The active controller sends every checkpoint change to its peer and waits
//! for the ack before the chunk is acknowledged upstream. `PeerLink` is the
//! message-passing seam; `LocalPeerLink` delivers in-process to the peer's
//! `MirrorSink`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spraid_core::{ControllerId, RaidGroupId, RebuildCheckpoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Mirroring errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MirrorError {
    #[error("Peer {0} unreachable")]
    PeerUnreachable(ControllerId),

    #[error("Raid group {0} unknown on peer")]
    UnknownRaidGroup(RaidGroupId),

    #[error("Peer rejected update: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, MirrorError>;

/// One position's checkpoint as sent to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorUpdate {
    pub raid_group: RaidGroupId,
    pub position: usize,
    pub checkpoint: RebuildCheckpoint,
    pub in_progress: bool,
    pub generation: u64,
    pub source: ControllerId,
}

/// Full copy of a raid group's checkpoints, used to resync a rejoining peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    pub raid_group: RaidGroupId,
    pub checkpoints: Vec<RebuildCheckpoint>,
    pub in_progress: Vec<bool>,
    pub generation: u64,
    pub source: ControllerId,
}

/// Peer's answer to a mirrored update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAck {
    Applied,
    /// The peer has seen a newer generation; the sender is no longer active
    Stale { current_generation: u64 },
}

/// Receiving end of the mirror channel
pub trait MirrorSink: Send + Sync {
    fn apply_update(&self, update: &MirrorUpdate) -> Result<MirrorAck>;

    fn apply_snapshot(&self, snapshot: &MirrorSnapshot) -> Result<MirrorAck>;
}

/// Sending end of the mirror channel
pub trait PeerLink: Send + Sync {
    /// Peer this link delivers to
    fn peer(&self) -> ControllerId;

    /// Send one checkpoint and wait for the ack
    fn send_update(&self, update: MirrorUpdate) -> Result<MirrorAck>;

    /// Send a full snapshot and wait for the ack
    fn send_snapshot(&self, snapshot: MirrorSnapshot) -> Result<MirrorAck>;

    /// Last liveness signal for the peer
    fn is_peer_reachable(&self) -> bool;

    /// Record a peer-dead or peer-alive signal
    fn set_peer_reachable(&self, reachable: bool);
}

/// In-process link to the peer controller
pub struct LocalPeerLink {
    peer: ControllerId,
    sink: RwLock<Option<Weak<dyn MirrorSink>>>,
    reachable: AtomicBool,
}

impl LocalPeerLink {
    /// Link with no endpoint yet; the peer reads as unreachable
    pub fn new(peer: ControllerId) -> Self {
        Self {
            peer,
            sink: RwLock::new(None),
            reachable: AtomicBool::new(false),
        }
    }

    /// Attach the peer's sink and mark it reachable
    pub fn connect(&self, sink: &Arc<dyn MirrorSink>) {
        *self.sink.write() = Some(Arc::downgrade(sink));
        self.reachable.store(true, Ordering::SeqCst);
    }

    fn endpoint(&self) -> Result<Arc<dyn MirrorSink>> {
        if !self.is_peer_reachable() {
            return Err(MirrorError::PeerUnreachable(self.peer));
        }
        self.sink
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(MirrorError::PeerUnreachable(self.peer))
    }
}

impl PeerLink for LocalPeerLink {
    fn peer(&self) -> ControllerId {
        self.peer
    }

    fn send_update(&self, update: MirrorUpdate) -> Result<MirrorAck> {
        let sink = self.endpoint()?;
        let ack = sink.apply_update(&update)?;
        debug!(
            raid_group = %update.raid_group,
            position = update.position,
            checkpoint = %update.checkpoint,
            peer = %self.peer,
            ?ack,
            "Mirrored checkpoint"
        );
        Ok(ack)
    }

    fn send_snapshot(&self, snapshot: MirrorSnapshot) -> Result<MirrorAck> {
        self.endpoint()?.apply_snapshot(&snapshot)
    }

    fn is_peer_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn set_peer_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<MirrorUpdate>>,
    }

    impl MirrorSink for RecordingSink {
        fn apply_update(&self, update: &MirrorUpdate) -> Result<MirrorAck> {
            self.updates.lock().push(*update);
            Ok(MirrorAck::Applied)
        }

        fn apply_snapshot(&self, _snapshot: &MirrorSnapshot) -> Result<MirrorAck> {
            Ok(MirrorAck::Applied)
        }
    }

    fn update() -> MirrorUpdate {
        MirrorUpdate {
            raid_group: RaidGroupId(1),
            position: 1,
            checkpoint: RebuildCheckpoint::new(0x800),
            in_progress: true,
            generation: 1,
            source: ControllerId::A,
        }
    }

    #[test]
    fn test_unconnected_link_is_unreachable() {
        let link = LocalPeerLink::new(ControllerId::B);
        assert!(!link.is_peer_reachable());
        assert_eq!(
            link.send_update(update()),
            Err(MirrorError::PeerUnreachable(ControllerId::B))
        );
    }

    #[test]
    fn test_delivers_until_marked_dead() {
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn MirrorSink> = sink.clone();
        let link = LocalPeerLink::new(ControllerId::B);
        link.connect(&dyn_sink);

        assert_eq!(link.send_update(update()), Ok(MirrorAck::Applied));
        link.set_peer_reachable(false);
        assert!(link.send_update(update()).is_err());
        assert_eq!(sink.updates.lock().len(), 1);
    }

    #[test]
    fn test_dropped_sink_is_unreachable() {
        let link = LocalPeerLink::new(ControllerId::A);
        {
            let sink: Arc<dyn MirrorSink> = Arc::new(RecordingSink::default());
            link.connect(&sink);
        }
        assert!(link.send_update(update()).is_err());
    }
}
