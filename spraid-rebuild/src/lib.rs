//! spraid Rebuild Library
//!
//! Rebuild checkpointing and progress notification for a dual-controller
//! RAID array:
//! - Per-position rebuild checkpoints, persisted and mirrored to the peer
//! - A scheduler per raid group on the active controller
//! - Start / Progress / End milestones delivered to registered consumers
//! - Ownership transfer on controller failure and resume after a dual crash

pub mod checkpoint_store;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod hooks;
pub mod metrics;
pub mod mirror;
pub mod notification;
pub mod ownership;
pub mod recovery;
pub mod scheduler;

// Re-export main types
pub use checkpoint_store::{CheckpointError, CheckpointStore, ReplicaRole, WriteOutcome};
pub use cluster::{ClusterError, DualController};
pub use config::{ConfigError, RebuildConfig};
pub use controller::{ControllerContext, ControllerError, PumpReport};
pub use hooks::{
    HookId, HookRegistry, PauseAtCheckpoint, PauseAtStart, PauseContext, PauseHook, RebuildPhase,
};
pub use mirror::{
    LocalPeerLink, MirrorAck, MirrorError, MirrorSink, MirrorSnapshot, MirrorUpdate, PeerLink,
};
pub use notification::{
    EventMask, NotificationEmitter, NotificationError, NotificationEvent, NotificationKind,
    NotificationStatus, NotificationTarget, RegistrationHandle, DEFAULT_WAIT_TIMEOUT,
};
pub use ownership::{
    BootOutcome, ClaimOutcome, LifecycleView, OwnershipArbiter, OwnershipError, OwnershipListener,
    OwnershipRecord, TransferOutcome,
};
pub use recovery::{RecoveryPlan, RecoverySequencer};
pub use scheduler::{ChunkDecision, ChunkOutcome, RebuildScheduler, RebuildState, SchedulerError};
