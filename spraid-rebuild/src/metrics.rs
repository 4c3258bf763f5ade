//! Rebuild metrics
//!
//! Recorded through the `metrics` facade. The library installs no exporter;
//! without a recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use spraid_core::{ControllerId, RaidGroupId};

/// Metric names as constants
pub mod names {
    // Rebuild progress
    pub const CHUNKS_REBUILT: &str = "spraid_rebuild_chunks_total";
    pub const POSITIONS_REBUILDING: &str = "spraid_rebuild_positions_active";
    pub const PARALLEL_REBUILDS: &str = "spraid_rebuild_parallel_total";

    // Notifications
    pub const NOTIFICATIONS_EMITTED: &str = "spraid_notifications_emitted_total";
    pub const NOTIFICATIONS_DROPPED: &str = "spraid_notifications_dropped_total";

    // Ownership and mirroring
    pub const OWNERSHIP_TRANSFERS: &str = "spraid_ownership_transfers_total";
    pub const OWNERSHIP_CONFLICTS: &str = "spraid_ownership_conflicts_total";
    pub const STALE_UPDATES_DROPPED: &str = "spraid_mirror_stale_dropped_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::CHUNKS_REBUILT, "Rebuild chunks completed");
    describe_gauge!(
        names::POSITIONS_REBUILDING,
        "Positions currently rebuilding per raid group"
    );
    describe_counter!(
        names::PARALLEL_REBUILDS,
        "Times two positions rebuilt at the same checkpoint"
    );
    describe_counter!(
        names::NOTIFICATIONS_EMITTED,
        "Notification events delivered to a registration"
    );
    describe_counter!(
        names::NOTIFICATIONS_DROPPED,
        "Notification events dropped or evicted"
    );
    describe_counter!(names::OWNERSHIP_TRANSFERS, "Active controller changes");
    describe_counter!(
        names::OWNERSHIP_CONFLICTS,
        "Simultaneous claims of active status"
    );
    describe_counter!(
        names::STALE_UPDATES_DROPPED,
        "Checkpoint updates refused for a stale generation"
    );
}

pub fn record_chunk(raid_group: RaidGroupId) {
    counter!(names::CHUNKS_REBUILT, "raid_group" => raid_group.to_string()).increment(1);
}

pub fn set_positions_rebuilding(raid_group: RaidGroupId, count: usize) {
    gauge!(names::POSITIONS_REBUILDING, "raid_group" => raid_group.to_string()).set(count as f64);
}

pub fn record_parallel_rebuild(raid_group: RaidGroupId) {
    counter!(names::PARALLEL_REBUILDS, "raid_group" => raid_group.to_string()).increment(1);
}

pub fn record_notification(kind: &'static str) {
    counter!(names::NOTIFICATIONS_EMITTED, "kind" => kind).increment(1);
}

pub fn record_notification_dropped(reason: &'static str) {
    counter!(names::NOTIFICATIONS_DROPPED, "reason" => reason).increment(1);
}

pub fn record_transfer(to: ControllerId) {
    counter!(names::OWNERSHIP_TRANSFERS, "to" => to.to_string()).increment(1);
}

pub fn record_conflict() {
    counter!(names::OWNERSHIP_CONFLICTS).increment(1);
}

pub fn record_stale_update(controller: ControllerId) {
    counter!(names::STALE_UPDATES_DROPPED, "controller" => controller.to_string()).increment(1);
}
