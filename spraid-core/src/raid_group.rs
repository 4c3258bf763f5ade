//! Raid group configuration types
//!
//! The configuration service owns these records. The rebuild subsystem reads
//! width and drive bindings and reacts to insertion/removal.

use crate::checkpoint::Lba;
use crate::error::{Result, SpRaidError};
use crate::MAX_RAID_GROUP_WIDTH;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raid group identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaidGroupId(pub u32);

impl fmt::Display for RaidGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rg-{}", self.0)
    }
}

/// Physical drive identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriveId(pub u64);

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pvd-0x{:x}", self.0)
    }
}

/// One of the two storage processors
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControllerId {
    A,
    B,
}

impl ControllerId {
    pub fn peer(&self) -> ControllerId {
        match self {
            ControllerId::A => ControllerId::B,
            ControllerId::B => ControllerId::A,
        }
    }

    pub fn all() -> [ControllerId; 2] {
        [ControllerId::A, ControllerId::B]
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerId::A => write!(f, "SPA"),
            ControllerId::B => write!(f, "SPB"),
        }
    }
}

impl std::str::FromStr for ControllerId {
    type Err = SpRaidError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" | "SPA" => Ok(ControllerId::A),
            "B" | "SPB" => Ok(ControllerId::B),
            other => Err(SpRaidError::Configuration(format!(
                "unknown controller: {}",
                other
            ))),
        }
    }
}

/// Raid layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidType {
    /// Number of positions that may be degraded before the group breaks
    pub fn redundancy(&self, width: usize) -> usize {
        match self {
            RaidType::Raid0 => 0,
            RaidType::Raid1 => width.saturating_sub(1),
            RaidType::Raid5 | RaidType::Raid10 => 1,
            RaidType::Raid6 => 2,
        }
    }

    /// Minimum width accepted for this layout
    pub fn min_width(&self) -> usize {
        match self {
            RaidType::Raid0 => 1,
            RaidType::Raid1 => 2,
            RaidType::Raid5 => 3,
            RaidType::Raid6 => 4,
            RaidType::Raid10 => 4,
        }
    }
}

/// Raid group lifecycle state as seen by one controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidGroupState {
    Specialize,
    Activate,
    Ready,
    Failed,
    PendingFail,
}

impl fmt::Display for RaidGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Specialize => write!(f, "specialize"),
            Self::Activate => write!(f, "activate"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::PendingFail => write!(f, "pending_fail"),
        }
    }
}

/// How a drive came to be bound to a position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindKind {
    /// The last-known-good drive came back (differential rebuild)
    Reinserted,
    /// A drive never seen at this position (full rebuild)
    Replacement,
}

/// A member slot of a raid group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Index within the group
    pub index: usize,
    /// Last-known-good drive for this slot
    pub drive: DriveId,
    /// Drive currently bound, if any
    pub bound: Option<DriveId>,
}

impl Position {
    pub fn new(index: usize, drive: DriveId) -> Self {
        Self {
            index,
            drive,
            bound: Some(drive),
        }
    }

    /// Bound drive does not match the last-known-good binding
    pub fn is_degraded(&self) -> bool {
        self.bound != Some(self.drive)
    }
}

/// Raid group configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaidGroup {
    pub id: RaidGroupId,
    pub raid_type: RaidType,
    /// Per-position logical extent in blocks
    pub extent: Lba,
    pub positions: Vec<Position>,
    pub state: RaidGroupState,
}

impl RaidGroup {
    /// Create a raid group with one drive per position
    pub fn new(
        id: RaidGroupId,
        raid_type: RaidType,
        extent: Lba,
        drives: &[DriveId],
    ) -> Result<Self> {
        let width = drives.len();
        if width == 0 || width > MAX_RAID_GROUP_WIDTH || width < raid_type.min_width() {
            return Err(SpRaidError::InvalidWidth {
                width,
                max: MAX_RAID_GROUP_WIDTH,
            });
        }
        if extent == 0 {
            return Err(SpRaidError::Configuration(format!(
                "{} has zero extent",
                id
            )));
        }

        let positions = drives
            .iter()
            .enumerate()
            .map(|(index, drive)| Position::new(index, *drive))
            .collect();

        Ok(Self {
            id,
            raid_type,
            extent,
            positions,
            state: RaidGroupState::Specialize,
        })
    }

    pub fn width(&self) -> usize {
        self.positions.len()
    }

    pub fn position(&self, index: usize) -> Result<&Position> {
        self.positions
            .get(index)
            .ok_or(SpRaidError::InvalidPosition {
                position: index,
                width: self.positions.len(),
            })
    }

    fn position_mut(&mut self, index: usize) -> Result<&mut Position> {
        let width = self.positions.len();
        self.positions
            .get_mut(index)
            .ok_or(SpRaidError::InvalidPosition {
                position: index,
                width,
            })
    }

    /// Indices of degraded positions in ascending order
    pub fn degraded_positions(&self) -> Vec<usize> {
        self.positions
            .iter()
            .filter(|p| p.is_degraded())
            .map(|p| p.index)
            .collect()
    }

    /// More positions degraded than the layout tolerates
    pub fn is_broken(&self) -> bool {
        self.degraded_positions().len() > self.raid_type.redundancy(self.width())
    }

    /// Drive pulled from a position
    pub fn remove_drive(&mut self, index: usize) -> Result<DriveId> {
        let position = self.position_mut(index)?;
        let removed = position.bound.take().unwrap_or(position.drive);
        self.refresh_state();
        Ok(removed)
    }

    /// Bind a drive to a position.
    ///
    /// A drive other than the last-known-good one becomes the new binding.
    pub fn bind_drive(&mut self, index: usize, drive: DriveId) -> Result<BindKind> {
        let position = self.position_mut(index)?;
        let kind = if position.drive == drive {
            BindKind::Reinserted
        } else {
            BindKind::Replacement
        };
        position.drive = drive;
        position.bound = Some(drive);
        self.refresh_state();
        Ok(kind)
    }

    /// Move between Ready and Failed as the degraded count changes.
    ///
    /// Groups still coming up are left alone.
    pub fn refresh_state(&mut self) {
        match self.state {
            RaidGroupState::Ready | RaidGroupState::Failed | RaidGroupState::PendingFail => {
                self.state = if self.is_broken() {
                    RaidGroupState::Failed
                } else {
                    RaidGroupState::Ready
                };
            }
            RaidGroupState::Specialize | RaidGroupState::Activate => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drives(n: u64) -> Vec<DriveId> {
        (0..n).map(|i| DriveId(0x100 + i)).collect()
    }

    #[test]
    fn test_controller_peer() {
        assert_eq!(ControllerId::A.peer(), ControllerId::B);
        assert_eq!(ControllerId::B.peer(), ControllerId::A);
        assert_eq!("spb".parse::<ControllerId>().unwrap(), ControllerId::B);
        assert!("c".parse::<ControllerId>().is_err());
    }

    #[test]
    fn test_redundancy() {
        assert_eq!(RaidType::Raid5.redundancy(5), 1);
        assert_eq!(RaidType::Raid6.redundancy(6), 2);
        assert_eq!(RaidType::Raid1.redundancy(3), 2);
        assert_eq!(RaidType::Raid0.redundancy(4), 0);
    }

    #[test]
    fn test_new_rejects_bad_width() {
        assert!(RaidGroup::new(RaidGroupId(1), RaidType::Raid6, 1024, &drives(3)).is_err());
        assert!(RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 1024, &drives(17)).is_err());
        assert!(RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 0, &drives(3)).is_err());
    }

    #[test]
    fn test_remove_and_reinsert() {
        let mut rg = RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 1024, &drives(3)).unwrap();
        rg.state = RaidGroupState::Ready;

        let removed = rg.remove_drive(1).unwrap();
        assert_eq!(removed, DriveId(0x101));
        assert_eq!(rg.degraded_positions(), vec![1]);
        assert_eq!(rg.state, RaidGroupState::Ready);

        assert_eq!(rg.bind_drive(1, removed).unwrap(), BindKind::Reinserted);
        assert!(rg.degraded_positions().is_empty());
    }

    #[test]
    fn test_replacement_becomes_binding() {
        let mut rg = RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 1024, &drives(3)).unwrap();
        rg.remove_drive(2).unwrap();
        assert_eq!(rg.bind_drive(2, DriveId(0x999)).unwrap(), BindKind::Replacement);
        assert_eq!(rg.position(2).unwrap().drive, DriveId(0x999));
        assert!(!rg.position(2).unwrap().is_degraded());
    }

    #[test]
    fn test_broken_when_redundancy_exceeded() {
        let mut rg = RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 1024, &drives(4)).unwrap();
        rg.state = RaidGroupState::Ready;
        rg.remove_drive(0).unwrap();
        rg.remove_drive(1).unwrap();
        assert!(rg.is_broken());
        assert_eq!(rg.state, RaidGroupState::Failed);
    }

    #[test]
    fn test_invalid_position() {
        let rg = RaidGroup::new(RaidGroupId(1), RaidType::Raid5, 1024, &drives(3)).unwrap();
        assert!(matches!(
            rg.position(3),
            Err(SpRaidError::InvalidPosition { position: 3, width: 3 })
        ));
    }
}
