//! Rebuild checkpoints
//!
//! A checkpoint is the logical block offset below which a position has been
//! rebuilt. The group extent doubles as the "complete" sentinel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block address
pub type Lba = u64;

/// Per-position rebuild progress marker
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RebuildCheckpoint(Lba);

impl RebuildCheckpoint {
    /// Checkpoint of a position that was never rebuilt
    pub const ZERO: RebuildCheckpoint = RebuildCheckpoint(0);

    pub fn new(lba: Lba) -> Self {
        Self(lba)
    }

    /// The "complete" sentinel for a group of the given extent
    pub fn complete(extent: Lba) -> Self {
        Self(extent)
    }

    pub fn lba(&self) -> Lba {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_complete(&self, extent: Lba) -> bool {
        self.0 >= extent
    }

    /// Percent of the extent rebuilt, rounded down.
    ///
    /// Only a complete checkpoint reports 100.
    pub fn percent_of(&self, extent: Lba) -> u8 {
        if extent == 0 || self.0 >= extent {
            return 100;
        }
        let percent = (self.0 as u128 * 100) / extent as u128;
        percent.min(99) as u8
    }
}

impl fmt::Debug for RebuildCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RebuildCheckpoint(0x{:x})", self.0)
    }
}

impl fmt::Display for RebuildCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Lba at which a rebuild has covered `percent` of `extent`.
///
/// Rounds the per-percent step up so that 100 always lands on or past the
/// extent. Returns `None` for percents outside 1..=100.
pub fn checkpoint_for_percent(extent: Lba, percent: u32) -> Option<Lba> {
    if percent == 0 || percent > 100 {
        return None;
    }
    Some(((extent + 99) / 100) * percent as Lba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of() {
        let extent = 0x10000;
        assert_eq!(RebuildCheckpoint::ZERO.percent_of(extent), 0);
        assert_eq!(RebuildCheckpoint::new(extent / 2).percent_of(extent), 50);
        assert_eq!(RebuildCheckpoint::new(extent - 1).percent_of(extent), 99);
        assert_eq!(RebuildCheckpoint::complete(extent).percent_of(extent), 100);
    }

    #[test]
    fn test_complete_sentinel() {
        let extent = 4096;
        assert!(RebuildCheckpoint::complete(extent).is_complete(extent));
        assert!(!RebuildCheckpoint::new(4095).is_complete(extent));
        assert!(RebuildCheckpoint::ZERO.is_zero());
    }

    #[test]
    fn test_checkpoint_for_percent() {
        assert_eq!(checkpoint_for_percent(1000, 10), Some(100));
        assert_eq!(checkpoint_for_percent(1001, 10), Some(110));
        assert_eq!(checkpoint_for_percent(1000, 0), None);
        assert_eq!(checkpoint_for_percent(1000, 101), None);
        assert!(checkpoint_for_percent(1001, 100).unwrap() >= 1001);
    }

    #[test]
    fn test_display() {
        assert_eq!(RebuildCheckpoint::new(0x800).to_string(), "0x800");
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn percent_follows_checkpoint_order(
                extent in 1u64..1 << 40,
                a in any::<u64>(),
                b in any::<u64>(),
            ) {
                let lo = RebuildCheckpoint::new(a.min(b) % (extent + 1));
                let hi = RebuildCheckpoint::new(a.max(b) % (extent + 1));
                if lo <= hi {
                    prop_assert!(lo.percent_of(extent) <= hi.percent_of(extent));
                }
                prop_assert_eq!(hi.percent_of(extent) == 100, hi.is_complete(extent));
            }

            #[test]
            fn percent_lba_reports_at_least_percent(
                extent in 100u64..1 << 40,
                percent in 1u32..=100,
            ) {
                let lba = checkpoint_for_percent(extent, percent).unwrap();
                let reported = RebuildCheckpoint::new(lba.min(extent)).percent_of(extent);
                prop_assert!(reported as u32 >= percent.min(99));
            }
        }
    }
}
