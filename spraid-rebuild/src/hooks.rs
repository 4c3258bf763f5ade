//! Rebuild pause hooks
//!
//! Predicates consulted by the scheduler before a position starts and before
//! each chunk is issued. Used to hold a rebuild at a known point while faults
//! are injected.

use parking_lot::RwLock;
use spraid_core::{checkpoint_for_percent, Lba, RaidGroupId, RebuildCheckpoint};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("Pause percent {0} not in 1..=100")]
    InvalidPercent(u32),
}

/// Where the scheduler is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    /// About to emit Start for a position
    Start,
    /// About to issue the next chunk
    Chunk,
}

#[derive(Debug, Clone, Copy)]
pub struct PauseContext {
    pub raid_group: RaidGroupId,
    pub position: usize,
    pub phase: RebuildPhase,
    pub checkpoint: RebuildCheckpoint,
    pub extent: Lba,
}

pub trait PauseHook: Send + Sync {
    fn should_pause(&self, ctx: &PauseContext) -> bool;
}

impl<F> PauseHook for F
where
    F: Fn(&PauseContext) -> bool + Send + Sync,
{
    fn should_pause(&self, ctx: &PauseContext) -> bool {
        self(ctx)
    }
}

/// Hold a position in Starting before its Start event
#[derive(Debug, Clone, Default)]
pub struct PauseAtStart {
    /// Only this position; every position when unset
    pub position: Option<usize>,
}

impl PauseAtStart {
    pub fn position(position: usize) -> Self {
        Self {
            position: Some(position),
        }
    }
}

impl PauseHook for PauseAtStart {
    fn should_pause(&self, ctx: &PauseContext) -> bool {
        ctx.phase == RebuildPhase::Start && self.position.map_or(true, |p| p == ctx.position)
    }
}

/// Stop issuing chunks once a position's checkpoint reaches an LBA
#[derive(Debug, Clone)]
pub struct PauseAtCheckpoint {
    pub lba: Lba,
    pub position: Option<usize>,
}

impl PauseAtCheckpoint {
    pub fn new(lba: Lba) -> Self {
        Self { lba, position: None }
    }

    /// Pause at `percent` of `extent`, rounding the extent up to a multiple of 100
    pub fn from_percent(extent: Lba, percent: u32) -> Result<Self, HookError> {
        let lba =
            checkpoint_for_percent(extent, percent).ok_or(HookError::InvalidPercent(percent))?;
        Ok(Self::new(lba))
    }

    pub fn for_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

impl PauseHook for PauseAtCheckpoint {
    fn should_pause(&self, ctx: &PauseContext) -> bool {
        ctx.phase == RebuildPhase::Chunk
            && self.position.map_or(true, |p| p == ctx.position)
            && ctx.checkpoint.lba() >= self.lba
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

/// Hooks installed on one controller for one raid group
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(HookId, Arc<dyn PauseHook>)>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn PauseHook>) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push((id, hook));
        id
    }

    pub fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every hook into another registry (boot carry-over)
    pub fn install_into(&self, other: &HookRegistry) {
        for (_, hook) in self.hooks.read().iter() {
            other.add(hook.clone());
        }
    }

    /// Any installed hook asks to pause
    pub fn should_pause(&self, ctx: &PauseContext) -> bool {
        self.hooks.read().iter().any(|(_, hook)| hook.should_pause(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(phase: RebuildPhase, position: usize, lba: Lba) -> PauseContext {
        PauseContext {
            raid_group: RaidGroupId(1),
            position,
            phase,
            checkpoint: RebuildCheckpoint::new(lba),
            extent: 1000,
        }
    }

    #[test]
    fn test_pause_at_checkpoint_from_percent() {
        let hook = PauseAtCheckpoint::from_percent(1000, 10).unwrap();
        assert_eq!(hook.lba, 100);
        assert!(!hook.should_pause(&ctx(RebuildPhase::Chunk, 1, 99)));
        assert!(hook.should_pause(&ctx(RebuildPhase::Chunk, 1, 100)));
        assert!(!hook.should_pause(&ctx(RebuildPhase::Start, 1, 100)));

        assert_eq!(
            PauseAtCheckpoint::from_percent(1000, 0).unwrap_err(),
            HookError::InvalidPercent(0)
        );
        assert!(PauseAtCheckpoint::from_percent(1000, 101).is_err());
    }

    #[test]
    fn test_pause_at_start_position_filter() {
        let hook = PauseAtStart::position(2);
        assert!(hook.should_pause(&ctx(RebuildPhase::Start, 2, 0)));
        assert!(!hook.should_pause(&ctx(RebuildPhase::Start, 1, 0)));
        assert!(!hook.should_pause(&ctx(RebuildPhase::Chunk, 2, 0)));
    }

    #[test]
    fn test_registry_add_remove() {
        let registry = HookRegistry::new();
        let id = registry.add(Arc::new(PauseAtStart::default()));
        registry.add(Arc::new(|c: &PauseContext| c.position == 7));
        assert_eq!(registry.len(), 2);
        assert!(registry.should_pause(&ctx(RebuildPhase::Chunk, 7, 0)));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.should_pause(&ctx(RebuildPhase::Start, 1, 0)));

        let copy = HookRegistry::new();
        registry.install_into(&copy);
        assert_eq!(copy.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
    }
}
