use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use super::geometry::Positions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Healthy,
    Failed,
    /// Accepts writes but is not trusted for reads yet.
    Rebuilding,
}

const HEALTHY: u8 = 0;
const FAILED: u8 = 1;
const REBUILDING: u8 = 2;

/// Health of every stripe position of a raid group, shared between the
/// monitor and the client channels.
///
/// `generation` moves on every state change so pollers can notice faults
/// raised from another thread without scanning all positions.
#[derive(Debug, Clone)]
pub struct PositionHealth {
    states: Arc<Vec<AtomicU8>>,
    generation: Arc<AtomicU64>,
}

impl PositionHealth {
    pub fn new(width: usize) -> Self {
        PositionHealth {
            states: Arc::new((0..width).map(|_| AtomicU8::new(HEALTHY)).collect()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn width(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, position: usize) -> PositionState {
        match self.states[position].load(Ordering::Acquire) {
            HEALTHY => PositionState::Healthy,
            REBUILDING => PositionState::Rebuilding,
            _ => PositionState::Failed,
        }
    }

    fn set(&self, position: usize, value: u8) -> bool {
        let prev = self.states[position].swap(value, Ordering::AcqRel);
        if prev != value {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        prev != value
    }

    /// Returns `true` if the position was not already failed.
    pub fn mark_failed(&self, position: usize) -> bool {
        let changed = self.set(position, FAILED);
        if changed {
            warn!("Stripe position {position} marked failed");
        }
        changed
    }

    pub fn mark_rebuilding(&self, position: usize) {
        if self.set(position, REBUILDING) {
            info!("Stripe position {position} rebuilding");
        }
    }

    pub fn mark_healthy(&self, position: usize) {
        if self.set(position, HEALTHY) {
            info!("Stripe position {position} healthy");
        }
    }

    pub fn is_readable(&self, position: usize) -> bool {
        self.state(position) == PositionState::Healthy
    }

    pub fn is_writable(&self, position: usize) -> bool {
        self.state(position) != PositionState::Failed
    }

    pub fn degraded(&self) -> Positions {
        (0..self.width()).filter(|p| !self.is_readable(*p)).collect()
    }

    pub fn degraded_count(&self) -> usize {
        self.degraded().len()
    }

    /// Bitmask of positions that will need a rebuild pass.
    pub fn needs_rebuild_mask(&self) -> u16 {
        self.degraded().iter().fold(0u16, |mask, p| mask | (1 << p))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_bump_generation() {
        let health = PositionHealth::new(4);
        assert_eq!(health.generation(), 0);
        assert!(health.mark_failed(2));
        assert!(!health.mark_failed(2));
        assert_eq!(health.generation(), 1);
        assert_eq!(health.degraded().as_slice(), &[2]);
        assert_eq!(health.needs_rebuild_mask(), 0b0100);

        health.mark_rebuilding(2);
        assert!(health.is_writable(2));
        assert!(!health.is_readable(2));
        health.mark_healthy(2);
        assert_eq!(health.degraded_count(), 0);
        assert_eq!(health.generation(), 3);
    }

    #[test]
    fn test_clones_share_state() {
        let health = PositionHealth::new(3);
        let clone = health.clone();
        clone.mark_failed(0);
        assert_eq!(health.state(0), PositionState::Failed);
    }
}
