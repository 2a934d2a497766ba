use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::checkpoint::FailReason;
use crate::config::RekeyConfig;
use crate::raid::{PositionHealth, RaidGeometry};
use crate::{rekey_error, RekeyError};

#[derive(Debug)]
pub enum DegradedDecision {
    Proceed,
    /// Hold rekey until rebuild brings the raid group back within tolerance.
    Pause,
    Fail(FailReason, RekeyError),
}

/// Arbitrates between rebuild and rekey. Rekey may only cross chunks while
/// the number of degraded positions stays within the raid type's rekey
/// tolerance; beyond the raid type's fault tolerance the group fails.
#[derive(Debug)]
pub struct DegradedPolicy {
    fault_tolerance: usize,
    rekey_tolerance: usize,
    rebuild_timeout: Duration,
    paused_since: Option<Instant>,
}

impl DegradedPolicy {
    pub fn new(geometry: &RaidGeometry, config: &RekeyConfig) -> Self {
        DegradedPolicy {
            fault_tolerance: geometry.fault_tolerance(),
            rekey_tolerance: config.rekey_tolerance(geometry.raid_type),
            rebuild_timeout: config.rebuild_timeout(),
            paused_since: None,
        }
    }

    pub fn rekey_tolerance(&self) -> usize {
        self.rekey_tolerance
    }

    pub fn is_waiting_for_rebuild(&self) -> bool {
        self.paused_since.is_some()
    }

    pub fn evaluate(&mut self, health: &PositionHealth) -> DegradedDecision {
        let degraded = health.degraded();
        if degraded.len() > self.fault_tolerance {
            let err = rekey_error!(RedundancyExceeded {
                degraded: degraded.len(),
                tolerance: self.fault_tolerance,
            });
            error!("{err}");
            return DegradedDecision::Fail(FailReason::RedundancyExceeded, err);
        }
        if degraded.len() <= self.rekey_tolerance {
            if let Some(since) = self.paused_since.take() {
                info!("Redundancy restored after {:?}, rekey may resume", since.elapsed());
            }
            return DegradedDecision::Proceed;
        }
        let tolerance = self.rekey_tolerance;
        let since = *self.paused_since.get_or_insert_with(|| {
            warn!("Positions {degraded:?} degraded beyond rekey tolerance {tolerance}, waiting for rebuild");
            Instant::now()
        });
        if since.elapsed() >= self.rebuild_timeout {
            let err = rekey_error!(RebuildTimeout { position: degraded[0] });
            error!("{err}");
            return DegradedDecision::Fail(FailReason::RebuildTimeout, err);
        }
        DegradedDecision::Pause
    }

    pub fn on_drive_fail(&mut self, position: usize, health: &PositionHealth) -> DegradedDecision {
        health.mark_failed(position);
        self.evaluate(health)
    }

    pub fn on_rebuild_complete(&mut self, position: usize, health: &PositionHealth) -> DegradedDecision {
        health.mark_healthy(position);
        self.evaluate(health)
    }
}
