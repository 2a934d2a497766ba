use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, error};

use super::checkpoint::RekeySubstate;
use super::monitor::{LifecycleState, MonitorPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    /// Keep the monitor where it is; it asks again on its next step.
    Hold,
}

/// Observer of monitor transitions. Called from the monitor's worker
/// thread every time the lifecycle, substate or phase changes, and again on
/// every step while the previous answer was `Hold`.
pub trait ObservabilityHook: Send + Sync {
    fn on_transition(
        &self,
        raid_group: u32,
        lifecycle: LifecycleState,
        substate: RekeySubstate,
        phase: MonitorPhase,
    ) -> HookDecision;
}

#[derive(Debug, Default)]
pub struct NoopHook;

impl ObservabilityHook for NoopHook {
    fn on_transition(&self, _: u32, _: LifecycleState, _: RekeySubstate, _: MonitorPhase) -> HookDecision {
        HookDecision::Proceed
    }
}

/// Logs every transition at debug level.
#[derive(Debug, Default)]
pub struct LogHook;

impl ObservabilityHook for LogHook {
    fn on_transition(
        &self,
        raid_group: u32,
        lifecycle: LifecycleState,
        substate: RekeySubstate,
        phase: MonitorPhase,
    ) -> HookDecision {
        debug!("rg {raid_group}: {lifecycle:?} {substate:?} {phase:?}");
        HookDecision::Proceed
    }
}

/// Holds one raid group at a named phase until released.
#[derive(Debug)]
pub struct PauseHook {
    raid_group: Option<u32>,
    phase: MonitorPhase,
    reached: AtomicBool,
    released: AtomicBool,
}

impl PauseHook {
    pub fn new(phase: MonitorPhase) -> Self {
        PauseHook {
            raid_group: None,
            phase,
            reached: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn for_raid_group(raid_group: u32, phase: MonitorPhase) -> Self {
        PauseHook {
            raid_group: Some(raid_group),
            ..Self::new(phase)
        }
    }

    /// Whether a monitor is being held (or was held) at the phase.
    pub fn reached(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl ObservabilityHook for PauseHook {
    fn on_transition(&self, raid_group: u32, _: LifecycleState, _: RekeySubstate, phase: MonitorPhase) -> HookDecision {
        let matches = phase == self.phase && self.raid_group.map_or(true, |rg| rg == raid_group);
        if !matches || self.released.load(Ordering::Acquire) {
            return HookDecision::Proceed;
        }
        if !self.reached.swap(true, Ordering::AcqRel) {
            debug!("rg {raid_group} held at {phase:?}");
        }
        HookDecision::Hold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub raid_group: u32,
    pub lifecycle: LifecycleState,
    pub substate: RekeySubstate,
    pub phase: MonitorPhase,
}

/// Records every transition it sees.
#[derive(Debug, Default)]
pub struct RecordingHook {
    transitions: Mutex<Vec<Transition>>,
}

impl RecordingHook {
    pub fn transitions(&self) -> Vec<Transition> {
        match self.transitions.lock() {
            Ok(transitions) => transitions.clone(),
            Err(e) => {
                error!("Transition log poisoned: {e}");
                Vec::new()
            }
        }
    }

    pub fn saw_substate(&self, substate: RekeySubstate) -> bool {
        self.transitions().iter().any(|t| t.substate == substate)
    }

    pub fn saw_lifecycle(&self, lifecycle: LifecycleState) -> bool {
        self.transitions().iter().any(|t| t.lifecycle == lifecycle)
    }
}

impl ObservabilityHook for RecordingHook {
    fn on_transition(
        &self,
        raid_group: u32,
        lifecycle: LifecycleState,
        substate: RekeySubstate,
        phase: MonitorPhase,
    ) -> HookDecision {
        if let Ok(mut transitions) = self.transitions.lock() {
            transitions.push(Transition {
                raid_group,
                lifecycle,
                substate,
                phase,
            });
        }
        HookDecision::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_hook_holds_until_released() {
        let hook = PauseHook::new(MonitorPhase::WritesInFlight { chunk: 2 });
        let running = RekeySubstate::Running;
        let ready = LifecycleState::Ready;
        assert_eq!(
            hook.on_transition(1, ready, running, MonitorPhase::WritesInFlight { chunk: 1 }),
            HookDecision::Proceed
        );
        assert!(!hook.reached());
        assert_eq!(
            hook.on_transition(1, ready, running, MonitorPhase::WritesInFlight { chunk: 2 }),
            HookDecision::Hold
        );
        assert!(hook.reached());
        hook.release();
        assert_eq!(
            hook.on_transition(1, ready, running, MonitorPhase::WritesInFlight { chunk: 2 }),
            HookDecision::Proceed
        );
    }

    #[test]
    fn test_pause_hook_scoped_to_raid_group() {
        let hook = PauseHook::for_raid_group(7, MonitorPhase::Completing);
        let state = (LifecycleState::Ready, RekeySubstate::Completing);
        assert_eq!(
            hook.on_transition(3, state.0, state.1, MonitorPhase::Completing),
            HookDecision::Proceed
        );
        assert_eq!(
            hook.on_transition(7, state.0, state.1, MonitorPhase::Completing),
            HookDecision::Hold
        );
    }

    #[test]
    fn test_recording_hook_keeps_order() {
        let hook = RecordingHook::default();
        hook.on_transition(1, LifecycleState::Specialize, RekeySubstate::NotStarted, MonitorPhase::Idle);
        hook.on_transition(1, LifecycleState::Ready, RekeySubstate::Running, MonitorPhase::Idle);
        let seen = hook.transitions();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].lifecycle, LifecycleState::Ready);
        assert!(hook.saw_substate(RekeySubstate::Running));
        assert!(!hook.saw_lifecycle(LifecycleState::Fail));
    }
}
