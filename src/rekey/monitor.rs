use std::sync::{Arc, RwLockReadGuard};
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::checkpoint::{Checkpoint, CheckpointTracker, FailReason, PauseReason, RekeySubstate};
use super::chunk::plan_rekey;
use super::degraded::{DegradedDecision, DegradedPolicy};
use super::hook::{HookDecision, ObservabilityHook};
use super::iw::{check_chunk, ChunkResolution, IwTracker};
use super::nonpaged::{EncryptionMode, NonpagedRecord, NonpagedStore};
use super::notify::NotificationService;
use super::paged::{PagedReconstructor, PagedStore, ReconstructContext};
use super::peer::{PeerCoordinator, PeerEvent, PeerLink};
use super::quiesce::{QuiesceCoordinator, QuiesceToken};
use super::shared::RekeySharedState;
use super::{NONPAGED_BASE_LBA, PAGED_BASE_LBA};
use crate::block_device::BlockDevice;
use crate::config::RekeyConfig;
use crate::crypt::{KeyRing, SharedKeyRing, XtsBlockCipher};
use crate::raid::{ChunkRow, PositionHealth, RaidGeometry, RowKeys, StripeIo, WriteBatch};
use crate::{rekey_error, RekeyError, Result};

/// Lifecycle of a raid group object as the rest of the system sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Specialize,
    /// Retry staging after a failed metadata update.
    Activate,
    Ready,
    /// Standby on the passive controller.
    Hibernate,
    Fail,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgEvent {
    StartRekey,
    PauseRekey,
    ResumeRekey,
    DriveFailed(usize),
    RebuildComplete(usize),
    PeerLost,
    PeerRejoined,
    /// A paged metadata block was found corrupt outside the monitor.
    PagedError,
    Destroy,
}

/// What the scheduler should do with the monitor after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Work remains; step again right away.
    Continue,
    /// Waiting on I/O, a drain or a hook; step again shortly.
    Wait,
    /// Nothing to do until an event arrives.
    Idle,
    /// The raid group was destroyed.
    Done,
    Failed,
}

/// Fine-grained position of the monitor, reported to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Idle,
    Specialize,
    Standby,
    Recovering,
    IwCheck { chunk: u64 },
    Draining { chunk: u64 },
    WritesInFlight { chunk: u64 },
    Quiescing { chunk: u64 },
    PagedUpdate { chunk: u64 },
    WaitingForRebuild,
    Completing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RekeyStatus {
    pub raid_group: u32,
    pub role: Role,
    pub lifecycle: LifecycleState,
    pub checkpoint: Checkpoint,
    pub substate: RekeySubstate,
    pub pending_peer_ack: bool,
    /// Cleared by an unacknowledged checkpoint hint, set again by the next
    /// acknowledgement.
    pub peer_responsive: bool,
    pub peer_ack_timeouts: u64,
}

/// Everything needed to build a monitor. It is `Send`, unlike the monitor
/// itself, so a scheduler can ship it to the worker that will own it.
pub struct MonitorParams {
    pub raid_group: u32,
    pub geometry: RaidGeometry,
    pub chunks_per_paged_block: u64,
    pub config: RekeyConfig,
    pub devices: Vec<Box<dyn BlockDevice>>,
    pub metadata: Box<dyn BlockDevice>,
    pub health: PositionHealth,
    pub keys: SharedKeyRing,
    pub shared: RekeySharedState,
    pub role: Role,
    pub peer: Option<PeerLink>,
    pub hook: Arc<dyn ObservabilityHook>,
    pub notify: NotificationService,
}

enum Stage {
    Draining,
    Writing(WriteBatch),
    Quiescing,
    Marking { attempts: u32, retry_at: Option<Instant> },
}

struct ChunkWork {
    chunk: u64,
    stage: Stage,
}

enum Recovery {
    Quiescing,
    Reconstructing {
        persisted: Checkpoint,
        reconstructor: PagedReconstructor,
    },
    Verifying {
        persisted: Checkpoint,
        derived: u64,
        /// First chunk below `derived` the check found on the old key.
        cap: Option<u64>,
    },
}

fn read_keys(keys: &SharedKeyRing) -> Result<RwLockReadGuard<'_, KeyRing>> {
    keys.read().map_err(|e| {
        rekey_error!(CryptoError {
            description: format!("Key ring lock poisoned: {e}"),
        })
    })
}

fn transition_keys(ring: &KeyRing) -> Result<RowKeys<'_>> {
    match ring.next() {
        Some(next) => Ok(RowKeys::transition(ring.current(), Some(next))),
        None => Err(rekey_error!(CryptoError {
            description: format!("No key pending after {}", ring.current_epoch()),
        })),
    }
}

fn fail_reason(err: &RekeyError) -> FailReason {
    match err {
        RekeyError::RedundancyExceeded { .. } => FailReason::RedundancyExceeded,
        RekeyError::UnresolvableChunk { .. } => FailReason::UnresolvableChunk,
        RekeyError::QuiesceTimeout { .. } => FailReason::QuiesceTimeout,
        RekeyError::PagedIoError { .. } => FailReason::PagedIo,
        RekeyError::RebuildTimeout { .. } => FailReason::RebuildTimeout,
        RekeyError::CheckpointRegression { .. } => FailReason::CheckpointRegression,
        _ => FailReason::Io,
    }
}

/// The per-raid-group rekey state machine.
///
/// A monitor never blocks on another thread: every call to [`step`]
/// performs at most one unit of work (one pipeline stage of one chunk, one
/// recovery step) and reports what it is waiting for. Metadata and stripe
/// I/O use bounded waits taken from [`RekeyConfig`].
///
/// [`step`]: RekeyMonitor::step
pub struct RekeyMonitor {
    raid_group: u32,
    role: Role,
    lifecycle: LifecycleState,
    geometry: RaidGeometry,
    config: RekeyConfig,
    metadata: Box<dyn BlockDevice>,
    chunks_per_paged_block: u64,
    io: StripeIo,
    nonpaged: NonpagedStore,
    paged: PagedStore,
    keys: SharedKeyRing,
    shared: RekeySharedState,
    tracker: CheckpointTracker,
    quiesce: QuiesceCoordinator,
    token: Option<QuiesceToken>,
    peer: PeerCoordinator,
    policy: DegradedPolicy,
    iw: IwTracker,
    hook: Arc<dyn ObservabilityHook>,
    notify: NotificationService,
    work: Option<ChunkWork>,
    recovery: Option<Recovery>,
    reconstruct_pending: bool,
    sync_pending: bool,
    deferred: Vec<RgEvent>,
    last_seen: Option<(LifecycleState, RekeySubstate, MonitorPhase)>,
    held: bool,
}

impl RekeyMonitor {
    pub fn new(params: MonitorParams) -> Result<Self> {
        let MonitorParams {
            raid_group,
            geometry,
            chunks_per_paged_block,
            config,
            devices,
            metadata,
            health,
            keys,
            shared,
            role,
            peer,
            hook,
            notify,
        } = params;
        config.validate_for(&geometry)?;
        let io = StripeIo::new(&devices, health, &config)?;
        let initial = {
            let ring = read_keys(&keys)?;
            let mode = if ring.is_encrypted() {
                EncryptionMode::Encrypted
            } else {
                EncryptionMode::Unencrypted
            };
            NonpagedRecord::new(mode, ring.current_epoch())
        };
        let nonpaged = NonpagedStore::open(metadata.as_ref(), NONPAGED_BASE_LBA, config.io_timeout(), initial)?;
        let paged = PagedStore::new(
            metadata.as_ref(),
            PAGED_BASE_LBA,
            chunks_per_paged_block,
            geometry.chunk_count,
            config.io_retries,
            config.io_timeout(),
        )?;
        let tracker = CheckpointTracker::new(&geometry, config.persist_interval_chunks, shared.clone());
        let quiesce = QuiesceCoordinator::new(shared.clone(), config.quiesce_timeout());
        let peer = PeerCoordinator::new(peer, &config);
        let policy = DegradedPolicy::new(&geometry, &config);
        info!("Raid group {raid_group} ({:?}, width {}) created as {role:?}", geometry.raid_type, geometry.width);
        let monitor = RekeyMonitor {
            raid_group,
            role,
            lifecycle: LifecycleState::Specialize,
            geometry,
            config,
            metadata,
            chunks_per_paged_block,
            io,
            nonpaged,
            paged,
            keys,
            shared,
            tracker,
            quiesce,
            token: None,
            peer,
            policy,
            iw: IwTracker::new(0..0),
            hook,
            notify,
            work: None,
            recovery: None,
            reconstruct_pending: false,
            sync_pending: false,
            deferred: Vec::new(),
            last_seen: None,
            held: false,
        };
        monitor.notify.emit(raid_group, LifecycleState::Specialize);
        Ok(monitor)
    }

    pub fn raid_group(&self) -> u32 {
        self.raid_group
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn substate(&self) -> RekeySubstate {
        self.tracker.substate()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.tracker.checkpoint()
    }

    pub fn geometry(&self) -> &RaidGeometry {
        &self.geometry
    }

    pub fn shared(&self) -> &RekeySharedState {
        &self.shared
    }

    pub fn iw_tracker(&self) -> &IwTracker {
        &self.iw
    }

    pub fn status(&self) -> RekeyStatus {
        let (checkpoint, substate) = match self.role {
            Role::Active => (self.tracker.checkpoint(), self.tracker.substate()),
            Role::Passive => {
                let view = self.peer.view();
                (view.checkpoint, view.substate.unwrap_or(RekeySubstate::NotStarted))
            }
        };
        RekeyStatus {
            raid_group: self.raid_group,
            role: self.role,
            lifecycle: self.lifecycle,
            checkpoint,
            substate,
            pending_peer_ack: self.peer.pending_peer_ack(),
            peer_responsive: self.peer.is_responsive(),
            peer_ack_timeouts: self.peer.ack_timeouts(),
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        match self.lifecycle {
            LifecycleState::Fail | LifecycleState::Destroy => return MonitorPhase::Failed,
            LifecycleState::Hibernate => return MonitorPhase::Standby,
            _ => {}
        }
        if let Some(recovery) = &self.recovery {
            return match recovery {
                Recovery::Verifying { .. } => MonitorPhase::IwCheck {
                    chunk: self.iw.next_unchecked().unwrap_or(self.iw.range().end),
                },
                _ => MonitorPhase::Recovering,
            };
        }
        if self.lifecycle == LifecycleState::Specialize {
            return MonitorPhase::Specialize;
        }
        if let Some(work) = &self.work {
            let chunk = work.chunk;
            return match work.stage {
                Stage::Draining => MonitorPhase::Draining { chunk },
                Stage::Writing(_) => MonitorPhase::WritesInFlight { chunk },
                Stage::Quiescing => MonitorPhase::Quiescing { chunk },
                Stage::Marking { .. } => MonitorPhase::PagedUpdate { chunk },
            };
        }
        match self.tracker.substate() {
            RekeySubstate::Completing => MonitorPhase::Completing,
            RekeySubstate::Paused(PauseReason::Degraded) => MonitorPhase::WaitingForRebuild,
            _ => MonitorPhase::Idle,
        }
    }

    /// Replaces the peer link after the other controller came back.
    pub fn attach_peer(&mut self, link: PeerLink) {
        self.peer.attach(link);
        if self.role == Role::Passive {
            self.peer.request_rejoin();
        }
    }

    /// Applies `events` and performs one unit of work.
    pub fn step(&mut self, events: &[RgEvent]) -> Action {
        for event in events {
            if let Err(e) = self.handle_event(*event) {
                self.fail(fail_reason(&e), &e);
            }
        }
        if let Some(action) = self.terminal_action() {
            return action;
        }
        if let Err(e) = self.poll_peer() {
            self.fail(fail_reason(&e), &e);
        }
        if let Some(action) = self.terminal_action() {
            return action;
        }
        if !self.consult_hook() {
            return Action::Wait;
        }
        let action = match self.run() {
            Ok(action) => action,
            Err(e) => {
                self.fail(fail_reason(&e), &e);
                Action::Failed
            }
        };
        self.terminal_action().unwrap_or(action)
    }

    fn terminal_action(&self) -> Option<Action> {
        match self.lifecycle {
            LifecycleState::Fail => Some(Action::Failed),
            LifecycleState::Destroy => Some(Action::Done),
            _ => None,
        }
    }

    fn consult_hook(&mut self) -> bool {
        let now = (self.lifecycle, self.tracker.substate(), self.phase());
        if self.last_seen == Some(now) && !self.held {
            return true;
        }
        self.last_seen = Some(now);
        let decision = self.hook.on_transition(self.raid_group, now.0, now.1, now.2);
        self.held = decision == HookDecision::Hold;
        !self.held
    }

    fn set_lifecycle(&mut self, lifecycle: LifecycleState) {
        if self.lifecycle != lifecycle {
            info!("Raid group {} lifecycle {:?} -> {lifecycle:?}", self.raid_group, self.lifecycle);
            self.lifecycle = lifecycle;
            self.notify.emit(self.raid_group, lifecycle);
        }
    }

    fn release_quiesce(&mut self) {
        if let Some(token) = self.token.take() {
            self.quiesce.unquiesce(token);
        }
    }

    fn fail(&mut self, reason: FailReason, err: &RekeyError) {
        if matches!(self.lifecycle, LifecycleState::Fail | LifecycleState::Destroy) {
            return;
        }
        error!("Raid group {} failed: {err}", self.raid_group);
        if let Some(work) = self.work.take() {
            self.quiesce.unlock_chunk(work.chunk);
        }
        self.recovery = None;
        self.shared.set_failed();
        self.release_quiesce();
        let rekeying = matches!(
            self.tracker.substate(),
            RekeySubstate::Running | RekeySubstate::Paused(_) | RekeySubstate::Completing
        );
        if rekeying {
            if let Err(e) = self.tracker.persist(&mut self.nonpaged) {
                warn!("Could not persist checkpoint of failed raid group {}: {e}", self.raid_group);
            }
        }
        if rekeying || self.nonpaged.record().mode.in_transition() {
            self.tracker.set_substate(RekeySubstate::Failed(reason));
        }
        self.set_lifecycle(LifecycleState::Fail);
    }

    fn destroy(&mut self) {
        if let Some(work) = self.work.take() {
            self.quiesce.unlock_chunk(work.chunk);
        }
        self.recovery = None;
        self.release_quiesce();
        self.set_lifecycle(LifecycleState::Destroy);
    }

    fn handle_event(&mut self, event: RgEvent) -> Result<()> {
        match event {
            RgEvent::Destroy => {
                self.destroy();
                return Ok(());
            }
            RgEvent::PeerLost => {
                self.peer.peer_lost();
                self.on_peer_lost();
                return Ok(());
            }
            RgEvent::PeerRejoined => {
                self.sync_pending = true;
                return Ok(());
            }
            RgEvent::DriveFailed(position) => {
                let decision = self.policy.on_drive_fail(position, self.io.health());
                self.apply_degraded(decision);
                return Ok(());
            }
            RgEvent::RebuildComplete(position) => {
                let decision = self.policy.on_rebuild_complete(position, self.io.health());
                self.apply_degraded(decision);
                return Ok(());
            }
            RgEvent::PagedError => {
                warn!("Raid group {}: paged metadata error reported", self.raid_group);
                self.nonpaged.record_mut().paged_reconstruct_required = true;
                self.reconstruct_pending = true;
                return Ok(());
            }
            RgEvent::StartRekey | RgEvent::PauseRekey | RgEvent::ResumeRekey => {}
        }
        if self.role == Role::Passive {
            warn!("Raid group {}: ignoring {event:?} on the passive controller", self.raid_group);
            return Ok(());
        }
        if self.lifecycle == LifecycleState::Specialize || self.recovery.is_some() {
            debug!("Raid group {}: deferring {event:?} until recovery finishes", self.raid_group);
            self.deferred.push(event);
            return Ok(());
        }
        match event {
            RgEvent::StartRekey => self.start_rekey(),
            RgEvent::PauseRekey => self.pause_rekey(),
            RgEvent::ResumeRekey => {
                self.resume_rekey();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn apply_degraded(&mut self, decision: DegradedDecision) {
        match decision {
            DegradedDecision::Proceed => {
                if self.tracker.substate() == RekeySubstate::Paused(PauseReason::Degraded) {
                    info!("Raid group {} back within rekey tolerance, resuming", self.raid_group);
                    self.tracker.set_substate(RekeySubstate::Running);
                }
            }
            DegradedDecision::Pause => {
                if self.tracker.substate() == RekeySubstate::Running {
                    self.tracker.set_substate(RekeySubstate::Paused(PauseReason::Degraded));
                    if let Err(e) = self.tracker.persist(&mut self.nonpaged) {
                        warn!("Could not persist checkpoint at pause: {e}");
                    }
                }
            }
            DegradedDecision::Fail(reason, err) => self.fail(reason, &err),
        }
    }

    fn on_peer_lost(&mut self) {
        if self.role == Role::Passive {
            info!(
                "Raid group {}: peer lost, taking over (last hint {})",
                self.raid_group,
                self.peer.view().checkpoint
            );
            self.role = Role::Active;
            self.set_lifecycle(LifecycleState::Specialize);
            self.recovery = Some(Recovery::Quiescing);
        }
    }

    fn poll_peer(&mut self) -> Result<()> {
        for event in self.peer.poll() {
            match event {
                PeerEvent::Lost => self.on_peer_lost(),
                PeerEvent::RejoinRequested => self.sync_pending = true,
                PeerEvent::Synced { checkpoint, substate } => {
                    info!(
                        "Raid group {}: synchronized with active peer at {checkpoint} ({substate:?})",
                        self.raid_group
                    );
                }
                PeerEvent::AckTimeout { sequence } => {
                    let err = rekey_error!(PeerAckTimeout { sequence });
                    error!(
                        "Raid group {}: {err}, peer unresponsive ({} timeouts)",
                        self.raid_group,
                        self.peer.ack_timeouts()
                    );
                }
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<Action> {
        if self.role == Role::Passive {
            if self.lifecycle == LifecycleState::Specialize {
                if self.peer.is_connected() {
                    self.peer.request_rejoin();
                }
                self.set_lifecycle(LifecycleState::Hibernate);
            }
            return Ok(Action::Idle);
        }
        if self.lifecycle == LifecycleState::Specialize && self.recovery.is_none() {
            self.recovery = Some(Recovery::Quiescing);
        }
        if let Some(recovery) = self.recovery.take() {
            return self.step_recovery(recovery);
        }
        if self.sync_pending {
            self.sync_pending = false;
            let (checkpoint, substate) = (self.tracker.checkpoint(), self.tracker.substate());
            self.peer.send_state_sync(checkpoint, substate);
        }
        if let Some(work) = self.work.take() {
            let chunk = work.chunk;
            return self.step_chunk(work).inspect_err(|_| self.quiesce.unlock_chunk(chunk));
        }
        if self.reconstruct_pending {
            self.reconstruct_pending = false;
            self.recovery = Some(Recovery::Quiescing);
            return Ok(Action::Continue);
        }
        if !self.deferred.is_empty() {
            for event in std::mem::take(&mut self.deferred) {
                self.handle_event(event)?;
            }
            return Ok(Action::Continue);
        }
        match self.tracker.substate() {
            RekeySubstate::Running => self.next_chunk(),
            RekeySubstate::Paused(PauseReason::Degraded) => {
                let decision = self.policy.evaluate(self.io.health());
                self.apply_degraded(decision);
                Ok(Action::Wait)
            }
            RekeySubstate::Completing => self.step_completion(),
            _ => Ok(Action::Idle),
        }
    }

    /// Takes the quiesce in place since boot, or quiesces now.
    fn poll_quiesce(&mut self) -> Result<bool> {
        if self.token.is_some() {
            return Ok(true);
        }
        if let Some(token) = self.quiesce.boot_token() {
            self.token = Some(token);
            return Ok(true);
        }
        self.quiesce.begin_quiesce();
        self.token = self.quiesce.poll_quiesce()?;
        Ok(self.token.is_some())
    }

    /// Reopens both metadata stores; another controller may have written
    /// them since they were loaded.
    fn reload_metadata(&mut self) -> Result<()> {
        let initial = self.nonpaged.record().clone();
        self.nonpaged = NonpagedStore::open(
            self.metadata.as_ref(),
            NONPAGED_BASE_LBA,
            self.config.io_timeout(),
            initial,
        )?;
        self.paged = PagedStore::new(
            self.metadata.as_ref(),
            PAGED_BASE_LBA,
            self.chunks_per_paged_block,
            self.geometry.chunk_count,
            self.config.io_retries,
            self.config.io_timeout(),
        )?;
        self.reconcile_keys()
    }

    /// Brings the key ring in line with the persisted epochs. A crash after
    /// the completion record was written but before the ring rotated leaves
    /// the ring one epoch behind.
    fn reconcile_keys(&mut self) -> Result<()> {
        let record = self.nonpaged.record();
        let mut ring = self.keys.write().map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Key ring lock poisoned: {e}"),
            })
        })?;
        if !record.mode.in_transition() && ring.next_epoch() == Some(record.current_epoch) {
            info!("Raid group {}: finishing interrupted key rotation", self.raid_group);
            ring.rotate()?;
        }
        if ring.current_epoch() != record.current_epoch {
            return Err(rekey_error!(CryptoError {
                description: format!(
                    "Raid group is on {} but the key ring holds {}",
                    record.current_epoch,
                    ring.current_epoch()
                ),
            }));
        }
        if record.mode.in_transition() && ring.next_epoch() != record.next_epoch {
            return Err(rekey_error!(CryptoError {
                description: format!("Rekey to {:?} in progress but that key is not available", record.next_epoch),
            }));
        }
        Ok(())
    }

    fn step_recovery(&mut self, recovery: Recovery) -> Result<Action> {
        match recovery {
            Recovery::Quiescing => {
                if !self.poll_quiesce()? {
                    self.recovery = Some(Recovery::Quiescing);
                    return Ok(Action::Wait);
                }
                self.reload_metadata()?;
                let record = self.nonpaged.record();
                let persisted = match (record.mode.in_transition(), record.rekey_checkpoint) {
                    (false, _) => Checkpoint::Invalid,
                    (true, Checkpoint::Invalid) => Checkpoint::At(0),
                    (true, at) => at,
                };
                info!(
                    "Raid group {}: recovering ({:?}, persisted checkpoint {persisted})",
                    self.raid_group, record.mode
                );
                let persisted_chunk = persisted.lba().map(|lba| lba / self.geometry.chunk_sectors);
                self.recovery = Some(Recovery::Reconstructing {
                    persisted,
                    reconstructor: PagedReconstructor::new(persisted_chunk),
                });
                Ok(Action::Continue)
            }
            Recovery::Reconstructing {
                persisted,
                mut reconstructor,
            } => {
                let ring = read_keys(&self.keys)?;
                let keys = match persisted {
                    Checkpoint::At(_) => transition_keys(&ring)?,
                    Checkpoint::Invalid => RowKeys::single(ring.current()),
                };
                let mut ctx = ReconstructContext {
                    store: &mut self.paged,
                    io: &mut self.io,
                    geometry: &self.geometry,
                    keys,
                };
                let Some(outcome) = reconstructor.step(&mut ctx)? else {
                    self.recovery = Some(Recovery::Reconstructing {
                        persisted,
                        reconstructor,
                    });
                    return Ok(Action::Continue);
                };
                drop(ring);
                let Some(derived) = outcome.checkpoint_chunk else {
                    return self.finish_idle_recovery();
                };
                let start = persisted.lba().unwrap_or(0) / self.geometry.chunk_sectors;
                let hint = self
                    .peer
                    .view()
                    .checkpoint
                    .lba()
                    .map_or(0, |lba| lba / self.geometry.chunk_sectors);
                let end = (derived.max(hint) + 1).min(self.geometry.chunk_count).max(start);
                info!(
                    "Raid group {}: checking chunks {start}..{end} for incomplete writes (derived {derived}, hint {hint})",
                    self.raid_group
                );
                self.iw = IwTracker::new(start..end);
                self.recovery = Some(Recovery::Verifying {
                    persisted,
                    derived,
                    cap: None,
                });
                Ok(Action::Continue)
            }
            Recovery::Verifying {
                persisted,
                derived,
                cap,
            } => {
                let Some(chunk) = self.iw.next_unchecked() else {
                    let chunk = cap.map_or(derived, |c| c.min(derived));
                    return self.finish_recovery(persisted, chunk);
                };
                self.paged.begin_verify(chunk)?;
                let resolution = {
                    let ring = read_keys(&self.keys)?;
                    let keys = transition_keys(&ring)?;
                    check_chunk(&mut self.io, &self.geometry, chunk, keys, &mut self.iw)?
                };
                self.paged
                    .finish_verify(chunk, resolution == ChunkResolution::Invalidated)?;
                debug!("Raid group {}: chunk {chunk} resolved {resolution:?}", self.raid_group);
                let cap = if resolution == ChunkResolution::OnOldKey && chunk < derived {
                    warn!("Chunk {chunk} is marked rekeyed but holds old-key data");
                    Some(cap.map_or(chunk, |c| c.min(chunk)))
                } else {
                    cap
                };
                self.recovery = Some(Recovery::Verifying {
                    persisted,
                    derived,
                    cap,
                });
                Ok(Action::Continue)
            }
        }
    }

    fn finish_recovery(&mut self, persisted: Checkpoint, chunk: u64) -> Result<Action> {
        let checkpoint = self.tracker.recover(persisted, self.geometry.chunk_lba(chunk));
        let verified_end = self.geometry.chunk_lba(self.iw.range().end);
        {
            let record = self.nonpaged.record_mut();
            record.iw_verify_checkpoint = Checkpoint::At(verified_end);
            record.paged_reconstruct_required = false;
        }
        self.tracker.persist(&mut self.nonpaged)?;
        let substate = if self.tracker.is_complete() {
            RekeySubstate::Completing
        } else {
            RekeySubstate::Running
        };
        self.tracker.set_substate(substate);
        self.release_quiesce();
        self.set_lifecycle(LifecycleState::Ready);
        info!("Raid group {}: recovered, resuming rekey at {checkpoint}", self.raid_group);
        self.peer.propagate_checkpoint(checkpoint, chunk, substate, true);
        Ok(Action::Continue)
    }

    fn finish_idle_recovery(&mut self) -> Result<Action> {
        if self.nonpaged.record().generation == 0 {
            self.nonpaged.write()?;
        } else if self.nonpaged.record().paged_reconstruct_required {
            self.nonpaged.record_mut().paged_reconstruct_required = false;
            self.nonpaged.write()?;
        }
        self.release_quiesce();
        self.set_lifecycle(LifecycleState::Ready);
        Ok(Action::Continue)
    }

    fn start_rekey(&mut self) -> Result<()> {
        match self.tracker.substate() {
            RekeySubstate::NotStarted | RekeySubstate::Complete => {}
            substate => {
                info!("Raid group {}: rekey already {substate:?}", self.raid_group);
                return Ok(());
            }
        }
        let (current, next, encrypted) = {
            let mut ring = self.keys.write().map_err(|e| {
                rekey_error!(CryptoError {
                    description: format!("Key ring lock poisoned: {e}"),
                })
            })?;
            if ring.next_epoch().is_none() {
                ring.push_next(XtsBlockCipher::random()?)?;
            }
            (ring.current_epoch(), ring.next_epoch(), ring.is_encrypted())
        };
        self.paged.initialize(self.io.health().needs_rebuild_mask())?;
        {
            let record = self.nonpaged.record_mut();
            record.mode = if encrypted {
                EncryptionMode::Rekeying
            } else {
                EncryptionMode::Encrypting
            };
            record.current_epoch = current;
            record.next_epoch = next;
            record.iw_verify_checkpoint = Checkpoint::Invalid;
        }
        self.tracker.start();
        self.tracker.persist(&mut self.nonpaged)?;
        self.iw = IwTracker::new(0..0);
        info!("Raid group {}: rekey from {current} to {next:?} started", self.raid_group);
        self.peer
            .propagate_checkpoint(Checkpoint::At(0), 0, RekeySubstate::Running, true);
        Ok(())
    }

    fn pause_rekey(&mut self) -> Result<()> {
        if self.tracker.substate() != RekeySubstate::Running {
            info!("Raid group {}: nothing to pause", self.raid_group);
            return Ok(());
        }
        self.tracker.set_substate(RekeySubstate::Paused(PauseReason::Admin));
        self.tracker.persist(&mut self.nonpaged)
    }

    fn resume_rekey(&mut self) {
        match self.tracker.substate() {
            RekeySubstate::Paused(PauseReason::Admin) => {
                self.tracker.set_substate(RekeySubstate::Running);
                let decision = self.policy.evaluate(self.io.health());
                self.apply_degraded(decision);
            }
            RekeySubstate::Paused(PauseReason::Degraded) => {
                warn!("Raid group {}: rekey resumes once rebuild completes", self.raid_group);
            }
            substate => info!("Raid group {}: cannot resume from {substate:?}", self.raid_group),
        }
    }

    fn next_chunk(&mut self) -> Result<Action> {
        let Some(chunk) = self.tracker.chunk() else {
            return Ok(Action::Idle);
        };
        if chunk >= self.geometry.chunk_count {
            self.tracker.set_substate(RekeySubstate::Completing);
            return Ok(Action::Continue);
        }
        let decision = self.policy.evaluate(self.io.health());
        if !matches!(decision, DegradedDecision::Proceed) {
            self.apply_degraded(decision);
            return Ok(Action::Wait);
        }
        self.quiesce.lock_chunk(chunk);
        self.work = Some(ChunkWork {
            chunk,
            stage: Stage::Draining,
        });
        Ok(Action::Continue)
    }

    fn step_chunk(&mut self, work: ChunkWork) -> Result<Action> {
        let ChunkWork { chunk, stage } = work;
        let (stage, action) = match stage {
            Stage::Draining => {
                if !self.quiesce.poll_chunk_drained(chunk)? {
                    (Stage::Draining, Action::Wait)
                } else {
                    let plan = {
                        let ring = read_keys(&self.keys)?;
                        let keys = transition_keys(&ring)?;
                        let row = ChunkRow::read(&mut self.io, &self.geometry, chunk, keys)?;
                        plan_rekey(&self.geometry, &row, keys.new)
                    };
                    // The row read may have failed positions.
                    let decision = self.policy.evaluate(self.io.health());
                    if !matches!(decision, DegradedDecision::Proceed) {
                        self.quiesce.unlock_chunk(chunk);
                        self.apply_degraded(decision);
                        return Ok(Action::Wait);
                    }
                    if plan.is_noop() {
                        (Stage::Quiescing, Action::Continue)
                    } else {
                        if plan.invalidate {
                            warn!("Raid group {}: chunk {chunk} is lost and will read back invalidated", self.raid_group);
                        }
                        (Stage::Writing(self.io.start_writes(plan.writes)?), Action::Continue)
                    }
                }
            }
            Stage::Writing(mut batch) => {
                self.io.poll_writes(&mut batch)?;
                if !batch.is_complete() {
                    (Stage::Writing(batch), Action::Wait)
                } else {
                    let failed = batch.failed_positions();
                    if !failed.is_empty() {
                        warn!("Raid group {}: rekey writes of chunk {chunk} failed on {failed:?}", self.raid_group);
                        if let DegradedDecision::Fail(reason, err) = self.policy.evaluate(self.io.health()) {
                            self.quiesce.unlock_chunk(chunk);
                            self.fail(reason, &err);
                            return Ok(Action::Failed);
                        }
                    }
                    (Stage::Quiescing, Action::Continue)
                }
            }
            Stage::Quiescing => {
                if self.poll_quiesce()? {
                    (
                        Stage::Marking {
                            attempts: 0,
                            retry_at: None,
                        },
                        Action::Continue,
                    )
                } else {
                    (Stage::Quiescing, Action::Wait)
                }
            }
            Stage::Marking { attempts, retry_at } => {
                if retry_at.is_some_and(|at| Instant::now() < at) {
                    (Stage::Marking { attempts, retry_at }, Action::Wait)
                } else {
                    match self.paged.set_rekeyed(chunk, self.io.health().needs_rebuild_mask()) {
                        Ok(()) => {
                            if self.lifecycle == LifecycleState::Activate {
                                self.set_lifecycle(LifecycleState::Ready);
                            }
                            return self.commit_chunk(chunk);
                        }
                        Err(e @ RekeyError::PagedIoError { .. }) => {
                            let attempts = attempts + 1;
                            if attempts > self.config.io_retries {
                                error!("Raid group {}: paged update of chunk {chunk} failed {attempts} times", self.raid_group);
                                return Err(e);
                            }
                            warn!(
                                "Raid group {}: paged update of chunk {chunk} failed ({e}), retry {attempts}/{}",
                                self.raid_group, self.config.io_retries
                            );
                            self.set_lifecycle(LifecycleState::Activate);
                            let retry_at = Some(Instant::now() + self.config.paged_retry_delay());
                            (Stage::Marking { attempts, retry_at }, Action::Wait)
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };
        self.work = Some(ChunkWork { chunk, stage });
        Ok(action)
    }

    /// Publishes a chunk whose rekey bit is durable.
    fn commit_chunk(&mut self, chunk: u64) -> Result<Action> {
        self.release_quiesce();
        let next = chunk + 1;
        if !self.iw.may_advance_to(next) {
            return Err(rekey_error!(MetadataError {
                description: format!("chunk {chunk} has not finished its incomplete-write check"),
            }));
        }
        let persist_due = self.tracker.advance(self.geometry.chunk_lba(next))?;
        if persist_due {
            self.tracker.persist(&mut self.nonpaged)?;
        }
        self.peer
            .propagate_checkpoint(self.tracker.checkpoint(), next, self.tracker.substate(), false);
        self.quiesce.unlock_chunk(chunk);
        Ok(Action::Continue)
    }

    fn step_completion(&mut self) -> Result<Action> {
        if !self.poll_quiesce()? {
            return Ok(Action::Wait);
        }
        let epoch = read_keys(&self.keys)?.next_epoch().ok_or_else(|| {
            rekey_error!(CryptoError {
                description: "Rekey completing without a pending key".to_string(),
            })
        })?;
        {
            let record = self.nonpaged.record_mut();
            record.mode = EncryptionMode::Encrypted;
            record.current_epoch = epoch;
            record.next_epoch = None;
            record.rekey_checkpoint = Checkpoint::Invalid;
            record.iw_verify_checkpoint = Checkpoint::Invalid;
        }
        self.nonpaged.write()?;
        self.keys
            .write()
            .map_err(|e| {
                rekey_error!(CryptoError {
                    description: format!("Key ring lock poisoned: {e}"),
                })
            })?
            .rotate()?;
        self.tracker.finish();
        self.release_quiesce();
        info!("Raid group {}: rekey complete, data is on {epoch}", self.raid_group);
        self.peer.propagate_checkpoint(
            Checkpoint::Invalid,
            self.geometry.chunk_count,
            RekeySubstate::Complete,
            true,
        );
        Ok(Action::Idle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::block_device::{
        FaultErrorType, FaultOpcode, FaultRecord, FaultyBlockDevice, MemBlockDevice, RaidGroupDevice, BLOCK_SIZE,
        SECTOR_SIZE,
    };
    use crate::crypt::KeyEpoch;
    use crate::raid::row::seal_position;
    use crate::raid::{rebuild_position, RaidType};
    use crate::rekey::hook::{NoopHook, PauseHook, RecordingHook};
    use crate::rekey::metadata_sectors;
    use crate::rekey::peer::peer_link_pair;

    const CHUNKS_PER_BLOCK: u64 = 2;
    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Rig {
        geometry: RaidGeometry,
        mems: Vec<MemBlockDevice>,
        metadata: FaultyBlockDevice,
        health: PositionHealth,
        keys: SharedKeyRing,
        config: RekeyConfig,
    }

    impl Rig {
        fn new(raid_type: RaidType, width: usize) -> Self {
            let geometry = RaidGeometry::new(raid_type, width, 4, 6).unwrap();
            let metadata = MemBlockDevice::new(metadata_sectors(geometry.chunk_count, CHUNKS_PER_BLOCK));
            Rig {
                mems: (0..width)
                    .map(|_| MemBlockDevice::new(geometry.position_sectors()))
                    .collect(),
                metadata: FaultyBlockDevice::new(Box::new(metadata)),
                health: PositionHealth::new(width),
                keys: KeyRing::with_key(KeyEpoch(1), XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap()).shared(),
                config: RekeyConfig {
                    persist_interval_chunks: 2,
                    peer_propagation_interval_chunks: 1,
                    paged_retry_delay_ms: 1,
                    io_retries: 3,
                    ..Default::default()
                },
                geometry,
            }
        }

        fn devices(&self) -> Vec<Box<dyn BlockDevice>> {
            self.mems.iter().map(|m| BlockDevice::clone(m)).collect()
        }

        fn monitor(&self, role: Role, peer: Option<PeerLink>, hook: Arc<dyn ObservabilityHook>) -> RekeyMonitor {
            RekeyMonitor::new(MonitorParams {
                raid_group: 1,
                geometry: self.geometry.clone(),
                chunks_per_paged_block: CHUNKS_PER_BLOCK,
                config: self.config.clone(),
                devices: self.devices(),
                metadata: BlockDevice::clone(&self.metadata),
                health: self.health.clone(),
                keys: self.keys.clone(),
                shared: RekeySharedState::new(self.geometry.chunk_count, self.geometry.chunk_sectors),
                role,
                peer,
                hook,
                notify: NotificationService::new(),
            })
            .unwrap()
        }

        fn client(&self, monitor: &RekeyMonitor) -> RaidGroupDevice {
            RaidGroupDevice::new(
                self.devices(),
                self.geometry.clone(),
                self.health.clone(),
                self.keys.clone(),
                monitor.shared().clone(),
                self.config.clone(),
            )
            .unwrap()
        }

        fn data(&self) -> Vec<u8> {
            (0..self.geometry.logical_capacity() as usize * SECTOR_SIZE)
                .map(|i| (i / 7) as u8)
                .collect()
        }

        fn sectors(&self) -> u32 {
            self.geometry.logical_capacity() as u32
        }

        fn past_chunk(&self, chunk: u64) -> impl Fn(&RekeyMonitor) -> bool {
            let lba = self.geometry.chunk_lba(chunk);
            move |m: &RekeyMonitor| m.checkpoint().lba().is_some_and(|at| at >= lba)
        }
    }

    fn run_until(monitor: &mut RekeyMonitor, done: impl Fn(&RekeyMonitor) -> bool) -> bool {
        for _ in 0..20_000 {
            if done(monitor) {
                return true;
            }
            match monitor.step(&[]) {
                Action::Failed | Action::Done => break,
                Action::Wait => std::thread::sleep(Duration::from_micros(50)),
                _ => {}
            }
        }
        done(monitor)
    }

    fn run_steps(monitor: &mut RekeyMonitor, steps: usize) {
        for _ in 0..steps {
            monitor.step(&[]);
        }
    }

    fn complete(m: &RekeyMonitor) -> bool {
        m.substate() == RekeySubstate::Complete
    }

    /// Boots an active monitor and fills the raid group through a client.
    fn ready(rig: &Rig, hook: Arc<dyn ObservabilityHook>) -> (RekeyMonitor, RaidGroupDevice, Vec<u8>) {
        let mut monitor = rig.monitor(Role::Active, None, hook);
        assert!(run_until(&mut monitor, |m| m.lifecycle() == LifecycleState::Ready));
        let client = rig.client(&monitor);
        let data = rig.data();
        client.write_sectors(0, &data, TIMEOUT).unwrap();
        (monitor, client, data)
    }

    fn persisted(rig: &Rig) -> NonpagedRecord {
        let initial = NonpagedRecord::new(EncryptionMode::Unencrypted, KeyEpoch(0));
        NonpagedStore::open(&rig.metadata, NONPAGED_BASE_LBA, TIMEOUT, initial)
            .unwrap()
            .record()
            .clone()
    }

    #[test]
    fn test_rekey_runs_to_completion() {
        for (raid_type, width) in [(RaidType::Raid1, 2), (RaidType::Raid5, 3), (RaidType::Raid6, 5)] {
            let rig = Rig::new(raid_type, width);
            let (mut monitor, client, data) = ready(&rig, Arc::new(NoopHook));
            monitor.step(&[RgEvent::StartRekey]);
            assert_eq!(monitor.substate(), RekeySubstate::Running);
            assert_eq!(persisted(&rig).mode, EncryptionMode::Rekeying);

            assert!(run_until(&mut monitor, complete), "{raid_type}");
            assert_eq!(monitor.checkpoint(), Checkpoint::Invalid);
            {
                let ring = rig.keys.read().unwrap();
                assert_eq!(ring.current_epoch(), KeyEpoch(2));
                assert!(ring.next().is_none());
            }
            let record = persisted(&rig);
            assert_eq!(record.mode, EncryptionMode::Encrypted);
            assert_eq!(record.current_epoch, KeyEpoch(2));
            assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
        }
    }

    #[test]
    fn test_client_io_interleaved_with_rekey() {
        let rig = Rig::new(RaidType::Raid5, 3);
        let (mut monitor, client, mut data) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        let shared = monitor.shared().clone();
        let per_chunk = rig.geometry.logical_sectors_per_chunk();
        let stride = 5;
        let mut sector = 0u64;
        while !complete(&monitor) {
            assert_ne!(monitor.step(&[]), Action::Failed);
            // Held requests would only complete on a later step.
            if shared.is_quiesced() || shared.chunk_locked(sector / per_chunk) {
                continue;
            }
            let fill = vec![sector as u8 ^ 0x5a; SECTOR_SIZE];
            client.write_sectors(sector, &fill, TIMEOUT).unwrap();
            let at = sector as usize * SECTOR_SIZE;
            data[at..at + SECTOR_SIZE].copy_from_slice(&fill);
            assert_eq!(client.read_sectors(sector, 1, TIMEOUT).unwrap(), fill);
            sector = (sector + stride) % rig.geometry.logical_capacity();
        }
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_admin_pause_freezes_checkpoint() {
        let rig = Rig::new(RaidType::Raid10, 4);
        let (mut monitor, client, data) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        assert!(run_until(&mut monitor, rig.past_chunk(2)));

        monitor.step(&[RgEvent::PauseRekey]);
        assert_eq!(monitor.substate(), RekeySubstate::Paused(PauseReason::Admin));
        run_steps(&mut monitor, 20);
        let frozen = monitor.checkpoint();
        run_steps(&mut monitor, 50);
        assert_eq!(monitor.checkpoint(), frozen);
        assert_eq!(monitor.status().substate, RekeySubstate::Paused(PauseReason::Admin));

        monitor.step(&[RgEvent::ResumeRekey]);
        assert!(run_until(&mut monitor, complete));
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_restart_resumes_from_metadata() {
        let rig = Rig::new(RaidType::Raid5, 4);
        let (mut monitor, client, data) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        assert!(run_until(&mut monitor, rig.past_chunk(3)));
        let reached = monitor.checkpoint();
        drop(client);
        drop(monitor);

        let mut restarted = rig.monitor(Role::Active, None, Arc::new(NoopHook));
        assert!(run_until(&mut restarted, |m| m.lifecycle() == LifecycleState::Ready));
        assert_eq!(restarted.substate(), RekeySubstate::Running);
        assert!(restarted.checkpoint().lba() >= reached.lba());
        assert!(restarted.iw_tracker().is_done());

        assert!(run_until(&mut restarted, complete));
        let client = rig.client(&restarted);
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_drive_failure_pauses_until_rebuild() {
        let rig = Rig::new(RaidType::Raid5, 3);
        let (mut monitor, client, data) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        assert!(run_until(&mut monitor, rig.past_chunk(1)));

        monitor.step(&[RgEvent::DriveFailed(0)]);
        assert_eq!(monitor.substate(), RekeySubstate::Paused(PauseReason::Degraded));
        run_steps(&mut monitor, 20);
        let frozen = monitor.checkpoint();
        run_steps(&mut monitor, 50);
        assert_eq!(monitor.checkpoint(), frozen);
        assert_eq!(monitor.phase(), MonitorPhase::WaitingForRebuild);
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);

        let shared = monitor.shared().clone();
        {
            let mut io = StripeIo::new(&rig.devices(), rig.health.clone(), &rig.config).unwrap();
            let ring = rig.keys.read().unwrap();
            rebuild_position(&mut io, &rig.geometry, 0, |chunk| {
                if shared.is_rekeyed(chunk) {
                    ring.next()
                } else {
                    ring.current()
                }
            })
            .unwrap();
        }
        monitor.step(&[RgEvent::RebuildComplete(0)]);
        assert_eq!(monitor.substate(), RekeySubstate::Running);
        assert!(run_until(&mut monitor, complete));
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_second_failure_fails_raid_group() {
        let rig = Rig::new(RaidType::Raid5, 3);
        let (mut monitor, client, _) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        assert_eq!(monitor.step(&[RgEvent::DriveFailed(0), RgEvent::DriveFailed(2)]), Action::Failed);
        assert_eq!(monitor.lifecycle(), LifecycleState::Fail);
        assert_eq!(monitor.substate(), RekeySubstate::Failed(FailReason::RedundancyExceeded));
        assert!(client.read_sectors(0, 1, TIMEOUT).is_err());
    }

    #[test]
    fn test_paged_update_failure_retries_through_activate() {
        let rig = Rig::new(RaidType::Raid5, 3);
        let hook = Arc::new(RecordingHook::default());
        let (mut monitor, client, data) = ready(&rig, hook.clone());
        monitor.step(&[RgEvent::StartRekey]);
        let paged = PAGED_BASE_LBA..PAGED_BASE_LBA + 3;
        rig.metadata
            .inject(FaultRecord::new(FaultOpcode::Write, paged, FaultErrorType::NonRetryable, 2));

        assert!(run_until(&mut monitor, complete));
        assert!(hook.saw_lifecycle(LifecycleState::Activate));
        assert_eq!(monitor.lifecycle(), LifecycleState::Ready);
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_paged_update_failure_exhausts_retries() {
        let rig = Rig::new(RaidType::Raid1, 2);
        let (mut monitor, _client, _) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        let paged = PAGED_BASE_LBA..PAGED_BASE_LBA + 3;
        rig.metadata
            .inject(FaultRecord::always(FaultOpcode::Write, paged, FaultErrorType::NonRetryable));

        assert!(run_until(&mut monitor, |m| m.lifecycle() == LifecycleState::Fail));
        assert_eq!(monitor.substate(), RekeySubstate::Failed(FailReason::PagedIo));
        assert!(monitor.shared().is_failed());
    }

    #[test]
    fn test_passive_takes_over_when_peer_is_lost() {
        let rig = Rig::new(RaidType::Raid6, 4);
        let (a, b) = peer_link_pair();
        let mut active = rig.monitor(Role::Active, Some(a), Arc::new(NoopHook));
        let mut passive = rig.monitor(Role::Passive, Some(b), Arc::new(NoopHook));
        assert!(run_until(&mut active, |m| m.lifecycle() == LifecycleState::Ready));
        passive.step(&[]);
        assert_eq!(passive.lifecycle(), LifecycleState::Hibernate);
        // Admin requests belong to the active side.
        passive.step(&[RgEvent::StartRekey]);
        assert_eq!(passive.substate(), RekeySubstate::NotStarted);

        let client = rig.client(&active);
        let data = rig.data();
        client.write_sectors(0, &data, TIMEOUT).unwrap();
        active.step(&[RgEvent::StartRekey]);
        let past = rig.past_chunk(3);
        while !past(&active) {
            assert_ne!(active.step(&[]), Action::Failed);
            passive.step(&[]);
        }
        passive.step(&[]);
        assert!(passive.status().checkpoint.lba().is_some());
        assert_eq!(passive.status().role, Role::Passive);
        drop(client);
        drop(active);

        assert!(run_until(&mut passive, complete));
        assert_eq!(passive.role(), Role::Active);
        let client = rig.client(&passive);
        assert_eq!(client.read_sectors(0, rig.sectors(), TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_recovery_records_invalidated_chunk() {
        let rig = Rig::new(RaidType::Raid5, 4);
        let (mut monitor, client, _) = ready(&rig, Arc::new(NoopHook));
        monitor.step(&[RgEvent::StartRekey]);
        assert!(run_until(&mut monitor, rig.past_chunk(3)));
        let torn = monitor.checkpoint().lba().unwrap() / rig.geometry.chunk_sectors;
        drop(client);
        drop(monitor);

        // Half of the next chunk's positions already carry the new key.
        let lba = rig.geometry.chunk_lba(torn);
        {
            let ring = rig.keys.read().unwrap();
            let plain = vec![0x3c; rig.geometry.chunk_sectors as usize * SECTOR_SIZE];
            let sealed = seal_position(&plain, lba, ring.next());
            for mem in &rig.mems[..2] {
                mem.write(lba as usize * BLOCK_SIZE, sealed.borrow().as_slice());
            }
        }

        let mut restarted = rig.monitor(Role::Active, None, Arc::new(NoopHook));
        assert!(run_until(&mut restarted, |m| m.lifecycle() == LifecycleState::Ready));
        let entry = restarted.paged.entry(torn).unwrap().unwrap();
        assert!(entry.verify_error());
        assert!(!entry.incomplete_write());

        assert!(run_until(&mut restarted, complete));
        let client = rig.client(&restarted);
        let first = torn * rig.geometry.logical_sectors_per_chunk();
        assert!(matches!(
            client.read_sectors(first, 1, TIMEOUT),
            Err(RekeyError::DataInvalidated { .. })
        ));
    }

    #[test]
    fn test_unacknowledged_hint_is_reported() {
        let mut rig = Rig::new(RaidType::Raid1, 2);
        rig.config.peer_ack_timeout_ms = 5;
        let (a, _silent) = peer_link_pair();
        let mut active = rig.monitor(Role::Active, Some(a), Arc::new(NoopHook));
        assert!(run_until(&mut active, |m| m.lifecycle() == LifecycleState::Ready));
        assert!(active.status().peer_responsive);
        active.step(&[RgEvent::StartRekey]);
        assert!(active.status().pending_peer_ack);

        let deadline = Instant::now() + TIMEOUT;
        while active.status().peer_ack_timeouts == 0 && Instant::now() < deadline {
            assert_ne!(active.step(&[]), Action::Failed);
            std::thread::sleep(Duration::from_millis(1));
        }
        let status = active.status();
        assert!(status.peer_ack_timeouts > 0);
        assert!(!status.peer_responsive);
        assert!(!matches!(status.substate, RekeySubstate::Failed(_)));
        assert!(run_until(&mut active, complete));
    }

    #[test]
    fn test_hook_holds_monitor_in_place() {
        let rig = Rig::new(RaidType::Raid5, 3);
        let hook = Arc::new(PauseHook::new(MonitorPhase::WritesInFlight { chunk: 1 }));
        let (mut monitor, _client, _) = ready(&rig, hook.clone());
        monitor.step(&[RgEvent::StartRekey]);
        assert!(run_until(&mut monitor, |_| hook.reached()));
        run_steps(&mut monitor, 30);
        assert_eq!(monitor.phase(), MonitorPhase::WritesInFlight { chunk: 1 });
        assert_eq!(monitor.checkpoint(), Checkpoint::At(rig.geometry.chunk_lba(1)));

        hook.release();
        assert!(run_until(&mut monitor, complete));
    }

    #[test]
    fn test_destroy_stops_monitor() {
        let rig = Rig::new(RaidType::Raid1, 2);
        let mut monitor = rig.monitor(Role::Active, None, Arc::new(NoopHook));
        assert_eq!(monitor.phase(), MonitorPhase::Specialize);
        assert_eq!(monitor.step(&[RgEvent::Destroy]), Action::Done);
        assert_eq!(monitor.lifecycle(), LifecycleState::Destroy);
    }
}
