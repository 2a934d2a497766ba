use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use log::{debug, info, warn};
use serde::Serialize;

use super::{wait_until, SimController, SimRaidGroup, SIM_TIMEOUT};
use crate::block_device::{FaultErrorType, FaultOpcode, FaultRecord, SECTOR_SIZE};
use crate::config::{KeyConfig, RaidGroupConfig, RekeyConfig, SimConfig, XtsKeyPair};
use crate::crypt::{KeyEncryptionCipher, KeyEpoch, KeyRing, XtsBlockCipher};
use crate::raid::{RaidGeometry, RaidType};
use crate::rekey::{
    peer_link_pair, wait_for_notification, Checkpoint, ChunkRekeyState, FailReason, LifecycleState, LogHook,
    MonitorPhase, ObservabilityHook, PauseHook, PauseReason, RekeyStatus, RekeySubstate, RgEvent, Role, PAGED_BASE_LBA,
};
use crate::{rekey_error, RekeyError, Result};

/// Raid group id used by the fault scenarios.
const RG: u32 = 1;
const CHUNK_SECTORS: u64 = 4;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Rekey every configured raid group to completion under client I/O.
    Rekey,
    /// One paged metadata block lost while rekey is paused half-way.
    PagedBlockLost,
    /// Every paged metadata block lost once the last chunk is rekeyed.
    AllPagedBlocksLost,
    /// Paged metadata writes fail while rekey runs.
    PagedWriteError,
    /// Two positions of a single-parity group fail reads during rekey.
    DoubleReadFault,
    /// The active controller crashes with rekey writes in flight.
    ControllerCrash,
    /// A position fails mid-rekey and is rebuilt.
    DegradedRebuild,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::Rekey,
        Scenario::PagedBlockLost,
        Scenario::AllPagedBlocksLost,
        Scenario::PagedWriteError,
        Scenario::DoubleReadFault,
        Scenario::ControllerCrash,
        Scenario::DegradedRebuild,
    ];
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub passed: bool,
    pub checks: Vec<Check>,
    /// Final status of every raid group the scenario ran.
    pub raid_groups: Vec<RekeyStatus>,
}

#[derive(Default)]
struct Checks(Vec<Check>);

impl Checks {
    fn expect(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if passed {
            debug!("check {name} passed");
        } else {
            warn!("check {name} failed: {detail}");
        }
        self.0.push(Check {
            name: name.to_string(),
            passed,
            detail,
        });
    }

    fn expect_eq<T: PartialEq + Debug>(&mut self, name: &str, actual: T, expected: T) {
        let passed = actual == expected;
        let detail = if passed {
            format!("{actual:?}")
        } else {
            format!("expected {expected:?}, got {actual:?}")
        };
        self.expect(name, passed, detail);
    }

    /// Compares the whole volume as seen through `sp` against `expected`.
    fn expect_contents(&mut self, name: &str, sp: &SimController, group: &SimRaidGroup, expected: &[u8]) -> Result<()> {
        let client = sp.client(group)?;
        match client.read_sectors(0, group.capacity(), IO_TIMEOUT) {
            Ok(read) => {
                let mismatch = read
                    .chunks(SECTOR_SIZE)
                    .zip(expected.chunks(SECTOR_SIZE))
                    .position(|(a, b)| a != b);
                let detail = match mismatch {
                    Some(sector) => format!("rg {}: sector {sector} differs", group.raid_group),
                    None => format!("rg {}: {} sectors match", group.raid_group, group.capacity()),
                };
                self.expect(name, mismatch.is_none(), detail);
            }
            Err(e) => self.expect(name, false, format!("rg {}: {e}", group.raid_group)),
        }
        Ok(())
    }

    fn finish(self, scenario: Scenario, raid_groups: Vec<RekeyStatus>) -> ScenarioReport {
        let passed = self.0.iter().all(|c| c.passed);
        info!(
            "Scenario {scenario:?} {}: {}/{} checks passed",
            if passed { "passed" } else { "FAILED" },
            self.0.iter().filter(|c| c.passed).count(),
            self.0.len()
        );
        ScenarioReport {
            scenario,
            passed,
            checks: self.0,
            raid_groups,
        }
    }
}

fn is_ready(status: &RekeyStatus) -> bool {
    status.lifecycle == LifecycleState::Ready
}

fn is_complete(status: &RekeyStatus) -> bool {
    status.substate == RekeySubstate::Complete
}

fn current_epoch(group: &SimRaidGroup) -> Result<KeyEpoch> {
    group.keys.read().map(|ring| ring.current_epoch()).map_err(|e| {
        rekey_error!(CryptoError {
            description: format!("Key ring lock poisoned: {e}"),
        })
    })
}

/// Configuration used when none is given: one raid group per raid type,
/// some starting in clear and some already encrypted.
pub fn default_config() -> SimConfig {
    let keys = |seed: u8| KeyConfig {
        current: Some(XtsKeyPair {
            key1: vec![seed; 32],
            key2: vec![seed.wrapping_add(1); 32],
        }),
        epoch: 1,
        next: None,
    };
    let group = |id: u32, raid_type: RaidType, width: usize, keys: KeyConfig| RaidGroupConfig {
        id,
        raid_type,
        width,
        chunk_sectors: 8,
        chunk_count: 16,
        chunks_per_paged_block: 4,
        keys,
    };
    SimConfig {
        engine: RekeyConfig {
            persist_interval_chunks: 4,
            paged_retry_delay_ms: 5,
            ..Default::default()
        },
        raid_groups: vec![
            group(1, RaidType::Raid1, 2, KeyConfig::default()),
            group(2, RaidType::Raid5, 4, keys(0x21)),
            group(3, RaidType::Raid6, 6, keys(0x42)),
            group(4, RaidType::Raid10, 4, keys(0x63)),
        ],
        kek: None,
        status_path: None,
    }
}

/// Runs scenarios against the engine configuration of a [`SimConfig`].
pub struct SimRunner {
    config: SimConfig,
    kek: KeyEncryptionCipher,
}

impl SimRunner {
    pub fn new(config: SimConfig, kek: KeyEncryptionCipher) -> Result<Self> {
        config.validate()?;
        Ok(SimRunner { config, kek })
    }

    pub fn run(&self, scenario: Scenario) -> Result<ScenarioReport> {
        info!("Running scenario {scenario:?} with {} worker(s)", self.workers());
        match scenario {
            Scenario::Rekey => self.rekey_configured(),
            Scenario::PagedBlockLost => self.paged_block_lost(),
            Scenario::AllPagedBlocksLost => self.all_paged_blocks_lost(),
            Scenario::PagedWriteError => self.paged_write_error(),
            Scenario::DoubleReadFault => self.double_read_fault(),
            Scenario::ControllerCrash => self.controller_crash(),
            Scenario::DegradedRebuild => self.degraded_rebuild(),
        }
    }

    pub fn run_all(&self) -> Result<Vec<ScenarioReport>> {
        Scenario::ALL.iter().map(|s| self.run(*s)).collect()
    }

    fn workers(&self) -> usize {
        self.config.engine.workers
    }

    /// A fresh raid group on the old key, tuned from the engine config.
    fn group(
        &self,
        raid_type: RaidType,
        width: usize,
        chunk_count: u64,
        chunks_per_paged_block: u64,
        tune: impl FnOnce(&mut RekeyConfig),
    ) -> Result<SimRaidGroup> {
        let mut config = self.config.engine.clone();
        tune(&mut config);
        let geometry = RaidGeometry::new(raid_type, width, CHUNK_SECTORS, chunk_count)?;
        let keys = KeyRing::with_key(KeyEpoch(1), XtsBlockCipher::random()?);
        SimRaidGroup::new(RG, geometry, chunks_per_paged_block, config, keys)
    }

    /// Boots a controller running `group` as active and fills the volume.
    fn boot_filled(
        &self,
        name: &str,
        group: &SimRaidGroup,
        hook: Arc<dyn ObservabilityHook>,
    ) -> Result<(SimController, Vec<u8>)> {
        let mut sp = SimController::boot(name, self.workers())?;
        sp.attach(group, Role::Active, None, hook)?;
        sp.wait_for(group.raid_group, "ready", is_ready)?;
        let data = group.pattern(group.raid_group as u8);
        sp.client(group)?.write_sectors(0, &data, IO_TIMEOUT)?;
        Ok((sp, data))
    }

    fn rekey_configured(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let groups = self
            .config
            .raid_groups
            .iter()
            .map(|rg| SimRaidGroup::from_config(rg, &self.config.engine, &self.kek))
            .collect::<Result<Vec<_>>>()?;
        let mut sp = SimController::boot("spa", self.workers())?;
        for group in &groups {
            sp.attach(group, Role::Active, None, Arc::new(LogHook))?;
        }
        let mut contents = Vec::with_capacity(groups.len());
        let mut epochs = Vec::with_capacity(groups.len());
        for group in &groups {
            sp.wait_for(group.raid_group, "ready", is_ready)?;
            let data = group.pattern(group.raid_group as u8);
            sp.client(group)?.write_sectors(0, &data, IO_TIMEOUT)?;
            contents.push(data);
            epochs.push(current_epoch(group)?);
        }
        for group in &groups {
            sp.control().start_rekey(group.raid_group)?;
        }

        let mut statuses = Vec::with_capacity(groups.len());
        for ((group, data), before) in groups.iter().zip(contents.iter_mut()).zip(epochs) {
            let rg = group.raid_group;
            let client = sp.client(group)?;
            let deadline = Instant::now() + SIM_TIMEOUT;
            let mut sector = 0u64;
            let status = loop {
                let status = sp.status(rg)?;
                if is_complete(&status) || matches!(status.substate, RekeySubstate::Failed(_)) {
                    break status;
                }
                if Instant::now() >= deadline {
                    break status;
                }
                let fill = vec![sector as u8 ^ 0xC3; SECTOR_SIZE];
                client.write_sectors(sector, &fill, IO_TIMEOUT)?;
                let at = sector as usize * SECTOR_SIZE;
                data[at..at + SECTOR_SIZE].copy_from_slice(&fill);
                sector = (sector + 7) % group.geometry.logical_capacity();
            };
            checks.expect_eq(&format!("rg{rg}_complete"), status.substate, RekeySubstate::Complete);
            let after = current_epoch(group)?;
            checks.expect(
                &format!("rg{rg}_epoch_advanced"),
                after > before,
                format!("{before} -> {after}"),
            );
            checks.expect_contents(&format!("rg{rg}_data_intact"), &sp, group, data)?;
            checks.expect(
                &format!("rg{rg}_checkpoint_monotonic"),
                sp.checkpoint_monotonic(rg),
                format!("rg {rg}"),
            );
            statuses.push(status);
        }
        Ok(checks.finish(Scenario::Rekey, statuses))
    }

    fn paged_block_lost(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let group = self.group(RaidType::Raid5, 4, 9, 3, |_| {})?;
        let chunk4 = Checkpoint::At(group.geometry.chunk_lba(4));

        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Draining { chunk: 4 }));
        let (mut spa, data) = self.boot_filled("spa", &group, hold.clone())?;
        spa.control().start_rekey(RG)?;
        wait_until("rekey to reach chunk 4", SIM_TIMEOUT, || hold.reached())?;
        spa.control().pause_rekey(RG)?;
        let paused = spa.wait_for(RG, "admin pause", |s| {
            s.substate == RekeySubstate::Paused(PauseReason::Admin)
        })?;
        checks.expect_eq("paused_at_chunk_4", paused.checkpoint, chunk4);
        checks.expect_eq("pause_persisted", group.persisted_record()?.rekey_checkpoint, chunk4);
        spa.crash();

        group.corrupt_paged_block(1);
        let report = group.scan()?;
        checks.expect_eq("scan_first_rekeyed_chunk", report.first_rekeyed_chunk, Some(0));
        checks.expect_eq("scan_last_rekeyed_chunk", report.last_rekeyed_chunk, Some(2));
        checks.expect_eq("scan_ambiguous_chunks", report.ambiguous, vec![3..6]);

        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Draining { chunk: 4 }));
        let mut spa = SimController::boot("spa-rebooted", self.workers())?;
        spa.attach(&group, Role::Active, None, hold.clone())?;
        wait_until("rekey to resume at chunk 4", SIM_TIMEOUT, || hold.reached())?;
        let states = (3..6).map(|c| group.chunk_state(c)).collect::<Result<Vec<_>>>()?;
        checks.expect_eq(
            "reconstructed_chunk_states",
            states,
            vec![ChunkRekeyState::Rekeyed, ChunkRekeyState::NotRekeyed, ChunkRekeyState::NotRekeyed],
        );
        checks.expect_eq("paged_block_rewritten", group.scan()?.invalid_blocks, Vec::new());
        checks.expect_eq("resumed_at_chunk_4", spa.status(RG)?.checkpoint, chunk4);

        hold.release();
        let done = spa.wait_for(RG, "rekey completion", is_complete)?;
        checks.expect_contents("data_intact", &spa, &group, &data)?;
        checks.expect("checkpoint_monotonic", spa.checkpoint_monotonic(RG), "after reboot");
        Ok(checks.finish(Scenario::PagedBlockLost, vec![done]))
    }

    fn all_paged_blocks_lost(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        // Only the start of the rekey reaches nonpaged metadata.
        let group = self.group(RaidType::Raid5, 4, 9, 3, |c| c.persist_interval_chunks = 64)?;
        let end = Checkpoint::At(group.geometry.chunk_lba(9));

        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Completing));
        let (mut spa, data) = self.boot_filled("spa", &group, hold.clone())?;
        spa.control().start_rekey(RG)?;
        wait_until("last chunk to be rekeyed", SIM_TIMEOUT, || hold.reached())?;
        checks.expect_eq("in_memory_checkpoint_at_end", spa.status(RG)?.checkpoint, end);
        checks.expect_eq(
            "persisted_checkpoint_behind",
            group.persisted_record()?.rekey_checkpoint,
            Checkpoint::At(0),
        );
        spa.crash();

        for index in 0..3 {
            group.corrupt_paged_block(index);
        }
        let report = group.scan()?;
        checks.expect_eq("scan_all_ambiguous", report.ambiguous, vec![0..3, 3..6, 6..9]);
        checks.expect_eq("scan_no_rekeyed_span", report.first_rekeyed_chunk, None);

        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Completing));
        let mut spa = SimController::boot("spa-rebooted", self.workers())?;
        spa.attach(&group, Role::Active, None, hold.clone())?;
        wait_until("recovery to reach completion", SIM_TIMEOUT, || hold.reached())?;
        let report = group.scan()?;
        checks.expect_eq("resolved_first_rekeyed_chunk", report.first_rekeyed_chunk, Some(0));
        checks.expect_eq("resolved_last_rekeyed_chunk", report.last_rekeyed_chunk, Some(8));
        checks.expect_eq("recovered_checkpoint", spa.status(RG)?.checkpoint, end);

        hold.release();
        let done = spa.wait_for(RG, "rekey completion", is_complete)?;
        checks.expect_eq("key_rotated", current_epoch(&group)?, KeyEpoch(2));
        checks.expect_contents("data_intact", &spa, &group, &data)?;
        Ok(checks.finish(Scenario::AllPagedBlocksLost, vec![done]))
    }

    fn paged_write_error(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let mut statuses = Vec::new();

        // A burst shorter than the retry budget is absorbed.
        let group = self.group(RaidType::Raid5, 3, 6, 2, |c| {
            c.io_retries = 5;
            c.paged_retry_delay_ms = 1;
        })?;
        let paged = PAGED_BASE_LBA..PAGED_BASE_LBA + group.geometry.chunk_count.div_ceil(group.chunks_per_paged_block);
        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Draining { chunk: 1 }));
        let (mut spa, data) = self.boot_filled("spa", &group, hold.clone())?;
        spa.control().start_rekey(RG)?;
        wait_until("rekey to reach chunk 1", SIM_TIMEOUT, || hold.reached())?;
        let activate = group.notify.register(RG, LifecycleState::Activate);
        let ready = group.notify.register(RG, LifecycleState::Ready);
        let handle = spa.metadata(RG)?.inject(FaultRecord::new(
            FaultOpcode::Write,
            paged.clone(),
            FaultErrorType::NonRetryable,
            3,
        ));
        hold.release();
        checks.expect(
            "entered_activate",
            wait_for_notification(&activate, SIM_TIMEOUT).is_ok(),
            "retry staging after a failed paged write",
        );
        checks.expect(
            "back_to_ready",
            wait_for_notification(&ready, SIM_TIMEOUT).is_ok(),
            "paged write succeeded on retry",
        );
        let done = spa.wait_for(RG, "rekey completion", is_complete)?;
        checks.expect_eq("faults_consumed", spa.metadata(RG)?.hits(handle), 3);
        checks.expect_contents("data_intact", &spa, &group, &data)?;
        statuses.push(done);
        spa.crash();

        // A persistent failure exhausts the budget and fails the group.
        let group = self.group(RaidType::Raid1, 2, 6, 2, |c| {
            c.io_retries = 5;
            c.paged_retry_delay_ms = 1;
        })?;
        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Draining { chunk: 1 }));
        let (mut spa, _) = self.boot_filled("spa", &group, hold.clone())?;
        spa.control().start_rekey(RG)?;
        wait_until("rekey to reach chunk 1", SIM_TIMEOUT, || hold.reached())?;
        let failed = group.notify.register(RG, LifecycleState::Fail);
        spa.metadata(RG)?
            .inject(FaultRecord::always(FaultOpcode::Write, paged, FaultErrorType::NonRetryable));
        hold.release();
        checks.expect(
            "failed_after_retries",
            wait_for_notification(&failed, SIM_TIMEOUT).is_ok(),
            "raid group shut down",
        );
        let status = spa.status(RG)?;
        checks.expect_eq("fail_reason", status.substate, RekeySubstate::Failed(FailReason::PagedIo));
        checks.expect_eq("checkpoint_kept", status.checkpoint, Checkpoint::At(group.geometry.chunk_lba(1)));
        checks.expect(
            "client_io_rejected",
            spa.client(&group)?.read_sectors(0, 1, IO_TIMEOUT).is_err(),
            "reads fail once the group failed",
        );
        statuses.push(status);
        Ok(checks.finish(Scenario::PagedWriteError, statuses))
    }

    fn double_read_fault(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let group = self.group(RaidType::Raid5, 5, 6, 2, |_| {})?;
        let (mut spa, _) = self.boot_filled("spa", &group, Arc::new(LogHook))?;
        let faulted = group.geometry.chunk_lba(2)..group.geometry.position_sectors();
        for position in [1, 3] {
            spa.disks(RG)?[position].inject(FaultRecord::always(
                FaultOpcode::Read,
                faulted.clone(),
                FaultErrorType::NonRetryable,
            ));
        }
        let failed = group.notify.register(RG, LifecycleState::Fail);
        spa.control().start_rekey(RG)?;
        checks.expect(
            "raid_group_shut_down",
            wait_for_notification(&failed, SIM_TIMEOUT).is_ok(),
            "two unreadable positions on a single-parity group",
        );
        let status = spa.status(RG)?;
        checks.expect_eq("lifecycle", status.lifecycle, LifecycleState::Fail);
        checks.expect_eq(
            "fail_reason",
            status.substate,
            RekeySubstate::Failed(FailReason::RedundancyExceeded),
        );
        checks.expect_eq("degraded_positions", group.health.degraded().to_vec(), vec![1, 3]);
        checks.expect_eq("no_advance_past_fault", status.checkpoint, Checkpoint::At(group.geometry.chunk_lba(2)));
        Ok(checks.finish(Scenario::DoubleReadFault, vec![status]))
    }

    fn controller_crash(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let group = self.group(RaidType::Raid5, 3, 6, 2, |c| {
            c.persist_interval_chunks = 4;
            c.peer_propagation_interval_chunks = 1;
        })?;
        let (link_a, link_b) = peer_link_pair();
        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::WritesInFlight { chunk: 2 }));
        let mut spa = SimController::boot("spa", self.workers())?;
        let mut spb = SimController::boot("spb", self.workers())?;
        spa.attach(&group, Role::Active, Some(link_a), hold.clone())?;
        spb.attach(&group, Role::Passive, Some(link_b), Arc::new(LogHook))?;
        spa.wait_for(RG, "ready", is_ready)?;
        spb.wait_for(RG, "standby", |s| s.lifecycle == LifecycleState::Hibernate)?;
        let data = group.pattern(0x5A);
        spa.client(&group)?.write_sectors(0, &data, IO_TIMEOUT)?;

        // Two of three positions never see their chunk 2 rekey write.
        let torn = group.geometry.chunk_lba(2)..group.geometry.chunk_lba(3);
        for position in [0, 1] {
            spa.disks(RG)?[position].inject(FaultRecord::always(
                FaultOpcode::Write,
                torn.clone(),
                FaultErrorType::Dropped,
            ));
        }
        spa.control().start_rekey(RG)?;
        wait_until("chunk 2 writes in flight", SIM_TIMEOUT, || hold.reached())?;
        let chunk2 = group.geometry.chunk_lba(2);
        let hint = spb.wait_for(RG, "checkpoint hint", |s| s.checkpoint.lba() >= Some(chunk2))?;
        checks.expect_eq("peer_hint", hint.checkpoint, Checkpoint::At(chunk2));
        checks.expect_eq(
            "persisted_behind_hint",
            group.persisted_record()?.rekey_checkpoint,
            Checkpoint::At(0),
        );
        spa.crash();

        spb.control().send_event(RG, RgEvent::PeerLost)?;
        let done = spb.wait_for(RG, "takeover and completion", |s| s.role == Role::Active && is_complete(s))?;
        checks.expect_eq("survivor_active", done.role, Role::Active);

        let client = spb.client(&group)?;
        let mut intact = true;
        let mut lost = false;
        for chunk in 0..group.geometry.chunk_count {
            let sectors = group.chunk_sectors(chunk);
            let count = (sectors.end - sectors.start) as u32;
            let result = client.read_sectors(sectors.start, count, IO_TIMEOUT);
            if chunk == 2 {
                lost = matches!(result, Err(RekeyError::DataInvalidated { chunk: 2, .. }));
            } else {
                let bytes = sectors.start as usize * SECTOR_SIZE..sectors.end as usize * SECTOR_SIZE;
                intact &= result.is_ok_and(|read| read == data[bytes]);
            }
        }
        checks.expect("torn_chunk_invalidated", lost, "chunk 2 reads back invalidated");
        let report = group.scan()?;
        checks.expect_eq("invalidation_recorded", report.invalidated_chunks, vec![2]);
        checks.expect_eq("verification_finished", report.unverified_chunks, Vec::new());
        checks.expect("other_chunks_intact", intact, "every other chunk holds its pre-crash data");

        let sectors = group.chunk_sectors(2);
        let count = (sectors.end - sectors.start) as u32;
        let fill = vec![0x77; count as usize * SECTOR_SIZE];
        client.write_sectors(sectors.start, &fill, IO_TIMEOUT)?;
        checks.expect(
            "invalidated_chunk_rewritable",
            client.read_sectors(sectors.start, count, IO_TIMEOUT).is_ok_and(|read| read == fill),
            "overwrite clears the invalidated pattern",
        );
        checks.expect("checkpoint_monotonic", spb.checkpoint_monotonic(RG), "on the survivor");

        let (link_a, link_b) = peer_link_pair();
        spb.control().attach_peer(RG, link_b)?;
        let mut spa = SimController::boot("spa-rebooted", self.workers())?;
        spa.attach(&group, Role::Passive, Some(link_a), Arc::new(LogHook))?;
        let rejoined = spa.wait_for(RG, "rejoin", |s| {
            s.lifecycle == LifecycleState::Hibernate && is_complete(s)
        })?;
        checks.expect_eq("rebooted_controller_passive", rejoined.role, Role::Passive);
        Ok(checks.finish(Scenario::ControllerCrash, vec![done, rejoined]))
    }

    fn degraded_rebuild(&self) -> Result<ScenarioReport> {
        let mut checks = Checks::default();
        let group = self.group(RaidType::Raid5, 4, 8, 4, |c| {
            c.degraded_tolerance.remove(&RaidType::Raid5);
        })?;
        let hold = Arc::new(PauseHook::for_raid_group(RG, MonitorPhase::Draining { chunk: 2 }));
        let (mut spa, data) = self.boot_filled("spa", &group, hold.clone())?;
        spa.control().start_rekey(RG)?;
        wait_until("rekey to reach chunk 2", SIM_TIMEOUT, || hold.reached())?;

        spa.disks(RG)?[0].kill();
        spa.control().send_event(RG, RgEvent::DriveFailed(0))?;
        hold.release();
        let paused = spa.wait_for(RG, "degraded pause", |s| {
            s.substate == RekeySubstate::Paused(PauseReason::Degraded)
        })?;
        std::thread::sleep(Duration::from_millis(50));
        let later = spa.status(RG)?;
        checks.expect_eq("paused_at_chunk_2", paused.checkpoint, Checkpoint::At(group.geometry.chunk_lba(2)));
        checks.expect_eq("no_advance_while_degraded", later.checkpoint, paused.checkpoint);
        checks.expect_eq("still_paused", later.substate, paused.substate);
        checks.expect_contents("degraded_reads", &spa, &group, &data)?;

        spa.disks(RG)?[0].revive();
        group.rebuild(0, spa.shared(RG)?)?;
        spa.control().send_event(RG, RgEvent::RebuildComplete(0))?;
        let done = spa.wait_for(RG, "rekey completion", is_complete)?;
        checks.expect_eq("key_rotated", current_epoch(&group)?, KeyEpoch(2));
        checks.expect_contents("data_intact", &spa, &group, &data)?;
        checks.expect("checkpoint_monotonic", spa.checkpoint_monotonic(RG), "across pause and rebuild");
        Ok(checks.finish(Scenario::DegradedRebuild, vec![done]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SimRunner {
        let mut config = default_config();
        config.engine.workers = 2;
        SimRunner::new(config, KeyEncryptionCipher::default()).unwrap()
    }

    fn assert_passed(report: &ScenarioReport) {
        let failed: Vec<&Check> = report.checks.iter().filter(|c| !c.passed).collect();
        assert!(report.passed, "{:?} failed: {failed:?}", report.scenario);
        assert!(!report.checks.is_empty());
    }

    #[test]
    fn test_rekey_configured_groups() {
        let report = runner().run(Scenario::Rekey).unwrap();
        assert_passed(&report);
        assert_eq!(report.raid_groups.len(), 4);
    }

    #[test]
    fn test_paged_block_lost() {
        assert_passed(&runner().run(Scenario::PagedBlockLost).unwrap());
    }

    #[test]
    fn test_all_paged_blocks_lost() {
        assert_passed(&runner().run(Scenario::AllPagedBlocksLost).unwrap());
    }

    #[test]
    fn test_paged_write_error() {
        let report = runner().run(Scenario::PagedWriteError).unwrap();
        assert_passed(&report);
        assert_eq!(report.raid_groups[1].lifecycle, LifecycleState::Fail);
    }

    #[test]
    fn test_double_read_fault() {
        assert_passed(&runner().run(Scenario::DoubleReadFault).unwrap());
    }

    #[test]
    fn test_controller_crash() {
        let report = runner().run(Scenario::ControllerCrash).unwrap();
        assert_passed(&report);
        assert_eq!(report.raid_groups[1].role, Role::Passive);
    }

    #[test]
    fn test_degraded_rebuild() {
        assert_passed(&runner().run(Scenario::DegradedRebuild).unwrap());
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!(
            Scenario::from_str("controller-crash", false).unwrap(),
            Scenario::ControllerCrash
        );
        assert!(Scenario::from_str("velma", false).is_err());
        assert_eq!(
            serde_json::to_string(&Scenario::AllPagedBlocksLost).unwrap(),
            "\"all-paged-blocks-lost\""
        );
    }

    #[test]
    fn test_failed_check_fails_report() {
        let mut checks = Checks::default();
        checks.expect_eq("same", 1, 1);
        checks.expect_eq("different", 1, 2);
        let report = checks.finish(Scenario::Rekey, Vec::new());
        assert!(!report.passed);
        assert_eq!(report.checks[1].detail, "expected 2, got 1");
    }

    #[test]
    fn test_runner_rejects_invalid_config() {
        let mut config = default_config();
        config.raid_groups.clear();
        assert!(SimRunner::new(config, KeyEncryptionCipher::default()).is_err());
    }
}
