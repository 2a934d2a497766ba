//! In-process model of a dual-controller array running the rekey engine.
//!
//! Both controllers see the same RAM disks, metadata device, position
//! health and key ring, the way two storage processors share a drive
//! enclosure. Each controller runs its own [`Scheduler`], talks to its own
//! view of the disks through fault-injecting wrappers and keeps its own
//! client-facing shared state. Crashing a controller shuts its scheduler
//! down without letting the monitors write anything.

mod scenario;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

pub use scenario::{default_config, Check, Scenario, ScenarioReport, SimRunner};

use crate::block_device::{BlockDevice, FaultyBlockDevice, MemBlockDevice, RaidGroupDevice, BLOCK_SIZE, SECTOR_SIZE};
use crate::config::{RaidGroupConfig, RekeyConfig};
use crate::control::{AdminControl, Scheduler};
use crate::crypt::{KeyEncryptionCipher, KeyEpoch, KeyRing, SharedKeyRing};
use crate::raid::{rebuild_position, PositionHealth, RaidGeometry, StripeIo};
use crate::rekey::nonpaged::{EncryptionMode, NonpagedRecord, NonpagedStore};
use crate::rekey::paged::{scan, PagedStore, ScanReport};
use crate::rekey::{
    metadata_sectors, Checkpoint, ChunkRekeyState, MonitorParams, NotificationService, ObservabilityHook, PeerLink,
    RekeySharedState, RekeyStatus, Role, NONPAGED_BASE_LBA, PAGED_BASE_LBA,
};
use crate::{rekey_error, Result};

/// Upper bound on any single wait of a simulation.
pub const SIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls `done` until it holds or `timeout` passes.
pub fn wait_until(what: &str, timeout: Duration, done: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return Err(rekey_error!(ChannelError {
                reason: format!("timed out after {timeout:?} waiting for {what}"),
            }));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Disks, metadata and keys of one raid group.
pub struct SimRaidGroup {
    pub raid_group: u32,
    pub geometry: RaidGeometry,
    pub chunks_per_paged_block: u64,
    pub config: RekeyConfig,
    pub health: PositionHealth,
    pub keys: SharedKeyRing,
    pub notify: NotificationService,
    disks: Vec<MemBlockDevice>,
    metadata: MemBlockDevice,
}

impl SimRaidGroup {
    pub fn new(
        raid_group: u32,
        geometry: RaidGeometry,
        chunks_per_paged_block: u64,
        config: RekeyConfig,
        keys: KeyRing,
    ) -> Result<Self> {
        config.validate()?;
        config.validate_for(&geometry)?;
        let disks = (0..geometry.width)
            .map(|_| MemBlockDevice::new(geometry.position_sectors()))
            .collect();
        let metadata = MemBlockDevice::new(metadata_sectors(geometry.chunk_count, chunks_per_paged_block));
        Ok(SimRaidGroup {
            raid_group,
            health: PositionHealth::new(geometry.width),
            geometry,
            chunks_per_paged_block,
            config,
            keys: keys.shared(),
            notify: NotificationService::new(),
            disks,
            metadata,
        })
    }

    pub fn from_config(rg: &RaidGroupConfig, engine: &RekeyConfig, kek: &KeyEncryptionCipher) -> Result<Self> {
        rg.validate()?;
        let keys = rg.keys.build_keyring(kek)?;
        Self::new(rg.id, rg.geometry()?, rg.chunks_per_paged_block, engine.clone(), keys)
    }

    pub fn monitor_params(
        &self,
        devices: Vec<Box<dyn BlockDevice>>,
        metadata: Box<dyn BlockDevice>,
        shared: RekeySharedState,
        role: Role,
        peer: Option<PeerLink>,
        hook: Arc<dyn ObservabilityHook>,
    ) -> MonitorParams {
        MonitorParams {
            raid_group: self.raid_group,
            geometry: self.geometry.clone(),
            chunks_per_paged_block: self.chunks_per_paged_block,
            config: self.config.clone(),
            devices,
            metadata,
            health: self.health.clone(),
            keys: self.keys.clone(),
            shared,
            role,
            peer,
            hook,
            notify: self.notify.clone(),
        }
    }

    /// Full-capacity data pattern, distinct per `seed`.
    pub fn pattern(&self, seed: u8) -> Vec<u8> {
        (0..self.geometry.logical_capacity() as usize * SECTOR_SIZE)
            .map(|i| ((i / SECTOR_SIZE) as u8).wrapping_mul(31) ^ (i as u8) ^ seed)
            .collect()
    }

    pub fn capacity(&self) -> u32 {
        self.geometry.logical_capacity() as u32
    }

    /// Logical sectors backed by `chunk`.
    pub fn chunk_sectors(&self, chunk: u64) -> Range<u64> {
        let per_chunk = self.geometry.logical_sectors_per_chunk();
        chunk * per_chunk..(chunk + 1) * per_chunk
    }

    /// Scribbles over paged block `index` behind the engine's back.
    pub fn corrupt_paged_block(&self, index: u64) {
        warn!("Corrupting paged block {index} of rg {}", self.raid_group);
        let offset = (PAGED_BASE_LBA + index) as usize * BLOCK_SIZE + 16;
        self.metadata.write(offset, &[0xA5; 32]);
    }

    fn paged_store(&self) -> Result<PagedStore> {
        PagedStore::new(
            &self.metadata,
            PAGED_BASE_LBA,
            self.chunks_per_paged_block,
            self.geometry.chunk_count,
            self.config.io_retries,
            self.config.io_timeout(),
        )
    }

    pub fn scan(&self) -> Result<ScanReport> {
        scan(&mut self.paged_store()?, 0..self.geometry.chunk_count)
    }

    pub fn chunk_state(&self, chunk: u64) -> Result<ChunkRekeyState> {
        self.paged_store()?.chunk_state(chunk)
    }

    pub fn persisted_record(&self) -> Result<NonpagedRecord> {
        let initial = NonpagedRecord::new(EncryptionMode::Unencrypted, KeyEpoch(0));
        let store = NonpagedStore::open(&self.metadata, NONPAGED_BASE_LBA, self.config.io_timeout(), initial)?;
        Ok(store.record().clone())
    }

    /// Rebuilds `position` onto its (replaced) disk, choosing each chunk's
    /// key from `shared`.
    pub fn rebuild(&self, position: usize, shared: &RekeySharedState) -> Result<()> {
        let devices: Vec<Box<dyn BlockDevice>> = self.disks.iter().map(BlockDevice::clone).collect();
        let mut io = StripeIo::new(&devices, self.health.clone(), &self.config)?;
        let ring = self.keys.read().map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Key ring lock poisoned: {e}"),
            })
        })?;
        rebuild_position(&mut io, &self.geometry, position, |chunk| {
            if shared.is_rekeyed(chunk) {
                ring.next()
            } else {
                ring.current()
            }
        })
    }
}

struct GroupView {
    disks: Vec<FaultyBlockDevice>,
    metadata: FaultyBlockDevice,
    shared: RekeySharedState,
    samples: Vec<Checkpoint>,
}

/// One storage controller: a scheduler plus the controller's own view of
/// the disks of every raid group it runs.
pub struct SimController {
    pub name: String,
    scheduler: Option<Scheduler>,
    control: AdminControl,
    groups: BTreeMap<u32, GroupView>,
}

impl SimController {
    pub fn boot(name: &str, workers: usize) -> Result<Self> {
        let scheduler = Scheduler::new(workers)?;
        let control = scheduler.control();
        info!("{name} booted with {workers} worker(s)");
        Ok(SimController {
            name: name.to_string(),
            scheduler: Some(scheduler),
            control,
            groups: BTreeMap::new(),
        })
    }

    /// Starts a monitor for `group` on this controller.
    pub fn attach(
        &mut self,
        group: &SimRaidGroup,
        role: Role,
        peer: Option<PeerLink>,
        hook: Arc<dyn ObservabilityHook>,
    ) -> Result<()> {
        let disks: Vec<FaultyBlockDevice> = group
            .disks
            .iter()
            .map(|disk| FaultyBlockDevice::new(BlockDevice::clone(disk)))
            .collect();
        let metadata = FaultyBlockDevice::new(BlockDevice::clone(&group.metadata));
        let shared = RekeySharedState::new(group.geometry.chunk_count, group.geometry.chunk_sectors);
        let devices = disks.iter().map(BlockDevice::clone).collect();
        self.control.add_group(group.monitor_params(
            devices,
            BlockDevice::clone(&metadata),
            shared.clone(),
            role,
            peer,
            hook,
        ))?;
        info!("{} runs rg {} as {role:?}", self.name, group.raid_group);
        self.groups.insert(
            group.raid_group,
            GroupView {
                disks,
                metadata,
                shared,
                samples: Vec::new(),
            },
        );
        Ok(())
    }

    fn view(&self, raid_group: u32) -> Result<&GroupView> {
        self.groups
            .get(&raid_group)
            .ok_or_else(|| rekey_error!(NotFound { raid_group }))
    }

    pub fn control(&self) -> &AdminControl {
        &self.control
    }

    /// This controller's fault-injecting handles on the disks of a group.
    pub fn disks(&self, raid_group: u32) -> Result<&[FaultyBlockDevice]> {
        Ok(&self.view(raid_group)?.disks)
    }

    pub fn metadata(&self, raid_group: u32) -> Result<&FaultyBlockDevice> {
        Ok(&self.view(raid_group)?.metadata)
    }

    pub fn shared(&self, raid_group: u32) -> Result<&RekeySharedState> {
        Ok(&self.view(raid_group)?.shared)
    }

    pub fn status(&mut self, raid_group: u32) -> Result<RekeyStatus> {
        let status = self.control.get_rekey_status(raid_group)?;
        if let Some(view) = self.groups.get_mut(&raid_group) {
            view.samples.push(status.checkpoint);
        }
        Ok(status)
    }

    /// Polls the status until `done` holds, recording every checkpoint seen.
    pub fn wait_for(
        &mut self,
        raid_group: u32,
        what: &str,
        done: impl Fn(&RekeyStatus) -> bool,
    ) -> Result<RekeyStatus> {
        let deadline = Instant::now() + SIM_TIMEOUT;
        loop {
            let status = self.status(raid_group)?;
            if done(&status) {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(rekey_error!(ChannelError {
                    reason: format!("{}: timed out waiting for {what}, last {status:?}", self.name),
                }));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Whether every checkpoint observed for the group moved forward.
    pub fn checkpoint_monotonic(&self, raid_group: u32) -> bool {
        self.groups.get(&raid_group).is_some_and(|view| {
            let seen: Vec<u64> = view.samples.iter().filter_map(|c| c.lba()).collect();
            seen.windows(2).all(|w| w[0] <= w[1])
        })
    }

    /// A client volume going through this controller's view of the disks.
    pub fn client(&self, group: &SimRaidGroup) -> Result<RaidGroupDevice> {
        let view = self.view(group.raid_group)?;
        RaidGroupDevice::new(
            view.disks.iter().map(BlockDevice::clone).collect(),
            group.geometry.clone(),
            group.health.clone(),
            group.keys.clone(),
            view.shared.clone(),
            group.config.clone(),
        )
    }

    /// Stops the controller dead. Requests held by injected faults die with
    /// it.
    pub fn crash(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            warn!("{} crashing", self.name);
            scheduler.shutdown();
        }
        for view in self.groups.values() {
            for disk in &view.disks {
                disk.disable_all();
            }
            view.metadata.disable_all();
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }
}

impl Drop for SimController {
    fn drop(&mut self) {
        self.crash();
    }
}
