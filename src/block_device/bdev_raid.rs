use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::time::Duration;

use log::{debug, error};

use super::*;
use crate::config::RekeyConfig;
use crate::crypt::{KeyRing, SharedKeyRing};
use crate::raid::parity;
use crate::raid::row::seal_position;
use crate::raid::{ChunkRow, KeySel, PendingWrite, PositionEpoch, Positions, PositionHealth, RaidGeometry, RowKeys, RowLayout, StripeIo};
use crate::rekey::RekeySharedState;
use crate::rekey_error;

enum QueuedRequest {
    Read {
        lba: u64,
        count: u32,
        buf: SharedBuffer,
        id: usize,
    },
    Write {
        lba: u64,
        count: u32,
        buf: SharedBuffer,
        id: usize,
    },
    Flush {
        id: usize,
    },
}

impl QueuedRequest {
    fn id(&self) -> usize {
        match self {
            QueuedRequest::Read { id, .. } | QueuedRequest::Write { id, .. } | QueuedRequest::Flush { id } => *id,
        }
    }
}

enum SectorRead {
    Data(Vec<u8>),
    Invalidated,
    Lost,
}

/// Client channel of a raid group. Requests are admitted in order; a
/// request touching a locked chunk, or any request while the raid group is
/// quiesced, waits at the head of the queue until the monitor lets it
/// through.
pub struct RaidIoChannel {
    io: StripeIo,
    geometry: RaidGeometry,
    keys: SharedKeyRing,
    shared: RekeySharedState,
    queue: VecDeque<QueuedRequest>,
    finished: Vec<(usize, IoStatus)>,
}

fn usable(epoch: PositionEpoch) -> bool {
    matches!(epoch, PositionEpoch::NewKey | PositionEpoch::Zeroed)
}

impl RaidIoChannel {
    fn chunks_of(&self, lba: u64, count: u32) -> RangeInclusive<u64> {
        let per_chunk = self.geometry.logical_sectors_per_chunk();
        let last = lba + u64::from(count.max(1)) - 1;
        (lba / per_chunk)..=(last / per_chunk)
    }

    fn chunks_for(&self, request: &QueuedRequest) -> RangeInclusive<u64> {
        match request {
            QueuedRequest::Read { lba, count, .. } | QueuedRequest::Write { lba, count, .. } => {
                self.chunks_of(*lba, *count)
            }
            // Admitted like any request, but touches no chunk.
            QueuedRequest::Flush { .. } => RangeInclusive::new(1, 0),
        }
    }

    /// Zero-length requests still address the sector at `lba`.
    fn in_range(&self, lba: u64, count: u32) -> bool {
        lba.checked_add(u64::from(count.max(1)))
            .is_some_and(|end| end <= self.geometry.logical_capacity())
    }

    fn admissible(&self, request: &QueuedRequest) -> bool {
        match request {
            QueuedRequest::Read { lba, count, .. } | QueuedRequest::Write { lba, count, .. } => {
                self.in_range(*lba, *count)
            }
            QueuedRequest::Flush { .. } => true,
        }
    }

    fn process_queue(&mut self) {
        while let Some(front) = self.queue.front() {
            if self.shared.is_failed() || !self.admissible(front) {
                let id = front.id();
                self.queue.pop_front();
                self.finished.push((id, IoStatus::NonRetryable));
                continue;
            }
            let chunks = self.chunks_for(front);
            if !self.shared.try_enter(chunks.clone()) {
                break;
            }
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            let id = request.id();
            let status = match self.execute(request) {
                Ok(status) => status,
                Err(e) => {
                    error!("Raid request {id} failed: {e}");
                    IoStatus::NonRetryable
                }
            };
            self.shared.exit(chunks);
            self.finished.push((id, status));
        }
    }

    fn execute(&mut self, request: QueuedRequest) -> Result<IoStatus> {
        match request {
            QueuedRequest::Read { lba, count, buf, .. } => {
                let mut status = IoStatus::Success;
                for i in 0..count as usize {
                    match self.read_sector(lba + i as u64)? {
                        SectorRead::Data(data) => {
                            buf.borrow_mut().as_mut_slice()[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                                .copy_from_slice(&data);
                        }
                        SectorRead::Invalidated => status = IoStatus::Invalidated,
                        SectorRead::Lost => return Ok(IoStatus::NonRetryable),
                    }
                }
                Ok(status)
            }
            QueuedRequest::Write { lba, count, buf, .. } => {
                for i in 0..count as usize {
                    let data = buf.borrow().as_slice()[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].to_vec();
                    if !self.write_sector(lba + i as u64, &data)? {
                        return Ok(IoStatus::NonRetryable);
                    }
                }
                Ok(IoStatus::Success)
            }
            QueuedRequest::Flush { .. } => {
                self.io.flush()?;
                Ok(IoStatus::Success)
            }
        }
    }

    /// Key `chunk` is stored under right now.
    fn key_for<'a>(&self, ring: &'a KeyRing, chunk: u64) -> Result<KeySel<'a>> {
        if !self.shared.is_rekeyed(chunk) {
            return Ok(ring.current());
        }
        match ring.next() {
            Some(next) => Ok(Some(next)),
            None => Err(rekey_error!(CryptoError {
                description: format!("chunk {chunk} is rekeyed but no new key is loaded"),
            })),
        }
    }

    fn read_sector(&mut self, logical: u64) -> Result<SectorRead> {
        let (chunk, column, offset) = self.geometry.locate(logical);
        let ring = self.keys.read().map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Key ring lock poisoned: {e}"),
            })
        })?;
        let key = self.key_for(&ring, chunk)?;
        let row = ChunkRow::read_range(&mut self.io, &self.geometry, chunk, offset, 1, RowKeys::single(key))?;
        let targets = self.geometry.column_positions(chunk, column);

        if let Some(data) = targets
            .iter()
            .find(|p| usable(row.epoch(**p)))
            .and_then(|p| row.positions[*p].plaintext.clone())
        {
            return Ok(SectorRead::Data(data));
        }
        let layout = self.geometry.layout(chunk);
        let invalidated = row.positions_where(|e| e == PositionEpoch::Invalidated);
        // Redundancy still carrying the pattern does not describe the target.
        if targets
            .iter()
            .chain(Self::redundancy(&layout, &targets).iter())
            .any(|p| invalidated.contains(p))
        {
            return Ok(SectorRead::Invalidated);
        }
        // Invalidated siblings count as zero, as they do for writes.
        let missing = row.positions_where(|e| !usable(e) && e != PositionEpoch::Invalidated);
        let mut cols: parity::Columns = row
            .positions
            .iter()
            .map(|p| match p.epoch {
                PositionEpoch::Invalidated => Some(vec![0u8; SECTOR_SIZE]),
                _ if usable(p.epoch) => p.plaintext.clone(),
                _ => None,
            })
            .collect();
        if !parity::reconstruct(&layout, &mut cols, &missing) {
            debug!("Sector {logical} lost: positions {missing:?} unusable");
            return Ok(SectorRead::Lost);
        }
        Ok(cols[targets[0]].take().map_or(SectorRead::Lost, SectorRead::Data))
    }

    /// Read-modify-write of one sector row. Invalidated positions count as
    /// zero for redundancy and keep their pattern unless they are the target.
    fn write_sector(&mut self, logical: u64, data: &[u8]) -> Result<bool> {
        let (chunk, column, offset) = self.geometry.locate(logical);
        let ring = self.keys.read().map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Key ring lock poisoned: {e}"),
            })
        })?;
        let key = self.key_for(&ring, chunk)?;
        let row = ChunkRow::read_range(&mut self.io, &self.geometry, chunk, offset, 1, RowKeys::single(key))?;
        let layout = self.geometry.layout(chunk);
        let targets = self.geometry.column_positions(chunk, column);

        let mut cols: parity::Columns = row
            .positions
            .iter()
            .map(|p| match p.epoch {
                PositionEpoch::Invalidated => Some(vec![0u8; SECTOR_SIZE]),
                _ if usable(p.epoch) => p.plaintext.clone(),
                _ => None,
            })
            .collect();
        let unknown: Positions = (0..self.geometry.width).filter(|p| cols[*p].is_none()).collect();
        // Redundancy over the whole row needs every other column known.
        let others: Positions = unknown.iter().copied().filter(|p| !targets.contains(p)).collect();
        let row_wide = !matches!(layout, RowLayout::Striped { .. } | RowLayout::Mirrored { .. });
        if row_wide && !others.is_empty() && !parity::reconstruct(&layout, &mut cols, &others) {
            debug!("Sector {logical} not writable: positions {unknown:?} unusable");
            return Ok(false);
        }
        for target in targets.iter() {
            cols[*target] = Some(data.to_vec());
        }
        parity::fill_redundancy(&layout, &mut cols);

        let mut rewrite: Positions = targets.clone();
        rewrite.extend(Self::redundancy(&layout, &targets));
        rewrite.extend(unknown.iter().copied());
        rewrite.sort_unstable();
        rewrite.dedup();
        let writes = rewrite
            .iter()
            .filter_map(|p| {
                cols[*p].as_ref().map(|plain| PendingWrite {
                    position: *p,
                    lba: row.first_lba,
                    buf: seal_position(plain, row.first_lba, key),
                })
            })
            .collect();
        drop(ring);
        let mut batch = self.io.start_writes(writes)?;
        self.io.wait_writes(&mut batch)?;
        Ok(self.io.health().degraded_count() <= self.geometry.fault_tolerance())
    }

    /// Positions whose content depends on the target column.
    fn redundancy(layout: &RowLayout, targets: &[usize]) -> Positions {
        match layout {
            RowLayout::Striped { .. } | RowLayout::Mirrored { .. } => Positions::new(),
            RowLayout::StripedMirror { pairs } => pairs
                .iter()
                .filter(|pair| targets.contains(&pair[0]) || targets.contains(&pair[1]))
                .flat_map(|pair| pair.iter().copied())
                .collect(),
            RowLayout::Parity { p, .. } => Positions::from_slice(&[*p]),
            RowLayout::DualParity { p, q, .. } => Positions::from_slice(&[*p, *q]),
        }
    }
}

impl IoChannel for RaidIoChannel {
    fn add_read(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        self.queue.push_back(QueuedRequest::Read {
            lba: sector_offset,
            count: sector_count,
            buf,
            id,
        });
    }

    fn add_write(&mut self, sector_offset: u64, sector_count: u32, buf: SharedBuffer, id: usize) {
        self.queue.push_back(QueuedRequest::Write {
            lba: sector_offset,
            count: sector_count,
            buf,
            id,
        });
    }

    fn add_flush(&mut self, id: usize) {
        self.queue.push_back(QueuedRequest::Flush { id });
    }

    fn submit(&mut self) -> Result<()> {
        self.process_queue();
        Ok(())
    }

    fn poll(&mut self) -> Vec<(usize, IoStatus)> {
        self.process_queue();
        std::mem::take(&mut self.finished)
    }

    fn busy(&self) -> bool {
        !self.queue.is_empty()
    }
}

/// The logical volume of one raid group as a client sees it: 512-byte
/// sectors striped over the positions, each chunk read and written under
/// whichever key the rekey checkpoint says it is on.
pub struct RaidGroupDevice {
    devices: Vec<Box<dyn BlockDevice>>,
    geometry: RaidGeometry,
    health: PositionHealth,
    keys: SharedKeyRing,
    shared: RekeySharedState,
    config: RekeyConfig,
}

impl RaidGroupDevice {
    pub fn new(
        devices: Vec<Box<dyn BlockDevice>>,
        geometry: RaidGeometry,
        health: PositionHealth,
        keys: SharedKeyRing,
        shared: RekeySharedState,
        config: RekeyConfig,
    ) -> Result<Self> {
        if devices.len() != geometry.width {
            return Err(rekey_error!(InvalidParameter {
                description: format!("{} devices for a raid group of width {}", devices.len(), geometry.width),
            }));
        }
        if let Some(small) = devices.iter().position(|d| d.sector_count() < geometry.position_sectors()) {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "position {small} holds {} sectors, {} needed",
                    devices[small].sector_count(),
                    geometry.position_sectors()
                ),
            }));
        }
        Ok(RaidGroupDevice {
            devices,
            geometry,
            health,
            keys,
            shared,
            config,
        })
    }

    pub fn shared(&self) -> &RekeySharedState {
        &self.shared
    }

    fn finish(&self, channel: &mut dyn IoChannel, lba: u64, timeout: Duration) -> Result<()> {
        match wait_for_status(channel, 0, timeout)? {
            IoStatus::Success => Ok(()),
            IoStatus::Invalidated => Err(rekey_error!(DataInvalidated {
                chunk: self.geometry.locate(lba).0,
            })),
            status => Err(rekey_error!(IoError {
                source: std::io::Error::other(format!("raid request at sector {lba} failed ({status:?})")),
            })),
        }
    }

    /// Blocking read of `count` logical sectors.
    pub fn read_sectors(&self, lba: u64, count: u32, timeout: Duration) -> Result<Vec<u8>> {
        let mut channel = self.create_channel()?;
        let buf = shared_buffer(SECTOR_SIZE, count as usize);
        channel.add_read(lba, count, buf.clone(), 0);
        channel.submit()?;
        self.finish(channel.as_mut(), lba, timeout)?;
        let data = buf.borrow().as_slice().to_vec();
        Ok(data)
    }

    /// Blocking write of whole logical sectors.
    pub fn write_sectors(&self, lba: u64, data: &[u8], timeout: Duration) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(rekey_error!(InvalidParameter {
                description: format!("write of {} bytes is not sector aligned", data.len()),
            }));
        }
        let count = data.len() / SECTOR_SIZE;
        let mut channel = self.create_channel()?;
        let buf = shared_buffer(SECTOR_SIZE, count);
        buf.borrow_mut().as_mut_slice().copy_from_slice(data);
        channel.add_write(lba, count as u32, buf, 0);
        channel.submit()?;
        self.finish(channel.as_mut(), lba, timeout)
    }
}

impl BlockDevice for RaidGroupDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(RaidIoChannel {
            io: StripeIo::new(&self.devices, self.health.clone(), &self.config)?,
            geometry: self.geometry.clone(),
            keys: self.keys.clone(),
            shared: self.shared.clone(),
            queue: VecDeque::new(),
            finished: Vec::new(),
        }))
    }

    fn sector_count(&self) -> u64 {
        self.geometry.logical_capacity()
    }

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(RaidGroupDevice {
            devices: self.devices.clone(),
            geometry: self.geometry.clone(),
            health: self.health.clone(),
            keys: self.keys.clone(),
            shared: self.shared.clone(),
            config: self.config.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::{KeyEpoch, KeyRing, XtsBlockCipher};
    use crate::raid::row::invalidated_position;
    use crate::raid::RaidType;
    use crate::RekeyError;

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Rig {
        mems: Vec<MemBlockDevice>,
        device: RaidGroupDevice,
        geometry: RaidGeometry,
        health: PositionHealth,
    }

    fn rig(raid_type: RaidType, width: usize) -> Rig {
        let geometry = RaidGeometry::new(raid_type, width, 4, 6).unwrap();
        let mems: Vec<MemBlockDevice> = (0..width)
            .map(|_| MemBlockDevice::new(geometry.position_sectors()))
            .collect();
        let devices = mems.iter().map(|m| BlockDevice::clone(m)).collect();
        let health = PositionHealth::new(width);
        let keys = KeyRing::with_key(KeyEpoch(1), XtsBlockCipher::new([5u8; 32], [6u8; 32]).unwrap()).shared();
        let shared = RekeySharedState::new(geometry.chunk_count, geometry.chunk_sectors);
        shared.set_quiesced(false);
        let device = RaidGroupDevice::new(
            devices,
            geometry.clone(),
            health.clone(),
            keys,
            shared,
            RekeyConfig::default(),
        )
        .unwrap();
        Rig {
            mems,
            device,
            geometry,
            health,
        }
    }

    fn pattern(sectors: usize, seed: u8) -> Vec<u8> {
        (0..sectors * SECTOR_SIZE)
            .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
            .collect()
    }

    #[test]
    fn test_write_then_read_across_chunks() {
        for (raid_type, width) in [
            (RaidType::Raid0, 3),
            (RaidType::Raid1, 2),
            (RaidType::Raid10, 4),
            (RaidType::Raid5, 5),
            (RaidType::Raid6, 6),
        ] {
            let rig = rig(raid_type, width);
            let lba = rig.geometry.logical_sectors_per_chunk() - 2;
            let data = pattern(5, 9);
            rig.device.write_sectors(lba, &data, TIMEOUT).unwrap();
            assert_eq!(rig.device.read_sectors(lba, 5, TIMEOUT).unwrap(), data, "{raid_type}");
        }
    }

    #[test]
    fn test_unwritten_sectors_read_as_zero() {
        let rig = rig(RaidType::Raid5, 4);
        assert_eq!(rig.device.read_sectors(7, 2, TIMEOUT).unwrap(), vec![0u8; 2 * SECTOR_SIZE]);
    }

    #[test]
    fn test_degraded_read_reconstructs() {
        let rig = rig(RaidType::Raid5, 5);
        let data = pattern(rig.geometry.logical_sectors_per_chunk() as usize, 3);
        rig.device.write_sectors(0, &data, TIMEOUT).unwrap();
        rig.health.mark_failed(2);
        assert_eq!(rig.device.read_sectors(0, data.len() as u32 / 512, TIMEOUT).unwrap(), data);

        let update = pattern(1, 77);
        rig.device.write_sectors(9, &update, TIMEOUT).unwrap();
        assert_eq!(rig.device.read_sectors(9, 1, TIMEOUT).unwrap(), update);
    }

    #[test]
    fn test_quiesce_holds_requests_in_order() {
        let rig = rig(RaidType::Raid1, 2);
        rig.device.shared().set_quiesced(true);
        let mut channel = rig.device.create_channel().unwrap();
        let write = shared_buffer(SECTOR_SIZE, 1);
        write.borrow_mut().as_mut_slice().fill(0xab);
        let read = shared_buffer(SECTOR_SIZE, 1);
        channel.add_write(3, 1, write, 1);
        channel.add_read(3, 1, read.clone(), 2);
        channel.submit().unwrap();
        assert!(channel.poll().is_empty());
        assert!(channel.busy());

        rig.device.shared().set_quiesced(false);
        assert_eq!(channel.poll(), vec![(1, IoStatus::Success), (2, IoStatus::Success)]);
        assert!(read.borrow().as_slice().iter().all(|b| *b == 0xab));
        assert_eq!(rig.device.shared().inflight(), 0);
    }

    #[test]
    fn test_locked_chunk_blocks_only_its_requests() {
        let rig = rig(RaidType::Raid0, 2);
        let per_chunk = rig.geometry.logical_sectors_per_chunk();
        rig.device.shared().lock_chunk(1);
        let mut channel = rig.device.create_channel().unwrap();
        channel.add_read(0, 1, shared_buffer(SECTOR_SIZE, 1), 1);
        channel.add_read(per_chunk, 1, shared_buffer(SECTOR_SIZE, 1), 2);
        channel.submit().unwrap();
        assert_eq!(channel.poll(), vec![(1, IoStatus::Success)]);
        rig.device.shared().unlock_chunk(1);
        assert_eq!(channel.poll(), vec![(2, IoStatus::Success)]);
    }

    #[test]
    fn test_invalidated_chunk_reports_invalidated() {
        let rig = rig(RaidType::Raid5, 3);
        rig.device.write_sectors(0, &pattern(16, 1), TIMEOUT).unwrap();
        let chunk = 2;
        let lba = rig.geometry.chunk_lba(chunk);
        let blocks = invalidated_position(rig.geometry.chunk_sectors);
        for mem in &rig.mems {
            mem.write(lba as usize * BLOCK_SIZE, blocks.borrow().as_slice());
        }
        let first = chunk * rig.geometry.logical_sectors_per_chunk();
        assert!(matches!(
            rig.device.read_sectors(first, 1, TIMEOUT),
            Err(RekeyError::DataInvalidated { chunk: 2, .. })
        ));
        assert!(rig.device.read_sectors(0, 1, TIMEOUT).is_ok());

        // Overwriting a sector makes it readable again.
        let data = pattern(1, 4);
        rig.device.write_sectors(first, &data, TIMEOUT).unwrap();
        assert_eq!(rig.device.read_sectors(first, 1, TIMEOUT).unwrap(), data);
    }

    #[test]
    fn test_out_of_range_requests_fail_cleanly() {
        let rig = rig(RaidType::Raid5, 3);
        let capacity = rig.geometry.logical_capacity();
        assert!(rig.device.read_sectors(capacity, 1, TIMEOUT).is_err());
        assert!(rig.device.read_sectors(capacity - 1, 2, TIMEOUT).is_err());
        assert!(rig.device.write_sectors(u64::MAX - 1, &pattern(4, 2), TIMEOUT).is_err());

        let mut channel = rig.device.create_channel().unwrap();
        channel.add_read(capacity, 0, shared_buffer(SECTOR_SIZE, 1), 1);
        channel.add_read(capacity - 1, 1, shared_buffer(SECTOR_SIZE, 1), 2);
        channel.submit().unwrap();
        assert_eq!(channel.poll(), vec![(1, IoStatus::NonRetryable), (2, IoStatus::Success)]);
        assert_eq!(rig.device.shared().inflight(), 0);
    }

    #[test]
    fn test_degraded_read_beside_invalidated_column() {
        let rig = rig(RaidType::Raid5, 3);
        let chunk = 2;
        let lba = rig.geometry.chunk_lba(chunk);
        let blocks = invalidated_position(rig.geometry.chunk_sectors);
        for mem in &rig.mems {
            mem.write(lba as usize * BLOCK_SIZE, blocks.borrow().as_slice());
        }
        let first = chunk * rig.geometry.logical_sectors_per_chunk();
        let data = pattern(1, 8);
        rig.device.write_sectors(first, &data, TIMEOUT).unwrap();

        let (_, column, _) = rig.geometry.locate(first);
        rig.health.mark_failed(rig.geometry.column_positions(chunk, column)[0]);
        assert_eq!(rig.device.read_sectors(first, 1, TIMEOUT).unwrap(), data);

        let sibling = (first..first + rig.geometry.logical_sectors_per_chunk())
            .find(|s| rig.geometry.locate(*s).1 != column)
            .unwrap();
        assert!(matches!(
            rig.device.read_sectors(sibling, 1, TIMEOUT),
            Err(RekeyError::DataInvalidated { chunk: 2, .. })
        ));
    }

    #[test]
    fn test_failed_raid_group_rejects_requests() {
        let rig = rig(RaidType::Raid1, 2);
        rig.device.shared().set_failed();
        assert!(rig.device.read_sectors(0, 1, TIMEOUT).is_err());
    }
}
