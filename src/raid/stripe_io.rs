use std::time::{Duration, Instant};

use log::{debug, warn};

use super::geometry::Positions;
use super::health::PositionHealth;
use crate::block_device::{shared_buffer, wait_for_status, BlockDevice, IoChannel, IoStatus, SharedBuffer, BLOCK_SIZE};
use crate::config::RekeyConfig;
use crate::{rekey_error, Result};

#[derive(Debug)]
pub enum ReadOutcome {
    Data(SharedBuffer),
    /// The position is degraded and was not asked.
    Missing,
    /// The position was asked and could not deliver.
    Unreadable,
}

pub struct PendingWrite {
    pub position: usize,
    pub lba: u64,
    pub buf: SharedBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    InFlight,
    Done,
    Failed,
    /// Position was degraded when the batch started.
    Skipped,
}

struct BatchEntry {
    write: PendingWrite,
    id: usize,
    attempts: u32,
    state: WriteState,
}

/// Writes of one chunk row submitted together and polled without blocking.
pub struct WriteBatch {
    entries: Vec<BatchEntry>,
    started: Instant,
}

impl WriteBatch {
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|e| e.state != WriteState::InFlight)
    }

    pub fn outstanding(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == WriteState::InFlight)
            .count()
    }

    pub fn written_positions(&self) -> Positions {
        self.positions_in(WriteState::Done)
    }

    pub fn failed_positions(&self) -> Positions {
        self.positions_in(WriteState::Failed)
    }

    fn positions_in(&self, state: WriteState) -> Positions {
        let mut positions: Positions = self
            .entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.write.position)
            .collect();
        positions.dedup();
        positions
    }
}

/// One I/O channel per stripe position plus the retry and fault policy the
/// engine applies to them.
///
/// Retryable completions are reissued up to `io_retries` times. A
/// non-retryable completion, exhausted retries, or a write that outlives
/// `io_timeout` marks the position failed.
pub struct StripeIo {
    channels: Vec<Box<dyn IoChannel>>,
    health: PositionHealth,
    io_retries: u32,
    io_timeout: Duration,
    next_id: usize,
}

impl StripeIo {
    pub fn new(devices: &[Box<dyn BlockDevice>], health: PositionHealth, config: &RekeyConfig) -> Result<Self> {
        if devices.len() != health.width() {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "{} devices given for a raid group of width {}",
                    devices.len(),
                    health.width()
                ),
            }));
        }
        let channels = devices
            .iter()
            .map(|d| d.create_channel())
            .collect::<Result<Vec<_>>>()?;
        Ok(StripeIo {
            channels,
            health,
            io_retries: config.io_retries,
            io_timeout: config.io_timeout(),
            next_id: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.channels.len()
    }

    pub fn health(&self) -> &PositionHealth {
        &self.health
    }

    fn next_id(&mut self) -> usize {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Reads `count` blocks of one position, blocking for at most
    /// `io_timeout` per attempt.
    pub fn read(&mut self, position: usize, lba: u64, count: u32) -> Result<ReadOutcome> {
        if !self.health.is_readable(position) {
            return Ok(ReadOutcome::Missing);
        }
        let buf = shared_buffer(BLOCK_SIZE, count as usize);
        for attempt in 0..=self.io_retries {
            let id = self.next_id();
            let channel = self.channels[position].as_mut();
            channel.add_read(lba, count, buf.clone(), id);
            channel.submit()?;
            match wait_for_status(channel, id, self.io_timeout) {
                Ok(IoStatus::Success) => return Ok(ReadOutcome::Data(buf)),
                Ok(IoStatus::Retryable) => {
                    warn!("Retryable read error on position {position} lba {lba} (attempt {attempt})");
                }
                Ok(status) => {
                    warn!("Read of position {position} lba {lba} failed with {status:?}");
                    self.health.mark_failed(position);
                    return Ok(ReadOutcome::Unreadable);
                }
                Err(e) => {
                    warn!("Read of position {position} lba {lba} timed out: {e}");
                    return Ok(ReadOutcome::Unreadable);
                }
            }
        }
        self.health.mark_failed(position);
        Ok(ReadOutcome::Unreadable)
    }

    /// Blocking write of one position. Returns `false` when the position is
    /// or became failed.
    pub fn write(&mut self, position: usize, lba: u64, buf: SharedBuffer) -> Result<bool> {
        let mut batch = self.start_writes(vec![PendingWrite { position, lba, buf }])?;
        self.wait_writes(&mut batch)?;
        Ok(batch.written_positions().contains(&position))
    }

    pub fn start_writes(&mut self, writes: Vec<PendingWrite>) -> Result<WriteBatch> {
        let mut entries = Vec::with_capacity(writes.len());
        for write in writes {
            let mut entry = BatchEntry {
                write,
                id: 0,
                attempts: 0,
                state: WriteState::InFlight,
            };
            if self.health.is_writable(entry.write.position) {
                self.issue(&mut entry);
            } else {
                entry.state = WriteState::Skipped;
            }
            entries.push(entry);
        }
        for channel in self.channels.iter_mut() {
            channel.submit()?;
        }
        Ok(WriteBatch {
            entries,
            started: Instant::now(),
        })
    }

    fn issue(&mut self, entry: &mut BatchEntry) {
        entry.id = self.next_id();
        let count = entry.write.buf.borrow().block_count() as u32;
        self.channels[entry.write.position].add_write(entry.write.lba, count, entry.write.buf.clone(), entry.id);
    }

    /// Collects completions for `batch` without blocking.
    pub fn poll_writes(&mut self, batch: &mut WriteBatch) -> Result<()> {
        for position in 0..self.channels.len() {
            if !batch
                .entries
                .iter()
                .any(|e| e.write.position == position && e.state == WriteState::InFlight)
            {
                continue;
            }
            let completions = self.channels[position].poll();
            for (id, status) in completions {
                let Some(index) = batch
                    .entries
                    .iter()
                    .position(|e| e.id == id && e.write.position == position && e.state == WriteState::InFlight)
                else {
                    debug!("Ignoring stale completion {id} on position {position}");
                    continue;
                };
                match status {
                    IoStatus::Success => batch.entries[index].state = WriteState::Done,
                    IoStatus::Retryable if batch.entries[index].attempts < self.io_retries => {
                        let entry = &mut batch.entries[index];
                        entry.attempts += 1;
                        warn!(
                            "Retryable write error on position {position} lba {} (attempt {})",
                            entry.write.lba, entry.attempts
                        );
                        self.issue(entry);
                        self.channels[position].submit()?;
                    }
                    status => {
                        warn!(
                            "Write of position {position} lba {} failed with {status:?}",
                            batch.entries[index].write.lba
                        );
                        batch.entries[index].state = WriteState::Failed;
                        self.health.mark_failed(position);
                    }
                }
            }
        }

        if !batch.is_complete() && batch.started.elapsed() >= self.io_timeout {
            for entry in batch.entries.iter_mut().filter(|e| e.state == WriteState::InFlight) {
                warn!(
                    "Write of position {} lba {} timed out",
                    entry.write.position, entry.write.lba
                );
                entry.state = WriteState::Failed;
                self.health.mark_failed(entry.write.position);
            }
        }
        Ok(())
    }

    /// Polls `batch` until every write finished or timed out.
    pub fn wait_writes(&mut self, batch: &mut WriteBatch) -> Result<()> {
        loop {
            self.poll_writes(batch)?;
            if batch.is_complete() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for position in 0..self.channels.len() {
            if !self.health.is_writable(position) {
                continue;
            }
            let id = self.next_id();
            let channel = self.channels[position].as_mut();
            channel.add_flush(id);
            channel.submit()?;
            match wait_for_status(channel, id, self.io_timeout) {
                Ok(IoStatus::Success) => {}
                Ok(status) => {
                    warn!("Flush of position {position} failed with {status:?}");
                    self.health.mark_failed(position);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::{FaultErrorType, FaultOpcode, FaultRecord, FaultyBlockDevice, MemBlockDevice};

    fn config(timeout_ms: u64) -> RekeyConfig {
        RekeyConfig {
            io_retries: 2,
            io_timeout_ms: timeout_ms,
            ..Default::default()
        }
    }

    fn faulty_devices(width: usize) -> (Vec<FaultyBlockDevice>, Vec<Box<dyn BlockDevice>>) {
        let faulty: Vec<FaultyBlockDevice> = (0..width)
            .map(|_| FaultyBlockDevice::new(Box::new(MemBlockDevice::new(16))))
            .collect();
        let devices = faulty.iter().map(|d| BlockDevice::clone(d)).collect();
        (faulty, devices)
    }

    fn filled(fill: u8) -> SharedBuffer {
        let buf = shared_buffer(BLOCK_SIZE, 1);
        buf.borrow_mut().as_mut_slice().fill(fill);
        buf
    }

    #[test]
    fn test_retryable_read_is_retried() {
        let (faulty, devices) = faulty_devices(2);
        let handle = faulty[1].inject(FaultRecord::new(FaultOpcode::Read, 0..1, FaultErrorType::Retryable, 2));
        let health = PositionHealth::new(2);
        let mut io = StripeIo::new(&devices, health.clone(), &config(1000)).unwrap();
        assert!(io.write(1, 0, filled(9)).unwrap());
        let ReadOutcome::Data(buf) = io.read(1, 0, 1).unwrap() else {
            panic!("expected data");
        };
        assert!(buf.borrow().as_slice().iter().all(|b| *b == 9));
        assert_eq!(faulty[1].hits(handle), 2);
        assert_eq!(health.degraded_count(), 0);
    }

    #[test]
    fn test_non_retryable_read_fails_position() {
        let (faulty, devices) = faulty_devices(3);
        faulty[2].inject(FaultRecord::always(FaultOpcode::Read, 0..16, FaultErrorType::NonRetryable));
        let health = PositionHealth::new(3);
        let mut io = StripeIo::new(&devices, health.clone(), &config(1000)).unwrap();
        assert!(matches!(io.read(2, 4, 1).unwrap(), ReadOutcome::Unreadable));
        assert_eq!(health.degraded().as_slice(), &[2]);
        assert!(matches!(io.read(2, 4, 1).unwrap(), ReadOutcome::Missing));
    }

    #[test]
    fn test_batch_skips_degraded_and_times_out_dropped_writes() {
        let (faulty, devices) = faulty_devices(3);
        faulty[1].inject(FaultRecord::always(FaultOpcode::Write, 0..16, FaultErrorType::Dropped));
        let health = PositionHealth::new(3);
        health.mark_failed(2);
        let mut io = StripeIo::new(&devices, health.clone(), &config(20)).unwrap();
        let writes = (0..3)
            .map(|position| PendingWrite {
                position,
                lba: 3,
                buf: filled(position as u8 + 1),
            })
            .collect();
        let mut batch = io.start_writes(writes).unwrap();
        io.poll_writes(&mut batch).unwrap();
        assert_eq!(batch.written_positions().as_slice(), &[0]);
        assert_eq!(batch.outstanding(), 1);

        io.wait_writes(&mut batch).unwrap();
        assert_eq!(batch.failed_positions().as_slice(), &[1]);
        assert_eq!(health.degraded().as_slice(), &[1, 2]);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let (_faulty, devices) = faulty_devices(2);
        assert!(StripeIo::new(&devices, PositionHealth::new(3), &config(10)).is_err());
    }
}
