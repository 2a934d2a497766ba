use std::time::Duration;

use log::{info, warn};
use rgrekey_macros::error_context;
use serde::{Deserialize, Serialize};

use super::checkpoint::Checkpoint;
use crate::block_device::{shared_buffer, wait_for_completion, BlockDevice, IoChannel, BLOCK_SIZE};
use crate::crypt::KeyEpoch;
use crate::{rekey_error, Result};

pub const NONPAGED_MAGIC: u32 = 0x524B_4E50;
pub const NONPAGED_SLOTS: u64 = 2;

const CRC_OFFSET: usize = BLOCK_SIZE - 4;
const WRITE_ID: usize = 0;
const FLUSH_ID: usize = 1;
const READ_ID: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    Unencrypted,
    Encrypted,
    /// First encryption of a clear raid group.
    Encrypting,
    Rekeying,
}

impl EncryptionMode {
    pub fn in_transition(self) -> bool {
        matches!(self, EncryptionMode::Encrypting | EncryptionMode::Rekeying)
    }
}

/// Durable per-raid-group state that does not scale with capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonpagedRecord {
    pub magic: u32,
    pub generation: u64,
    pub mode: EncryptionMode,
    pub rekey_checkpoint: Checkpoint,
    /// Chunks below this LBA passed an incomplete-write check since the
    /// last takeover.
    pub iw_verify_checkpoint: Checkpoint,
    pub current_epoch: KeyEpoch,
    pub next_epoch: Option<KeyEpoch>,
    pub paged_reconstruct_required: bool,
}

impl NonpagedRecord {
    pub fn new(mode: EncryptionMode, current_epoch: KeyEpoch) -> Self {
        NonpagedRecord {
            magic: NONPAGED_MAGIC,
            generation: 0,
            mode,
            rekey_checkpoint: Checkpoint::Invalid,
            iw_verify_checkpoint: Checkpoint::Invalid,
            current_epoch,
            next_epoch: None,
            paged_reconstruct_required: false,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if body.len() > CRC_OFFSET {
            return Err(rekey_error!(MetadataError {
                description: format!("Nonpaged record of {} bytes does not fit a block", body.len()),
            }));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..body.len()].copy_from_slice(&body);
        let crc = crc32c::crc32c(&block[..CRC_OFFSET]);
        block[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        Ok(block)
    }

    fn decode(block: &[u8]) -> Option<Self> {
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&block[CRC_OFFSET..BLOCK_SIZE]);
        if crc32c::crc32c(&block[..CRC_OFFSET]) != u32::from_le_bytes(crc) {
            return None;
        }
        let record: NonpagedRecord = bincode::deserialize(&block[..CRC_OFFSET]).ok()?;
        (record.magic == NONPAGED_MAGIC).then_some(record)
    }
}

/// Two alternating slots on the metadata device. A torn write can only
/// damage the slot being written, so the other still holds the previous
/// generation.
pub struct NonpagedStore {
    channel: Box<dyn IoChannel>,
    base_lba: u64,
    record: NonpagedRecord,
    timeout: Duration,
}

impl NonpagedStore {
    /// Loads the newest valid slot, or starts from `initial` when neither
    /// slot holds a record yet.
    #[error_context("Failed to load nonpaged metadata")]
    pub fn open(
        device: &dyn BlockDevice,
        base_lba: u64,
        timeout: Duration,
        initial: NonpagedRecord,
    ) -> Result<Self> {
        let mut channel = device.create_channel()?;
        let buf = shared_buffer(BLOCK_SIZE, NONPAGED_SLOTS as usize);
        channel.add_read(base_lba, NONPAGED_SLOTS as u32, buf.clone(), READ_ID);
        channel.submit()?;
        wait_for_completion(channel.as_mut(), READ_ID, timeout)?;

        let newest = {
            let buf = buf.borrow();
            (0..NONPAGED_SLOTS as usize)
                .filter_map(|slot| NonpagedRecord::decode(buf.block(slot)))
                .max_by_key(|record| record.generation)
        };
        let record = match newest {
            Some(record) => {
                info!(
                    "Loaded nonpaged record generation {} ({:?}, checkpoint {})",
                    record.generation, record.mode, record.rekey_checkpoint
                );
                record
            }
            None => {
                warn!("No valid nonpaged record found, starting fresh");
                initial
            }
        };
        Ok(NonpagedStore {
            channel,
            base_lba,
            record,
            timeout,
        })
    }

    pub fn record(&self) -> &NonpagedRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut NonpagedRecord {
        &mut self.record
    }

    /// Writes the record as the next generation and flushes it.
    #[error_context("Failed to write nonpaged metadata")]
    pub fn write(&mut self) -> Result<()> {
        let mut record = self.record.clone();
        record.generation += 1;
        let slot = record.generation % NONPAGED_SLOTS;
        let encoded = record.encode()?;
        let buf = shared_buffer(BLOCK_SIZE, 1);
        buf.borrow_mut().as_mut_slice().copy_from_slice(&encoded);

        self.channel.add_write(self.base_lba + slot, 1, buf, WRITE_ID);
        self.channel.submit()?;
        wait_for_completion(self.channel.as_mut(), WRITE_ID, self.timeout)?;
        self.channel.add_flush(FLUSH_ID);
        self.channel.submit()?;
        wait_for_completion(self.channel.as_mut(), FLUSH_ID, self.timeout)?;

        self.record = record;
        Ok(())
    }
}
