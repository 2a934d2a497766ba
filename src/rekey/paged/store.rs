use std::ops::Range;
use std::time::Duration;

use log::{debug, warn};

use super::entry::{PagedBlock, PagedEntry, MAX_CHUNKS_PER_BLOCK};
use crate::block_device::{shared_buffer, wait_for_status, BlockDevice, IoChannel, IoStatus, BLOCK_SIZE};
use crate::rekey::checkpoint::ChunkRekeyState;
use crate::{rekey_error, Result};

/// Paged metadata of one raid group: one block per `chunks_per_block`
/// chunks, stored back to back from `base_lba` on the metadata device.
///
/// Only the owning monitor touches the store, so the cache never needs
/// invalidation except after a takeover, which opens a fresh store.
pub struct PagedStore {
    channel: Box<dyn IoChannel>,
    base_lba: u64,
    chunks_per_block: u64,
    chunk_count: u64,
    cache: Vec<Option<PagedBlock>>,
    io_retries: u32,
    timeout: Duration,
    next_id: usize,
}

impl PagedStore {
    pub fn new(
        device: &dyn BlockDevice,
        base_lba: u64,
        chunks_per_block: u64,
        chunk_count: u64,
        io_retries: u32,
        timeout: Duration,
    ) -> Result<Self> {
        if chunks_per_block == 0 || chunks_per_block > MAX_CHUNKS_PER_BLOCK {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "chunks_per_block {chunks_per_block} must be in 1..={MAX_CHUNKS_PER_BLOCK}"
                ),
            }));
        }
        let block_count = chunk_count.div_ceil(chunks_per_block);
        if base_lba + block_count > device.sector_count() {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "Metadata device of {} sectors cannot hold {block_count} paged blocks at lba {base_lba}",
                    device.sector_count()
                ),
            }));
        }
        Ok(PagedStore {
            channel: device.create_channel()?,
            base_lba,
            chunks_per_block,
            chunk_count,
            cache: vec![None; block_count as usize],
            io_retries,
            timeout,
            next_id: 0,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.cache.len() as u64
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn chunks_per_block(&self) -> u64 {
        self.chunks_per_block
    }

    pub fn block_of(&self, chunk: u64) -> u64 {
        chunk / self.chunks_per_block
    }

    /// Chunks of the raid group covered by `block`. The last block may
    /// carry entries past the end of the raid group.
    pub fn chunks_in(&self, block: u64) -> Range<u64> {
        let start = block * self.chunks_per_block;
        start..(start + self.chunks_per_block).min(self.chunk_count)
    }

    fn next_id(&mut self) -> usize {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    /// Issues one request and retries retryable completions.
    fn execute(&mut self, block: u64, build: impl Fn(&mut dyn IoChannel, usize)) -> Result<()> {
        for attempt in 0..=self.io_retries {
            let id = self.next_id();
            build(self.channel.as_mut(), id);
            self.channel.submit()?;
            let status = wait_for_status(self.channel.as_mut(), id, self.timeout).map_err(|e| {
                rekey_error!(PagedIoError {
                    block,
                    description: e.to_string(),
                })
            })?;
            match status {
                IoStatus::Success => return Ok(()),
                IoStatus::Retryable => {
                    warn!("Retryable error on paged block {block} (attempt {attempt})");
                }
                status => {
                    return Err(rekey_error!(PagedIoError {
                        block,
                        description: format!("request completed with {status:?}"),
                    }));
                }
            }
        }
        Err(rekey_error!(PagedIoError {
            block,
            description: format!("retries exhausted after {} attempts", self.io_retries + 1),
        }))
    }

    /// Reads `index` from the device. `Ok(None)` means the block does not
    /// verify; I/O failures are errors.
    pub fn read_block(&mut self, index: u64) -> Result<Option<PagedBlock>> {
        let buf = shared_buffer(BLOCK_SIZE, 1);
        let lba = self.base_lba + index;
        let read_buf = buf.clone();
        self.execute(index, move |channel, id| channel.add_read(lba, 1, read_buf.clone(), id))?;
        let block = PagedBlock::decode(buf.borrow().as_slice(), index, self.chunks_per_block as usize);
        if block.is_none() {
            warn!("Paged block {index} failed verification");
        }
        self.cache[index as usize] = block.clone();
        Ok(block)
    }

    /// Writes and flushes `block`.
    pub fn write_block(&mut self, block: PagedBlock) -> Result<()> {
        let index = block.index;
        let encoded = block.encode()?;
        let buf = shared_buffer(BLOCK_SIZE, 1);
        buf.borrow_mut().as_mut_slice().copy_from_slice(&encoded);
        let lba = self.base_lba + index;
        self.execute(index, move |channel, id| channel.add_write(lba, 1, buf.clone(), id))?;
        self.execute(index, |channel, id| channel.add_flush(id))?;
        debug!("Wrote paged block {index}");
        self.cache[index as usize] = Some(block);
        Ok(())
    }

    /// Cached copy of `index`, read on first use.
    pub fn block(&mut self, index: u64) -> Result<Option<PagedBlock>> {
        match &self.cache[index as usize] {
            Some(block) => Ok(Some(block.clone())),
            None => self.read_block(index),
        }
    }

    /// Writes every block with fresh entries: nothing rekeyed.
    pub fn initialize(&mut self, needs_rebuild: u16) -> Result<()> {
        for index in 0..self.block_count() {
            let entries = vec![PagedEntry::valid(needs_rebuild); self.chunks_per_block as usize];
            self.write_block(PagedBlock::new(index, entries))?;
        }
        Ok(())
    }

    pub fn entry(&mut self, chunk: u64) -> Result<Option<PagedEntry>> {
        let index = self.block_of(chunk);
        let slot = (chunk % self.chunks_per_block) as usize;
        Ok(self.block(index)?.map(|block| block.entries[slot]))
    }

    /// Rewrites the entry of `chunk` through `update`. The block must
    /// verify; a block that does not is a paged error the caller recovers
    /// from.
    fn update_entry(&mut self, chunk: u64, what: &str, update: impl FnOnce(&mut PagedEntry)) -> Result<()> {
        let index = self.block_of(chunk);
        let slot = (chunk % self.chunks_per_block) as usize;
        let Some(mut block) = self.block(index)? else {
            return Err(rekey_error!(PagedIoError {
                block: index,
                description: format!("block does not verify while recording {what} of chunk {chunk}"),
            }));
        };
        update(&mut block.entries[slot]);
        self.write_block(block)
    }

    /// Records that `chunk` is on the new key.
    pub fn set_rekeyed(&mut self, chunk: u64, needs_rebuild: u16) -> Result<()> {
        self.update_entry(chunk, "rekey", |entry| {
            entry.set_rekeyed(true);
            entry.set_needs_rebuild(needs_rebuild);
        })
    }

    /// Flags `chunk` as under incomplete-write check.
    pub fn begin_verify(&mut self, chunk: u64) -> Result<()> {
        self.update_entry(chunk, "verify start", |entry| entry.set_incomplete_write(true))
    }

    /// Clears the pending check of `chunk` and records whether it ended in
    /// invalidation.
    pub fn finish_verify(&mut self, chunk: u64, invalidated: bool) -> Result<()> {
        self.update_entry(chunk, "verify result", |entry| {
            entry.set_incomplete_write(false);
            entry.set_verify_error(invalidated);
        })
    }

    pub fn chunk_state(&mut self, chunk: u64) -> Result<ChunkRekeyState> {
        Ok(match self.entry(chunk)? {
            Some(entry) if entry.is_valid() && entry.is_rekeyed() => ChunkRekeyState::Rekeyed,
            Some(entry) if entry.is_valid() => ChunkRekeyState::NotRekeyed,
            _ => ChunkRekeyState::Ambiguous,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::{FaultErrorType, FaultOpcode, FaultRecord, FaultyBlockDevice, MemBlockDevice};
    use crate::RekeyError;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_initialize_and_mark_rekeyed() {
        let device = MemBlockDevice::new(8);
        let mut store = PagedStore::new(&device, 2, 3, 8, 2, TIMEOUT).unwrap();
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.chunks_in(2), 6..8);
        store.initialize(0).unwrap();
        store.set_rekeyed(4, 0b10).unwrap();

        let mut reopened = PagedStore::new(&device, 2, 3, 8, 2, TIMEOUT).unwrap();
        assert_eq!(reopened.chunk_state(4).unwrap(), ChunkRekeyState::Rekeyed);
        assert_eq!(reopened.chunk_state(3).unwrap(), ChunkRekeyState::NotRekeyed);
        assert_eq!(reopened.entry(4).unwrap().unwrap().needs_rebuild(), 0b10);
    }

    #[test]
    fn test_verify_flags_survive_reopen() {
        let device = MemBlockDevice::new(8);
        let mut store = PagedStore::new(&device, 2, 3, 8, 2, TIMEOUT).unwrap();
        store.initialize(0).unwrap();
        store.set_rekeyed(1, 0).unwrap();
        store.begin_verify(1).unwrap();
        store.begin_verify(2).unwrap();
        store.finish_verify(2, false).unwrap();

        let mut reopened = PagedStore::new(&device, 2, 3, 8, 2, TIMEOUT).unwrap();
        let entry = reopened.entry(1).unwrap().unwrap();
        assert!(entry.incomplete_write());
        assert!(entry.is_rekeyed());
        assert!(!reopened.entry(2).unwrap().unwrap().incomplete_write());

        reopened.finish_verify(1, true).unwrap();
        let entry = reopened.entry(1).unwrap().unwrap();
        assert!(!entry.incomplete_write());
        assert!(entry.verify_error());
        assert_eq!(reopened.chunk_state(1).unwrap(), ChunkRekeyState::Rekeyed);
    }

    #[test]
    fn test_corrupt_block_is_ambiguous() {
        let device = MemBlockDevice::new(8);
        let mut store = PagedStore::new(&device, 2, 3, 9, 2, TIMEOUT).unwrap();
        store.initialize(0).unwrap();
        device.write(3 * BLOCK_SIZE + 7, &[0xAB; 4]);

        let mut reopened = PagedStore::new(&device, 2, 3, 9, 2, TIMEOUT).unwrap();
        assert_eq!(reopened.chunk_state(3).unwrap(), ChunkRekeyState::Ambiguous);
        assert_eq!(reopened.chunk_state(6).unwrap(), ChunkRekeyState::NotRekeyed);
        assert!(matches!(
            reopened.set_rekeyed(5, 0),
            Err(RekeyError::PagedIoError { block: 1, .. })
        ));
    }

    #[test]
    fn test_retryable_write_errors_are_retried() {
        let device = FaultyBlockDevice::new(Box::new(MemBlockDevice::new(8)));
        let handle = device.inject(FaultRecord::new(FaultOpcode::Write, 2..3, FaultErrorType::Retryable, 2));
        let mut store = PagedStore::new(&device, 2, 4, 4, 2, TIMEOUT).unwrap();
        store.initialize(0).unwrap();
        assert_eq!(device.hits(handle), 2);
    }

    #[test]
    fn test_non_retryable_write_is_paged_error() {
        let device = FaultyBlockDevice::new(Box::new(MemBlockDevice::new(8)));
        device.inject(FaultRecord::always(FaultOpcode::Write, 3..4, FaultErrorType::NonRetryable));
        let mut store = PagedStore::new(&device, 2, 4, 8, 5, TIMEOUT).unwrap();
        let err = store.initialize(0).unwrap_err();
        assert!(matches!(err, RekeyError::PagedIoError { block: 1, .. }));
    }

    #[test]
    fn test_rejects_oversized_layout() {
        let device = MemBlockDevice::new(4);
        assert!(PagedStore::new(&device, 2, MAX_CHUNKS_PER_BLOCK + 1, 8, 0, TIMEOUT).is_err());
        assert!(PagedStore::new(&device, 2, 1, 8, 0, TIMEOUT).is_err());
    }
}
