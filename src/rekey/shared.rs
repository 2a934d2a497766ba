use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::checkpoint::{Checkpoint, Region};

const CHECKPOINT_INVALID: u64 = u64::MAX;

/// State shared between a raid group's monitor and its client channels.
///
/// All fields are atomic and wrapped in `Arc` so that cloning is cheap and
/// sharing across threads is safe. The monitor is the only writer of the
/// checkpoint, the quiesce flag and the chunk locks; client channels only
/// move the in-flight counters.
#[derive(Debug, Clone)]
pub struct RekeySharedState {
    /// Per-position LBA below which chunks are on the new key.
    checkpoint: Arc<AtomicU64>,
    chunk_sectors: u64,

    /// Set while quiesced: channels hold new requests.
    quiesced: Arc<AtomicBool>,

    /// The raid group failed; channels complete everything with an error.
    failed: Arc<AtomicBool>,

    /// Admitted client requests not yet completed.
    inflight: Arc<AtomicUsize>,

    /// Per-chunk lock held by the monitor while it rewrites the chunk.
    chunk_locks: Arc<Vec<AtomicBool>>,

    /// Admitted client requests per chunk.
    chunk_inflight: Arc<Vec<AtomicU32>>,
}

impl RekeySharedState {
    /// Starts quiesced: nothing is admitted until the monitor is ready.
    pub fn new(chunk_count: u64, chunk_sectors: u64) -> Self {
        RekeySharedState {
            checkpoint: Arc::new(AtomicU64::new(CHECKPOINT_INVALID)),
            chunk_sectors,
            quiesced: Arc::new(AtomicBool::new(true)),
            failed: Arc::new(AtomicBool::new(false)),
            inflight: Arc::new(AtomicUsize::new(0)),
            chunk_locks: Arc::new((0..chunk_count).map(|_| AtomicBool::new(false)).collect()),
            chunk_inflight: Arc::new((0..chunk_count).map(|_| AtomicU32::new(0)).collect()),
        }
    }

    // --- Checkpoint ---

    pub fn checkpoint(&self) -> Checkpoint {
        match self.checkpoint.load(Ordering::Acquire) {
            CHECKPOINT_INVALID => Checkpoint::Invalid,
            lba => Checkpoint::At(lba),
        }
    }

    pub fn set_checkpoint(&self, checkpoint: Checkpoint) {
        let value = match checkpoint {
            Checkpoint::Invalid => CHECKPOINT_INVALID,
            Checkpoint::At(lba) => lba,
        };
        self.checkpoint.store(value, Ordering::Release);
    }

    pub fn region(&self, lba: u64) -> Region {
        match self.checkpoint() {
            Checkpoint::At(at) if lba < at => Region::Rekeyed,
            _ => Region::NotRekeyed,
        }
    }

    /// Whether `chunk` is stored under the incoming key.
    pub fn is_rekeyed(&self, chunk: u64) -> bool {
        self.region(chunk * self.chunk_sectors) == Region::Rekeyed
    }

    // --- Quiesce ---

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    pub fn set_quiesced(&self, quiesced: bool) {
        self.quiesced.store(quiesced, Ordering::Release);
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    // --- Chunk locks ---

    pub fn chunk_count(&self) -> u64 {
        self.chunk_locks.len() as u64
    }

    pub fn lock_chunk(&self, chunk: u64) {
        self.chunk_locks[chunk as usize].store(true, Ordering::Release);
    }

    pub fn unlock_chunk(&self, chunk: u64) {
        self.chunk_locks[chunk as usize].store(false, Ordering::Release);
    }

    pub fn chunk_locked(&self, chunk: u64) -> bool {
        self.chunk_locks[chunk as usize].load(Ordering::Acquire)
    }

    pub fn chunk_inflight(&self, chunk: u64) -> u32 {
        self.chunk_inflight[chunk as usize].load(Ordering::Acquire)
    }

    /// Admits a client request touching `chunks`. Counters go up first and
    /// the gates are checked afterwards, so a monitor that sets a gate and
    /// then sees zero in flight knows no request slipped past it.
    pub fn try_enter(&self, chunks: RangeInclusive<u64>) -> bool {
        debug_assert!(chunks.is_empty() || *chunks.end() < self.chunk_count());
        self.inflight.fetch_add(1, Ordering::AcqRel);
        for chunk in chunks.clone() {
            self.chunk_inflight[chunk as usize].fetch_add(1, Ordering::AcqRel);
        }
        let blocked = self.is_quiesced() || chunks.clone().any(|c| self.chunk_locked(c));
        if blocked {
            self.exit(chunks);
        }
        !blocked
    }

    pub fn exit(&self, chunks: RangeInclusive<u64>) {
        for chunk in chunks {
            self.chunk_inflight[chunk as usize].fetch_sub(1, Ordering::AcqRel);
        }
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_quiesced_with_invalid_checkpoint() {
        let shared = RekeySharedState::new(4, 8);
        assert!(shared.is_quiesced());
        assert_eq!(shared.checkpoint(), Checkpoint::Invalid);
        assert!(!shared.is_rekeyed(0));
        assert!(!shared.try_enter(0..=0));
        assert_eq!(shared.inflight(), 0);
    }

    #[test]
    fn test_checkpoint_selects_rekeyed_chunks() {
        let shared = RekeySharedState::new(4, 8);
        shared.set_checkpoint(Checkpoint::At(16));
        assert!(shared.is_rekeyed(1));
        assert!(!shared.is_rekeyed(2));
        assert_eq!(shared.region(15), Region::Rekeyed);
        assert_eq!(shared.region(16), Region::NotRekeyed);
    }

    #[test]
    fn test_chunk_lock_blocks_only_that_chunk() {
        let shared = RekeySharedState::new(4, 8);
        shared.set_quiesced(false);
        shared.lock_chunk(2);
        assert!(!shared.try_enter(1..=2));
        assert_eq!(shared.chunk_inflight(1), 0);
        assert!(shared.try_enter(0..=1));
        assert_eq!(shared.inflight(), 1);
        assert_eq!(shared.chunk_inflight(1), 1);
        shared.exit(0..=1);
        assert_eq!(shared.inflight(), 0);
        shared.unlock_chunk(2);
        assert!(shared.try_enter(2..=3));
    }
}
