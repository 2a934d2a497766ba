use std::ops::Range;

use log::{error, info, warn};

use super::entry::{PagedBlock, PagedEntry};
use super::store::PagedStore;
use crate::raid::{ChunkRow, PositionEpoch, Positions, RaidGeometry, RowKeys, StripeIo};
use crate::rekey::checkpoint::ChunkRekeyState;
use crate::{rekey_error, Result};

/// Result of classifying a range of chunks from paged metadata alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// First chunk of the contiguous span known to be rekeyed.
    pub first_rekeyed_chunk: Option<u64>,
    pub last_rekeyed_chunk: Option<u64>,
    /// Highest chunk with a rekey bit anywhere in the scanned range.
    pub highest_rekeyed_chunk: Option<u64>,
    /// Chunk ranges whose paged block does not verify.
    pub ambiguous: Vec<Range<u64>>,
    pub invalid_blocks: Vec<u64>,
    /// Chunks whose incomplete-write check ended in invalidation.
    pub invalidated_chunks: Vec<u64>,
    /// Chunks whose incomplete-write check never finished.
    pub unverified_chunks: Vec<u64>,
}

impl ScanReport {
    pub fn is_ambiguous(&self, chunk: u64) -> bool {
        self.ambiguous.iter().any(|range| range.contains(&chunk))
    }
}

/// Classifies every chunk of `chunks` from the paged blocks on disk. A block
/// that does not verify or cannot be read makes all of its chunks ambiguous.
pub fn scan(store: &mut PagedStore, chunks: Range<u64>) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    if chunks.is_empty() {
        return Ok(report);
    }
    let mut span_open = true;
    let first_block = store.block_of(chunks.start);
    let last_block = store.block_of(chunks.end - 1);

    for index in first_block..=last_block {
        let covered = store.chunks_in(index);
        let covered = covered.start.max(chunks.start)..covered.end.min(chunks.end);
        let block = match store.read_block(index) {
            Ok(block) => block,
            Err(e) => {
                warn!("Paged block {index} unreadable during scan: {e}");
                None
            }
        };
        let Some(block) = block else {
            report.invalid_blocks.push(index);
            report.ambiguous.push(covered);
            if report.first_rekeyed_chunk.is_some() {
                span_open = false;
            }
            continue;
        };
        for chunk in covered {
            let entry = block.entries[(chunk % store.chunks_per_block()) as usize];
            if entry.verify_error() {
                report.invalidated_chunks.push(chunk);
            }
            if entry.incomplete_write() {
                report.unverified_chunks.push(chunk);
            }
            if entry.is_valid() && entry.is_rekeyed() {
                report.highest_rekeyed_chunk = Some(chunk);
                if report.first_rekeyed_chunk.is_none() {
                    report.first_rekeyed_chunk = Some(chunk);
                }
                if span_open {
                    report.last_rekeyed_chunk = Some(chunk);
                }
            } else if report.first_rekeyed_chunk.is_some() {
                span_open = false;
            }
        }
    }
    Ok(report)
}

/// Reads `chunk` across every position and decides whether it already sits
/// on the new key. Only a row whose readable positions all decode under the
/// new key (or were never written) and which holds at least one new-key
/// position counts as rekeyed; anything else is not rekeyed.
pub fn probe_chunk(io: &mut StripeIo, geometry: &RaidGeometry, chunk: u64, keys: RowKeys) -> Result<ChunkRekeyState> {
    let row = ChunkRow::read(io, geometry, chunk, keys)?;
    let unreadable: Positions = row.positions_where(|e| !e.is_readable());
    if !geometry.layout(chunk).can_reconstruct(&unreadable) {
        return Err(rekey_error!(UnresolvableChunk {
            chunk,
            reason: format!("positions {unreadable:?} unreadable during probe"),
        }));
    }
    let readable = row.positions_where(|e| e.is_readable());
    let all_new = readable
        .iter()
        .all(|p| matches!(row.epoch(*p), PositionEpoch::NewKey | PositionEpoch::Zeroed));
    let any_new = readable.iter().any(|p| row.epoch(*p) == PositionEpoch::NewKey);
    Ok(if all_new && any_new {
        ChunkRekeyState::Rekeyed
    } else {
        ChunkRekeyState::NotRekeyed
    })
}

/// Builds and writes a replacement for paged block `index`. Chunks below
/// `rekeyed_below` get the rekey bit.
pub fn reconstruct_block(store: &mut PagedStore, index: u64, rekeyed_below: Option<u64>, needs_rebuild: u16) -> Result<()> {
    let covered = store.chunks_in(index);
    let start = index * store.chunks_per_block();
    let entries = (start..start + store.chunks_per_block())
        .map(|chunk| {
            if !covered.contains(&chunk) {
                return PagedEntry::valid(0);
            }
            let mut entry = PagedEntry::valid(needs_rebuild);
            entry.set_rekeyed(rekeyed_below.is_some_and(|below| chunk < below));
            entry
        })
        .collect();
    store.write_block(PagedBlock::new(index, entries))?;
    info!("Reconstructed paged block {index} (chunks {covered:?})");
    Ok(())
}

/// Everything the reconstructor touches while it runs.
pub struct ReconstructContext<'a, 'k> {
    pub store: &'a mut PagedStore,
    pub io: &'a mut StripeIo,
    pub geometry: &'a RaidGeometry,
    pub keys: RowKeys<'k>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructPhase {
    Idle,
    Scanning,
    Verifying { chunk: u64 },
    Reconstructing { next: usize },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// First chunk not known to be rekeyed, or `None` when no rekey runs.
    pub checkpoint_chunk: Option<u64>,
    pub report: ScanReport,
    /// Chunks the live-data probe confirmed past the paged metadata.
    pub confirmed_by_probe: u64,
}

/// Recovers rekey progress from paged metadata and rewrites every block
/// that does not verify, one unit of work per [`step`](Self::step).
#[derive(Debug)]
pub struct PagedReconstructor {
    phase: ReconstructPhase,
    checkpoint_chunk: Option<u64>,
    report: ScanReport,
    confirmed_by_probe: u64,
}

impl PagedReconstructor {
    /// `persisted_chunk` is the checkpoint chunk from nonpaged metadata,
    /// `None` when the raid group is not rekeying.
    pub fn new(persisted_chunk: Option<u64>) -> Self {
        PagedReconstructor {
            phase: ReconstructPhase::Idle,
            checkpoint_chunk: persisted_chunk,
            report: ScanReport::default(),
            confirmed_by_probe: 0,
        }
    }

    pub fn phase(&self) -> ReconstructPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == ReconstructPhase::Done
    }

    fn outcome(&self) -> RecoveryOutcome {
        RecoveryOutcome {
            checkpoint_chunk: self.checkpoint_chunk,
            report: self.report.clone(),
            confirmed_by_probe: self.confirmed_by_probe,
        }
    }

    /// Next phase once the checkpoint chunk is settled.
    fn after_verify(&self, chunk: u64, chunk_count: u64) -> ReconstructPhase {
        if chunk < chunk_count && self.report.is_ambiguous(chunk) {
            ReconstructPhase::Verifying { chunk }
        } else {
            ReconstructPhase::Reconstructing { next: 0 }
        }
    }

    /// Performs one unit of work. Returns the outcome once done.
    pub fn step(&mut self, ctx: &mut ReconstructContext) -> Result<Option<RecoveryOutcome>> {
        let chunk_count = ctx.store.chunk_count();
        match self.phase {
            ReconstructPhase::Idle => {
                info!("Paged reconstruction starting from checkpoint chunk {:?}", self.checkpoint_chunk);
                self.phase = ReconstructPhase::Scanning;
            }
            ReconstructPhase::Scanning => {
                self.report = scan(ctx.store, 0..chunk_count)?;
                self.phase = match self.checkpoint_chunk {
                    Some(persisted) => {
                        let derived = self.report.highest_rekeyed_chunk.map_or(0, |c| c + 1);
                        let chunk = persisted.max(derived);
                        if chunk > persisted {
                            info!("Paged metadata shows progress up to chunk {chunk}, past persisted chunk {persisted}");
                        }
                        self.checkpoint_chunk = Some(chunk);
                        self.after_verify(chunk, chunk_count)
                    }
                    None => ReconstructPhase::Reconstructing { next: 0 },
                };
            }
            ReconstructPhase::Verifying { chunk } => {
                let state = probe_chunk(ctx.io, ctx.geometry, chunk, ctx.keys).inspect_err(|e| {
                    error!("Cannot resolve ambiguous chunk {chunk}: {e}");
                })?;
                if state == ChunkRekeyState::Rekeyed {
                    info!("Live data confirms chunk {chunk} is rekeyed");
                    self.confirmed_by_probe += 1;
                    self.checkpoint_chunk = Some(chunk + 1);
                    self.phase = self.after_verify(chunk + 1, chunk_count);
                } else {
                    info!("Chunk {chunk} not confirmed on the new key, treating it as not rekeyed");
                    self.phase = ReconstructPhase::Reconstructing { next: 0 };
                }
            }
            ReconstructPhase::Reconstructing { next } => match self.report.invalid_blocks.get(next) {
                Some(&index) => {
                    let mask = ctx.io.health().needs_rebuild_mask();
                    reconstruct_block(ctx.store, index, self.checkpoint_chunk, mask)?;
                    self.phase = ReconstructPhase::Reconstructing { next: next + 1 };
                }
                None => {
                    info!(
                        "Paged reconstruction done: {} blocks rebuilt, checkpoint chunk {:?}",
                        self.report.invalid_blocks.len(),
                        self.checkpoint_chunk
                    );
                    self.phase = ReconstructPhase::Done;
                    return Ok(Some(self.outcome()));
                }
            },
            ReconstructPhase::Done => return Ok(Some(self.outcome())),
        }
        Ok(None)
    }

    /// Steps until done.
    pub fn run(&mut self, ctx: &mut ReconstructContext) -> Result<RecoveryOutcome> {
        loop {
            if let Some(outcome) = self.step(ctx)? {
                return Ok(outcome);
            }
        }
    }
}
