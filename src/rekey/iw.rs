use std::ops::Range;

use log::{info, warn};

use crate::raid::parity;
use crate::raid::row::{invalidated_position, seal_position};
use crate::raid::{ChunkRow, PendingWrite, PositionEpoch, Positions, RaidGeometry, RowKeys, RowLayout, StripeIo};
use crate::{rekey_error, Result};

/// Key a completed row ends up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEpoch {
    New,
    Old,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IwVerdict {
    /// Every readable position already agrees.
    Consistent,
    /// The stale positions can be rebuilt from the rest and rewritten.
    Complete { stale: Positions, target: TargetEpoch },
    /// Not enough agreeing positions survive to recover the row.
    Invalidate,
}

/// What a chunk holds once its check is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkResolution {
    OnNewKey,
    OnOldKey,
    Invalidated,
    Unwritten,
}

fn agrees(epoch: PositionEpoch, target: TargetEpoch) -> bool {
    match epoch {
        PositionEpoch::Zeroed => true,
        PositionEpoch::NewKey => target == TargetEpoch::New,
        PositionEpoch::OldKey => target == TargetEpoch::Old,
        _ => false,
    }
}

/// Decides how an interrupted key transition of `row` is resolved.
///
/// The row's reference epoch is the new key as soon as one readable
/// position carries it, the old key otherwise. Readable positions on any
/// other epoch are stale. Stale positions together with missing or
/// unreadable ones must be recoverable by the layout for the row to be
/// completed.
pub fn decide(layout: &RowLayout, row: &ChunkRow) -> IwVerdict {
    let readable = row.positions_where(|e| e.is_readable());
    if !readable.is_empty()
        && readable
            .iter()
            .all(|p| row.epoch(*p) == PositionEpoch::Invalidated)
    {
        return IwVerdict::Consistent;
    }
    let target = if readable.iter().any(|p| row.epoch(*p) == PositionEpoch::NewKey) {
        TargetEpoch::New
    } else {
        TargetEpoch::Old
    };
    let stale: Positions = readable
        .iter()
        .copied()
        .filter(|p| !agrees(row.epoch(*p), target))
        .collect();
    if stale.is_empty() {
        return IwVerdict::Consistent;
    }
    let lost: Positions = row.positions_where(|e| !e.is_readable() || !agrees(e, target));
    if layout.can_reconstruct(&lost) {
        IwVerdict::Complete { stale, target }
    } else {
        IwVerdict::Invalidate
    }
}

/// Reads `chunk` and decides its verdict.
pub fn check(io: &mut StripeIo, geometry: &RaidGeometry, chunk: u64, keys: RowKeys) -> Result<(IwVerdict, ChunkRow)> {
    let row = ChunkRow::read(io, geometry, chunk, keys)?;
    let verdict = decide(&geometry.layout(chunk), &row);
    Ok((verdict, row))
}

fn settled(row: &ChunkRow) -> ChunkResolution {
    let epochs: Vec<PositionEpoch> = row.positions.iter().map(|p| p.epoch).collect();
    if epochs.contains(&PositionEpoch::NewKey) {
        ChunkResolution::OnNewKey
    } else if epochs.contains(&PositionEpoch::OldKey) {
        ChunkResolution::OnOldKey
    } else if epochs.contains(&PositionEpoch::Invalidated) {
        ChunkResolution::Invalidated
    } else {
        ChunkResolution::Unwritten
    }
}

/// Applies `verdict` to `row`: rewrites the stale positions for
/// `Complete`, writes the invalidated pattern everywhere for `Invalidate`.
pub fn resolve(
    io: &mut StripeIo,
    geometry: &RaidGeometry,
    row: &ChunkRow,
    verdict: &IwVerdict,
    keys: RowKeys,
) -> Result<ChunkResolution> {
    let chunk = row.chunk;
    let writes = match verdict {
        IwVerdict::Consistent => return Ok(settled(row)),
        IwVerdict::Complete { stale, target } => {
            let usable = |e: PositionEpoch| agrees(e, *target);
            let missing = row.positions_where(|e| !usable(e));
            let mut cols = row.columns(usable);
            if !parity::reconstruct(&geometry.layout(chunk), &mut cols, &missing) {
                return Err(rekey_error!(UnresolvableChunk {
                    chunk,
                    reason: format!("cannot complete with {missing:?} unusable"),
                }));
            }
            let key = match target {
                TargetEpoch::New => keys.new,
                TargetEpoch::Old => keys.old.unwrap_or(keys.new),
            };
            let mut writes = Vec::with_capacity(stale.len());
            for position in stale {
                let Some(plaintext) = cols[*position].as_ref() else {
                    return Err(rekey_error!(UnresolvableChunk {
                        chunk,
                        reason: format!("reconstruction left position {position} empty"),
                    }));
                };
                writes.push(PendingWrite {
                    position: *position,
                    lba: row.first_lba,
                    buf: seal_position(plaintext, row.first_lba, key),
                });
            }
            info!("Completing interrupted write of chunk {chunk}: positions {stale:?} rewritten");
            writes
        }
        IwVerdict::Invalidate => {
            warn!("Invalidating chunk {chunk}: positions disagree beyond redundancy");
            (0..geometry.width)
                .map(|position| PendingWrite {
                    position,
                    lba: row.first_lba,
                    buf: invalidated_position(row.sectors),
                })
                .collect()
        }
    };

    let mut batch = io.start_writes(writes)?;
    io.wait_writes(&mut batch)?;
    let failed = batch.failed_positions();
    if !failed.is_empty() {
        return Err(rekey_error!(UnresolvableChunk {
            chunk,
            reason: format!("writes to positions {failed:?} failed while resolving {verdict:?}"),
        }));
    }
    Ok(match verdict {
        IwVerdict::Complete {
            target: TargetEpoch::New,
            ..
        } => ChunkResolution::OnNewKey,
        IwVerdict::Complete { .. } => ChunkResolution::OnOldKey,
        _ => ChunkResolution::Invalidated,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IwPhase {
    Unchecked,
    Checking,
    Invalidated,
    Completed,
    Consistent,
    Done,
}

/// Per-chunk check progress over the chunks that must be verified before
/// the checkpoint may move past them.
#[derive(Debug, Clone)]
pub struct IwTracker {
    start: u64,
    phases: Vec<IwPhase>,
}

impl IwTracker {
    pub fn new(chunks: Range<u64>) -> Self {
        IwTracker {
            start: chunks.start,
            phases: vec![IwPhase::Unchecked; (chunks.end.saturating_sub(chunks.start)) as usize],
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.phases.len() as u64
    }

    /// Chunks outside the tracked range need no check.
    pub fn phase(&self, chunk: u64) -> IwPhase {
        if self.range().contains(&chunk) {
            self.phases[(chunk - self.start) as usize]
        } else {
            IwPhase::Done
        }
    }

    fn set(&mut self, chunk: u64, phase: IwPhase) {
        if self.range().contains(&chunk) {
            self.phases[(chunk - self.start) as usize] = phase;
        }
    }

    pub fn begin(&mut self, chunk: u64) {
        self.set(chunk, IwPhase::Checking);
    }

    pub fn record(&mut self, chunk: u64, verdict: &IwVerdict) {
        let phase = match verdict {
            IwVerdict::Consistent => IwPhase::Consistent,
            IwVerdict::Complete { .. } => IwPhase::Completed,
            IwVerdict::Invalidate => IwPhase::Invalidated,
        };
        self.set(chunk, phase);
    }

    pub fn finish(&mut self, chunk: u64) {
        self.set(chunk, IwPhase::Done);
    }

    pub fn next_unchecked(&self) -> Option<u64> {
        self.phases
            .iter()
            .position(|p| *p == IwPhase::Unchecked)
            .map(|i| self.start + i as u64)
    }

    pub fn is_done(&self) -> bool {
        self.phases.iter().all(|p| *p == IwPhase::Done)
    }

    /// Whether every tracked chunk below `chunk_end` finished its check.
    pub fn may_advance_to(&self, chunk_end: u64) -> bool {
        self.range()
            .take_while(|c| *c < chunk_end)
            .all(|c| self.phase(c) == IwPhase::Done)
    }
}

/// Runs the whole check of one chunk through `tracker`.
pub fn check_chunk(
    io: &mut StripeIo,
    geometry: &RaidGeometry,
    chunk: u64,
    keys: RowKeys,
    tracker: &mut IwTracker,
) -> Result<ChunkResolution> {
    tracker.begin(chunk);
    let (verdict, row) = check(io, geometry, chunk, keys)?;
    tracker.record(chunk, &verdict);
    let resolution = resolve(io, geometry, &row, &verdict, keys)?;
    tracker.finish(chunk);
    Ok(resolution)
}
