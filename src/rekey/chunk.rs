use log::{debug, warn};

use crate::raid::parity;
use crate::raid::row::{invalidated_position, seal_position};
use crate::raid::{ChunkRow, KeySel, PendingWrite, PositionEpoch, Positions, RaidGeometry};

/// Writes that move one chunk row onto the new key.
pub struct RekeyPlan {
    pub chunk: u64,
    pub writes: Vec<PendingWrite>,
    pub rewritten: Positions,
    /// The row could not be recovered and is written with the invalidated
    /// pattern instead.
    pub invalidate: bool,
}

impl RekeyPlan {
    pub fn is_noop(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Plans the re-encryption of `row`. Positions already on the new key and
/// never-written positions are left alone, so planning a rekeyed row yields
/// no writes. Torn positions are rebuilt from the rest of the row when the
/// layout allows it.
pub fn plan_rekey(geometry: &RaidGeometry, row: &ChunkRow, new_key: KeySel) -> RekeyPlan {
    let chunk = row.chunk;
    let readable = row.positions_where(|e| e.is_readable());
    let all_invalidated = !readable.is_empty()
        && readable
            .iter()
            .all(|p| row.epoch(*p) == PositionEpoch::Invalidated);
    let needs: Positions = row.positions_where(|e| {
        matches!(e, PositionEpoch::OldKey | PositionEpoch::Torn | PositionEpoch::Invalidated)
    });
    if all_invalidated || needs.is_empty() {
        debug!("Chunk {chunk} needs no rekey writes");
        return RekeyPlan {
            chunk,
            writes: Vec::new(),
            rewritten: Positions::new(),
            invalidate: false,
        };
    }

    let usable = |e: PositionEpoch| matches!(e, PositionEpoch::NewKey | PositionEpoch::OldKey | PositionEpoch::Zeroed);
    let unknown = row.positions_where(|e| !usable(e));
    let mut cols = row.columns(usable);
    let recovered = unknown
        .iter()
        .all(|p| !matches!(row.epoch(*p), PositionEpoch::Torn | PositionEpoch::Invalidated))
        || parity::reconstruct(&geometry.layout(chunk), &mut cols, &unknown);

    if !recovered {
        warn!("Chunk {chunk} has torn positions {unknown:?} beyond redundancy, invalidating");
        let all: Positions = (0..geometry.width).collect();
        return RekeyPlan {
            chunk,
            writes: all
                .iter()
                .map(|position| PendingWrite {
                    position: *position,
                    lba: row.first_lba,
                    buf: invalidated_position(row.sectors),
                })
                .collect(),
            rewritten: all,
            invalidate: true,
        };
    }

    let writes = needs
        .iter()
        .filter_map(|position| {
            cols[*position].as_ref().map(|plaintext| PendingWrite {
                position: *position,
                lba: row.first_lba,
                buf: seal_position(plaintext, row.first_lba, new_key),
            })
        })
        .collect();
    RekeyPlan {
        chunk,
        writes,
        rewritten: needs,
        invalidate: false,
    }
}
