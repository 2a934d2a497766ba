use super::block_format::{self, BlockDecode};
use super::geometry::{Positions, RaidGeometry};
use super::parity::Columns;
use super::stripe_io::{ReadOutcome, StripeIo};
use crate::block_device::{shared_buffer, SharedBuffer, BLOCK_SIZE, SECTOR_SIZE};
use crate::crypt::XtsBlockCipher;
use crate::Result;

/// Key a block is stored under; `None` is clear text.
pub type KeySel<'a> = Option<&'a XtsBlockCipher>;

/// Keys a row is decoded with. Blocks verifying under `new` count as new,
/// blocks verifying under `old` count as old.
#[derive(Debug, Clone, Copy)]
pub struct RowKeys<'a> {
    pub new: KeySel<'a>,
    pub old: Option<KeySel<'a>>,
}

impl<'a> RowKeys<'a> {
    pub fn single(key: KeySel<'a>) -> Self {
        RowKeys { new: key, old: None }
    }

    pub fn transition(old: KeySel<'a>, new: KeySel<'a>) -> Self {
        RowKeys { new, old: Some(old) }
    }
}

/// What one stripe position of a chunk row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEpoch {
    NewKey,
    OldKey,
    /// Never written; compatible with either key.
    Zeroed,
    /// Blocks of different keys, or blocks verifying under neither.
    Torn,
    Invalidated,
    Unreadable,
    /// Degraded position, not read.
    Missing,
}

impl PositionEpoch {
    pub fn is_readable(self) -> bool {
        !matches!(self, PositionEpoch::Unreadable | PositionEpoch::Missing)
    }
}

#[derive(Debug, Clone)]
pub struct PositionData {
    pub epoch: PositionEpoch,
    /// Plain text of the whole position for `NewKey`, `OldKey` and `Zeroed`.
    pub plaintext: Option<Vec<u8>>,
}

/// One chunk across every stripe position, decoded.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk: u64,
    pub first_lba: u64,
    pub sectors: u64,
    pub positions: Vec<PositionData>,
}

impl ChunkRow {
    pub fn read(io: &mut StripeIo, geometry: &RaidGeometry, chunk: u64, keys: RowKeys) -> Result<Self> {
        Self::read_range(io, geometry, chunk, 0, geometry.chunk_sectors, keys)
    }

    /// Reads `sectors` sector rows of `chunk` starting `offset` sectors in.
    pub fn read_range(
        io: &mut StripeIo,
        geometry: &RaidGeometry,
        chunk: u64,
        offset: u64,
        sectors: u64,
        keys: RowKeys,
    ) -> Result<Self> {
        let first_lba = geometry.chunk_lba(chunk) + offset;
        let mut positions = Vec::with_capacity(geometry.width);
        for position in 0..geometry.width {
            let data = match io.read(position, first_lba, sectors as u32)? {
                ReadOutcome::Data(buf) => classify(buf.borrow().as_slice(), first_lba, keys),
                ReadOutcome::Missing => PositionData {
                    epoch: PositionEpoch::Missing,
                    plaintext: None,
                },
                ReadOutcome::Unreadable => PositionData {
                    epoch: PositionEpoch::Unreadable,
                    plaintext: None,
                },
            };
            positions.push(data);
        }
        Ok(ChunkRow {
            chunk,
            first_lba,
            sectors,
            positions,
        })
    }

    pub fn epoch(&self, position: usize) -> PositionEpoch {
        self.positions[position].epoch
    }

    pub fn positions_where(&self, pred: impl Fn(PositionEpoch) -> bool) -> Positions {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, p)| pred(p.epoch))
            .map(|(i, _)| i)
            .collect()
    }

    /// Plain text of the positions accepted by `pred`, `None` elsewhere.
    pub fn columns(&self, pred: impl Fn(PositionEpoch) -> bool) -> Columns {
        self.positions
            .iter()
            .map(|p| if pred(p.epoch) { p.plaintext.clone() } else { None })
            .collect()
    }
}

/// Decodes the raw blocks of one position.
pub fn classify(raw: &[u8], first_lba: u64, keys: RowKeys) -> PositionData {
    let mut plaintext = vec![0u8; raw.len() / BLOCK_SIZE * SECTOR_SIZE];
    let (mut new, mut old, mut invalid, mut bad) = (0usize, 0usize, 0usize, 0usize);

    for (i, (block, payload)) in raw
        .chunks_exact(BLOCK_SIZE)
        .zip(plaintext.chunks_exact_mut(SECTOR_SIZE))
        .enumerate()
    {
        let lba = first_lba + i as u64;
        match block_format::open(block, lba, keys.new, payload) {
            BlockDecode::Data => new += 1,
            BlockDecode::Zeroed => {}
            BlockDecode::Invalidated => invalid += 1,
            BlockDecode::Mismatch => match keys.old {
                Some(old_key) if block_format::open(block, lba, old_key, payload) == BlockDecode::Data => old += 1,
                _ => bad += 1,
            },
        }
    }

    let blocks = raw.len() / BLOCK_SIZE;
    let epoch = if invalid == blocks && blocks > 0 {
        PositionEpoch::Invalidated
    } else if invalid > 0 || bad > 0 || (new > 0 && old > 0) {
        PositionEpoch::Torn
    } else if new > 0 {
        PositionEpoch::NewKey
    } else if old > 0 {
        PositionEpoch::OldKey
    } else {
        PositionEpoch::Zeroed
    };
    let plaintext = matches!(
        epoch,
        PositionEpoch::NewKey | PositionEpoch::OldKey | PositionEpoch::Zeroed
    )
    .then_some(plaintext);
    PositionData { epoch, plaintext }
}

/// Encodes the plain text of a whole position for writing at `first_lba`.
pub fn seal_position(plaintext: &[u8], first_lba: u64, key: KeySel) -> SharedBuffer {
    let blocks = plaintext.len() / SECTOR_SIZE;
    let buf = shared_buffer(BLOCK_SIZE, blocks);
    {
        let mut buf = buf.borrow_mut();
        for (i, payload) in plaintext.chunks_exact(SECTOR_SIZE).enumerate() {
            block_format::seal(payload, first_lba + i as u64, key, buf.block_mut(i));
        }
    }
    buf
}

pub fn invalidated_position(blocks: u64) -> SharedBuffer {
    let buf = shared_buffer(BLOCK_SIZE, blocks as usize);
    block_format::write_invalidated(buf.borrow_mut().as_mut_slice());
    buf
}
