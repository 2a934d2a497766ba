use serde::{Deserialize, Serialize};

use crate::block_device::BLOCK_SIZE;

pub const PAGED_MAGIC: u32 = 0x524B_5047;

/// Encoded size of one entry.
pub const ENTRY_SIZE: usize = 4;
// magic + block index + entry vector length
const HEADER_SIZE: usize = 4 + 8 + 8;
const CRC_OFFSET: usize = BLOCK_SIZE - 4;

pub const MAX_CHUNKS_PER_BLOCK: u64 = ((CRC_OFFSET - HEADER_SIZE) / ENTRY_SIZE) as u64;

const FLAG_VALID: u8 = 1 << 0;
const FLAG_REKEY: u8 = 1 << 1;

const VERIFY_ERROR: u8 = 1 << 0;
const VERIFY_INCOMPLETE_WRITE: u8 = 1 << 1;

/// Per-chunk paged metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedEntry {
    flags: u8,
    verify: u8,
    needs_rebuild: u16,
}

impl PagedEntry {
    pub fn valid(needs_rebuild: u16) -> Self {
        PagedEntry {
            flags: FLAG_VALID,
            verify: 0,
            needs_rebuild,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    pub fn is_rekeyed(&self) -> bool {
        self.flags & FLAG_REKEY != 0
    }

    pub fn set_rekeyed(&mut self, rekeyed: bool) {
        if rekeyed {
            self.flags |= FLAG_REKEY;
        } else {
            self.flags &= !FLAG_REKEY;
        }
    }

    pub fn needs_rebuild(&self) -> u16 {
        self.needs_rebuild
    }

    pub fn set_needs_rebuild(&mut self, mask: u16) {
        self.needs_rebuild = mask;
    }

    pub fn verify_error(&self) -> bool {
        self.verify & VERIFY_ERROR != 0
    }

    pub fn incomplete_write(&self) -> bool {
        self.verify & VERIFY_INCOMPLETE_WRITE != 0
    }

    /// Set once the chunk's check ended in invalidation, so the loss stays
    /// on record after the chunk is rewritten.
    pub fn set_verify_error(&mut self, error: bool) {
        self.set_verify_bit(VERIFY_ERROR, error);
    }

    /// Set while the chunk's incomplete-write check has not finished.
    pub fn set_incomplete_write(&mut self, pending: bool) {
        self.set_verify_bit(VERIFY_INCOMPLETE_WRITE, pending);
    }

    fn set_verify_bit(&mut self, bit: u8, set: bool) {
        if set {
            self.verify |= bit;
        } else {
            self.verify &= !bit;
        }
    }
}

/// One block of paged metadata covering a fixed run of chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedBlock {
    magic: u32,
    pub index: u64,
    pub entries: Vec<PagedEntry>,
}

impl PagedBlock {
    pub fn new(index: u64, entries: Vec<PagedEntry>) -> Self {
        PagedBlock {
            magic: PAGED_MAGIC,
            index,
            entries,
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if body.len() > CRC_OFFSET {
            return Err(crate::rekey_error!(MetadataError {
                description: format!(
                    "Paged block {} with {} entries does not fit a block",
                    self.index,
                    self.entries.len()
                ),
            }));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..body.len()].copy_from_slice(&body);
        let crc = crc32c::crc32c(&block[..CRC_OFFSET]);
        block[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        Ok(block)
    }

    /// Any mismatch invalidates the whole block.
    pub fn decode(raw: &[u8], index: u64, entry_count: usize) -> Option<Self> {
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&raw[CRC_OFFSET..BLOCK_SIZE]);
        if crc32c::crc32c(&raw[..CRC_OFFSET]) != u32::from_le_bytes(crc) {
            return None;
        }
        let block: PagedBlock = bincode::deserialize(&raw[..CRC_OFFSET]).ok()?;
        (block.magic == PAGED_MAGIC && block.index == index && block.entries.len() == entry_count)
            .then_some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_four_bytes() {
        let encoded = bincode::serialize(&PagedEntry::valid(0x0102)).unwrap();
        assert_eq!(encoded.len(), ENTRY_SIZE);
    }

    #[test]
    fn test_entry_flags() {
        let mut entry = PagedEntry::valid(0b101);
        assert!(entry.is_valid());
        assert!(!entry.is_rekeyed());
        entry.set_rekeyed(true);
        entry.set_incomplete_write(true);
        assert!(entry.is_rekeyed());
        assert!(entry.incomplete_write());
        assert!(!entry.verify_error());
        entry.set_verify_error(true);
        entry.set_incomplete_write(false);
        assert!(entry.verify_error());
        assert!(!entry.incomplete_write());
        assert_eq!(entry.needs_rebuild(), 0b101);
        entry.set_rekeyed(false);
        assert!(!entry.is_rekeyed());
        assert!(!PagedEntry::default().is_valid());
    }

    #[test]
    fn test_full_block_fits() {
        let block = PagedBlock::new(3, vec![PagedEntry::valid(0); MAX_CHUNKS_PER_BLOCK as usize]);
        let raw = block.encode().unwrap();
        assert_eq!(raw.len(), BLOCK_SIZE);
        assert_eq!(PagedBlock::decode(&raw, 3, MAX_CHUNKS_PER_BLOCK as usize), Some(block));

        let oversized = PagedBlock::new(0, vec![PagedEntry::valid(0); MAX_CHUNKS_PER_BLOCK as usize + 1]);
        assert!(oversized.encode().is_err());
    }

    #[test]
    fn test_decode_rejects_corruption_and_misplacement() {
        let block = PagedBlock::new(1, vec![PagedEntry::valid(0); 3]);
        let mut raw = block.encode().unwrap();
        assert!(PagedBlock::decode(&raw, 2, 3).is_none());
        assert!(PagedBlock::decode(&raw, 1, 4).is_none());
        raw[30] ^= 0x40;
        assert!(PagedBlock::decode(&raw, 1, 3).is_none());
        assert!(PagedBlock::decode(&[0u8; BLOCK_SIZE], 0, 0).is_none());
    }
}
