//! On-disk format of one user-data block on a stripe position.
//!
//! ```text
//! [0..512)   payload
//! [512..516) crc32c(payload), little endian
//! [516..524) position LBA the block was written to, little endian
//! [524..528) reserved, zero
//! ```
//!
//! The whole block is XTS encrypted with the key of its epoch, tweaked by the
//! position LBA. A block that fails the CRC or LBA check after decryption was
//! written under a different key. Invalidated blocks are a fixed pattern that
//! is never encrypted, so it is recognized before any key is tried.

use crate::block_device::{BLOCK_SIZE, SECTOR_SIZE};
use crate::crypt::XtsBlockCipher;

const CRC_OFFSET: usize = SECTOR_SIZE;
const LBA_OFFSET: usize = CRC_OFFSET + 4;
const RESERVED_OFFSET: usize = LBA_OFFSET + 8;

pub const INVALIDATED_MAGIC: &[u8; 16] = b"RGREKEY-INVALID!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecode {
    /// Payload verified under the supplied key.
    Data,
    /// Never written; reads as zeros under any key.
    Zeroed,
    Invalidated,
    /// Does not verify under the supplied key.
    Mismatch,
}

/// Builds the raw block for `payload` at `lba`. `None` stores it in clear.
pub fn seal(payload: &[u8], lba: u64, cipher: Option<&XtsBlockCipher>, out: &mut [u8]) {
    debug_assert_eq!(payload.len(), SECTOR_SIZE);
    debug_assert_eq!(out.len(), BLOCK_SIZE);
    out[..CRC_OFFSET].copy_from_slice(payload);
    out[CRC_OFFSET..LBA_OFFSET].copy_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    out[LBA_OFFSET..RESERVED_OFFSET].copy_from_slice(&lba.to_le_bytes());
    out[RESERVED_OFFSET..].fill(0);
    if let Some(cipher) = cipher {
        cipher.encrypt(out, BLOCK_SIZE, lba);
    }
}

/// Decodes `raw` as written at `lba` under `cipher`. On `Data` and `Zeroed`
/// the plaintext is left in `payload`.
pub fn open(raw: &[u8], lba: u64, cipher: Option<&XtsBlockCipher>, payload: &mut [u8]) -> BlockDecode {
    if is_invalidated(raw) {
        return BlockDecode::Invalidated;
    }
    if raw.iter().all(|b| *b == 0) {
        payload.fill(0);
        return BlockDecode::Zeroed;
    }
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(raw);
    if let Some(cipher) = cipher {
        cipher.decrypt(&mut block, BLOCK_SIZE, lba);
    }
    let crc = u32::from_le_bytes([
        block[CRC_OFFSET],
        block[CRC_OFFSET + 1],
        block[CRC_OFFSET + 2],
        block[CRC_OFFSET + 3],
    ]);
    let mut lba_bytes = [0u8; 8];
    lba_bytes.copy_from_slice(&block[LBA_OFFSET..RESERVED_OFFSET]);
    if u64::from_le_bytes(lba_bytes) != lba || crc32c::crc32c(&block[..CRC_OFFSET]) != crc {
        return BlockDecode::Mismatch;
    }
    payload.copy_from_slice(&block[..CRC_OFFSET]);
    BlockDecode::Data
}

pub fn write_invalidated(out: &mut [u8]) {
    for (i, b) in out.iter_mut().enumerate() {
        *b = INVALIDATED_MAGIC[i % INVALIDATED_MAGIC.len()];
    }
}

pub fn is_invalidated(raw: &[u8]) -> bool {
    raw.iter()
        .enumerate()
        .all(|(i, b)| *b == INVALIDATED_MAGIC[i % INVALIDATED_MAGIC.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(fill: u8) -> Vec<u8> {
        (0..SECTOR_SIZE).map(|i| fill ^ (i as u8)).collect()
    }

    #[test]
    fn test_seal_and_open_with_key() {
        let cipher = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        let mut raw = [0u8; BLOCK_SIZE];
        seal(&payload(0x10), 77, Some(&cipher), &mut raw);
        assert_ne!(&raw[..SECTOR_SIZE], payload(0x10).as_slice());

        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(open(&raw, 77, Some(&cipher), &mut out), BlockDecode::Data);
        assert_eq!(out, payload(0x10));
    }

    #[test]
    fn test_wrong_key_or_lba_is_mismatch() {
        let old = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        let new = XtsBlockCipher::new([3u8; 32], [4u8; 32]).unwrap();
        let mut raw = [0u8; BLOCK_SIZE];
        seal(&payload(0x20), 5, Some(&old), &mut raw);

        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(open(&raw, 5, Some(&new), &mut out), BlockDecode::Mismatch);
        assert_eq!(open(&raw, 6, Some(&old), &mut out), BlockDecode::Mismatch);
        assert_eq!(open(&raw, 5, None, &mut out), BlockDecode::Mismatch);
    }

    #[test]
    fn test_clear_blocks_do_not_verify_under_a_key() {
        let cipher = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        let mut raw = [0u8; BLOCK_SIZE];
        seal(&payload(0x30), 9, None, &mut raw);
        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(open(&raw, 9, None, &mut out), BlockDecode::Data);
        assert_eq!(open(&raw, 9, Some(&cipher), &mut out), BlockDecode::Mismatch);
    }

    #[test]
    fn test_zeroed_and_invalidated_blocks() {
        let cipher = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        let mut out = vec![0xFFu8; SECTOR_SIZE];
        assert_eq!(open(&[0u8; BLOCK_SIZE], 1, Some(&cipher), &mut out), BlockDecode::Zeroed);
        assert!(out.iter().all(|b| *b == 0));

        let mut raw = [0u8; BLOCK_SIZE];
        write_invalidated(&mut raw);
        assert!(is_invalidated(&raw));
        assert_eq!(open(&raw, 1, Some(&cipher), &mut out), BlockDecode::Invalidated);
        assert_eq!(open(&raw, 1, None, &mut out), BlockDecode::Invalidated);
    }
}
