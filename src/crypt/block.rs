use aes::{
    cipher::{generic_array::GenericArray, KeyInit},
    Aes256,
};
use rand::RngCore;
use xts_mode::Xts128;

use crate::{rekey_error, Result};

/// XTS-AES-256 over fixed-size blocks, tweaked by the block's LBA.
pub struct XtsBlockCipher {
    key1: [u8; 32],
    key2: [u8; 32],
    xts: Xts128<Aes256>,
}

impl XtsBlockCipher {
    pub fn new(key1: [u8; 32], key2: [u8; 32]) -> Result<Self> {
        if key1 == key2 {
            return Err(rekey_error!(CryptoError {
                description: "XTS key halves must differ".to_string(),
            }));
        }
        let cipher_1 = Aes256::new_from_slice(&key1).map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Failed to initialize data cipher: {e}"),
            })
        })?;
        let cipher_2 = Aes256::new_from_slice(&key2).map_err(|e| {
            rekey_error!(CryptoError {
                description: format!("Failed to initialize tweak cipher: {e}"),
            })
        })?;
        Ok(XtsBlockCipher {
            key1,
            key2,
            xts: Xts128::new(cipher_1, cipher_2),
        })
    }

    pub fn random() -> Result<Self> {
        let mut key1 = [0u8; 32];
        let mut key2 = [0u8; 32];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key1);
        rng.fill_bytes(&mut key2);
        Self::new(key1, key2)
    }

    pub fn keys(&self) -> (&[u8; 32], &[u8; 32]) {
        (&self.key1, &self.key2)
    }

    fn get_initial_tweak(&self, sector: u64) -> [u8; 16] {
        // First 8 bytes stay zero, the sector number goes little-endian into
        // the second half.
        let mut tweak = [0u8; 16];
        tweak[8..].copy_from_slice(&sector.to_le_bytes());
        tweak
    }

    /// Encrypts `buf` in place; `buf` holds consecutive blocks of
    /// `block_size` bytes starting at `sector_start`.
    pub fn encrypt(&self, buf: &mut [u8], block_size: usize, sector_start: u64) {
        for (i, block) in buf.chunks_exact_mut(block_size).enumerate() {
            let tweak = self.get_initial_tweak(sector_start + i as u64);
            self.xts.encrypt_sector(block, tweak);
        }
    }

    pub fn decrypt(&self, buf: &mut [u8], block_size: usize, sector_start: u64) {
        for (i, block) in buf.chunks_exact_mut(block_size).enumerate() {
            let tweak = self.get_initial_tweak(sector_start + i as u64);
            self.xts.decrypt_sector(block, tweak);
        }
    }
}

impl Clone for XtsBlockCipher {
    fn clone(&self) -> Self {
        let cipher_1 = Aes256::new(GenericArray::from_slice(&self.key1));
        let cipher_2 = Aes256::new(GenericArray::from_slice(&self.key2));
        XtsBlockCipher {
            key1: self.key1,
            key2: self.key2,
            xts: Xts128::new(cipher_1, cipher_2),
        }
    }
}

impl PartialEq for XtsBlockCipher {
    fn eq(&self, other: &Self) -> bool {
        self.key1 == other.key1 && self.key2 == other.key2
    }
}

impl std::fmt::Debug for XtsBlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtsBlockCipher").finish_non_exhaustive()
    }
}
