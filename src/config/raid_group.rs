use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::crypt::{KeyEncryptionCipher, KeyEpoch, KeyRing, XtsBlockCipher};
use crate::raid::{RaidGeometry, RaidType};
use crate::rekey::paged::MAX_CHUNKS_PER_BLOCK;
use crate::{rekey_error, Result, ResultExt};

/// One XTS key pair as stored in configuration, possibly wrapped by the
/// key-encryption key.
#[serde_as]
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct XtsKeyPair {
    #[serde_as(as = "Base64")]
    pub key1: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub key2: Vec<u8>,
}

impl std::fmt::Debug for XtsKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtsKeyPair")
            .field("key1", &"[REDACTED]")
            .field("key2", &"[REDACTED]")
            .finish()
    }
}

impl XtsKeyPair {
    pub fn to_cipher(&self, kek: &KeyEncryptionCipher) -> Result<XtsBlockCipher> {
        let (key1, key2) = kek.unwrap_xts_keys(&self.key1, &self.key2)?;
        XtsBlockCipher::new(key1, key2)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Absent when the raid group stores data in clear.
    #[serde(default)]
    pub current: Option<XtsKeyPair>,
    #[serde(default = "default_epoch")]
    pub epoch: u32,
    /// Key to move to on the next rekey; a random key is generated otherwise.
    #[serde(default)]
    pub next: Option<XtsKeyPair>,
}

impl KeyConfig {
    pub fn build_keyring(&self, kek: &KeyEncryptionCipher) -> Result<KeyRing> {
        let mut ring = match &self.current {
            Some(pair) => KeyRing::with_key(
                KeyEpoch(self.epoch),
                pair.to_cipher(kek).context("Unwrapping current key failed")?,
            ),
            None => KeyRing::unencrypted(),
        };
        if let Some(pair) = &self.next {
            ring.push_next(pair.to_cipher(kek).context("Unwrapping next key failed")?)?;
        }
        Ok(ring)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RaidGroupConfig {
    pub id: u32,
    pub raid_type: RaidType,
    pub width: usize,
    #[serde(default = "default_chunk_sectors")]
    pub chunk_sectors: u64,
    pub chunk_count: u64,
    #[serde(default = "default_chunks_per_paged_block")]
    pub chunks_per_paged_block: u64,
    #[serde(default)]
    pub keys: KeyConfig,
}

impl RaidGroupConfig {
    pub fn geometry(&self) -> Result<RaidGeometry> {
        RaidGeometry::new(self.raid_type, self.width, self.chunk_sectors, self.chunk_count)
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry()?;
        if self.chunks_per_paged_block == 0 || self.chunks_per_paged_block > MAX_CHUNKS_PER_BLOCK {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "chunks_per_paged_block {} is out of range (must be 1..={MAX_CHUNKS_PER_BLOCK})",
                    self.chunks_per_paged_block
                ),
            }));
        }
        Ok(())
    }
}

fn default_epoch() -> u32 {
    1
}

fn default_chunk_sectors() -> u64 {
    8
}

fn default_chunks_per_paged_block() -> u64 {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CipherMethod;

    const YAML: &str = r#"
id: 7
raid_type: raid5
width: 5
chunk_count: 9
chunks_per_paged_block: 3
keys:
  current:
    key1: AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=
    key2: AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=
  epoch: 3
"#;

    #[test]
    fn raid_group_config_parses_with_defaults() {
        let config: RaidGroupConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.id, 7);
        assert_eq!(config.raid_type, RaidType::Raid5);
        assert_eq!(config.chunk_sectors, 8);
        assert!(config.validate().is_ok());

        let ring = config.keys.build_keyring(&KeyEncryptionCipher::default()).unwrap();
        assert_eq!(ring.current_epoch(), KeyEpoch(3));
        assert_eq!(ring.current().unwrap().keys(), (&[1u8; 32], &[2u8; 32]));
        assert!(ring.next().is_none());
    }

    #[test]
    fn wrapped_keys_are_unwrapped_with_kek() {
        let kek = KeyEncryptionCipher {
            method: CipherMethod::Aes256Gcm,
            key: Some(vec![0x33u8; 32]),
            init_vector: Some(vec![0x44u8; 12]),
            auth_data: Some(b"rg".to_vec()),
        };
        let (key1, key2) = kek.wrap_xts_keys(&[5u8; 32], &[6u8; 32]).unwrap();
        let keys = KeyConfig {
            current: None,
            epoch: 1,
            next: Some(XtsKeyPair { key1, key2 }),
        };
        let ring = keys.build_keyring(&kek).unwrap();
        assert!(!ring.is_encrypted());
        assert_eq!(ring.next().unwrap().keys(), (&[5u8; 32], &[6u8; 32]));
    }

    #[test]
    fn paged_block_fanout_is_bounded() {
        let mut config: RaidGroupConfig = serde_yaml::from_str(YAML).unwrap();
        config.chunks_per_paged_block = 0;
        assert!(config.validate().is_err());
        config.chunks_per_paged_block = MAX_CHUNKS_PER_BLOCK + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_pair_debug_is_redacted() {
        let pair = XtsKeyPair {
            key1: vec![1; 32],
            key2: vec![2; 32],
        };
        let rendered = format!("{pair:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("[1, 1"));
    }
}
