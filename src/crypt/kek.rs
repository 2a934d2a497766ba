use std::path::Path;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use log::error;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::{rekey_error, RekeyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherMethod {
    #[default]
    None,
    Aes256Gcm,
}

/// Key-encryption key protecting the XTS key material of a raid group's
/// key epochs while it sits in configuration.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KeyEncryptionCipher {
    pub method: CipherMethod,

    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub key: Option<Vec<u8>>,

    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub init_vector: Option<Vec<u8>>,

    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub auth_data: Option<Vec<u8>>,
}

type KekNonce = Nonce<<Aes256Gcm as AeadCore>::NonceSize>;

impl KeyEncryptionCipher {
    fn init_cipher_context(&self) -> Result<(Aes256Gcm, KekNonce, &[u8])> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| param_err("Key is required"))?;
        let iv = self
            .init_vector
            .as_ref()
            .ok_or_else(|| param_err("Initialization vector is required"))?;
        let auth_data = self
            .auth_data
            .as_ref()
            .ok_or_else(|| param_err("Authentication data is required"))?;

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
            let msg = format!("Failed to initialize cipher: {e}");
            error!("{}", msg);
            param_err(msg)
        })?;

        if iv.len() != 12 {
            let msg = "Initialization vector must be exactly 12 bytes";
            error!("{}", msg);
            return Err(param_err(msg));
        }
        let nonce = KekNonce::from_slice(iv);

        Ok((cipher, *nonce, auth_data))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(KeyEncryptionCipher::default());
        };
        let file = std::fs::File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| {
            rekey_error!(InvalidParameter {
                description: format!("Error parsing KEK file {}: {e}", path.display()),
            })
        })
    }

    /// Unwraps an XTS key pair. With `CipherMethod::None` the inputs are
    /// already plain text and only their length is checked.
    pub fn unwrap_xts_keys(&self, key1: &[u8], key2: &[u8]) -> Result<([u8; 32], [u8; 32])> {
        match self.method {
            CipherMethod::None => Ok((ensure_32_bytes(key1.to_vec())?, ensure_32_bytes(key2.to_vec())?)),
            CipherMethod::Aes256Gcm => {
                let (cipher, nonce, aad) = self.init_cipher_context()?;
                let k1 = decrypt_bytes(&cipher, &nonce, aad, key1)?;
                let k2 = decrypt_bytes(&cipher, &nonce, aad, key2)?;
                Ok((ensure_32_bytes(k1)?, ensure_32_bytes(k2)?))
            }
        }
    }

    pub fn wrap_xts_keys(&self, key1: &[u8; 32], key2: &[u8; 32]) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.method {
            CipherMethod::None => Ok((key1.to_vec(), key2.to_vec())),
            CipherMethod::Aes256Gcm => {
                let (cipher, nonce, aad) = self.init_cipher_context()?;
                let encrypt = |msg: &[u8]| {
                    cipher.encrypt(&nonce, Payload { msg, aad }).map_err(|e| {
                        rekey_error!(CryptoError {
                            description: format!("Failed to encrypt key material: {e}"),
                        })
                    })
                };
                Ok((encrypt(key1)?, encrypt(key2)?))
            }
        }
    }
}

fn decrypt_bytes(cipher: &Aes256Gcm, nonce: &KekNonce, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| {
            let msg = format!("Failed to decrypt data: {e}");
            error!("{}", msg);
            param_err(msg)
        })
}

fn ensure_32_bytes(data: Vec<u8>) -> Result<[u8; 32]> {
    data.try_into().map_err(|_| {
        let msg = "Key length must be exactly 32 bytes";
        error!("{}", msg);
        param_err(msg)
    })
}

fn param_err(description: impl Into<String>) -> RekeyError {
    rekey_error!(InvalidParameter {
        description: description.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcm_kek() -> KeyEncryptionCipher {
        KeyEncryptionCipher {
            method: CipherMethod::Aes256Gcm,
            key: Some(vec![0x11u8; 32]),
            init_vector: Some(vec![0x22u8; 12]),
            auth_data: Some(b"rg-keys".to_vec()),
        }
    }

    #[test]
    fn test_wrap_then_unwrap_with_gcm() {
        let kek = gcm_kek();
        let (wrapped1, wrapped2) = kek.wrap_xts_keys(&[0xAA; 32], &[0xBB; 32]).unwrap();
        assert_ne!(wrapped1, vec![0xAA; 32]);
        let (k1, k2) = kek.unwrap_xts_keys(&wrapped1, &wrapped2).unwrap();
        assert_eq!(k1, [0xAA; 32]);
        assert_eq!(k2, [0xBB; 32]);
    }

    #[test]
    fn test_none_method_passes_keys_through() {
        let kek = KeyEncryptionCipher::default();
        let (k1, k2) = kek.unwrap_xts_keys(&[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(k1, [1u8; 32]);
        assert_eq!(k2, [2u8; 32]);
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let kek = gcm_kek();
        let (mut wrapped1, wrapped2) = kek.wrap_xts_keys(&[0xAA; 32], &[0xBB; 32]).unwrap();
        let last = wrapped1.len() - 1;
        wrapped1[last] ^= 0xFF;
        let res = kek.unwrap_xts_keys(&wrapped1, &wrapped2);
        assert!(matches!(res, Err(RekeyError::InvalidParameter { .. })));
    }

    #[test]
    fn test_missing_key_parameter() {
        let kek = KeyEncryptionCipher {
            key: None,
            ..gcm_kek()
        };
        let res = kek.unwrap_xts_keys(&[], &[]);
        assert!(
            matches!(res, Err(RekeyError::InvalidParameter { ref description, .. }) if description == "Key is required")
        );
    }

    #[test]
    fn test_short_key_is_rejected() {
        let kek = KeyEncryptionCipher::default();
        let res = kek.unwrap_xts_keys(&[1u8; 31], &[2u8; 32]);
        assert!(
            matches!(res, Err(RekeyError::InvalidParameter { ref description, .. }) if description.contains("exactly 32 bytes"))
        );
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek.yaml");
        std::fs::write(
            &path,
            "method: aes256-gcm\nkey: ERERERERERERERERERERERERERERERERERERERERERE=\ninit_vector: IiIiIiIiIiIiIiIi\nauth_data: cmcta2V5cw==\n",
        )
        .unwrap();
        let kek = KeyEncryptionCipher::load(Some(&path)).unwrap();
        assert_eq!(kek.method, CipherMethod::Aes256Gcm);
        assert_eq!(kek.key, Some(vec![0x11u8; 32]));
        assert_eq!(kek.init_vector, Some(vec![0x22u8; 12]));
        assert_eq!(kek.auth_data, Some(b"rg-keys".to_vec()));
    }
}
