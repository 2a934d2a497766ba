use std::sync::{Arc, RwLock};

use log::info;
use serde::{Deserialize, Serialize};

use super::XtsBlockCipher;
use crate::{rekey_error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyEpoch(pub u32);

impl std::fmt::Display for KeyEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

/// Key material of one raid group: the epoch data is currently stored under
/// and, while a rekey runs, the epoch it is moving to. An epoch without a
/// cipher means the data is stored in clear.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current_epoch: KeyEpoch,
    current: Option<XtsBlockCipher>,
    next: Option<(KeyEpoch, XtsBlockCipher)>,
}

pub type SharedKeyRing = Arc<RwLock<KeyRing>>;

impl KeyRing {
    pub fn unencrypted() -> Self {
        KeyRing {
            current_epoch: KeyEpoch(0),
            current: None,
            next: None,
        }
    }

    pub fn with_key(epoch: KeyEpoch, cipher: XtsBlockCipher) -> Self {
        KeyRing {
            current_epoch: epoch,
            current: Some(cipher),
            next: None,
        }
    }

    pub fn shared(self) -> SharedKeyRing {
        Arc::new(RwLock::new(self))
    }

    pub fn current_epoch(&self) -> KeyEpoch {
        self.current_epoch
    }

    pub fn current(&self) -> Option<&XtsBlockCipher> {
        self.current.as_ref()
    }

    pub fn next_epoch(&self) -> Option<KeyEpoch> {
        self.next.as_ref().map(|(epoch, _)| *epoch)
    }

    pub fn next(&self) -> Option<&XtsBlockCipher> {
        self.next.as_ref().map(|(_, cipher)| cipher)
    }

    pub fn is_encrypted(&self) -> bool {
        self.current.is_some()
    }

    /// Installs the key the raid group is going to move to.
    pub fn push_next(&mut self, cipher: XtsBlockCipher) -> Result<KeyEpoch> {
        if let Some((epoch, _)) = &self.next {
            return Err(rekey_error!(CryptoError {
                description: format!("Key {epoch} is already pending"),
            }));
        }
        let epoch = KeyEpoch(self.current_epoch.0 + 1);
        self.next = Some((epoch, cipher));
        Ok(epoch)
    }

    /// Makes the pending key current and purges the old key material.
    pub fn rotate(&mut self) -> Result<KeyEpoch> {
        let Some((epoch, cipher)) = self.next.take() else {
            return Err(rekey_error!(CryptoError {
                description: "No pending key to rotate to".to_string(),
            }));
        };
        info!("Purging key {} in favor of {}", self.current_epoch, epoch);
        self.current_epoch = epoch;
        self.current = Some(cipher);
        Ok(epoch)
    }
}
