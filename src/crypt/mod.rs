mod block;
pub use block::XtsBlockCipher;

mod kek;
pub use kek::{CipherMethod, KeyEncryptionCipher};

mod keyring;
pub use keyring::{KeyEpoch, KeyRing, SharedKeyRing};
