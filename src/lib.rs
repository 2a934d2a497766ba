pub mod block_device;
pub mod cli;
pub mod config;
pub mod control;
pub mod crypt;
pub mod error;
pub mod raid;
pub mod rekey;
pub mod sim;
pub mod utils;

pub use crypt::{CipherMethod, KeyEncryptionCipher};
pub use error::{Error, ErrorLocation, ErrorMeta, RekeyError, Result, ResultExt};
pub use rgrekey_macros::error_context;
