//! Shared primitives for the mining pool front-end: a 256-bit scalar with
//! internal/displayed orderings, target/difficulty conversions, Bitcoin
//! address validation and the quirky BIP34 height-push encoding.

use thiserror::Error;

pub mod address;
pub mod bip34;
pub mod target;
pub mod uint256;

pub use address::{is_valid_address, AddressKind, ScriptPubKey};
pub use bip34::pack_number;
pub use target::{bits_to_target, diff_to_target, target_to_diff, target_to_stratum};
pub use uint256::Uint256;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("base58 decoding error: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

/// Double SHA-256, used for every hash in this system.
pub fn dsha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CoreError> {
    Ok(hex::decode(hex_str)?)
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
