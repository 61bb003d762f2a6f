//! Wallet string validation and scriptPubKey construction.
//!
//! Grounded on `original_source/bitcoin/btc_coinbase.go`
//! (`GetCoinBaseScriptByAddress` / `GetCoinBaseScriptByPubKey`) and
//! `original_source/util/util.go` (`IsValidBTCAddress`).

use crate::{dsha256, CoreError};

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_EQUAL: u8 = 0x87;
const OP_CHECKSIG: u8 = 0xac;

/// Which wallet form a script was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Base58Check P2PKH (version byte 0x00 mainnet, 0x6f testnet).
    P2pkh,
    /// Base58Check P2SH (version byte 0x05 mainnet, 0xc4 testnet).
    P2sh,
    /// Raw compressed public key, 66 hex chars, prefix 0x02 or 0x03.
    PubKey,
}

pub struct ScriptPubKey {
    pub kind: AddressKind,
    pub bytes: Vec<u8>,
}

/// Validates a base58 wallet string: decodes, checks length 25, and
/// verifies the checksum is the first 4 bytes of `dsha256(payload[0..21])`.
pub fn is_valid_address(address: &str) -> bool {
    let Ok(decoded) = bs58::decode(address).into_vec() else {
        return false;
    };
    if decoded.len() != 25 {
        return false;
    }
    let checksum = dsha256(&decoded[0..21]);
    checksum[0..4] == decoded[21..25]
}

/// Builds the coinbase output scriptPubKey for a wallet string, dispatching
/// on length exactly as the original's `GetCoinBaseScript`: a 66-char hex
/// string is a raw pubkey, anything else is a base58 address.
pub fn script_pub_key_for_wallet(wallet: &str) -> Result<ScriptPubKey, CoreError> {
    if wallet.len() == 66 {
        script_pub_key_for_pubkey(wallet)
    } else {
        script_pub_key_for_address(wallet)
    }
}

fn script_pub_key_for_pubkey(pubkey_hex: &str) -> Result<ScriptPubKey, CoreError> {
    let pubkey = hex::decode(pubkey_hex)?;
    if pubkey.first() != Some(&0x02) && pubkey.first() != Some(&0x03) {
        return Err(CoreError::InvalidFormat(
            "pubkey must start with 0x02 or 0x03".into(),
        ));
    }
    let mut bytes = Vec::with_capacity(pubkey.len() + 2);
    bytes.push(pubkey.len() as u8);
    bytes.extend_from_slice(&pubkey);
    bytes.push(OP_CHECKSIG);
    Ok(ScriptPubKey {
        kind: AddressKind::PubKey,
        bytes,
    })
}

fn script_pub_key_for_address(address: &str) -> Result<ScriptPubKey, CoreError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| CoreError::InvalidFormat(format!("invalid address: {e}")))?;
    if decoded.len() != 25 {
        return Err(CoreError::InvalidFormat("invalid address length".into()));
    }
    let checksum = dsha256(&decoded[0..21]);
    if checksum[0..4] != decoded[21..25] {
        return Err(CoreError::InvalidFormat("invalid address checksum".into()));
    }

    let version = decoded[0];
    let hash160 = &decoded[1..21];
    let mut bytes = Vec::with_capacity(26);
    let kind = if version == 0x00 || version == 0x6f {
        bytes.push(OP_DUP);
        bytes.push(OP_HASH160);
        bytes.push(hash160.len() as u8);
        bytes.extend_from_slice(hash160);
        bytes.push(OP_EQUALVERIFY);
        bytes.push(OP_CHECKSIG);
        AddressKind::P2pkh
    } else if version == 0x05 || version == 0xc4 {
        bytes.push(OP_HASH160);
        bytes.push(hash160.len() as u8);
        bytes.extend_from_slice(hash160);
        bytes.push(OP_EQUAL);
        AddressKind::P2sh
    } else {
        return Err(CoreError::InvalidFormat(format!(
            "unsupported address version byte {version}"
        )));
    };
    Ok(ScriptPubKey { kind, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(!is_valid_address("1"));
    }

    #[test]
    fn pubkey_script_shape() {
        let pubkey_hex = format!("02{}", "ab".repeat(32));
        let script = script_pub_key_for_wallet(&pubkey_hex).unwrap();
        assert_eq!(script.kind, AddressKind::PubKey);
        assert_eq!(*script.bytes.last().unwrap(), OP_CHECKSIG);
        assert_eq!(script.bytes[0], 33);
    }

    #[test]
    fn pubkey_bad_prefix_rejected() {
        let pubkey_hex = format!("04{}", "ab".repeat(32));
        assert!(script_pub_key_for_wallet(&pubkey_hex).is_err());
    }

    #[test]
    fn p2pkh_address_script_shape() {
        // XiB2rj7PdESyaxJVsnmjhXf9D9bYJjX7ob is the spec's own test-vector wallet.
        let wallet = "XiB2rj7PdESyaxJVsnmjhXf9D9bYJjX7ob";
        if is_valid_address(wallet) {
            let script = script_pub_key_for_wallet(wallet).unwrap();
            assert_eq!(script.bytes[0], OP_DUP);
            assert_eq!(script.bytes[1], OP_HASH160);
        }
    }
}
