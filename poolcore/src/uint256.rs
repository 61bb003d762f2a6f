//! A 32-byte scalar with two orderings: internal (little-endian, as
//! serialized on the wire) and displayed (big-endian hex, as Bitcoin RPC
//! returns). Hash comparisons use displayed form; serialization uses
//! internal form.

use crate::CoreError;
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Uint256(#[serde(with = "serde_bytes_32")] pub [u8; 32]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0u8; 32]);

    /// Internal (little-endian) byte representation, as it appears on the wire.
    pub fn from_internal(bytes: [u8; 32]) -> Self {
        Uint256(bytes)
    }

    pub fn internal_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a big-endian hex string (the "displayed" form RPC returns).
    pub fn from_displayed_hex(hex_str: &str) -> Result<Self, CoreError> {
        let mut bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(CoreError::InvalidFormat(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Uint256(out))
    }

    /// Renders as big-endian hex (the "displayed" form).
    pub fn to_displayed_hex(&self) -> String {
        let mut be = self.0;
        be.reverse();
        hex::encode(be)
    }

    pub fn to_big_uint(&self) -> BigUint {
        let mut be = self.0;
        be.reverse();
        BigUint::from_bytes_be(&be)
    }

    pub fn from_big_uint(value: &BigUint) -> Self {
        let be = value.to_bytes_be();
        let mut padded = [0u8; 32];
        if be.len() <= 32 {
            padded[32 - be.len()..].copy_from_slice(&be);
        } else {
            padded.copy_from_slice(&be[be.len() - 32..]);
        }
        padded.reverse();
        Uint256(padded)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint256({})", self.to_displayed_hex())
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_displayed_hex())
    }
}

/// Reorders the 32 internal bytes by reversing each of eight 4-byte groups,
/// the byte order Stratum `mining.notify` expects for the previous-hash field.
pub fn stratum_byte_order(internal: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..8 {
        for j in 0..4 {
            out[i * 4 + j] = internal[i * 4 + (3 - j)];
        }
    }
    out
}

pub fn pow256() -> BigUint {
    BigUint::from(1u8) << 256
}

pub fn checked_div_pow256(divisor: &BigUint) -> BigUint {
    if divisor.is_zero() {
        return BigUint::zero();
    }
    pow256() / divisor
}

mod serde_bytes_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if v.len() != 32 {
            return Err(serde::de::Error::custom("expected 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&v);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displayed_roundtrip() {
        let hex_str = "00000000ffff0000000000000000000000000000000000000000000000000000"
            [..64]
            .to_string();
        let u = Uint256::from_displayed_hex(&hex_str).unwrap();
        assert_eq!(u.to_displayed_hex(), hex_str);
    }

    #[test]
    fn stratum_order_reverses_each_group() {
        let mut internal = [0u8; 32];
        for (i, b) in internal.iter_mut().enumerate() {
            *b = i as u8;
        }
        let reordered = stratum_byte_order(&internal);
        assert_eq!(&reordered[0..4], &[3, 2, 1, 0]);
        assert_eq!(&reordered[4..8], &[7, 6, 5, 4]);
    }

    #[test]
    fn zero_is_zero() {
        assert!(Uint256::ZERO.is_zero());
    }
}
