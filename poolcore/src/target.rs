//! Target <-> difficulty conversions and compact-bits decoding.
//!
//! Grounded on `original_source/util/util.go` (`GetTargetHex` /
//! `TargetHexToDiff`), generalized from `math/big.Int` to `num_bigint`.

use crate::uint256::{checked_div_pow256, pow256, stratum_byte_order};
use crate::Uint256;
use num_bigint::BigUint;
use num_traits::Zero;

/// `floor(2^256 / target)`, matching the original's `pow256.Div(pow256, target)`.
pub fn target_to_diff(target: &Uint256) -> BigUint {
    checked_div_pow256(&target.to_big_uint())
}

/// `floor(2^256 / difficulty)`, the inverse of `target_to_diff`.
pub fn diff_to_target(difficulty: &BigUint) -> Uint256 {
    if difficulty.is_zero() {
        return Uint256::from_big_uint(&(pow256() - BigUint::from(1u8)));
    }
    Uint256::from_big_uint(&(pow256() / difficulty))
}

/// Decodes a Bitcoin compact-bits `n_bits` value into a 256-bit target.
pub fn bits_to_target(bits: u32) -> Uint256 {
    let exponent = (bits >> 24) as u32;
    let mantissa = BigUint::from(bits & 0x00ff_ffff);
    let value = if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    };
    Uint256::from_big_uint(&value)
}

/// Re-orders a displayed-hex hash into the byte order Stratum `mining.notify`
/// expects for the previous-hash parameter.
pub fn target_to_stratum(displayed_hex: &str) -> Result<String, crate::CoreError> {
    let internal = Uint256::from_displayed_hex(displayed_hex)?;
    Ok(hex::encode(stratum_byte_order(internal.internal_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_target_inverse() {
        for d in [1u64, 2, 1000, 1_000_000, 19_160_000_000_000] {
            let diff = BigUint::from(d);
            let target = diff_to_target(&diff);
            let back = target_to_diff(&target);
            assert_eq!(back, diff, "round trip failed for {d}");
        }
    }

    #[test]
    fn genesis_bits_decode_to_expected_prefix() {
        // Bitcoin's genesis difficulty-1 target: 0x1d00ffff.
        let target = bits_to_target(0x1d00ffff);
        let hex_str = target.to_displayed_hex();
        assert!(hex_str.starts_with("00000000ffff"));
    }

    #[test]
    fn stratum_reorders_prev_hash() {
        let hex_str = format!("{}01", "0".repeat(62));
        assert_eq!(hex_str.len(), 64);
        let out = target_to_stratum(&hex_str).unwrap();
        assert_eq!(out.len(), 64);
    }
}
