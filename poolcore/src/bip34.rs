//! BIP34 coinbase height/extra-nonce push encoding.
//!
//! Bit-exact port of `original_source/bitcoin/btc_coinbase.go: PackNumber`:
//! values <= 127 push the least-significant byte straight through with a
//! length prefix of 1; larger values add a length byte per extra 256-chunk.

/// Encodes `num` as `[len, byte_0, byte_1, ..., byte_n]`, little-endian,
/// matching the original's length-prefixed push used for BIP34 block height.
pub fn pack_number(mut num: i64) -> Vec<u8> {
    let mut out = vec![0x1u8];
    while num > 127 {
        out[0] += 1;
        out.push((num % 256) as u8);
        num /= 256;
    }
    out.push(num as u8);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_value_passes_through() {
        assert_eq!(pack_number(1), vec![0x1, 0x1]);
        assert_eq!(pack_number(127), vec![0x1, 127]);
    }

    #[test]
    fn multi_byte_height() {
        // height 277945 -> matches the original's chunked little-endian push.
        let packed = pack_number(277945);
        assert_eq!(packed[0] as usize, packed.len() - 1);
        let mut reconstructed: i64 = 0;
        for (i, b) in packed[1..].iter().enumerate() {
            reconstructed |= (*b as i64) << (8 * i);
        }
        assert_eq!(reconstructed, 277945);
    }

    #[test]
    fn length_prefix_matches_body_len() {
        for h in [0i64, 1, 126, 127, 128, 1000, 65536, 700_000, 1_000_000] {
            let packed = pack_number(h);
            assert_eq!(packed[0] as usize, packed.len() - 1);
        }
    }
}
