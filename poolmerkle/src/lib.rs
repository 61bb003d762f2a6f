//! Merkle branch/root construction for coinbase-aware block templates.
//!
//! Grounded bit-for-bit on `original_source/bitcoin/btc_merkle_tree.go`:
//! a nil (all-zero) placeholder stands in for the coinbase transaction while
//! the branch is built, so the branch hashes never depend on the coinbase
//! txid itself — only the final root combines the real coinbase hash with
//! the recorded branch, in order.

use poolcore::{dsha256, Uint256};

/// Computes the merkle branch for the non-coinbase transactions of a block,
/// following the original's `UpdateMerkleBranch`: a nil placeholder is
/// prepended for the coinbase slot, and at each reduction round the second
/// element of the working list is recorded as a branch entry before the
/// list is pairwise hashed down. Odd-length rounds duplicate the last
/// element, mirroring Bitcoin's classic merkle tree.
pub fn branch(txids: &[Uint256]) -> Vec<Uint256> {
    let mut branch = Vec::new();
    let mut list: Vec<Uint256> = std::iter::once(Uint256::ZERO)
        .chain(txids.iter().copied())
        .collect();

    while list.len() > 1 {
        branch.push(list[1]);

        if list.len() % 2 == 1 {
            let last = *list.last().unwrap();
            list.push(last);
        }

        let mut next = vec![Uint256::ZERO];
        let mut i = 2;
        while i < list.len() {
            next.push(combine(&list[i], &list[i + 1]));
            i += 2;
        }
        list = next;
    }

    branch
}

/// Folds the real coinbase txid through the branch in order, producing the
/// merkle root, per the original's `CalcMerkleRoot`.
pub fn root(coinbase_txid: &Uint256, branch: &[Uint256]) -> Uint256 {
    let mut acc = *coinbase_txid;
    for sibling in branch {
        acc = combine(&acc, sibling);
    }
    acc
}

fn combine(a: &Uint256, b: &Uint256) -> Uint256 {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(a.internal_bytes());
    buf.extend_from_slice(b.internal_bytes());
    Uint256::from_internal(dsha256(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(byte: u8) -> Uint256 {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        Uint256::from_internal(bytes)
    }

    #[test]
    fn single_transaction_branch_is_empty() {
        let coinbase = txid(1);
        let b = branch(&[]);
        assert!(b.is_empty());
        assert_eq!(root(&coinbase, &b), coinbase);
    }

    #[test]
    fn two_transactions_single_branch_entry() {
        let other = txid(2);
        let b = branch(&[other]);
        assert_eq!(b, vec![other]);

        let coinbase = txid(1);
        let expected = combine(&coinbase, &other);
        assert_eq!(root(&coinbase, &b), expected);
    }

    #[test]
    fn odd_transaction_count_duplicates_last() {
        // list = [nil, tx2, tx3, tx4]: first round records tx2, then pads
        // nothing (length 4 is even) and reduces [tx3, tx4] to one hash.
        let txs = vec![txid(2), txid(3), txid(4)];
        let b = branch(&txs);
        let expected = vec![txs[0], combine(&txs[1], &txs[2])];
        assert_eq!(b, expected);

        let coinbase = txid(1);
        let expected_root = combine(&combine(&coinbase, &expected[0]), &expected[1]);
        assert_eq!(root(&coinbase, &b), expected_root);
    }
}
