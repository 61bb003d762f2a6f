//! Share Processor (C6).
//!
//! Grounded on `original_source/proxy/miner.go` (`processShare`,
//! `DoubleSha256HashVerify`) and `proxy/blocks.go` (`ConstructRawBlockHex`).

use poolcore::target::target_to_diff;
use poolcore::{dsha256, Uint256};
use pooltemplate::BlockTemplate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("coinbase error: {0}")]
    Coinbase(#[from] poolcoinbase::CoinbaseError),

    #[error("core error: {0}")]
    Core(#[from] poolcore::CoreError),

    #[error("missing tx detail for txid in template")]
    MissingTxDetail,
}

pub struct ShareSubmission<'a> {
    pub job_id: &'a str,
    pub extranonce2_hex: &'a str,
    pub ntime_hex: &'a str,
    pub nonce_hex: &'a str,
}

#[derive(Debug)]
pub enum ShareOutcome {
    /// The referenced job id is no longer known (template rolled over).
    Stale,
    /// The share hash fails even the session's own target.
    Reject,
    /// The share meets the session target but not the network target.
    Valid,
    /// The share meets the network target: a block was found.
    Block { raw_block_hex: String },
}

/// Verifies one submission against a template snapshot and produces the
/// acceptance outcome. Pure and synchronous: all I/O (backend writes,
/// block submission) is the caller's responsibility, matching spec §4.6's
/// suspension-point note that share verification itself never suspends.
pub fn process_share(
    template: &BlockTemplate,
    share_target: &Uint256,
    submission: &ShareSubmission,
    extranonce1: &[u8],
) -> Result<ShareOutcome, ShareError> {
    let job = match template.jobs.get(submission.job_id) {
        Some(job) => job,
        None => return Ok(ShareOutcome::Stale),
    };

    let extranonce2 = hex::decode(submission.extranonce2_hex)?;
    let ntime = u32::from_str_radix(submission.ntime_hex, 16).map_err(|_| {
        poolcore::CoreError::InvalidFormat("invalid ntime".into())
    })?;
    let nonce = u32::from_str_radix(submission.nonce_hex, 16).map_err(|_| {
        poolcore::CoreError::InvalidFormat("invalid nonce".into())
    })?;

    let mut coinbase_bytes = Vec::with_capacity(
        job.coinbase1.len() + job.coinbase2.len() + extranonce1.len() + extranonce2.len(),
    );
    coinbase_bytes.extend_from_slice(&job.coinbase1);
    coinbase_bytes.extend_from_slice(extranonce1);
    coinbase_bytes.extend_from_slice(&extranonce2);
    coinbase_bytes.extend_from_slice(&job.coinbase2);

    let coinbase_txid = Uint256::from_internal(dsha256(&coinbase_bytes));
    let merkle_root = poolmerkle::root(&coinbase_txid, &job.merkle_branch);

    let header = build_header(
        template.version,
        &template.prev_hash,
        &merkle_root,
        ntime,
        template.n_bits,
        nonce,
    );
    let header_hash = Uint256::from_internal(dsha256(&header));
    let hash_diff = target_to_diff(&header_hash);
    let share_diff = target_to_diff(share_target);

    if hash_diff <= share_diff {
        return Ok(ShareOutcome::Reject);
    }

    if hash_diff > template.difficulty {
        let raw_block_hex = assemble_block_hex(template, job, &coinbase_bytes, &header)?;
        return Ok(ShareOutcome::Block { raw_block_hex });
    }

    Ok(ShareOutcome::Valid)
}

fn build_header(
    version: u32,
    prev_hash: &Uint256,
    merkle_root: &Uint256,
    ntime: u32,
    n_bits: u32,
    nonce: u32,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(80);
    header.extend_from_slice(&(version as i32).to_le_bytes());
    header.extend_from_slice(prev_hash.internal_bytes());
    header.extend_from_slice(merkle_root.internal_bytes());
    header.extend_from_slice(&ntime.to_le_bytes());
    header.extend_from_slice(&n_bits.to_le_bytes());
    header.extend_from_slice(&nonce.to_le_bytes());
    header
}

/// `block_header_bytes || varint(1 + |tx_id_list|) || coinbase_tx_bytes ||
/// concat(tx_detail[txid] for txid in tx_id_list)`, per spec §4.6.
fn assemble_block_hex(
    template: &BlockTemplate,
    job: &pooltemplate::BlockTemplateJob,
    coinbase_bytes: &[u8],
    header: &[u8],
) -> Result<String, ShareError> {
    let mut block = Vec::new();
    block.extend_from_slice(header);
    push_compact_size(&mut block, 1 + job.tx_id_list.len() as u64);
    block.extend_from_slice(coinbase_bytes);
    for txid in &job.tx_id_list {
        let raw_tx = template
            .tx_detail
            .get(txid)
            .ok_or(ShareError::MissingTxDetail)?;
        block.extend_from_slice(raw_tx);
    }
    Ok(hex::encode(block))
}

fn push_compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolcore::target::bits_to_target;
    use pooltemplate::BlockTemplateJob;
    use std::collections::HashMap;

    fn sample_template() -> BlockTemplate {
        let n_bits = 0x1d00ffff;
        BlockTemplate {
            version: 1,
            height: 1,
            prev_hash: Uint256::ZERO,
            n_bits,
            target: bits_to_target(n_bits),
            difficulty: target_to_diff(&bits_to_target(n_bits)),
            jobs: HashMap::new(),
            tx_detail: HashMap::new(),
            update_time: 0,
            new_template: true,
            last_job_id: String::new(),
        }
    }

    #[test]
    fn unknown_job_id_is_stale() {
        let template = sample_template();
        let submission = ShareSubmission {
            job_id: "missing",
            extranonce2_hex: "00000000",
            ntime_hex: "00000000",
            nonce_hex: "00000000",
        };
        let outcome =
            process_share(&template, &Uint256::ZERO, &submission, &[0u8; 4]).unwrap();
        assert!(matches!(outcome, ShareOutcome::Stale));
    }

    #[test]
    fn easy_share_target_is_valid_or_block() {
        let mut template = sample_template();
        let coinbase_inputs = poolcoinbase::CoinbaseInputs {
            wallet: &format!("02{}", "11".repeat(32)),
            height: 1,
            reward_satoshis: 1,
            aux_flags_hex: "",
            extras: "",
            witness_commitment_hex: "",
            masternodes: &[],
        };
        let halves = poolcoinbase::build(&coinbase_inputs).unwrap();
        let job = BlockTemplateJob {
            job_id: halves.job_id(),
            job_time: 1,
            tx_id_list: vec![],
            merkle_branch: vec![],
            coinbase1: halves.coinbase1,
            coinbase2: halves.coinbase2,
            coinbase_value: 1,
            tx_fee_total: 0,
            default_witness_commitment: String::new(),
        };
        let job_id = job.job_id.clone();
        template.jobs.insert(job_id.clone(), job);

        // A near-maximal target accepts virtually any hash as a valid share.
        let easy_target = Uint256::from_internal([0xff; 32]);
        let submission = ShareSubmission {
            job_id: &job_id,
            extranonce2_hex: "00000000",
            ntime_hex: "00000001",
            nonce_hex: "00000001",
        };
        let outcome = process_share(&template, &easy_target, &submission, &[0u8; 4]).unwrap();
        assert!(matches!(
            outcome,
            ShareOutcome::Valid | ShareOutcome::Block { .. }
        ));
    }
}
