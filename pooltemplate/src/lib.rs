//! Template engine: owns the single live `BlockTemplate`, polls the
//! upstream node, and republishes atomically.
//!
//! Grounded on `original_source/proxy/blocks.go: fetchBlockTemplate` for
//! the poll algorithm and on the teacher's `mining/src/pool.rs`
//! `Arc<Mutex<Option<T>>>` "replace whole value" pattern for publication,
//! generalized here to `arc-swap` (see DESIGN.md) for a lock-free swap.

use arc_swap::ArcSwapOption;
use log::info;
use num_bigint::BigUint;
use poolcoinbase::{CoinbaseHalves, CoinbaseInputs, MasterNodeVout};
use poolcore::target::{bits_to_target, target_to_diff};
use poolcore::Uint256;
use poolupstream::UpstreamPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("upstream error: {0}")]
    Upstream(#[from] poolupstream::UpstreamError),

    #[error("coinbase build error: {0}")]
    Coinbase(#[from] poolcoinbase::CoinbaseError),

    #[error("core error: {0}")]
    Core(#[from] poolcore::CoreError),
}

pub type JobId = String;
pub type TxId = Uint256;

#[derive(Clone)]
pub struct BlockTemplateJob {
    pub job_id: JobId,
    pub job_time: u32,
    pub tx_id_list: Vec<TxId>,
    pub merkle_branch: Vec<Uint256>,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub coinbase_value: i64,
    pub tx_fee_total: i64,
    pub default_witness_commitment: String,
}

impl BlockTemplateJob {
    pub fn coinbase1_hex(&self) -> String {
        hex::encode(&self.coinbase1)
    }

    pub fn coinbase2_hex(&self) -> String {
        hex::encode(&self.coinbase2)
    }
}

#[derive(Clone)]
pub struct BlockTemplate {
    pub version: u32,
    pub height: u32,
    pub prev_hash: Uint256,
    pub n_bits: u32,
    pub target: Uint256,
    pub difficulty: BigUint,
    pub jobs: HashMap<JobId, BlockTemplateJob>,
    pub tx_detail: HashMap<TxId, Vec<u8>>,
    pub update_time: u64,
    pub new_template: bool,
    pub last_job_id: JobId,
}

/// Pool-wide coinbase construction parameters, loaded from config.
pub struct CoinbaseParams {
    pub wallet: String,
    pub aux_flags_hex: String,
    pub extras: String,
    pub masternodes: Vec<MasterNodeVout>,
}

/// Owns the live template snapshot, replaced wholesale on every publish.
pub struct TemplateEngine {
    upstream: Arc<UpstreamPool>,
    coinbase_params: CoinbaseParams,
    current: ArcSwapOption<BlockTemplate>,
    block_template_interval_secs: u64,
    last_fetch_unix: AtomicU64,
}

impl TemplateEngine {
    pub fn new(
        upstream: Arc<UpstreamPool>,
        coinbase_params: CoinbaseParams,
        block_template_interval_secs: u64,
    ) -> Self {
        TemplateEngine {
            upstream,
            coinbase_params,
            current: ArcSwapOption::from(None),
            block_template_interval_secs,
            last_fetch_unix: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<BlockTemplate>> {
        self.current.load_full()
    }

    /// Steps 1-6 of the poll loop (spec §4.4). Step 7 (Stratum broadcast)
    /// is the caller's responsibility once this returns `Some`.
    pub async fn poll(&self) -> Result<Option<Arc<BlockTemplate>>, TemplateError> {
        let upstream = self.upstream.active();
        let prev_hash_hex = upstream.get_best_block_hash().await?;

        if let Some(current) = self.current.load_full() {
            let now = now_unix();
            let unchanged = current.prev_hash == Uint256::from_displayed_hex(&prev_hash_hex)?;
            let fresh = now.saturating_sub(self.last_fetch_unix.load(Ordering::Relaxed))
                < self.block_template_interval_secs;
            if unchanged && fresh {
                return Ok(None);
            }
        }

        let tpl = upstream.get_pending_block().await?;
        self.last_fetch_unix.store(now_unix(), Ordering::Relaxed);

        let new_prev_hash = Uint256::from_displayed_hex(&prev_hash_hex)?;
        let current = self.current.load_full();
        let is_new_template = match &current {
            None => true,
            Some(t) => t.prev_hash != new_prev_hash,
        };

        let mut tx_detail = if is_new_template {
            HashMap::new()
        } else {
            current.as_ref().unwrap().tx_detail.clone()
        };
        let mut jobs = if is_new_template {
            HashMap::new()
        } else {
            current.as_ref().unwrap().jobs.clone()
        };

        let mut tx_id_list = Vec::with_capacity(tpl.transactions.len());
        let mut tx_fee_total: i64 = 0;
        for tx in &tpl.transactions {
            let txid = Uint256::from_displayed_hex(&tx.hash)?;
            tx_id_list.push(txid);
            tx_fee_total += tx.fee;
            tx_detail.insert(txid, hex::decode(&tx.data).unwrap_or_default());
        }

        let merkle_branch = poolmerkle::branch(&tx_id_list);

        let masternodes = &self.coinbase_params.masternodes;
        let coinbase_inputs = CoinbaseInputs {
            wallet: &self.coinbase_params.wallet,
            height: tpl.height,
            reward_satoshis: tpl.coinbase_value,
            aux_flags_hex: &self.coinbase_params.aux_flags_hex,
            extras: &self.coinbase_params.extras,
            witness_commitment_hex: &tpl.coinbase_payload,
            masternodes,
        };
        let halves: CoinbaseHalves = poolcoinbase::build(&coinbase_inputs)?;
        let job_id = halves.job_id();

        let job = BlockTemplateJob {
            job_id: job_id.clone(),
            job_time: tpl.curtime,
            tx_id_list,
            merkle_branch,
            coinbase1: halves.coinbase1,
            coinbase2: halves.coinbase2,
            coinbase_value: tpl.coinbase_value,
            tx_fee_total,
            default_witness_commitment: tpl.coinbase_payload.clone(),
        };
        jobs.insert(job_id.clone(), job);

        let n_bits = u32::from_str_radix(&tpl.bits, 16).unwrap_or(0);
        let target = bits_to_target(n_bits);
        let difficulty = target_to_diff(&target);

        let new_template = BlockTemplate {
            version: tpl.version,
            height: tpl.height,
            prev_hash: new_prev_hash,
            n_bits,
            target,
            difficulty,
            jobs,
            tx_detail,
            update_time: now_unix(),
            new_template: is_new_template,
            last_job_id: job_id,
        };

        info!(
            "published template: height={} job={} new_template={}",
            new_template.height, new_template.last_job_id, new_template.new_template
        );
        let published = Arc::new(new_template);
        self.current.store(Some(published.clone()));
        Ok(Some(published))
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_template_has_no_jobs() {
        let tpl = BlockTemplate {
            version: 1,
            height: 1,
            prev_hash: Uint256::ZERO,
            n_bits: 0x1d00ffff,
            target: bits_to_target(0x1d00ffff),
            difficulty: target_to_diff(&bits_to_target(0x1d00ffff)),
            jobs: HashMap::new(),
            tx_detail: HashMap::new(),
            update_time: 0,
            new_template: true,
            last_job_id: String::new(),
        };
        assert!(tpl.jobs.is_empty());
        assert!(tpl.new_template);
    }
}
