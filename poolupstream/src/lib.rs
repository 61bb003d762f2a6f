//! JSON-RPC client for the upstream Bitcoin node.
//!
//! Inverts the teacher's `rpc/src/lib.rs` axum server pattern into an
//! outbound `reqwest` client, carrying over its error-taxonomy shape
//! (a `thiserror` enum, `log` facade). The sickness tracking and
//! multi-upstream rotation are grounded on
//! `original_source/rpc/rpc.go` (`markSick`/`markAlive`) and
//! `original_source/proxy/proxy.go` (`checkUpstreams`).

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SICK_THRESHOLD: u32 = 5;
const SUCCESS_THRESHOLD: u32 = 5;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("unexpected empty result for method {0}")]
    EmptyResult(&'static str),

    #[error("deserialization error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CoinBaseAux {
    pub flags: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BlockTplTransaction {
    pub data: String,
    pub hash: String,
    pub fee: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MasterNode {
    pub payee: String,
    pub script: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BlockTemplateReply {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub transactions: Vec<BlockTplTransaction>,
    #[serde(rename = "coinbaseaux")]
    pub coinbase_aux: CoinBaseAux,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: i64,
    pub curtime: u32,
    pub bits: String,
    pub target: String,
    pub height: u32,
    #[serde(rename = "coinbase_payload", default)]
    pub coinbase_payload: String,
    #[serde(rename = "masternode", default)]
    pub masternodes: Vec<MasterNode>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BlockReply {
    pub height: u32,
    pub hash: String,
    pub nonce: u32,
    pub difficulty: f64,
    #[serde(default)]
    pub tx: Vec<Value>,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u32,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

/// A single upstream Bitcoin node connection, tracking its own sickness
/// state independently of any other upstream.
pub struct UpstreamClient {
    pub name: String,
    url: String,
    http: reqwest::Client,
    sick_rate: AtomicUsize,
    success_rate: AtomicUsize,
}

impl UpstreamClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        UpstreamClient {
            name: name.into(),
            url: url.into(),
            http,
            sick_rate: AtomicUsize::new(0),
            success_rate: AtomicUsize::new(0),
        }
    }

    pub fn is_sick(&self) -> bool {
        self.sick_rate.load(Ordering::Relaxed) >= SICK_THRESHOLD as usize
    }

    fn mark_sick(&self) {
        self.sick_rate.fetch_add(1, Ordering::Relaxed);
        self.success_rate.store(0, Ordering::Relaxed);
    }

    fn mark_ok(&self) {
        let successes = self.success_rate.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= SUCCESS_THRESHOLD as usize {
            self.sick_rate.store(0, Ordering::Relaxed);
            self.success_rate.store(0, Ordering::Relaxed);
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 0,
        };
        let resp = match self.http.post(&self.url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_sick();
                return Err(UpstreamError::Transport(e));
            }
        };

        let parsed: Result<JsonRpcResponse, _> = resp.json().await.map_err(UpstreamError::Transport);
        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                self.mark_sick();
                return Err(e);
            }
        };

        if let Some(error) = parsed.error {
            self.mark_sick();
            return Err(UpstreamError::Rpc(error.to_string()));
        }

        self.mark_ok();
        parsed.result.ok_or(UpstreamError::EmptyResult("rpc"))
    }

    pub async fn get_best_block_hash(&self) -> Result<String, UpstreamError> {
        let value = self
            .call("getbestblockhash", serde_json::json!([]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_pending_block(&self) -> Result<BlockTemplateReply, UpstreamError> {
        let value = self
            .call("getblocktemplate", serde_json::json!([]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, UpstreamError> {
        let value = self
            .call("getblockhash", serde_json::json!([height]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_block(&self, hash: &str) -> Result<BlockReply, UpstreamError> {
        let value = self
            .call("getblock", serde_json::json!([hash, 2]))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn submit_block(&self, raw_hex: &str) -> Result<(), UpstreamError> {
        let value = self
            .call("submitblock", serde_json::json!([raw_hex]))
            .await?;
        if value.is_null() {
            return Ok(());
        }
        if let Some(reason) = value.as_str() {
            return Err(UpstreamError::Rpc(reason.to_string()));
        }
        Ok(())
    }

    /// Liveness probe used by rotation: a successful `getbestblockhash`
    /// marks the client alive, any failure leaves its sickness untouched
    /// beyond what the failed call itself already recorded.
    pub async fn check(&self) -> bool {
        matches!(self.get_best_block_hash().await, Ok(_)) && !self.is_sick()
    }
}

/// Rotates across configured upstreams, always routing calls to the first
/// non-sick one, per `proxy.go: checkUpstreams`.
pub struct UpstreamPool {
    upstreams: Vec<Arc<UpstreamClient>>,
    active: AtomicUsize,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<Arc<UpstreamClient>>) -> Self {
        assert!(!upstreams.is_empty(), "at least one upstream is required");
        UpstreamPool {
            upstreams,
            active: AtomicUsize::new(0),
        }
    }

    pub fn active(&self) -> Arc<UpstreamClient> {
        let i = self.active.load(Ordering::Relaxed);
        self.upstreams[i].clone()
    }

    /// Probes every upstream, and if a different (non-sick) one responded
    /// healthy, switches the active index to it.
    pub async fn check_upstreams(&self) {
        let mut candidate = 0usize;
        let mut found = false;
        for (i, upstream) in self.upstreams.iter().enumerate() {
            if upstream.check().await && !found {
                candidate = i;
                found = true;
            }
        }
        let current = self.active.load(Ordering::Relaxed);
        if current != candidate {
            info!(
                "switching upstream from {} to {}",
                self.upstreams[current].name, self.upstreams[candidate].name
            );
            self.active.store(candidate, Ordering::Relaxed);
        } else if !found {
            warn!("no healthy upstream found during rotation check");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sickness_threshold_marks_sick_after_five() {
        let client = UpstreamClient::new("n", "http://example.invalid", Duration::from_secs(1));
        for _ in 0..4 {
            client.mark_sick();
        }
        assert!(!client.is_sick());
        client.mark_sick();
        assert!(client.is_sick());
    }

    #[test]
    fn five_successes_clears_sickness() {
        let client = UpstreamClient::new("n", "http://example.invalid", Duration::from_secs(1));
        for _ in 0..6 {
            client.mark_sick();
        }
        assert!(client.is_sick());
        for _ in 0..SUCCESS_THRESHOLD {
            client.mark_ok();
        }
        assert!(!client.is_sick());
    }
}
