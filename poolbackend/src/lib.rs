//! Key-value backend for share/block accounting.
//!
//! Grounded on the teacher's `storage::BlockStore` trait shape
//! (`async_trait`, per-operation `thiserror` variants) from
//! `storage/src/lib.rs`, generalized from blockchain storage to the
//! five share-accounting operations of spec §6. `MemoryBackend` mirrors
//! the teacher's in-memory test doubles.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend data error: {0}")]
    Data(String),
}

/// The three values a found share or block carries over the wire, in the
/// order the miner submitted them.
#[derive(Debug, Clone)]
pub struct SubmissionTriple {
    pub nonce: String,
    pub extranonce1: String,
    pub extranonce2: String,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Records an accepted share. Returns `true` if this exact
    /// `(login, worker_id, nonce)` was already recorded (a duplicate).
    async fn write_share(
        &self,
        login: &str,
        worker_id: &str,
        submission: &SubmissionTriple,
        share_diff: u64,
        height: u32,
        hashrate_expiration_secs: u64,
    ) -> Result<bool, BackendError>;

    /// Records an accepted block. Returns `true` if this exact submission
    /// was already recorded (a duplicate).
    #[allow(clippy::too_many_arguments)]
    async fn write_block(
        &self,
        login: &str,
        worker_id: &str,
        submission: &SubmissionTriple,
        share_diff: u64,
        block_diff: u64,
        height: u32,
        coinbase_value: i64,
        tx_fee_total: i64,
        hashrate_expiration_secs: u64,
    ) -> Result<bool, BackendError>;

    async fn write_invalid_share(
        &self,
        unix_ms: i64,
        unix_secs: i64,
        login: &str,
        worker_id: &str,
        share_diff: u64,
    ) -> Result<(), BackendError>;

    async fn write_reject_share(
        &self,
        unix_ms: i64,
        unix_secs: i64,
        login: &str,
        worker_id: &str,
        share_diff: u64,
    ) -> Result<(), BackendError>;

    async fn write_node_state(
        &self,
        name: &str,
        height: u32,
        difficulty: f64,
    ) -> Result<(), BackendError>;
}

/// In-process backend for tests and standalone runs: keeps shares, blocks
/// and node state in memory, with no persistence across restarts.
#[derive(Default)]
pub struct MemoryBackend {
    shares: Mutex<HashMap<String, u32>>,
    blocks: Mutex<HashMap<String, u32>>,
    invalid_shares: Mutex<Vec<(i64, String, String, u64)>>,
    rejected_shares: Mutex<Vec<(i64, String, String, u64)>>,
    node_state: Mutex<HashMap<String, (u32, f64)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn submission_key(login: &str, worker_id: &str, submission: &SubmissionTriple) -> String {
        format!(
            "{login}:{worker_id}:{}:{}:{}",
            submission.nonce, submission.extranonce1, submission.extranonce2
        )
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn write_share(
        &self,
        login: &str,
        worker_id: &str,
        submission: &SubmissionTriple,
        _share_diff: u64,
        _height: u32,
        _hashrate_expiration_secs: u64,
    ) -> Result<bool, BackendError> {
        let key = Self::submission_key(login, worker_id, submission);
        let mut shares = self.shares.lock().unwrap();
        let duplicate = shares.insert(key, 1).is_some();
        Ok(duplicate)
    }

    async fn write_block(
        &self,
        login: &str,
        worker_id: &str,
        submission: &SubmissionTriple,
        _share_diff: u64,
        _block_diff: u64,
        _height: u32,
        _coinbase_value: i64,
        _tx_fee_total: i64,
        _hashrate_expiration_secs: u64,
    ) -> Result<bool, BackendError> {
        let key = Self::submission_key(login, worker_id, submission);
        let mut blocks = self.blocks.lock().unwrap();
        let duplicate = blocks.insert(key, 1).is_some();
        Ok(duplicate)
    }

    async fn write_invalid_share(
        &self,
        unix_ms: i64,
        _unix_secs: i64,
        login: &str,
        worker_id: &str,
        share_diff: u64,
    ) -> Result<(), BackendError> {
        self.invalid_shares.lock().unwrap().push((
            unix_ms,
            login.to_string(),
            worker_id.to_string(),
            share_diff,
        ));
        Ok(())
    }

    async fn write_reject_share(
        &self,
        unix_ms: i64,
        _unix_secs: i64,
        login: &str,
        worker_id: &str,
        share_diff: u64,
    ) -> Result<(), BackendError> {
        self.rejected_shares.lock().unwrap().push((
            unix_ms,
            login.to_string(),
            worker_id.to_string(),
            share_diff,
        ));
        Ok(())
    }

    async fn write_node_state(
        &self,
        name: &str,
        height: u32,
        difficulty: f64,
    ) -> Result<(), BackendError> {
        self.node_state
            .lock()
            .unwrap()
            .insert(name.to_string(), (height, difficulty));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple() -> SubmissionTriple {
        SubmissionTriple {
            nonce: "deadbeef".into(),
            extranonce1: "0001000a".into(),
            extranonce2: "00000000".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_share_detected() {
        let backend = MemoryBackend::new();
        let first = backend
            .write_share("addr", "worker", &triple(), 1, 100, 600)
            .await
            .unwrap();
        assert!(!first);
        let second = backend
            .write_share("addr", "worker", &triple(), 1, 100, 600)
            .await
            .unwrap();
        assert!(second);
    }

    #[tokio::test]
    async fn node_state_roundtrip() {
        let backend = MemoryBackend::new();
        backend.write_node_state("node-a", 820_000, 1.5e13).await.unwrap();
        assert_eq!(
            backend.node_state.lock().unwrap().get("node-a"),
            Some(&(820_000, 1.5e13))
        );
    }
}
