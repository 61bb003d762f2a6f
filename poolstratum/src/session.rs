//! Per-connection Stratum session state.
//!
//! Grounded on the teacher's `SessionState`/`StratumSession` split
//! (`mining/src/stratum.rs`) and on `original_source/proxy/proxy.go`'s
//! `Session` struct for the Bitcoin-specific fields (`extraNonce1`,
//! `target`, `targetNextJob`, `shareCountInv`).

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use poolcore::target::{bits_to_target, target_to_diff};
use poolcore::Uint256;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Bitcoin's difficulty-1 target, used to convert pool targets into the
/// "share difficulty" unit miners expect in `mining.set_difficulty`.
fn genesis_work() -> BigUint {
    let genesis_target = bits_to_target(0x1d00ffff);
    target_to_diff(&genesis_target)
}

/// Derives the 16-byte session id from `ip,node_id,tag`, hex-encoded.
pub fn derive_sid(ip: &str, node_id: u16, tag: u16) -> String {
    let input = format!("{ip},{node_id},{tag}");
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[0..16])
}

/// Derives the 4-byte `extranonce1` as `(node_id << 16) | tag`, big-endian.
pub fn derive_extranonce1(node_id: u16, tag: u16) -> [u8; 4] {
    let value = ((node_id as u32) << 16) | (tag as u32);
    value.to_be_bytes()
}

pub struct SessionState {
    pub login: String,
    pub worker_id: String,
    pub is_authorized: bool,
    pub target: Uint256,
    pub target_next: Uint256,
    pub share_count_in_interval: i64,
}

/// One TCP connection's registered entry: the fields the Stratum server
/// and the diff-adjust task touch from outside the connection's own task.
pub struct Session {
    pub ip: String,
    pub tag: u16,
    pub sid: String,
    pub extranonce1: [u8; 4],
    pub state: Mutex<SessionState>,
    pub shares_since_connect: AtomicI64,
    pub writer: mpsc::Sender<String>,
}

impl Session {
    pub fn new(
        ip: String,
        node_id: u16,
        tag: u16,
        initial_target: Uint256,
        writer: mpsc::Sender<String>,
    ) -> Self {
        let sid = derive_sid(&ip, node_id, tag);
        let extranonce1 = derive_extranonce1(node_id, tag);
        Session {
            ip,
            tag,
            sid,
            extranonce1,
            state: Mutex::new(SessionState {
                login: String::new(),
                worker_id: String::new(),
                is_authorized: false,
                target: initial_target,
                target_next: initial_target,
                share_count_in_interval: 0,
            }),
            shares_since_connect: AtomicI64::new(0),
            writer,
        }
    }

    pub fn extranonce1_hex(&self) -> String {
        hex::encode(self.extranonce1)
    }

    /// `share_diff = target_to_diff(target_next) / genesis_work`, the
    /// value pushed in `mining.set_difficulty`.
    pub fn share_difficulty(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let diff = target_to_diff(&state.target_next);
        let work = genesis_work();
        diff.to_f64().unwrap_or(0.0) / work.to_f64().unwrap_or(1.0)
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().unwrap().is_authorized
    }

    pub async fn send_line(&self, line: String) -> bool {
        self.writer.send(line).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_is_32_hex_chars() {
        let sid = derive_sid("127.0.0.1", 1, 7);
        assert_eq!(sid.len(), 32);
    }

    #[test]
    fn extranonce1_encodes_node_and_tag() {
        let bytes = derive_extranonce1(1, 0xa);
        assert_eq!(hex::encode(bytes), "0001000a");
    }
}
