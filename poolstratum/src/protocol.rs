//! Stratum wire types: newline-delimited JSON-RPC, request/response/push.
//!
//! Grounded on the teacher's `StratumRequest`/`StratumResponse` shape in
//! `mining/src/stratum.rs`, generalized to raw `Value` ids (the wire
//! contract echoes whatever id the miner sent) per spec §6.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Max Stratum line length in bytes; a single longer request triggers a
/// socket-flood ban (spec §5 "Cancellation & timeouts").
pub const MAX_FRAME_BYTES: usize = 1024;

pub const ERR_INVALID_PARAMS: i32 = -1;
pub const ERR_METHOD_NOT_FOUND: i32 = -3;
pub const ERR_DUPLICATE_SHARE: i32 = 22;
pub const ERR_INVALID_SHARE: i32 = 23;
pub const ERR_NOT_SUBSCRIBED: i32 = 25;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        StratumResponse {
            id,
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i32, message: &str) -> Self {
        StratumResponse {
            id,
            jsonrpc: "2.0",
            result: None,
            error: Some(serde_json::json!({ "code": code, "message": message })),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumPush {
    pub id: Option<Value>,
    pub method: &'static str,
    pub params: Value,
}
