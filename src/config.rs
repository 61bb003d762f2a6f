//! Pool configuration, deserialized from a JSON file given by `--config`.
//!
//! Grounded on `original_source/proxy/config.go`'s `Config` struct tree:
//! cluster node identity, the upstream list, Stratum listen/timeout/max-conn,
//! policy thresholds, block/template intervals, pool wallet, coinbase extras
//! and the diff-adjust parameters.

use poolcoinbase::MasterNodeVout;
use pooltemplate::CoinbaseParams;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(String, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(String, serde_json::Error),

    #[error("invalid duration string {0:?}")]
    InvalidDuration(String),

    #[error("invalid bind address {0:?}: {1}")]
    InvalidBindAddr(String, std::net::AddrParseError),
}

#[derive(Debug, Deserialize)]
pub struct ClusterNode {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "nodeId")]
    pub node_id: u16,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    /// Go-style duration string, e.g. `"10s"`.
    pub timeout: String,
}

#[derive(Debug, Deserialize)]
pub struct StratumConfig {
    pub enabled: bool,
    pub listen: String,
    #[serde(rename = "maxConn")]
    pub max_conn: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiffAdjustConfig {
    pub enabled: bool,
    #[serde(rename = "adjustInv")]
    pub adjust_interval: String,
    #[serde(rename = "expectShareCount")]
    pub expect_share_count: i64,
}

#[derive(Debug, Deserialize, Default)]
pub struct MasterNodeConfig {
    pub wallet: String,
    #[serde(rename = "amountSatoshis")]
    pub amount_satoshis: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub difficulty: u64,
    #[serde(rename = "blockTemplateInterval")]
    pub block_template_interval: String,
    #[serde(rename = "stateUpdateInterval")]
    pub state_update_interval: String,
    #[serde(rename = "hashrateExpiration")]
    pub hashrate_expiration: String,
    pub stratum: StratumConfig,
    #[serde(rename = "diffAdjust")]
    pub diff_adjust: DiffAdjustConfig,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub cluster: ClusterNode,
    pub upstream: Vec<UpstreamConfig>,
    #[serde(rename = "upstreamCheckInterval")]
    pub upstream_check_interval: String,
    pub proxy: ProxyConfig,
    pub wallet: String,
    #[serde(rename = "coinbaseAuxFlags", default)]
    pub coinbase_aux_flags: String,
    #[serde(rename = "coinbaseExtraData", default)]
    pub coinbase_extra_data: String,
    #[serde(rename = "masternodes", default)]
    pub masternodes: Vec<MasterNodeConfig>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.display().to_string(), e))
    }

    pub fn coinbase_params(&self) -> CoinbaseParams {
        CoinbaseParams {
            wallet: self.wallet.clone(),
            aux_flags_hex: self.coinbase_aux_flags.clone(),
            extras: self.coinbase_extra_data.clone(),
            masternodes: self
                .masternodes
                .iter()
                .map(|m| MasterNodeVout {
                    amount_satoshis: m.amount_satoshis,
                    wallet: m.wallet.clone(),
                })
                .collect(),
        }
    }
}

/// Parses a Go-style duration string (`"10s"`, `"500ms"`, `"2m"`) into a
/// [`Duration`]. Only the units the original's config files actually use.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))?;
    let (value, unit) = raw.split_at(split_at);
    let value: u64 = value
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(ConfigError::InvalidDuration(raw.to_string())),
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_minutes() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn loads_minimal_config_json() {
        let json = r#"{
            "cluster": {"nodeName": "pool-a", "nodeId": 1},
            "upstream": [{"name": "main", "url": "http://127.0.0.1:8332", "timeout": "10s"}],
            "upstreamCheckInterval": "30s",
            "proxy": {
                "difficulty": 1000000,
                "blockTemplateInterval": "5s",
                "stateUpdateInterval": "10s",
                "hashrateExpiration": "600s",
                "stratum": {"enabled": true, "listen": "0.0.0.0:3333", "maxConn": 4096},
                "diffAdjust": {"enabled": true, "adjustInv": "30s", "expectShareCount": 16}
            },
            "wallet": "XiB2rj7PdESyaxJVsnmjhXf9D9bYJjX7ob"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.cluster.node_id, 1);
        assert_eq!(config.upstream.len(), 1);
        assert!(config.proxy.stratum.enabled);
    }
}
