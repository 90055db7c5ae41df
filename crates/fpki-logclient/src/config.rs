//! Log client configuration
//!
//! Defaults match a local single-tree log. `from_env` overlays
//! `FPKI_LOG_*` environment variables; unparsable values fall back to the
//! default with a warning.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::backend::TreeId;

/// Configuration for `LogSubmissionEngine`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogClientConfig {
    /// Log instance on the backend
    pub tree_id: TreeId,

    /// Backend RPC endpoint
    pub rpc_address: String,

    /// Concurrent RPC workers
    pub num_workers: usize,

    /// Largest response the transport accepts, in bytes
    pub max_receive_message_size: usize,

    /// Delay between inclusion proof attempts for an unsequenced leaf
    #[serde(with = "duration_ms")]
    pub proof_poll_interval: Duration,

    /// Attempts per leaf before giving up on its inclusion proof
    pub max_proof_attempts: u32,

    /// Delay between root refreshes while waiting for the tree to grow
    #[serde(with = "duration_ms")]
    pub tree_growth_poll_interval: Duration,

    /// Upper bound on one tree growth wait
    #[serde(with = "duration_ms")]
    pub tree_growth_timeout: Duration,

    /// PEM key verifying the log's root signatures; unchecked when absent
    pub log_public_key_pem: Option<String>,
}

impl Default for LogClientConfig {
    fn default() -> Self {
        Self {
            tree_id: 0,
            rpc_address: "localhost:8090".into(),
            num_workers: 20,
            max_receive_message_size: 128 * 1024 * 1024,
            proof_poll_interval: Duration::from_millis(10),
            max_proof_attempts: 10,
            tree_growth_poll_interval: Duration::from_millis(50),
            tree_growth_timeout: Duration::from_secs(30),
            log_public_key_pem: None,
        }
    }
}

impl LogClientConfig {
    /// Defaults overlaid with `FPKI_LOG_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "FPKI_LOG_TREE_ID", &mut config.tree_id);
        if let Some(address) = lookup("FPKI_LOG_RPC_ADDRESS") {
            config.rpc_address = address;
        }
        parse_into(&lookup, "FPKI_LOG_NUM_WORKERS", &mut config.num_workers);
        parse_into(
            &lookup,
            "FPKI_LOG_MAX_RECEIVE_MESSAGE_SIZE",
            &mut config.max_receive_message_size,
        );
        parse_millis_into(
            &lookup,
            "FPKI_LOG_PROOF_POLL_INTERVAL_MS",
            &mut config.proof_poll_interval,
        );
        parse_into(&lookup, "FPKI_LOG_MAX_PROOF_ATTEMPTS", &mut config.max_proof_attempts);
        parse_millis_into(
            &lookup,
            "FPKI_LOG_TREE_GROWTH_POLL_INTERVAL_MS",
            &mut config.tree_growth_poll_interval,
        );
        parse_millis_into(
            &lookup,
            "FPKI_LOG_TREE_GROWTH_TIMEOUT_MS",
            &mut config.tree_growth_timeout,
        );
        if let Some(pem) = lookup("FPKI_LOG_PUBLIC_KEY_PEM") {
            config.log_public_key_pem = Some(pem);
        }

        // A pool with no workers would never make progress
        config.num_workers = config.num_workers.max(1);
        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparsable configuration value"),
        }
    }
}

fn parse_millis_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    parse_into(lookup, key, &mut millis);
    *target = Duration::from_millis(millis);
}

/// Durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
