//! Issuer configuration
//!
//! Defaults follow the policy used in deployment: a seven day cool-off for
//! requests that cannot prove key continuity and ninety days of validity.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

const DAY: u64 = 24 * 60 * 60;

/// Configuration for `Issuer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    /// Name written into every issued certificate
    pub ca_name: String,

    /// Delay before a certificate without proven key continuity becomes usable
    #[serde(with = "duration_secs")]
    pub cool_off: Duration,

    /// Lifetime of an issued certificate, counted from issuance
    #[serde(with = "duration_secs")]
    pub validity: Duration,

    /// Identifier of the log certificates are submitted to
    pub log_id: String,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            ca_name: "pca".into(),
            cool_off: Duration::from_secs(7 * DAY),
            validity: Duration::from_secs(90 * DAY),
            log_id: "policy-log".into(),
        }
    }
}

impl PcaConfig {
    pub fn new(ca_name: impl Into<String>) -> Self {
        Self {
            ca_name: ca_name.into(),
            ..Self::default()
        }
    }

    pub fn with_cool_off(mut self, cool_off: Duration) -> Self {
        self.cool_off = cool_off;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }

    /// Defaults overlaid with `FPKI_PCA_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup("FPKI_PCA_CA_NAME") {
            config.ca_name = name;
        }
        if let Some(log_id) = lookup("FPKI_PCA_LOG_ID") {
            config.log_id = log_id;
        }
        parse_secs_into(&lookup, "FPKI_PCA_COOL_OFF_SECS", &mut config.cool_off);
        parse_secs_into(&lookup, "FPKI_PCA_VALIDITY_SECS", &mut config.validity);

        config
    }
}

fn parse_secs_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(secs) => *target = Duration::from_secs(secs),
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparsable configuration value"),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let config = PcaConfig::default();
        assert_eq!(config.cool_off, Duration::from_secs(7 * DAY));
        assert_eq!(config.validity, Duration::from_secs(90 * DAY));
    }

    #[test]
    fn test_env_overrides() {
        let config = PcaConfig::from_lookup(|key| match key {
            "FPKI_PCA_CA_NAME" => Some("pca.example.org".into()),
            "FPKI_PCA_COOL_OFF_SECS" => Some("60".into()),
            "FPKI_PCA_VALIDITY_SECS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(config.ca_name, "pca.example.org");
        assert_eq!(config.cool_off, Duration::from_secs(60));
        assert_eq!(config.validity, Duration::from_secs(90 * DAY));
        assert_eq!(config.log_id, "policy-log");
    }

    #[test]
    fn test_json_in_seconds() {
        let config: PcaConfig = serde_json::from_str(r#"{"ca_name": "a", "cool_off": 3600}"#).unwrap();
        assert_eq!(config.cool_off, Duration::from_secs(3600));
        assert_eq!(config.validity, Duration::from_secs(90 * DAY));
    }
}
