//! Common types used across F-PKI

use crate::error::{FpkiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Maximum length of a full domain name
const MAX_NAME_LEN: usize = 253;

/// Domain name a policy certificate is issued for
///
/// Names are stored lower-cased so that `Example.COM` and `example.com`
/// address the same issuer state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    /// Validate and normalize a domain name
    pub fn parse(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().trim_end_matches('.').to_ascii_lowercase();

        if name.is_empty() {
            return Err(FpkiError::InvalidDomain(name, "empty name".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(FpkiError::InvalidDomain(name, "name too long".into()));
        }
        for label in name.split('.') {
            if label.is_empty() {
                return Err(FpkiError::InvalidDomain(name.clone(), "empty label".into()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(FpkiError::InvalidDomain(name.clone(), "label too long".into()));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'*')
            {
                return Err(FpkiError::InvalidDomain(
                    name.clone(),
                    format!("invalid character in label '{}'", label),
                ));
            }
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DomainName {
    type Error = FpkiError;

    fn try_from(value: String) -> Result<Self> {
        DomainName::parse(value)
    }
}

impl TryFrom<&str> for DomainName {
    type Error = FpkiError;

    fn try_from(value: &str) -> Result<Self> {
        DomainName::parse(value)
    }
}

impl From<DomainName> for String {
    fn from(name: DomainName) -> Self {
        name.0
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_trailing_dot() {
        let name = DomainName::parse("Example.COM.").unwrap();
        assert_eq!(name.as_str(), "example.com");
    }

    #[test]
    fn test_rejects_empty_and_malformed() {
        assert!(DomainName::parse("").is_err());
        assert!(DomainName::parse("example..com").is_err());
        assert!(DomainName::parse("exa mple.com").is_err());
        assert!(DomainName::parse(format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let name: DomainName = serde_json::from_str("\"Example.com\"").unwrap();
        assert_eq!(name.as_str(), "example.com");
        assert!(serde_json::from_str::<DomainName>("\"bad..name\"").is_err());
    }
}
