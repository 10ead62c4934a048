//! Session cookie value formats.

use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Format of the session cookie a service expects.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// `selector-validator` pair, the validator is stored hashed
    #[default]
    Cnc,
    /// Opaque value compared as-is
    Simple,
    /// Service without sessions
    None,
}

impl SessionType {
    /// Parse a raw cookie value into a session of this type.
    pub fn parse(self, raw: &str) -> HttpSession {
        match self {
            SessionType::Cnc => HttpSession::Cnc(CncSessionValue::parse(raw)),
            SessionType::Simple => HttpSession::Simple(raw.to_string()),
            SessionType::None => HttpSession::None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CncSessionValue {
    pub selector: String,
    pub validator: String,
}

impl CncSessionValue {
    /// Split on the first `-`; values without a separator yield an empty session.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('-') {
            Some((selector, validator)) => {
                Self { selector: selector.to_string(), validator: validator.to_string() }
            }
            None => Self::default(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.selector.is_empty() && self.validator.is_empty()
    }

    /// Compare the SHA-256 hex digest of the validator with a stored hash in constant time.
    pub fn matches_stored_hash(&self, stored: &str) -> bool {
        let hashed = hex::encode(Sha256::digest(self.validator.as_bytes()));
        hashed.as_bytes().ct_eq(stored.as_bytes()).into()
    }
}

/// A decoded session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpSession {
    Cnc(CncSessionValue),
    Simple(String),
    None,
}

impl HttpSession {
    pub fn is_zero(&self) -> bool {
        match self {
            HttpSession::Cnc(v) => v.is_zero(),
            HttpSession::Simple(v) => v.is_empty(),
            HttpSession::None => true,
        }
    }

    /// Key used to look the session up in a session store.
    pub fn search_selector(&self) -> &str {
        match self {
            HttpSession::Cnc(v) => &v.selector,
            HttpSession::Simple(v) => v,
            HttpSession::None => "",
        }
    }

    pub fn matches_stored_value(&self, stored: &str) -> bool {
        match self {
            HttpSession::Cnc(v) => v.matches_stored_hash(stored),
            HttpSession::Simple(v) => v.as_bytes().ct_eq(stored.as_bytes()).into(),
            HttpSession::None => false,
        }
    }
}

impl fmt::Display for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpSession::Cnc(v) if v.is_zero() => Ok(()),
            HttpSession::Cnc(v) => write!(f, "{}-{}", v.selector, v.validator),
            HttpSession::Simple(v) => f.write_str(v),
            HttpSession::None => Ok(()),
        }
    }
}

/// SHA-256 hex digest, the format session validators and API tokens are stored in.
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cnc_session_split_on_first_dash() {
        let s = SessionType::Cnc.parse("sel-val-ue");
        assert_eq!(
            s,
            HttpSession::Cnc(CncSessionValue {
                selector: "sel".to_string(),
                validator: "val-ue".to_string()
            })
        );
        assert_eq!(s.to_string(), "sel-val-ue");
        assert!(SessionType::Cnc.parse("nodash").is_zero());
    }

    #[test]
    fn test_cnc_validator_hash() {
        let s = SessionType::Cnc.parse("abc-secret");
        assert!(s.matches_stored_value(&sha256_hex("secret")));
        assert!(!s.matches_stored_value(&sha256_hex("other")));
    }

    #[test]
    fn test_simple_and_none() {
        let s = SessionType::Simple.parse("token");
        assert_eq!(s.search_selector(), "token");
        assert!(s.matches_stored_value("token"));
        assert!(SessionType::None.parse("anything").is_zero());
    }
}
