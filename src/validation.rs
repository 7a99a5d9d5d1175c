use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use validator::Validate;

use crate::error::AdmissionError;

pub const MAX_KEY_LEN: usize = 256;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9:._@/\-]+$").expect("key pattern is valid"));

/// Body of `POST /rate-limit/:policy/check`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CheckRequest {
    /// Caller identity; derived from the request when absent.
    #[validate(length(min = 1, max = 256), regex(path = *KEY_PATTERN))]
    pub key: Option<String>,
}

impl CheckRequest {
    /// Parse and validate a possibly empty JSON body.
    pub fn from_body(body: &[u8]) -> Result<Self, AdmissionError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let request: CheckRequest = serde_json::from_slice(body)
            .map_err(|e| AdmissionError::Validation(format!("invalid JSON body: {}", e)))?;
        request.validate()?;
        Ok(request)
    }
}

/// Validate a caller identity supplied in a path or body.
pub fn validate_key(key: &str) -> Result<(), AdmissionError> {
    if key.is_empty() {
        return Err(AdmissionError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(AdmissionError::InvalidKey(format!(
            "key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    if !KEY_PATTERN.is_match(key) {
        return Err(AdmissionError::InvalidKey(
            "key may only contain letters, digits and : . _ @ / -".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_defaults() {
        let request = CheckRequest::from_body(b"").unwrap();
        assert!(request.key.is_none());
        assert!(CheckRequest::from_body(b" \n").unwrap().key.is_none());
    }

    #[test]
    fn test_body_with_key() {
        let request = CheckRequest::from_body(br#"{"key": "ip:1.2.3.4"}"#).unwrap();
        assert_eq!(request.key.as_deref(), Some("ip:1.2.3.4"));
    }

    #[test]
    fn test_body_rejects_bad_key() {
        let err = CheckRequest::from_body(br#"{"key": "has space"}"#).unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
        let err = CheckRequest::from_body(br#"{"key": ""}"#).unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn test_body_rejects_malformed_json() {
        let err = CheckRequest::from_body(b"{not json").unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:alice@example.com").is_ok());
        assert!(validate_key("ip:2001:db8::1").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("invalid key!").is_err());
        assert!(validate_key(&"a".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
