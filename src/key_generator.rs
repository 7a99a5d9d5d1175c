//! Caller identity derivation for admission keys.

use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::AdmissionError;
use crate::validation::validate_key;

/// Strategy for deriving a caller identity
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    /// Use client IP address
    IpAddress,
    /// Use API key from header
    ApiKey,
    /// Use user ID header
    UserId,
    /// Composite key from multiple sources
    Composite(Vec<KeyStrategy>),
}

impl FromStr for KeyStrategy {
    type Err = AdmissionError;

    /// Parses `ip`, `api-key`, `user-id`, or a `+`-joined composite such as `user-id+ip`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split('+').map(str::trim).collect();
        if parts.len() > 1 {
            let strategies = parts
                .into_iter()
                .map(|part| part.parse())
                .collect::<Result<Vec<KeyStrategy>, _>>()?;
            return Ok(KeyStrategy::Composite(strategies));
        }
        match raw.trim().to_ascii_lowercase().as_str() {
            "ip" | "ip-address" => Ok(KeyStrategy::IpAddress),
            "api" | "api-key" => Ok(KeyStrategy::ApiKey),
            "user" | "user-id" => Ok(KeyStrategy::UserId),
            other => Err(AdmissionError::Configuration(format!(
                "unknown key strategy: {:?}",
                other
            ))),
        }
    }
}

/// Derives the caller identity a request is admitted under
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    /// Generate an identity from request headers and the peer address
    pub fn generate_key(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<String, AdmissionError> {
        self.generate_key_with_strategy(&self.default_strategy, headers, peer)
    }

    /// Derived keys obey the same charset and length rules as keys supplied in a body.
    pub fn generate_key_with_strategy(
        &self,
        strategy: &KeyStrategy,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<String, AdmissionError> {
        let key = match strategy {
            KeyStrategy::IpAddress => format!("ip:{}", Self::extract_client_ip(headers, peer)),
            KeyStrategy::ApiKey => format!("api:{}", api_key(headers)?),
            KeyStrategy::UserId => format!("user:{}", user_id(headers)?),
            KeyStrategy::Composite(strategies) => {
                let mut key_parts = Vec::new();
                for sub_strategy in strategies {
                    let part = match sub_strategy {
                        KeyStrategy::IpAddress => Self::extract_client_ip(headers, peer),
                        KeyStrategy::ApiKey => api_key(headers)?.to_string(),
                        KeyStrategy::UserId => user_id(headers)?.to_string(),
                        KeyStrategy::Composite(_) => {
                            return Err(AdmissionError::Configuration(
                                "Nested composite keys not supported".to_string(),
                            ))
                        }
                    };
                    key_parts.push(part);
                }
                format!("composite:{}", key_parts.join(":"))
            }
        };
        let key = Self::sanitize_key(&key);
        validate_key(&key)?;
        Ok(key)
    }

    /// Client IP from proxy headers, then the socket address, else `unknown`
    pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        header(headers, "x-forwarded-for")
            .and_then(|xff| xff.split(',').next().map(str::trim))
            .filter(|ip| !ip.is_empty())
            .or_else(|| header(headers, "x-real-ip"))
            .or_else(|| header(headers, "cf-connecting-ip"))
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Replace anything outside `[A-Za-z0-9:._@/-]` with `_`
    pub fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '@' | '/' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyStrategy::IpAddress)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn api_key(headers: &HeaderMap) -> Result<&str, AdmissionError> {
    header(headers, "x-api-key")
        .or_else(|| header(headers, "authorization"))
        .ok_or_else(|| AdmissionError::InvalidKey("missing x-api-key or authorization header".to_string()))
}

fn user_id(headers: &HeaderMap) -> Result<&str, AdmissionError> {
    header(headers, "x-user-id")
        .ok_or_else(|| AdmissionError::InvalidKey("missing x-user-id header".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn create_test_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("test-api-key"));
        headers.insert("x-user-id", HeaderValue::from_static("user123"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        headers
    }

    fn peer() -> Option<SocketAddr> {
        Some("203.0.113.9:4242".parse().unwrap())
    }

    #[test]
    fn test_ip_address_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::IpAddress);
        let key = generator.generate_key(&create_test_headers(), peer()).unwrap();
        assert_eq!(key, "ip:192.168.1.1");
    }

    #[test]
    fn test_api_key_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::ApiKey);
        let key = generator.generate_key(&create_test_headers(), peer()).unwrap();
        assert_eq!(key, "api:test-api-key");
    }

    #[test]
    fn test_user_id_strategy() {
        let generator = KeyGenerator::new(KeyStrategy::UserId);
        let key = generator.generate_key(&create_test_headers(), peer()).unwrap();
        assert_eq!(key, "user:user123");
    }

    #[test]
    fn test_missing_user_id() {
        let generator = KeyGenerator::new(KeyStrategy::UserId);
        let err = generator.generate_key(&HeaderMap::new(), peer()).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidKey(_)));
    }

    #[test]
    fn test_composite_strategy() {
        let strategy = KeyStrategy::Composite(vec![KeyStrategy::UserId, KeyStrategy::IpAddress]);
        let generator = KeyGenerator::new(strategy);
        let key = generator.generate_key(&create_test_headers(), peer()).unwrap();
        assert_eq!(key, "composite:user123:192.168.1.1");
    }

    #[test]
    fn test_ip_fallback_order() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(KeyGenerator::extract_client_ip(&headers, peer()), "198.51.100.7");

        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(KeyGenerator::extract_client_ip(&headers, peer()), "203.0.113.1");

        assert_eq!(KeyGenerator::extract_client_ip(&HeaderMap::new(), peer()), "203.0.113.9");
        assert_eq!(KeyGenerator::extract_client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("ip".parse::<KeyStrategy>().unwrap(), KeyStrategy::IpAddress);
        assert_eq!(
            "user-id+ip".parse::<KeyStrategy>().unwrap(),
            KeyStrategy::Composite(vec![KeyStrategy::UserId, KeyStrategy::IpAddress])
        );
        assert!("cookie".parse::<KeyStrategy>().is_err());
    }

    #[test]
    fn test_oversized_header_identity_rejected() {
        let mut headers = HeaderMap::new();
        let long_id = "u".repeat(400);
        headers.insert("x-user-id", HeaderValue::from_str(&long_id).unwrap());

        let generator = KeyGenerator::new(KeyStrategy::UserId);
        let err = generator.generate_key(&headers, peer()).unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidKey(_)));

        let composite = KeyGenerator::new(KeyStrategy::Composite(vec![
            KeyStrategy::UserId,
            KeyStrategy::IpAddress,
        ]));
        assert!(composite.generate_key(&headers, peer()).is_err());
    }

    #[test]
    fn test_sanitize_key() {
        let sanitized = KeyGenerator::sanitize_key("api:test key#with$special%chars");
        assert_eq!(sanitized, "api:test_key_with_special_chars");
        assert_eq!(KeyGenerator::sanitize_key("ip:2001:db8::1"), "ip:2001:db8::1");
    }
}
