//! Request DTOs for the node's HTTP surface

use serde::Deserialize;

/// Maximum accepted key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Request body for PUT /put
///
/// A missing or `null` value stores a null element.
#[derive(Debug, Clone, Deserialize)]
pub struct PutRequest {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Lifetime in seconds; the table's expiration interval applies when absent
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl PutRequest {
    /// Returns an error message if the request is unusable.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Some(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            ));
        }
        if self.ttl == Some(0) {
            return Some("ttl must be positive".to_string());
        }
        None
    }
}
