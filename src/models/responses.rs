//! Response DTOs for the node's HTTP surface

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{ElementView, Statistics};

/// Renders a table timestamp (time since the Unix epoch) as a UTC date.
fn to_utc(timestamp: Option<Duration>) -> Option<DateTime<Utc>> {
    let t = timestamp?;
    DateTime::from_timestamp(i64::try_from(t.as_secs()).ok()?, t.subsec_nanos())
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Response body for GET /get/:key
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    pub key: String,
    pub value: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub update_counter: i64,
}

impl From<ElementView> for GetResponse {
    fn from(view: ElementView) -> Self {
        Self {
            key: text(&view.key),
            value: view.value.as_deref().map(text),
            created_at: to_utc(view.created_time),
            expires_at: to_utc(view.expiration_time),
            update_counter: view.update_counter,
        }
    }
}

/// Response body for PUT /put
#[derive(Debug, Clone, Serialize)]
pub struct PutResponse {
    pub message: String,
    pub key: String,
    /// Value that was overwritten, if it was still live
    pub replaced: Option<String>,
}

impl PutResponse {
    pub fn new(key: impl Into<String>, replaced: Option<&[u8]>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' stored", key),
            key,
            replaced: replaced.map(text),
        }
    }
}

/// Response body for DELETE /remove/:key
#[derive(Debug, Clone, Serialize)]
pub struct RemoveResponse {
    pub message: String,
    pub key: String,
    pub previous: Option<String>,
}

impl RemoveResponse {
    pub fn new(key: impl Into<String>, previous: Option<&[u8]>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' removed", key),
            key,
            previous: previous.map(text),
        }
    }
}

/// Response body for GET /keys
#[derive(Debug, Clone, Serialize)]
pub struct KeysResponse {
    /// Live keys, least recently used first
    pub keys: Vec<String>,
}

impl KeysResponse {
    pub fn new<K: AsRef<[u8]>>(keys: &[K]) -> Self {
        Self {
            keys: keys.iter().map(|k| text(k.as_ref())).collect(),
        }
    }
}

/// Response body for GET /stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub statistics: Statistics,
    pub read_hit_ratio: f64,
    pub write_hit_ratio: f64,
    /// Elements in this table
    pub elements: usize,
    /// Bytes charged by this table
    pub bytes: u64,
    /// Partition-wide counter values
    pub partition_elements: Option<i64>,
    pub partition_bytes: Option<i64>,
}

impl StatsResponse {
    pub fn new(statistics: Statistics, elements: usize, bytes: u64) -> Self {
        Self {
            read_hit_ratio: statistics.read_hit_ratio(),
            write_hit_ratio: statistics.write_hit_ratio(),
            statistics,
            elements,
            bytes,
            partition_elements: None,
            partition_bytes: None,
        }
    }

    pub fn with_partition(mut self, elements: i64, bytes: i64) -> Self {
        self.partition_elements = Some(elements);
        self.partition_bytes = Some(bytes);
        self
    }
}

/// Response body for GET /health
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    /// Current time in RFC 3339 format
    pub timestamp: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
