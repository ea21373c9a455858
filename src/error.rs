//! Error types for the partition store
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::SubscriberId;

// == Storage Error ==
/// Failure reported by a secondary storage engine.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The engine could not complete the operation
    #[error("secondary storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The handle does not refer to anything the engine knows about
    #[error("unknown storage handle {0}")]
    UnknownHandle(u64),
}

// == Cache Error Enum ==
/// Unified error type for the partition store.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Secondary storage put/get/remove failed
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Wire encoding or decoding failed
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Unsubscribe matched no subscriber for any of the given keys
    #[error("Subscriber {0} is not subscribed")]
    NotSubscribed(SubscriberId),

    /// A value could not be converted to its binary form
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// The miss-fill data source failed
    #[error("Data source failure: {0}")]
    DataSource(String),

    /// The write-through data store failed
    #[error("Data store failure: {0}")]
    DataStore(String),

    /// A subscriber failed while handling a notification
    #[error("Subscriber failure: {0}")]
    Subscriber(String),

    /// Key not found
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::InvalidObject(_) => {
                StatusCode::BAD_REQUEST
            }
            CacheError::NotSubscribed(_) => StatusCode::CONFLICT,
            CacheError::DataSource(_) | CacheError::DataStore(_) => StatusCode::BAD_GATEWAY,
            CacheError::Storage(_) | CacheError::Io(_) | CacheError::Subscriber(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the partition store.
pub type Result<T> = std::result::Result<T, CacheError>;
