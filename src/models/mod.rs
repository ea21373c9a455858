//! Request and Response models for the node's HTTP surface
//!
//! Keys and values travel as UTF-8 strings; the table itself stores raw bytes.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::PutRequest;
pub use responses::{
    ErrorResponse, GetResponse, HealthResponse, KeysResponse, PutResponse, RemoveResponse,
    StatsResponse,
};
