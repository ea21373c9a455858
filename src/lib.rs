//! Partition Store - size-bounded element storage for a cache node partition
//!
//! An LRU element table with shared element and byte budgets, spill to
//! secondary storage, lazy expiration, per-key change notification and a
//! binary snapshot format, plus a small HTTP surface for running it as a node.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use error::{CacheError, Result};
pub use store::{ElementTable, ElementView, Previous, SharedCounter, StoreContext};
pub use tasks::spawn_sweep_task;
