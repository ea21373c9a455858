//! Background Tasks Module
//!
//! Periodic work that runs alongside the node's HTTP surface.
//!
//! # Tasks
//! - Expiration sweep: purges stale elements so memory is reclaimed even
//!   when nothing reads them

mod sweep;

pub use sweep::spawn_sweep_task;
