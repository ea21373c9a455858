//! API Module
//!
//! HTTP handlers and routing for the node's inspection surface.

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
