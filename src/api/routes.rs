//! API Routes
//!
//! Configures the Axum router for the node's endpoints.

use axum::{
    routing::{delete, get, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    get_handler, health_handler, keys_handler, put_handler, remove_handler, snapshot_handler,
    stats_handler, AppState,
};

/// Creates the router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /put` - Store a key with an optional value and ttl
/// - `GET /get/:key` - Read a key
/// - `DELETE /remove/:key` - Remove a key
/// - `GET /keys` - Live keys, least recently used first
/// - `GET /stats` - Table and partition statistics
/// - `GET /snapshot` - Binary wire snapshot of the table
/// - `GET /health` - Health check
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/put", put(put_handler))
        .route("/get/:key", get(get_handler))
        .route("/remove/:key", delete(remove_handler))
        .route("/keys", get(keys_handler))
        .route("/stats", get(stats_handler))
        .route("/snapshot", get(snapshot_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
