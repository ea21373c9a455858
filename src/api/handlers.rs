//! API Handlers
//!
//! HTTP request handlers for the node's inspection and manipulation endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::{
    GetResponse, HealthResponse, KeysResponse, PutRequest, PutResponse, RemoveResponse,
    StatsResponse,
};
use crate::store::{
    ElementTable, InMemorySecondaryStorage, Previous, SharedCounter, StoreContext,
};

/// Application state shared across all handlers.
///
/// One partition: a single table plus the budget counters it is attached to.
#[derive(Clone)]
pub struct AppState {
    pub table: Arc<Mutex<ElementTable>>,
    pub elements: Arc<SharedCounter>,
    pub bytes: Arc<SharedCounter>,
}

impl AppState {
    /// Wraps a table, attaching it to fresh counters with the given budgets.
    pub fn new(mut table: ElementTable, max_elements: i64, max_bytes: i64) -> Self {
        let elements = Arc::new(SharedCounter::new(max_elements));
        let bytes = Arc::new(SharedCounter::new(max_bytes));
        table.attach_counters(elements.clone(), bytes.clone());
        Self {
            table: Arc::new(Mutex::new(table)),
            elements,
            bytes,
        }
    }

    /// Builds the partition from configuration, with in-memory spill when
    /// a secondary capacity is configured.
    pub fn from_config(config: &Config) -> Self {
        let mut ctx = StoreContext::default();
        if config.secondary_capacity_bytes > 0 {
            ctx = ctx.with_secondary(Arc::new(InMemorySecondaryStorage::new(
                config.secondary_capacity_bytes,
            )));
        }
        let table = ElementTable::new(config, ctx);
        Self::new(table, config.max_elements, config.max_bytes)
    }
}

/// Handler for PUT /put
pub async fn put_handler(
    State(state): State<AppState>,
    Json(req): Json<PutRequest>,
) -> Result<Json<PutResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let mut table = state.table.lock().await;
    let expiration = req
        .ttl
        .map(|secs| table.context().clock.now() + Duration::from_secs(secs));
    let replaced = table.put(
        Bytes::from(req.key.clone()),
        req.value.map(Bytes::from),
        expiration,
        true,
        None,
    )?;
    debug!(key = %req.key, elements = table.len(), "stored via http");

    Ok(Json(PutResponse::new(req.key, replaced.as_deref())))
}

/// Handler for GET /get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    // reads mutate recency and statistics
    let mut table = state.table.lock().await;
    match table.get(key.as_bytes())? {
        Some(view) => Ok(Json(GetResponse::from(view))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for DELETE /remove/:key
pub async fn remove_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RemoveResponse>> {
    let mut table = state.table.lock().await;
    match table.remove(key.as_bytes())? {
        Previous::Present(previous) => Ok(Json(RemoveResponse::new(key, previous.as_deref()))),
        Previous::Absent => Err(CacheError::NotFound(key)),
    }
}

/// Handler for GET /keys
pub async fn keys_handler(State(state): State<AppState>) -> Result<Json<KeysResponse>> {
    let mut table = state.table.lock().await;
    let keys = table.key_set()?;
    Ok(Json(KeysResponse::new(&keys)))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let table = state.table.lock().await;
    Json(
        StatsResponse::new(table.statistics().clone(), table.len(), table.byte_size())
            .with_partition(state.elements.value(), state.bytes.value()),
    )
}

/// Handler for GET /snapshot
///
/// Returns the table's binary wire form.
pub async fn snapshot_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let table = state.table.lock().await;
    let snapshot = table.to_bytes()?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], snapshot))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
