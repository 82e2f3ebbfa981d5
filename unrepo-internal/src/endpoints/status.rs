use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppState;

pub const UNREPO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// GET /health
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics
pub async fn metrics_handler(State(app_state): AppState) -> String {
    app_state.metrics_handle.render()
}

/// GET /status
///
/// Limiter and tier-cache counters since process start, per instance.
/// Decision counts are exported on `/metrics`.
pub async fn status_handler(State(app_state): AppState) -> Json<Value> {
    let engine = &app_state.engine;
    let limiter = engine.rate_limiter().metrics();
    let tier_cache = engine.tiers().metrics();
    Json(json!({
        "status": "ok",
        "version": UNREPO_VERSION,
        "store_backend": app_state.stores.backend.to_string(),
        "rate_limit_enabled": engine.rate_limiter().is_enabled(),
        "rate_limiter": {
            "checks": limiter.checks.load(Ordering::Relaxed),
            "rate_limit_exceeded": limiter.rate_limit_exceeded.load(Ordering::Relaxed),
            "store_errors": limiter.store_errors.load(Ordering::Relaxed),
        },
        "tier_cache": {
            "hits": tier_cache.cache_hits.load(Ordering::Relaxed),
            "misses": tier_cache.cache_misses.load(Ordering::Relaxed),
        },
    }))
}
