//! Health and Infrastructure Handlers
//!
//! Kubernetes probes and the Prometheus scrape endpoint.

use axum::{extract::State, http::StatusCode, response::Json};

use super::router::AppState;
use crate::metrics;

/// Health response for main health endpoint
#[derive(serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store_backend: String,
    pub generator: String,
    pub exploration_threshold: u64,
}

/// Main health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_backend: state.store().backend_name().to_string(),
        generator: state.provisioner().generator_name().to_string(),
        exploration_threshold: state.selector().config().exploration_threshold,
    })
}

/// Liveness probe - indicates if process is alive and not deadlocked
pub async fn health_live() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

/// Readiness probe - 200 once the store answers reads, 503 otherwise
pub async fn health_ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let probe = tokio::task::spawn_blocking(move || state.store().list_tests()).await;

    match probe {
        Ok(Ok(tests)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "version": env!("CARGO_PKG_VERSION"),
                "tests": tests.len(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            })),
        ),
        Ok(Err(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "error": e.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "error": format!("readiness probe panicked: {e}"),
                "timestamp": chrono::Utc::now().to_rfc3339()
            })),
        ),
    }
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<String, StatusCode> {
    use prometheus::Encoder;

    // Refresh the active-tests gauge before serving
    let tests = tokio::task::spawn_blocking(move || state.store().list_tests())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if let Ok(tests) = tests {
        let active = tests.iter().filter(|t| t.is_active()).count();
        metrics::ACTIVE_TESTS.set(active as i64);
    }

    let encoder = prometheus::TextEncoder::new();
    let metric_families = metrics::METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
