//! Router Configuration - Centralized route definitions
//!
//! Public routes carry probes and metrics. API routes map one-to-one onto the
//! selector and provisioner operations.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::state::ExperimentManager;
use super::{experiments, health};

/// Application state type alias
pub type AppState = Arc<ExperimentManager>;

/// Build the infrastructure routes (probes and Prometheus scraping)
pub fn build_public_routes(state: AppState) -> Router {
    Router::new()
        // =================================================================
        // HEALTH & KUBERNETES PROBES
        // =================================================================
        .route("/health", get(health::health))
        .route("/health/live", get(health::health_live))
        .route("/health/ready", get(health::health_ready))
        // =================================================================
        // METRICS (PROMETHEUS)
        // =================================================================
        .route("/metrics", get(health::metrics_endpoint))
        .with_state(state)
}

/// Build the experiment API routes
pub fn build_api_routes(state: AppState) -> Router {
    Router::new()
        // =================================================================
        // PROVISIONING
        // =================================================================
        .route("/api/generate", post(experiments::generate_test))
        // =================================================================
        // SELECTION & TRACKING
        // =================================================================
        .route(
            "/api/tests/{test_id}/select",
            post(experiments::select_variant),
        )
        .route("/api/track", post(experiments::track_event))
        // =================================================================
        // TESTS
        // =================================================================
        .route("/api/tests", get(experiments::list_tests))
        .route("/api/tests/{test_id}", delete(experiments::delete_test))
        .route(
            "/api/tests/{test_id}/performance",
            get(experiments::test_performance),
        )
        .route(
            "/api/tests/{test_id}/events/{variant_id}",
            get(experiments::variant_events),
        )
        .route(
            "/api/tests/{test_id}/comparison",
            get(experiments::compare_test),
        )
        .route("/api/tests/{test_id}/pause", post(experiments::pause_test))
        .route(
            "/api/tests/{test_id}/resume",
            post(experiments::resume_test),
        )
        .route(
            "/api/tests/{test_id}/complete",
            post(experiments::complete_test),
        )
        // =================================================================
        // ANALYTICS
        // =================================================================
        .route("/api/analytics/dashboard", get(experiments::dashboard))
        .route("/api/analytics/top", get(experiments::top_performers))
        .route(
            "/api/variants/{variant_id}/performance",
            get(experiments::variant_performance),
        )
        .with_state(state)
}

/// Build the complete router
///
/// Global layers (metrics, concurrency limit, CORS) are applied by main.rs.
pub fn build_router(state: AppState) -> Router {
    let public = build_public_routes(state.clone());
    let api = build_api_routes(state);

    Router::new().merge(public).merge(api)
}
