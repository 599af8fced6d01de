//! Experiment Handlers
//!
//! Test provisioning, variant selection, event tracking, lifecycle and
//! analytics. Every store call is blocking and runs on the blocking pool.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::router::AppState;
use crate::bandit::types::{
    DashboardMetrics, EventRecord, PerformanceReport, RecordedEvent, Selection, StatusTransition,
    TestComparison, TestId, TestStatus, TestSummary, TopPerformer, VariantDetail,
};
use crate::constants::{TOP_PERFORMERS_LIMIT, TOP_PERFORMERS_MIN_SENDS};
use crate::errors::{AppError, ValidationErrorExt};
use crate::generation::ProvisionedVariant;
use crate::validation;

/// Run blocking store work off the async runtime
async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Blocking task panicked: {e}")))?
}

fn parse_test_id(raw: &str) -> Result<TestId, AppError> {
    validation::validate_test_id(raw).map_err(|e| AppError::InvalidTestId(e.to_string()))
}

// =============================================================================
// GENERATE
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub email_content: String,
    #[serde(default)]
    pub original_subject: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub test_id: TestId,
    pub variants: Vec<ProvisionedVariant>,
    pub cached: bool,
    pub generated_at: DateTime<Utc>,
}

/// POST /api/generate - Create (or fetch) the test for a piece of email content
#[tracing::instrument(skip(state, req), fields(content_len = req.email_content.len()))]
pub async fn generate_test(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let provisioned = blocking(move || {
        state
            .provisioner()
            .provision(&req.email_content, req.original_subject.as_deref())
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(GenerateResponse {
        test_id: provisioned.test_id,
        variants: provisioned.variants,
        cached: provisioned.cached,
        generated_at: Utc::now(),
    }))
}

// =============================================================================
// SELECT & TRACK
// =============================================================================

/// POST /api/tests/{test_id}/select - Pick the variant to send next
#[tracing::instrument(skip(state))]
pub async fn select_variant(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<Selection>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    let selection = blocking(move || {
        state
            .selector()
            .select_variant(test_id)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(selection))
}

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    #[serde(alias = "variation_id")]
    pub variant_id: String,
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrackResponse {
    pub success: bool,
    pub message: String,
    pub event: RecordedEvent,
}

/// Flatten JSON metadata into the string map stored with each event
fn flatten_metadata(raw: serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect()
}

/// POST /api/track - Record a send, open, click or conversion
#[tracing::instrument(skip(state, req), fields(variant_id = %req.variant_id, event_type = %req.event_type))]
pub async fn track_event(
    State(state): State<AppState>,
    Json(req): Json<TrackRequest>,
) -> Result<Json<TrackResponse>, AppError> {
    let variant_id = validation::validate_variant_id(&req.variant_id)
        .map_err(|e| AppError::InvalidVariantId(e.to_string()))?;
    let metadata = flatten_metadata(req.metadata);
    validation::validate_metadata(&metadata).map_validation_err("metadata")?;

    let event_type = req.event_type;
    let event = blocking(move || {
        state
            .selector()
            .record_event(variant_id, &event_type, metadata)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(TrackResponse {
        success: true,
        message: format!("Recorded {} for variant {}", event.kind, event.variant_id),
        event,
    }))
}

// =============================================================================
// TESTS
// =============================================================================

/// GET /api/tests/{test_id}/performance - Per-variant report, best first
#[tracing::instrument(skip(state))]
pub async fn test_performance(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<PerformanceReport>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    let report = blocking(move || {
        state
            .selector()
            .test_performance(test_id)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(report))
}

/// GET /api/tests/{test_id}/comparison - Ranked variants and the winner, if any
#[tracing::instrument(skip(state))]
pub async fn compare_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestComparison>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    let comparison = blocking(move || {
        state
            .selector()
            .compare_test(test_id)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(comparison))
}

/// GET /api/variants/{variant_id}/performance - Lifetime and last-24h view of one variant
#[tracing::instrument(skip(state))]
pub async fn variant_performance(
    State(state): State<AppState>,
    Path(variant_id): Path<String>,
) -> Result<Json<VariantDetail>, AppError> {
    let variant_id = validation::validate_variant_id(&variant_id)
        .map_err(|e| AppError::InvalidVariantId(e.to_string()))?;
    let detail = blocking(move || {
        state
            .selector()
            .variant_performance(variant_id)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(detail))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTestsResponse {
    pub tests: Vec<TestSummary>,
    pub count: usize,
}

/// GET /api/tests - All tests, oldest first
#[tracing::instrument(skip(state))]
pub async fn list_tests(
    State(state): State<AppState>,
) -> Result<Json<ListTestsResponse>, AppError> {
    let tests = blocking(move || state.selector().list_tests().map_err(AppError::from)).await?;

    Ok(Json(ListTestsResponse {
        count: tests.len(),
        tests,
    }))
}

fn default_events_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<EventRecord>,
    pub count: usize,
}

/// GET /api/tests/{test_id}/events/{variant_id} - Recent events of one variant
#[tracing::instrument(skip(state))]
pub async fn variant_events(
    State(state): State<AppState>,
    Path((test_id, variant_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    let variant_id = validation::validate_variant_id(&variant_id)
        .map_err(|e| AppError::InvalidVariantId(e.to_string()))?;
    validation::validate_limit(query.limit).map_validation_err("limit")?;

    let events = blocking(move || {
        state
            .selector()
            .recent_events(test_id, variant_id, query.limit)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestStatusResponse {
    pub success: bool,
    pub test_id: TestId,
    pub status: TestStatus,
}

async fn transition(
    state: AppState,
    test_id: String,
    transition: StatusTransition,
) -> Result<Json<TestStatusResponse>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    let test = blocking(move || {
        state
            .provisioner()
            .set_status(test_id, transition)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(TestStatusResponse {
        success: true,
        test_id: test.id,
        status: test.status,
    }))
}

/// POST /api/tests/{test_id}/pause - Stop serving a test
#[tracing::instrument(skip(state))]
pub async fn pause_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestStatusResponse>, AppError> {
    transition(state, test_id, StatusTransition::Pause).await
}

/// POST /api/tests/{test_id}/resume - Serve a paused test again
#[tracing::instrument(skip(state))]
pub async fn resume_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestStatusResponse>, AppError> {
    transition(state, test_id, StatusTransition::Resume).await
}

/// POST /api/tests/{test_id}/complete - Close a test for good
#[tracing::instrument(skip(state))]
pub async fn complete_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<TestStatusResponse>, AppError> {
    transition(state, test_id, StatusTransition::Complete).await
}

/// DELETE /api/tests/{test_id} - Remove a test with its variants and events
#[tracing::instrument(skip(state))]
pub async fn delete_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let test_id = parse_test_id(&test_id)?;
    blocking(move || {
        state
            .provisioner()
            .delete_test(test_id)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Test {test_id} deleted"),
    })))
}

// =============================================================================
// ANALYTICS
// =============================================================================

/// GET /api/analytics/dashboard - Cross-test aggregates
#[tracing::instrument(skip(state))]
pub async fn dashboard(
    State(state): State<AppState>,
) -> Result<Json<DashboardMetrics>, AppError> {
    let metrics = blocking(move || state.selector().dashboard().map_err(AppError::from)).await?;
    Ok(Json(metrics))
}

fn default_top_limit() -> usize {
    TOP_PERFORMERS_LIMIT
}

fn default_min_sends() -> u64 {
    TOP_PERFORMERS_MIN_SENDS
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_top_limit")]
    pub limit: usize,
    #[serde(default = "default_min_sends")]
    pub min_sends: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopPerformersResponse {
    pub performers: Vec<TopPerformer>,
    pub min_sends: u64,
}

/// GET /api/analytics/top - Best converting variants across all tests
#[tracing::instrument(skip(state))]
pub async fn top_performers(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<TopPerformersResponse>, AppError> {
    validation::validate_limit(query.limit).map_validation_err("limit")?;

    let TopQuery { limit, min_sends } = query;
    let performers = blocking(move || {
        state
            .selector()
            .top_performers(limit, min_sends)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(TopPerformersResponse {
        performers,
        min_sends,
    }))
}
