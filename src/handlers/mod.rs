//! HTTP API Handlers
//!
//! Thin axum plumbing over [`ExperimentManager`]. Each submodule handles one
//! area of the API.

// Core modules
pub mod router;
pub mod state;

// Health and metrics
pub mod health;

// Provisioning, selection, tracking and analytics
pub mod experiments;

// Test utilities (compiled only in test builds)
#[cfg(test)]
pub mod test_helpers;

// Re-export commonly used items
pub use router::{build_api_routes, build_public_routes, build_router, AppState};
pub use state::ExperimentManager;
