//! Multi-armed bandit over subject-line variants
//!
//! [`BanditSelector`] decides which variant to serve and records outcome
//! events against it. Selection runs in two phases:
//!
//! - exploration: round-robin on `times_selected` until the test has served
//!   `exploration_threshold` selections in total
//! - exploitation: Thompson sampling on `(conversions, times_sent)`
//!
//! All counter changes go through a [`StoreTransaction`](crate::storage::StoreTransaction).

pub mod selector;
pub mod types;

pub use selector::BanditSelector;
pub use types::*;

use serde::{Deserialize, Serialize};

use crate::constants::{EXPLORATION_THRESHOLD, WILSON_Z_95};
use crate::storage::StoreError;

/// Tuning for the selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Total selections before Thompson sampling takes over
    pub exploration_threshold: u64,

    /// z value for reported Wilson intervals
    pub confidence_z: f64,

    /// Reject open/click/conversion events that would exceed `times_sent`
    pub enforce_causal_order: bool,

    /// Fixed RNG seed for reproducible Thompson draws
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_threshold: EXPLORATION_THRESHOLD,
            confidence_z: WILSON_Z_95,
            enforce_causal_order: false,
            seed: None,
        }
    }
}

/// Coarse failure classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    PersistenceFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum BanditError {
    #[error("Test not found: {0}")]
    TestNotFound(TestId),

    #[error("Test {id} is {status}, only active tests serve variants")]
    TestNotActive { id: TestId, status: TestStatus },

    #[error("Test {0} has no variants")]
    NoVariants(TestId),

    #[error("Variant not found: {0}")]
    VariantNotFound(VariantId),

    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl BanditError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TestNotFound(_)
            | Self::TestNotActive { .. }
            | Self::NoVariants(_)
            | Self::VariantNotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// Only persistence failures are worth retrying, and only some of them
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short label for metrics and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TestNotFound(_) => "test_not_found",
            Self::TestNotActive { .. } => "test_not_active",
            Self::NoVariants(_) => "no_variants",
            Self::VariantNotFound(_) => "variant_not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Persistence(StoreError::Timeout(_)) => "store_timeout",
            Self::Persistence(StoreError::Conflict(_)) => "store_conflict",
            Self::Persistence(_) => "store_error",
        }
    }
}

pub type BanditResult<T> = std::result::Result<T, BanditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BanditError::TestNotFound(TestId::new()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BanditError::TestNotActive {
                id: TestId::new(),
                status: TestStatus::Paused
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BanditError::invalid("event_type", "bad").kind(),
            ErrorKind::InvalidInput
        );
        let timeout = BanditError::from(StoreError::Timeout("lock".into()));
        assert_eq!(timeout.kind(), ErrorKind::PersistenceFailure);
        assert!(timeout.is_retryable());
        assert_eq!(timeout.reason(), "store_timeout");
        assert!(!BanditError::from(StoreError::Codec("x".into())).is_retryable());
    }

    #[test]
    fn test_default_config() {
        let config = BanditConfig::default();
        assert_eq!(config.exploration_threshold, 5000);
        assert_eq!(config.confidence_z, 1.96);
        assert!(!config.enforce_causal_order);
    }
}
