//! Input validation for request payloads
//! Rejects malformed input before it reaches the generator or the store

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

use crate::bandit::types::{TestId, VariantId};

/// Maximum lengths
pub const MAX_CONTENT_LENGTH: usize = 10_000;
pub const MIN_CONTENT_LENGTH: usize = 10;
pub const MAX_ORIGINAL_SUBJECT_LENGTH: usize = 255;
pub const MAX_METADATA_ENTRIES: usize = 32;
pub const MAX_METADATA_VALUE_LENGTH: usize = 1_000;
pub const MAX_LIST_LIMIT: usize = 1_000;

/// Validate email content (length counted in chars, after trimming)
pub fn validate_email_content(content: &str) -> Result<()> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("email_content cannot be empty"));
    }

    let chars = trimmed.chars().count();
    if chars < MIN_CONTENT_LENGTH {
        return Err(anyhow!(
            "email_content too short: {chars} chars (min: {MIN_CONTENT_LENGTH})"
        ));
    }
    if chars > MAX_CONTENT_LENGTH {
        return Err(anyhow!(
            "email_content too long: {chars} chars (max: {MAX_CONTENT_LENGTH})"
        ));
    }

    Ok(())
}

/// Validate optional original subject line
pub fn validate_original_subject(subject: Option<&str>) -> Result<()> {
    if let Some(subject) = subject {
        let chars = subject.chars().count();
        if chars > MAX_ORIGINAL_SUBJECT_LENGTH {
            return Err(anyhow!(
                "original_subject too long: {chars} chars (max: {MAX_ORIGINAL_SUBJECT_LENGTH})"
            ));
        }
    }
    Ok(())
}

/// Validate event metadata attached to a tracking call
pub fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<()> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(anyhow!(
            "too many metadata entries: {} (max: {MAX_METADATA_ENTRIES})",
            metadata.len()
        ));
    }

    for (key, value) in metadata {
        if key.is_empty() {
            return Err(anyhow!("metadata keys cannot be empty"));
        }
        if value.len() > MAX_METADATA_VALUE_LENGTH {
            return Err(anyhow!(
                "metadata value for '{key}' too long: {} bytes (max: {MAX_METADATA_VALUE_LENGTH})",
                value.len()
            ));
        }
    }
    Ok(())
}

/// Validate a list limit
pub fn validate_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(anyhow!("limit must be greater than 0"));
    }
    if limit > MAX_LIST_LIMIT {
        return Err(anyhow!("limit too large: {limit} (max: {MAX_LIST_LIMIT})"));
    }
    Ok(())
}

/// Validate test_id (UUID format)
pub fn validate_test_id(test_id: &str) -> Result<TestId> {
    test_id
        .parse()
        .map_err(|e| anyhow!("Invalid test_id UUID format: {e}"))
}

/// Validate variant_id (UUID format)
pub fn validate_variant_id(variant_id: &str) -> Result<VariantId> {
    variant_id
        .parse()
        .map_err(|e| anyhow!("Invalid variant_id UUID format: {e}"))
}
