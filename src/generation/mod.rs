//! Test provisioning: email content in, subject-line test out
//!
//! The same content always resolves to the same test. Lookup order is
//! cache, then the store's fingerprint index, and only then the generator,
//! so a repeated request never pays for a second generation.

pub mod cache;
pub mod llm;

pub use cache::{GenerationCache, MokaGenerationCache};
pub use llm::{OpenAiSubjectGenerator, RetryPolicy};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bandit::types::{
    Fingerprint, StatusTransition, Test, TestId, Variant, VariantId,
};
use crate::bandit::{BanditError, BanditResult};
use crate::constants::MAX_SUBJECT_LINE_CHARS;
use crate::metrics::{self, Timer};
use crate::storage::{BanditStore, StoreError};
use crate::validation;

/// Produces candidate subject lines for a piece of email content
pub trait SubjectLineGenerator: Send + Sync {
    fn generate(&self, content: &str, original_subject: Option<&str>) -> anyhow::Result<Vec<String>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Subject line generator failed: {0:#}")]
    Generator(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedVariant {
    pub variant_id: VariantId,
    pub subject_line: String,
    pub index: u32,
}

/// A test ready to serve, plus whether it already existed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedTest {
    pub test_id: TestId,
    pub fingerprint: Fingerprint,
    pub original_subject: Option<String>,
    pub variants: Vec<ProvisionedVariant>,
    pub cached: bool,
}

impl ProvisionedTest {
    fn from_rows(test: &Test, variants: &[Variant], cached: bool) -> Self {
        Self {
            test_id: test.id,
            fingerprint: test.fingerprint.clone(),
            original_subject: test.original_subject.clone(),
            variants: variants
                .iter()
                .map(|v| ProvisionedVariant {
                    variant_id: v.id,
                    subject_line: v.subject_line.clone(),
                    index: v.index,
                })
                .collect(),
            cached,
        }
    }
}

/// Strip a leading list marker: `1.`, `12)`, `-`, `*`, `•`
fn strip_list_marker(line: &str) -> &str {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if (1..=2).contains(&digits) {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim_start();
        }
    }
    for marker in ["- ", "* ", "•"] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    line
}

/// Clean generator output into at most `limit` distinct subject lines
pub fn sanitize_lines(raw: &[String], limit: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::with_capacity(limit);
    for candidate in raw {
        let line = strip_list_marker(candidate.trim())
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '“' || c == '”')
            .trim();
        if line.is_empty() {
            continue;
        }
        let line: String = line.chars().take(MAX_SUBJECT_LINE_CHARS).collect();
        if lines.iter().any(|existing| existing.eq_ignore_ascii_case(&line)) {
            continue;
        }
        lines.push(line);
        if lines.len() == limit {
            break;
        }
    }
    lines
}

/// Creates tests from content, idempotently
pub struct TestProvisioner {
    store: Arc<dyn BanditStore>,
    generator: Arc<dyn SubjectLineGenerator>,
    cache: Arc<dyn GenerationCache>,
    variants_per_test: usize,
}

impl TestProvisioner {
    pub fn new(
        store: Arc<dyn BanditStore>,
        generator: Arc<dyn SubjectLineGenerator>,
        cache: Arc<dyn GenerationCache>,
        variants_per_test: usize,
    ) -> Self {
        Self {
            store,
            generator,
            cache,
            variants_per_test: variants_per_test.max(1),
        }
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    /// Return the test for `content`, generating and storing it on first sight
    pub fn provision(
        &self,
        content: &str,
        original_subject: Option<&str>,
    ) -> Result<ProvisionedTest, GenerationError> {
        let result = self.try_provision(content, original_subject);
        if result.is_err() {
            metrics::GENERATION_TOTAL.with_label_values(&["failed"]).inc();
        }
        result
    }

    fn try_provision(
        &self,
        content: &str,
        original_subject: Option<&str>,
    ) -> Result<ProvisionedTest, GenerationError> {
        validation::validate_email_content(content).map_err(|e| GenerationError::InvalidInput {
            field: "email_content".to_string(),
            reason: e.to_string(),
        })?;
        validation::validate_original_subject(original_subject).map_err(|e| {
            GenerationError::InvalidInput {
                field: "original_subject".to_string(),
                reason: e.to_string(),
            }
        })?;

        let fingerprint = Fingerprint::of(content);

        if let Some(mut hit) = self.cache.get(&fingerprint) {
            metrics::GENERATION_TOTAL.with_label_values(&["cache_hit"]).inc();
            hit.cached = true;
            return Ok(hit);
        }

        if let Some(existing) = self.store.find_test_by_fingerprint(&fingerprint)? {
            let variants = self.store.load_variants(existing.id)?;
            let found = ProvisionedTest::from_rows(&existing, &variants, true);
            self.cache.set(fingerprint, found.clone());
            metrics::GENERATION_TOTAL.with_label_values(&["stored"]).inc();
            return Ok(found);
        }

        let raw = {
            let _timer = Timer::new(metrics::GENERATION_DURATION.clone());
            self.generator
                .generate(content.trim(), original_subject)
                .map_err(GenerationError::Generator)?
        };
        let lines = sanitize_lines(&raw, self.variants_per_test);
        if lines.is_empty() {
            warn!(generator = self.generator.name(), raw = raw.len(), "Generator produced no usable subject lines");
            return Err(GenerationError::Generator(anyhow::anyhow!(
                "generator returned no usable subject lines"
            )));
        }

        let test = Test::new(fingerprint.clone(), original_subject.map(str::to_string));
        let variants: Vec<Variant> = lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| Variant::new(test.id, i as u32, line))
            .collect();

        let stored = self.store.create_test(&test, &variants)?;
        let provisioned = if stored.id == test.id {
            metrics::GENERATION_TOTAL.with_label_values(&["generated"]).inc();
            info!(test_id = %test.id, variants = variants.len(), "Created subject line test");
            ProvisionedTest::from_rows(&test, &variants, false)
        } else {
            // Lost a creation race; serve the winner's rows
            let winner_variants = self.store.load_variants(stored.id)?;
            metrics::GENERATION_TOTAL.with_label_values(&["stored"]).inc();
            ProvisionedTest::from_rows(&stored, &winner_variants, true)
        };

        self.cache.set(fingerprint, provisioned.clone());
        Ok(provisioned)
    }

    /// Apply a lifecycle transition
    pub fn set_status(&self, test_id: TestId, transition: StatusTransition) -> BanditResult<Test> {
        let test = self
            .store
            .load_test(test_id)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        let target = transition.apply(test.status).ok_or_else(|| {
            BanditError::invalid(
                "status",
                format!("cannot {transition:?} a test that is {}", test.status).to_lowercase(),
            )
        })?;

        let updated = self
            .store
            .set_status(test_id, target)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        info!(test_id = %test_id, from = %test.status, to = %target, "Test status changed");
        Ok(updated)
    }

    /// Delete a test with its variants and events, and forget it in the cache
    pub fn delete_test(&self, test_id: TestId) -> BanditResult<()> {
        let test = self
            .store
            .load_test(test_id)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        if !self.store.delete_test(test_id)? {
            return Err(BanditError::TestNotFound(test_id));
        }
        self.cache.invalidate(&test.fingerprint);
        Ok(())
    }
}
