//! Variant selection and event recording
//!
//! The selector owns no row state. Each call reads the counters it needs,
//! decides, and pushes increments through a store transaction that is
//! committed before the call returns. The only in-process state is the RNG
//! used for Thompson draws.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::types::{
    ActivityCounts, DashboardMetrics, EventKind, EventRecord, PerformanceReport,
    PerformanceSnapshot, RecentPerformance, RecordedEvent, Selection, SelectionMethod,
    TestComparison, TestId, TestStatus, TestSummary, TopPerformer, Variant, VariantDetail,
    VariantId, VariantPerformance, WinningVariant,
};
use super::{BanditConfig, BanditError, BanditResult};
use crate::constants::{DASHBOARD_RECENT_DAYS, VARIANT_ACTIVITY_WINDOW_HOURS, WINNER_MIN_SENDS};
use crate::metrics::{self, Timer};
use crate::stats;
use crate::storage::{BanditStore, StoreError};

/// Index of the least-selected variant; ties go to the earliest position.
///
/// `variants` must be in index order. Returns `None` only for an empty slice.
pub fn pick_round_robin(variants: &[Variant]) -> Option<usize> {
    variants
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.counters.times_selected)
        .map(|(i, _)| i)
}

/// Index of the variant with the strictly greatest Thompson draw on
/// `(conversions, times_sent)`; ties go to the earliest position.
pub fn pick_thompson<R: Rng + ?Sized>(variants: &[Variant], rng: &mut R) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, variant) in variants.iter().enumerate() {
        let draw =
            stats::sample_thompson_with(rng, variant.counters.conversions, variant.counters.times_sent);
        match best {
            Some((_, best_draw)) if draw <= best_draw => {}
            _ => best = Some((i, draw)),
        }
    }
    best.map(|(i, _)| i)
}

/// A row that vanished after the unlocked existence read was deleted
/// concurrently; callers see that as not-found, not a storage fault.
fn missing_row_as_not_found(variant_id: VariantId) -> impl Fn(StoreError) -> BanditError {
    move |e| match e {
        StoreError::MissingRow(_) => BanditError::VariantNotFound(variant_id),
        other => BanditError::Persistence(other),
    }
}

/// Winner of a ranked list, if the leader has enough sends.
///
/// `ranked` must be sorted best conversion rate first. Improvement is the
/// leader's relative lift in percent over the mean rate of the others, and
/// 0 when there are no others or their mean is 0.
pub fn pick_winner(ranked: &[VariantPerformance], min_sends: u64) -> Option<WinningVariant> {
    let (leader, rest) = ranked.split_first()?;
    if leader.times_sent < min_sends {
        return None;
    }

    let improvement_pct = if rest.is_empty() {
        0.0
    } else {
        let mean = rest.iter().map(|v| v.conversion_rate).sum::<f64>() / rest.len() as f64;
        if mean > 0.0 {
            (leader.conversion_rate - mean) / mean * 100.0
        } else {
            0.0
        }
    };

    Some(WinningVariant {
        variant_id: leader.variant_id,
        subject_line: leader.subject_line.clone(),
        times_sent: leader.times_sent,
        conversion_rate: leader.conversion_rate,
        improvement_pct,
    })
}

/// Two-phase bandit over the variants of a test
pub struct BanditSelector {
    store: Arc<dyn BanditStore>,
    config: BanditConfig,
    rng: Mutex<StdRng>,
}

impl BanditSelector {
    pub fn new(store: Arc<dyn BanditStore>, config: BanditConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BanditStore> {
        &self.store
    }

    fn snapshot(&self, variant: &Variant) -> PerformanceSnapshot {
        let c = &variant.counters;
        PerformanceSnapshot {
            open_rate: c.open_rate(),
            click_rate: c.click_rate(),
            conversion_rate: c.conversion_rate(),
            confidence_interval: stats::wilson_score_with_z(
                c.conversions,
                c.times_sent,
                self.config.confidence_z,
            ),
            times_selected: c.times_selected,
            times_sent: c.times_sent,
        }
    }

    fn performance_row(&self, variant: &Variant) -> VariantPerformance {
        let c = &variant.counters;
        VariantPerformance {
            variant_id: variant.id,
            subject_line: variant.subject_line.clone(),
            index: variant.index,
            times_selected: c.times_selected,
            times_sent: c.times_sent,
            opens: c.opens,
            clicks: c.clicks,
            conversions: c.conversions,
            open_rate: c.open_rate(),
            click_rate: c.click_rate(),
            conversion_rate: c.conversion_rate(),
            confidence_interval: stats::wilson_score_with_z(
                c.conversions,
                c.times_sent,
                self.config.confidence_z,
            ),
        }
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    /// Pick a variant of an active test and commit `times_selected += 1`.
    ///
    /// An `Ok` means the increment is durable. Any `Err` means nothing was
    /// selected and nothing was written.
    pub fn select_variant(&self, test_id: TestId) -> BanditResult<Selection> {
        let _timer = Timer::new(metrics::SELECTION_DURATION.clone());

        match self.try_select(test_id) {
            Ok(selection) => {
                metrics::SELECTIONS_TOTAL
                    .with_label_values(&[selection.selection_method.as_str()])
                    .inc();
                info!(
                    test_id = %test_id,
                    variant_id = %selection.variant_id,
                    method = selection.selection_method.as_str(),
                    times_selected = selection.performance.times_selected,
                    "variant selected"
                );
                Ok(selection)
            }
            Err(e) => {
                metrics::SELECTION_FAILURES_TOTAL
                    .with_label_values(&[e.reason()])
                    .inc();
                warn!(
                    test_id = %test_id,
                    reason = e.reason(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "selection failed"
                );
                Err(e)
            }
        }
    }

    fn try_select(&self, test_id: TestId) -> BanditResult<Selection> {
        let test = self
            .store
            .load_test(test_id)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        if !test.is_active() {
            return Err(BanditError::TestNotActive {
                id: test_id,
                status: test.status,
            });
        }

        let variants = self.store.load_variants(test_id)?;
        let total_selected: u64 = variants.iter().map(|v| v.counters.times_selected).sum();

        let (chosen, method) = if total_selected < self.config.exploration_threshold {
            (pick_round_robin(&variants), SelectionMethod::RoundRobin)
        } else {
            let mut rng = self.rng.lock();
            (
                pick_thompson(&variants, &mut *rng),
                SelectionMethod::ThompsonSampling,
            )
        };
        let chosen = chosen
            .map(|i| &variants[i])
            .ok_or(BanditError::NoVariants(test_id))?;

        debug!(
            test_id = %test_id,
            total_selected,
            method = method.as_str(),
            index = chosen.index,
            "selection decided"
        );

        let not_found = missing_row_as_not_found(chosen.id);
        let mut txn = self.store.begin()?;
        let committed = txn.increment_selected(chosen.id).map_err(&not_found)?;
        txn.commit().map_err(&not_found)?;

        Ok(Selection {
            variant_id: committed.id,
            test_id,
            subject_line: committed.subject_line.clone(),
            selection_method: method,
            performance: self.snapshot(&committed),
        })
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Record one outcome event and its counter increment atomically.
    ///
    /// `event_type` is validated before any store access.
    pub fn record_event(
        &self,
        variant_id: VariantId,
        event_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> BanditResult<RecordedEvent> {
        let kind: EventKind = match event_type.parse() {
            Ok(kind) => kind,
            Err(e) => {
                metrics::EVENTS_TOTAL
                    .with_label_values(&["unknown", "invalid_input"])
                    .inc();
                warn!(variant_id = %variant_id, event_type, "rejected unknown event type");
                return Err(BanditError::invalid("event_type", format!("{e}")));
            }
        };

        let result = self.try_record(variant_id, kind, metadata);
        let outcome = match &result {
            Ok(_) => "recorded",
            Err(e) => e.reason(),
        };
        metrics::EVENTS_TOTAL
            .with_label_values(&[kind.as_str(), outcome])
            .inc();

        match &result {
            Ok(recorded) => info!(
                variant_id = %variant_id,
                test_id = %recorded.test_id,
                event_type = kind.as_str(),
                event_id = %recorded.event_id,
                "event recorded"
            ),
            Err(e) => warn!(
                variant_id = %variant_id,
                event_type = kind.as_str(),
                reason = e.reason(),
                error = %e,
                "event not recorded"
            ),
        }
        result
    }

    fn try_record(
        &self,
        variant_id: VariantId,
        kind: EventKind,
        metadata: BTreeMap<String, String>,
    ) -> BanditResult<RecordedEvent> {
        if self.store.load_variant(variant_id)?.is_none() {
            return Err(BanditError::VariantNotFound(variant_id));
        }

        let not_found = missing_row_as_not_found(variant_id);
        let mut txn = self.store.begin()?;
        let updated = txn
            .apply_event_counter(variant_id, kind)
            .map_err(&not_found)?;

        if self.config.enforce_causal_order && !updated.counters.is_causally_consistent() {
            txn.rollback()?;
            return Err(BanditError::invalid(
                "causal_order",
                format!(
                    "{kind} would exceed times_sent ({}) for variant {variant_id}",
                    updated.counters.times_sent
                ),
            ));
        }

        let record = EventRecord::new(&updated, kind, metadata);
        txn.insert_event(&record).map_err(&not_found)?;
        txn.commit().map_err(&not_found)?;

        let c = updated.counters;
        Ok(RecordedEvent {
            event_id: record.id,
            variant_id,
            test_id: updated.test_id,
            kind,
            counters: c,
            open_rate: c.open_rate(),
            click_rate: c.click_rate(),
            conversion_rate: c.conversion_rate(),
        })
    }

    /// Most recent events of a variant, newest first
    pub fn recent_events(
        &self,
        test_id: TestId,
        variant_id: VariantId,
        limit: usize,
    ) -> BanditResult<Vec<EventRecord>> {
        match self.store.load_variant(variant_id)? {
            Some(variant) if variant.test_id == test_id => {}
            _ => return Err(BanditError::VariantNotFound(variant_id)),
        }

        let mut events = self.store.load_events(variant_id)?;
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    /// Per-variant performance, best conversion rate first
    pub fn test_performance(&self, test_id: TestId) -> BanditResult<PerformanceReport> {
        let test = self
            .store
            .load_test(test_id)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        let variants = self.store.load_variants(test_id)?;

        let total_samples = variants.iter().map(|v| v.counters.times_sent).sum();
        let rows = self.ranked_rows(&variants);

        Ok(PerformanceReport {
            test_id,
            status: test.status,
            original_subject: test.original_subject,
            created_at: test.created_at,
            total_samples,
            variants: rows,
        })
    }

    fn ranked_rows(&self, variants: &[Variant]) -> Vec<VariantPerformance> {
        let mut rows: Vec<VariantPerformance> =
            variants.iter().map(|v| self.performance_row(v)).collect();
        // Stable sort keeps index order among equal rates
        rows.sort_by(|a, b| {
            b.conversion_rate
                .partial_cmp(&a.conversion_rate)
                .unwrap_or(Ordering::Equal)
        });
        rows
    }

    /// Ranked variants of a test plus the declared winner, if any.
    ///
    /// A winner needs at least [`WINNER_MIN_SENDS`] sends on the top-ranked
    /// variant; its improvement is measured against the mean conversion rate
    /// of the remaining variants.
    pub fn compare_test(&self, test_id: TestId) -> BanditResult<TestComparison> {
        let test = self
            .store
            .load_test(test_id)?
            .ok_or(BanditError::TestNotFound(test_id))?;
        let variants = self.store.load_variants(test_id)?;
        let rows = self.ranked_rows(&variants);
        let winner = pick_winner(&rows, WINNER_MIN_SENDS);

        debug!(
            test_id = %test_id,
            variants = rows.len(),
            winner = ?winner.as_ref().map(|w| w.variant_id),
            "test compared"
        );

        Ok(TestComparison {
            test_id,
            status: test.status,
            original_subject: test.original_subject,
            created_at: test.created_at,
            total_variants: rows.len(),
            total_samples: rows.iter().map(|r| r.times_sent).sum(),
            variants: rows,
            winner,
        })
    }

    /// Lifetime metrics of one variant plus its event counts over the last
    /// [`VARIANT_ACTIVITY_WINDOW_HOURS`] hours
    pub fn variant_performance(&self, variant_id: VariantId) -> BanditResult<VariantDetail> {
        let variant = self
            .store
            .load_variant(variant_id)?
            .ok_or(BanditError::VariantNotFound(variant_id))?;
        // Test deleted between the two reads
        let test = self
            .store
            .load_test(variant.test_id)?
            .ok_or(BanditError::VariantNotFound(variant_id))?;

        let since = Utc::now() - Duration::hours(VARIANT_ACTIVITY_WINDOW_HOURS);
        let mut recent = ActivityCounts::default();
        for event in self.store.load_events(variant_id)? {
            if event.occurred_at >= since {
                recent.add(event.kind);
            }
        }

        Ok(VariantDetail {
            variant_id,
            test_id: test.id,
            test_status: test.status,
            subject_line: variant.subject_line.clone(),
            index: variant.index,
            created_at: variant.created_at,
            lifetime: self.performance_row(&variant),
            window_hours: VARIANT_ACTIVITY_WINDOW_HOURS,
            recent,
        })
    }

    /// All tests, oldest first
    pub fn list_tests(&self) -> BanditResult<Vec<TestSummary>> {
        let tests = self.store.list_tests()?;
        let mut summaries = Vec::with_capacity(tests.len());
        for test in tests {
            let variants = self.store.load_variants(test.id)?;
            summaries.push(TestSummary {
                test_id: test.id,
                status: test.status,
                original_subject: test.original_subject,
                created_at: test.created_at,
                variant_count: variants.len(),
                total_selected: variants.iter().map(|v| v.counters.times_selected).sum(),
                total_sent: variants.iter().map(|v| v.counters.times_sent).sum(),
            });
        }
        Ok(summaries)
    }

    /// Aggregates across every test
    pub fn dashboard(&self) -> BanditResult<DashboardMetrics> {
        let tests = self.store.list_tests()?;
        let week_ago = Utc::now() - Duration::days(DASHBOARD_RECENT_DAYS);

        let mut overall = ActivityCounts::default();
        let mut recent = ActivityCounts::default();
        let mut total_variants = 0;
        for test in &tests {
            for variant in self.store.load_variants(test.id)? {
                total_variants += 1;
                overall.absorb(&variant.counters);
                if test.created_at >= week_ago {
                    recent.absorb(&variant.counters);
                }
            }
        }

        let active_tests = tests.iter().filter(|t| t.is_active()).count();
        metrics::ACTIVE_TESTS.set(active_tests as i64);

        Ok(DashboardMetrics {
            total_tests: tests.len(),
            active_tests,
            completed_tests: tests
                .iter()
                .filter(|t| t.status == TestStatus::Completed)
                .count(),
            total_variants,
            total_emails_sent: overall.send,
            overall_open_rate: stats::rate(overall.open, overall.send),
            overall_click_rate: stats::rate(overall.click, overall.send),
            overall_conversion_rate: stats::rate(overall.conversion, overall.send),
            tests_created_this_week: tests.iter().filter(|t| t.created_at >= week_ago).count(),
            recent_performance: RecentPerformance::new(DASHBOARD_RECENT_DAYS, recent),
            top_performer: self.top_performers(1, WINNER_MIN_SENDS)?.into_iter().next(),
        })
    }

    /// Variants across all tests with at least `min_sends` sends, ranked by
    /// conversion rate (then by sends, so larger samples win ties)
    pub fn top_performers(&self, limit: usize, min_sends: u64) -> BanditResult<Vec<TopPerformer>> {
        let mut ranked = Vec::new();
        for test in self.store.list_tests()? {
            for variant in self.store.load_variants(test.id)? {
                let c = variant.counters;
                if c.times_sent < min_sends {
                    continue;
                }
                ranked.push(TopPerformer {
                    test_id: test.id,
                    variant_id: variant.id,
                    subject_line: variant.subject_line,
                    times_sent: c.times_sent,
                    open_rate: c.open_rate(),
                    click_rate: c.click_rate(),
                    conversion_rate: c.conversion_rate(),
                    confidence_interval: stats::wilson_score_with_z(
                        c.conversions,
                        c.times_sent,
                        self.config.confidence_z,
                    ),
                    test_created_at: test.created_at,
                });
            }
        }

        ranked.sort_by(|a, b| {
            b.conversion_rate
                .partial_cmp(&a.conversion_rate)
                .unwrap_or(Ordering::Equal)
                .then(b.times_sent.cmp(&a.times_sent))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::types::{Fingerprint, Test};
    use crate::bandit::ErrorKind;
    use crate::storage::{MemoryBanditStore, StoreResult, StoreTransaction};
    use std::time::Duration as StdDuration;

    fn setup(config: BanditConfig, count: u32) -> (Arc<MemoryBanditStore>, BanditSelector, TestId, Vec<Variant>) {
        let store = Arc::new(MemoryBanditStore::new());
        let test = Test::new(Fingerprint::of("summer campaign"), Some("Summer".into()));
        let variants: Vec<Variant> = (0..count)
            .map(|i| Variant::new(test.id, i, format!("Subject {i}")))
            .collect();
        store.create_test(&test, &variants).unwrap();
        let selector = BanditSelector::new(store.clone(), config);
        (store, selector, test.id, variants)
    }

    /// Apply `n` increments of `kind` directly through the store
    fn bump(store: &MemoryBanditStore, id: VariantId, kind: EventKind, n: u64) {
        let mut txn = store.begin().unwrap();
        for _ in 0..n {
            txn.apply_event_counter(id, kind).unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_first_selections_follow_creation_order() {
        let (_, selector, test_id, variants) = setup(BanditConfig::default(), 5);

        for expected in &variants {
            let selection = selector.select_variant(test_id).unwrap();
            assert_eq!(selection.variant_id, expected.id);
            assert_eq!(selection.selection_method, SelectionMethod::RoundRobin);
            assert_eq!(selection.performance.times_selected, 1);
        }
        // Sixth wraps around to the first
        let sixth = selector.select_variant(test_id).unwrap();
        assert_eq!(sixth.variant_id, variants[0].id);
        assert_eq!(sixth.performance.times_selected, 2);
    }

    #[test]
    fn test_switches_to_thompson_at_threshold() {
        let (store, selector, test_id, _) = setup(BanditConfig::default(), 5);

        for _ in 0..5000 {
            let selection = selector.select_variant(test_id).unwrap();
            assert_eq!(selection.selection_method, SelectionMethod::RoundRobin);
        }
        for variant in store.load_variants(test_id).unwrap() {
            assert_eq!(variant.counters.times_selected, 1000);
        }

        let next = selector.select_variant(test_id).unwrap();
        assert_eq!(next.selection_method, SelectionMethod::ThompsonSampling);
    }

    #[test]
    fn test_thompson_favours_converting_variant() {
        let config = BanditConfig {
            exploration_threshold: 0,
            seed: Some(11),
            ..Default::default()
        };
        let (store, selector, test_id, variants) = setup(config, 3);
        for v in &variants {
            bump(&store, v.id, EventKind::Send, 1000);
        }
        bump(&store, variants[1].id, EventKind::Conversion, 400);
        bump(&store, variants[0].id, EventKind::Conversion, 20);
        bump(&store, variants[2].id, EventKind::Conversion, 20);

        for _ in 0..50 {
            let selection = selector.select_variant(test_id).unwrap();
            assert_eq!(selection.selection_method, SelectionMethod::ThompsonSampling);
            assert_eq!(selection.variant_id, variants[1].id);
        }
    }

    #[test]
    fn test_round_robin_tie_breaks_on_earliest() {
        let test_id = TestId::new();
        let mut variants: Vec<Variant> = (0..3).map(|i| Variant::new(test_id, i, "x")).collect();
        variants[0].counters.times_selected = 4;
        variants[1].counters.times_selected = 2;
        variants[2].counters.times_selected = 2;
        assert_eq!(pick_round_robin(&variants), Some(1));
        assert_eq!(pick_round_robin(&[]), None);
    }

    #[test]
    fn test_thompson_empty_slice() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pick_thompson(&[], &mut rng), None);
    }

    #[test]
    fn test_missing_and_inactive_tests_are_not_found() {
        let (store, selector, test_id, _) = setup(BanditConfig::default(), 2);

        let err = selector.select_variant(TestId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        store.set_status(test_id, TestStatus::Paused).unwrap();
        let err = selector.select_variant(test_id).unwrap_err();
        assert!(matches!(err, BanditError::TestNotActive { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_test_without_variants_is_not_found() {
        let store = Arc::new(MemoryBanditStore::new());
        let test = Test::new(Fingerprint::of("empty"), None);
        store.create_test(&test, &[]).unwrap();
        let selector = BanditSelector::new(store, BanditConfig::default());

        let err = selector.select_variant(test.id).unwrap_err();
        assert!(matches!(err, BanditError::NoVariants(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_open_event_updates_counter_and_rate() {
        let (store, selector, _, variants) = setup(BanditConfig::default(), 1);
        let id = variants[0].id;
        bump(&store, id, EventKind::Send, 10);
        bump(&store, id, EventKind::Open, 3);

        let recorded = selector.record_event(id, "open", BTreeMap::new()).unwrap();
        assert_eq!(recorded.counters.opens, 4);
        assert_eq!(recorded.counters.times_sent, 10);
        assert!((recorded.open_rate - 0.4).abs() < 1e-12);

        let stored = store.load_variant(id).unwrap().unwrap();
        assert_eq!(stored.counters.opens, 4);
        assert_eq!(store.load_events(id).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_event_type_changes_nothing() {
        let (store, selector, _, variants) = setup(BanditConfig::default(), 1);
        let id = variants[0].id;

        let err = selector.record_event(id, "bounce", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let stored = store.load_variant(id).unwrap().unwrap();
        assert_eq!(stored.counters, Default::default());
        assert!(store.load_events(id).unwrap().is_empty());
    }

    #[test]
    fn test_event_for_unknown_variant() {
        let (_, selector, _, _) = setup(BanditConfig::default(), 1);
        let err = selector
            .record_event(VariantId::new(), "send", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, BanditError::VariantNotFound(_)));
    }

    #[test]
    fn test_causal_order_is_permissive_by_default() {
        let (store, selector, _, variants) = setup(BanditConfig::default(), 1);
        let id = variants[0].id;
        let recorded = selector.record_event(id, "conversion", BTreeMap::new()).unwrap();
        assert_eq!(recorded.counters.conversions, 1);
        assert_eq!(store.load_events(id).unwrap().len(), 1);
    }

    #[test]
    fn test_strict_causal_order_rolls_back() {
        let config = BanditConfig {
            enforce_causal_order: true,
            ..Default::default()
        };
        let (store, selector, _, variants) = setup(config, 1);
        let id = variants[0].id;

        let err = selector.record_event(id, "opened", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(
            matches!(&err, BanditError::InvalidInput { field, .. } if field == "causal_order"),
            "valid event type must not be blamed: {err:?}"
        );
        assert_eq!(store.load_variant(id).unwrap().unwrap().counters, Default::default());
        assert!(store.load_events(id).unwrap().is_empty());

        selector.record_event(id, "sent", BTreeMap::new()).unwrap();
        let recorded = selector.record_event(id, "opened", BTreeMap::new()).unwrap();
        assert_eq!(recorded.counters.opens, 1);
    }

    #[test]
    fn test_lock_timeout_is_retryable_persistence_failure() {
        let store = Arc::new(MemoryBanditStore::with_lock_timeout(StdDuration::from_millis(20)));
        let test = Test::new(Fingerprint::of("busy"), None);
        store.create_test(&test, &[Variant::new(test.id, 0, "a")]).unwrap();
        let selector = BanditSelector::new(store.clone(), BanditConfig::default());

        let _held = store.begin().unwrap();
        let err = selector.select_variant(test.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert!(err.is_retryable());
        assert!(matches!(err, BanditError::Persistence(StoreError::Timeout(_))));
    }

    #[test]
    fn test_performance_ordered_by_conversion_rate() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 3);
        bump(&store, variants[0].id, EventKind::Send, 100);
        bump(&store, variants[0].id, EventKind::Conversion, 5);
        bump(&store, variants[1].id, EventKind::Send, 100);
        bump(&store, variants[1].id, EventKind::Conversion, 10);
        bump(&store, variants[2].id, EventKind::Send, 50);
        bump(&store, variants[2].id, EventKind::Conversion, 5);

        let report = selector.test_performance(test_id).unwrap();
        assert_eq!(report.total_samples, 250);
        let order: Vec<VariantId> = report.variants.iter().map(|v| v.variant_id).collect();
        // 0.10 and 0.10 tie: index order is kept
        assert_eq!(order, vec![variants[1].id, variants[2].id, variants[0].id]);

        let top = &report.variants[0];
        assert!((top.confidence_interval.lower - 0.0554).abs() < 1e-3);
        assert!((top.confidence_interval.upper - 0.1749).abs() < 1e-3);
    }

    #[test]
    fn test_performance_of_fresh_test() {
        let (_, selector, test_id, _) = setup(BanditConfig::default(), 2);
        let report = selector.test_performance(test_id).unwrap();
        assert_eq!(report.total_samples, 0);
        for row in &report.variants {
            assert_eq!(row.conversion_rate, 0.0);
            assert_eq!(row.confidence_interval.lower, 0.0);
            assert_eq!(row.confidence_interval.upper, 0.0);
        }
    }

    #[test]
    fn test_recent_events_newest_first() {
        let (_, selector, test_id, variants) = setup(BanditConfig::default(), 2);
        let id = variants[0].id;
        for kind in ["send", "open", "click"] {
            selector.record_event(id, kind, BTreeMap::new()).unwrap();
        }

        let events = selector.recent_events(test_id, id, 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Click);
        assert_eq!(events[1].kind, EventKind::Open);

        let err = selector.recent_events(TestId::new(), id, 10).unwrap_err();
        assert!(matches!(err, BanditError::VariantNotFound(_)));
    }

    #[test]
    fn test_dashboard_and_top_performers() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 2);
        bump(&store, variants[0].id, EventKind::Send, 200);
        bump(&store, variants[0].id, EventKind::Open, 50);
        bump(&store, variants[0].id, EventKind::Click, 20);
        bump(&store, variants[0].id, EventKind::Conversion, 10);
        bump(&store, variants[1].id, EventKind::Send, 50);

        let done = Test::new(Fingerprint::of("winter campaign"), None);
        store.create_test(&done, &[Variant::new(done.id, 0, "Winter")]).unwrap();
        store.set_status(done.id, TestStatus::Completed).unwrap();

        let dashboard = selector.dashboard().unwrap();
        assert_eq!(dashboard.total_tests, 2);
        assert_eq!(dashboard.active_tests, 1);
        assert_eq!(dashboard.completed_tests, 1);
        assert_eq!(dashboard.total_variants, 3);
        assert_eq!(dashboard.total_emails_sent, 250);
        assert!((dashboard.overall_open_rate - 0.2).abs() < 1e-12);
        assert!((dashboard.overall_click_rate - 0.08).abs() < 1e-12);
        assert_eq!(dashboard.tests_created_this_week, 2);

        let recent = &dashboard.recent_performance;
        assert_eq!(recent.period_days, 7);
        assert_eq!(recent.sends, 250);
        assert_eq!(recent.conversions, 10);
        assert!((recent.conversion_rate - 0.04).abs() < 1e-12);

        let best = dashboard.top_performer.as_ref().unwrap();
        assert_eq!(best.variant_id, variants[0].id);
        assert_eq!(best.times_sent, 200);

        let top = selector.top_performers(10, 100).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].variant_id, variants[0].id);
        assert_eq!(top[0].test_id, test_id);

        let summaries = selector.list_tests().unwrap();
        assert_eq!(summaries.len(), 2);
        let summer = summaries.iter().find(|s| s.test_id == test_id).unwrap();
        assert_eq!(summer.variant_count, 2);
        assert_eq!(summer.total_sent, 250);
    }

    #[test]
    fn test_dashboard_without_enough_sends_has_no_top_performer() {
        let (store, selector, _, variants) = setup(BanditConfig::default(), 2);
        bump(&store, variants[0].id, EventKind::Send, 99);
        bump(&store, variants[0].id, EventKind::Conversion, 50);

        let dashboard = selector.dashboard().unwrap();
        assert!(dashboard.top_performer.is_none());
        assert_eq!(dashboard.completed_tests, 0);
    }

    #[test]
    fn test_comparison_declares_winner_with_improvement() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 3);
        bump(&store, variants[0].id, EventKind::Send, 100);
        bump(&store, variants[0].id, EventKind::Conversion, 5);
        bump(&store, variants[1].id, EventKind::Send, 200);
        bump(&store, variants[1].id, EventKind::Conversion, 20);
        bump(&store, variants[2].id, EventKind::Send, 100);
        bump(&store, variants[2].id, EventKind::Conversion, 5);

        let comparison = selector.compare_test(test_id).unwrap();
        assert_eq!(comparison.total_variants, 3);
        assert_eq!(comparison.total_samples, 400);
        assert_eq!(comparison.variants[0].variant_id, variants[1].id);

        let winner = comparison.winner.unwrap();
        assert_eq!(winner.variant_id, variants[1].id);
        assert_eq!(winner.times_sent, 200);
        // 0.10 against a mean of 0.05
        assert!((winner.improvement_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_comparison_needs_enough_sends_on_leader() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 2);
        bump(&store, variants[0].id, EventKind::Send, 99);
        bump(&store, variants[0].id, EventKind::Conversion, 30);

        let comparison = selector.compare_test(test_id).unwrap();
        assert_eq!(comparison.variants[0].variant_id, variants[0].id);
        assert!(comparison.winner.is_none());

        let err = selector.compare_test(TestId::new()).unwrap_err();
        assert!(matches!(err, BanditError::TestNotFound(_)));
    }

    #[test]
    fn test_winner_improvement_edge_cases() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 2);
        bump(&store, variants[0].id, EventKind::Send, 150);
        bump(&store, variants[0].id, EventKind::Conversion, 15);
        let rows = selector.test_performance(test_id).unwrap().variants;

        // Others never converted: no meaningful lift
        let winner = pick_winner(&rows, 100).unwrap();
        assert_eq!(winner.improvement_pct, 0.0);

        // Sole variant
        let winner = pick_winner(&rows[..1], 100).unwrap();
        assert_eq!(winner.improvement_pct, 0.0);

        assert!(pick_winner(&rows, 151).is_none());
        assert!(pick_winner(&[], 0).is_none());
    }

    #[test]
    fn test_variant_performance_counts_recent_events() {
        let (store, selector, test_id, variants) = setup(BanditConfig::default(), 2);
        let id = variants[0].id;
        for kind in ["send", "send", "open", "conversion"] {
            selector.record_event(id, kind, BTreeMap::new()).unwrap();
        }

        // Older than the window: kept in the log, left out of recent counts
        let stored = store.load_variant(id).unwrap().unwrap();
        let mut old = EventRecord::new(&stored, EventKind::Click, BTreeMap::new());
        old.occurred_at = Utc::now() - Duration::hours(30);
        let mut txn = store.begin().unwrap();
        txn.insert_event(&old).unwrap();
        txn.commit().unwrap();

        let detail = selector.variant_performance(id).unwrap();
        assert_eq!(detail.test_id, test_id);
        assert_eq!(detail.test_status, TestStatus::Active);
        assert_eq!(detail.window_hours, 24);
        assert_eq!(detail.lifetime.times_sent, 2);
        assert!((detail.lifetime.conversion_rate - 0.5).abs() < 1e-12);
        assert_eq!(
            detail.recent,
            ActivityCounts {
                send: 2,
                open: 1,
                click: 0,
                conversion: 1,
            }
        );

        let err = selector.variant_performance(VariantId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Deletes one test whenever a transaction opens, as if a concurrent
    /// delete landed after the selector's unlocked reads
    struct DeletesOnBegin {
        inner: MemoryBanditStore,
        doomed: TestId,
    }

    impl BanditStore for DeletesOnBegin {
        fn load_test(&self, id: TestId) -> StoreResult<Option<Test>> {
            self.inner.load_test(id)
        }

        fn find_test_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Test>> {
            self.inner.find_test_by_fingerprint(fingerprint)
        }

        fn load_variants(&self, test_id: TestId) -> StoreResult<Vec<Variant>> {
            self.inner.load_variants(test_id)
        }

        fn load_variant(&self, id: VariantId) -> StoreResult<Option<Variant>> {
            self.inner.load_variant(id)
        }

        fn list_tests(&self) -> StoreResult<Vec<Test>> {
            self.inner.list_tests()
        }

        fn load_events(&self, variant_id: VariantId) -> StoreResult<Vec<EventRecord>> {
            self.inner.load_events(variant_id)
        }

        fn create_test(&self, test: &Test, variants: &[Variant]) -> StoreResult<Test> {
            self.inner.create_test(test, variants)
        }

        fn set_status(&self, id: TestId, status: TestStatus) -> StoreResult<Option<Test>> {
            self.inner.set_status(id, status)
        }

        fn delete_test(&self, id: TestId) -> StoreResult<bool> {
            self.inner.delete_test(id)
        }

        fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
            self.inner.delete_test(self.doomed)?;
            self.inner.begin()
        }

        fn backend_name(&self) -> &'static str {
            "deletes-on-begin"
        }
    }

    fn racing_delete() -> (BanditSelector, TestId, VariantId) {
        let inner = MemoryBanditStore::new();
        let test = Test::new(Fingerprint::of("deleted mid-flight"), None);
        let variant = Variant::new(test.id, 0, "Going away");
        inner.create_test(&test, &[variant.clone()]).unwrap();
        let store = Arc::new(DeletesOnBegin {
            inner,
            doomed: test.id,
        });
        (
            BanditSelector::new(store, BanditConfig::default()),
            test.id,
            variant.id,
        )
    }

    #[test]
    fn test_event_for_concurrently_deleted_test_is_not_found() {
        let (selector, _, variant_id) = racing_delete();

        let err = selector
            .record_event(variant_id, "send", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, BanditError::VariantNotFound(id) if id == variant_id));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());

        let app_err = crate::errors::AppError::from(err);
        assert_eq!(app_err.status_code(), axum::http::StatusCode::NOT_FOUND);
        assert_eq!(app_err.code(), "VARIANT_NOT_FOUND");
    }

    #[test]
    fn test_selection_for_concurrently_deleted_test_is_not_found() {
        let (selector, test_id, variant_id) = racing_delete();

        let err = selector.select_variant(test_id).unwrap_err();
        assert!(matches!(err, BanditError::VariantNotFound(id) if id == variant_id));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
        assert!(selector.store().load_test(test_id).unwrap().is_none());
    }
}
