//! Domain types for subject-line tests
//!
//! A [`Test`] owns an ordered set of [`Variant`]s (one per candidate subject
//! line). Variants carry the five bandit counters; [`EventRecord`]s are the
//! append-only audit trail behind those counters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::stats::{self, ConfidenceInterval};

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a test
    TestId
);
uuid_id!(
    /// Unique identifier for a variant (one subject line)
    VariantId
);
uuid_id!(
    /// Unique identifier for an event record
    EventId
);

/// SHA-256 of the trimmed email content, lowercase hex.
///
/// Natural key for tests: the same content always maps to the same test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.trim().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// TEST
// =============================================================================

/// Lifecycle status of a test. Only `Active` tests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Active,
    Paused,
    Completed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested lifecycle change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTransition {
    Pause,
    Resume,
    Complete,
}

impl StatusTransition {
    /// Target status, or `None` when the transition is not allowed from `from`
    pub fn apply(self, from: TestStatus) -> Option<TestStatus> {
        match (self, from) {
            (Self::Pause, TestStatus::Active) => Some(TestStatus::Paused),
            (Self::Resume, TestStatus::Paused) => Some(TestStatus::Active),
            (Self::Complete, TestStatus::Active | TestStatus::Paused) => {
                Some(TestStatus::Completed)
            }
            _ => None,
        }
    }
}

/// A subject-line test created from one piece of email content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub fingerprint: Fingerprint,
    pub original_subject: Option<String>,
    pub status: TestStatus,
    pub created_at: DateTime<Utc>,
}

impl Test {
    pub fn new(fingerprint: Fingerprint, original_subject: Option<String>) -> Self {
        Self {
            id: TestId::new(),
            fingerprint,
            original_subject,
            status: TestStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TestStatus::Active
    }
}

// =============================================================================
// VARIANT
// =============================================================================

/// Bandit counters for one variant. Never decremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariantCounters {
    pub times_selected: u64,
    pub times_sent: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
}

impl VariantCounters {
    /// Increment the counter an event of `kind` maps to
    pub fn apply(&mut self, kind: EventKind) {
        match kind {
            EventKind::Send => self.times_sent += 1,
            EventKind::Open => self.opens += 1,
            EventKind::Click => self.clicks += 1,
            EventKind::Conversion => self.conversions += 1,
        }
    }

    /// Whether opens/clicks/conversions stay within sends
    pub fn is_causally_consistent(&self) -> bool {
        self.opens <= self.times_sent
            && self.clicks <= self.times_sent
            && self.conversions <= self.times_sent
    }

    pub fn open_rate(&self) -> f64 {
        stats::rate(self.opens, self.times_sent)
    }

    pub fn click_rate(&self) -> f64 {
        stats::rate(self.clicks, self.times_sent)
    }

    pub fn conversion_rate(&self) -> f64 {
        stats::rate(self.conversions, self.times_sent)
    }
}

/// One candidate subject line within a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub test_id: TestId,
    pub subject_line: String,
    /// Creation order within the test; also the tie-break order
    pub index: u32,
    pub counters: VariantCounters,
    pub created_at: DateTime<Utc>,
}

impl Variant {
    pub fn new(test_id: TestId, index: u32, subject_line: impl Into<String>) -> Self {
        Self {
            id: VariantId::new(),
            test_id,
            subject_line: subject_line.into(),
            index,
            counters: VariantCounters::default(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Outcome events tracked per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Send,
    Open,
    Click,
    Conversion,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Open => "open",
            Self::Click => "click",
            Self::Conversion => "conversion",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an event type outside the tracked set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}' (expected send, open, click or conversion)")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    /// Accepts the canonical names and the past-tense tracking aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" | "sent" => Ok(Self::Send),
            "open" | "opened" => Ok(Self::Open),
            "click" | "clicked" => Ok(Self::Click),
            "conversion" | "converted" => Ok(Self::Conversion),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// Immutable audit record of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub kind: EventKind,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(variant: &Variant, kind: EventKind, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: EventId::new(),
            test_id: variant.test_id,
            variant_id: variant.id,
            kind,
            metadata,
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

/// How the selector picked a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    RoundRobin,
    ThompsonSampling,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::ThompsonSampling => "thompson_sampling",
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live performance of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
    pub confidence_interval: ConfidenceInterval,
    pub times_selected: u64,
    pub times_sent: u64,
}

/// Result of a successful, committed selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub variant_id: VariantId,
    pub test_id: TestId,
    pub subject_line: String,
    pub selection_method: SelectionMethod,
    pub performance: PerformanceSnapshot,
}

/// Acknowledgement of a committed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: EventId,
    pub variant_id: VariantId,
    pub test_id: TestId,
    pub kind: EventKind,
    pub counters: VariantCounters,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
}

/// Per-variant row of a performance report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantPerformance {
    pub variant_id: VariantId,
    pub subject_line: String,
    pub index: u32,
    pub times_selected: u64,
    pub times_sent: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
    pub confidence_interval: ConfidenceInterval,
}

/// Performance of every variant in a test, best conversion rate first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub test_id: TestId,
    pub status: TestStatus,
    pub original_subject: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Sum of `times_sent` across variants
    pub total_samples: u64,
    pub variants: Vec<VariantPerformance>,
}

/// One line of the test listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub test_id: TestId,
    pub status: TestStatus,
    pub original_subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub variant_count: usize,
    pub total_selected: u64,
    pub total_sent: u64,
}

/// Leader of a comparison that has enough sends to be called
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinningVariant {
    pub variant_id: VariantId,
    pub subject_line: String,
    pub times_sent: u64,
    pub conversion_rate: f64,
    /// Relative lift over the mean conversion rate of the other variants, in %
    pub improvement_pct: f64,
}

/// Ranked variants of one test with the declared winner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestComparison {
    pub test_id: TestId,
    pub status: TestStatus,
    pub original_subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub total_variants: usize,
    pub total_samples: u64,
    pub variants: Vec<VariantPerformance>,
    pub winner: Option<WinningVariant>,
}

/// Event or counter tallies by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub send: u64,
    pub open: u64,
    pub click: u64,
    pub conversion: u64,
}

impl ActivityCounts {
    pub fn add(&mut self, kind: EventKind) {
        match kind {
            EventKind::Send => self.send += 1,
            EventKind::Open => self.open += 1,
            EventKind::Click => self.click += 1,
            EventKind::Conversion => self.conversion += 1,
        }
    }

    /// Add a variant's outcome counters (selections are not events)
    pub fn absorb(&mut self, counters: &VariantCounters) {
        self.send += counters.times_sent;
        self.open += counters.opens;
        self.click += counters.clicks;
        self.conversion += counters.conversions;
    }
}

/// One variant in depth: lifetime metrics plus a recent activity window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDetail {
    pub variant_id: VariantId,
    pub test_id: TestId,
    pub test_status: TestStatus,
    pub subject_line: String,
    pub index: u32,
    pub created_at: DateTime<Utc>,
    pub lifetime: VariantPerformance,
    pub window_hours: i64,
    /// Events recorded within the last `window_hours`
    pub recent: ActivityCounts,
}

/// Outcome totals of tests created within the last `period_days`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentPerformance {
    pub period_days: i64,
    pub sends: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
}

impl RecentPerformance {
    pub fn new(period_days: i64, counts: ActivityCounts) -> Self {
        Self {
            period_days,
            sends: counts.send,
            opens: counts.open,
            clicks: counts.click,
            conversions: counts.conversion,
            open_rate: stats::rate(counts.open, counts.send),
            click_rate: stats::rate(counts.click, counts.send),
            conversion_rate: stats::rate(counts.conversion, counts.send),
        }
    }
}

/// Cross-test aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub total_tests: usize,
    pub active_tests: usize,
    pub completed_tests: usize,
    pub total_variants: usize,
    pub total_emails_sent: u64,
    pub overall_open_rate: f64,
    pub overall_click_rate: f64,
    pub overall_conversion_rate: f64,
    pub tests_created_this_week: usize,
    pub recent_performance: RecentPerformance,
    /// Best converting variant with enough sends, across all tests
    pub top_performer: Option<TopPerformer>,
}

/// A variant ranked across all tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPerformer {
    pub test_id: TestId,
    pub variant_id: VariantId,
    pub subject_line: String,
    pub times_sent: u64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
    pub confidence_interval: ConfidenceInterval,
    pub test_created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!("send".parse::<EventKind>().unwrap(), EventKind::Send);
        assert_eq!("opened".parse::<EventKind>().unwrap(), EventKind::Open);
        assert_eq!(" CLICK ".parse::<EventKind>().unwrap(), EventKind::Click);
        assert_eq!(
            "converted".parse::<EventKind>().unwrap(),
            EventKind::Conversion
        );
        let err = "bounce".parse::<EventKind>().unwrap_err();
        assert_eq!(err.0, "bounce");
    }

    #[test]
    fn test_counters_apply_one_increment() {
        let mut counters = VariantCounters {
            times_sent: 10,
            opens: 3,
            ..Default::default()
        };
        counters.apply(EventKind::Open);
        assert_eq!(counters.opens, 4);
        assert_eq!(counters.times_sent, 10);
        assert!((counters.open_rate() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_causal_consistency() {
        let mut counters = VariantCounters::default();
        assert!(counters.is_causally_consistent());
        counters.apply(EventKind::Conversion);
        assert!(!counters.is_causally_consistent());
        counters.apply(EventKind::Send);
        assert!(counters.is_causally_consistent());
    }

    #[test]
    fn test_status_transitions() {
        use StatusTransition::*;
        use TestStatus::*;
        assert_eq!(Pause.apply(Active), Some(Paused));
        assert_eq!(Resume.apply(Paused), Some(Active));
        assert_eq!(Complete.apply(Paused), Some(Completed));
        assert_eq!(Resume.apply(Active), None);
        assert_eq!(Pause.apply(Completed), None);
        assert_eq!(Complete.apply(Completed), None);
    }

    #[test]
    fn test_fingerprint_trims_and_is_stable() {
        let a = Fingerprint::of("Hello subscribers, big sale today");
        let b = Fingerprint::of("  Hello subscribers, big sale today\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, Fingerprint::of("Different content entirely"));
    }

    #[test]
    fn test_ids_round_trip_through_strings() {
        let id = VariantId::new();
        let parsed: VariantId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TestId>().is_err());
    }

    #[test]
    fn test_activity_counts() {
        let mut counts = ActivityCounts::default();
        counts.add(EventKind::Send);
        counts.add(EventKind::Send);
        counts.add(EventKind::Click);
        counts.absorb(&VariantCounters {
            times_selected: 9,
            times_sent: 8,
            opens: 4,
            ..Default::default()
        });
        assert_eq!(counts.send, 10);
        assert_eq!(counts.open, 4);
        assert_eq!(counts.click, 1);
        assert_eq!(counts.conversion, 0);

        let recent = RecentPerformance::new(7, counts);
        assert!((recent.open_rate - 0.4).abs() < 1e-12);
        assert_eq!(RecentPerformance::new(7, ActivityCounts::default()).open_rate, 0.0);
    }

    #[test]
    fn test_selection_method_serializes_snake_case() {
        let json = serde_json::to_string(&SelectionMethod::ThompsonSampling).unwrap();
        assert_eq!(json, "\"thompson_sampling\"");
        assert_eq!(SelectionMethod::RoundRobin.as_str(), "round_robin");
    }
}
