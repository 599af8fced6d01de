//! Documented constants for the bandit engine
//!
//! Tunable parameters live here so the selector, the stats routines and the
//! configuration layer agree on the same defaults.

// =============================================================================
// BANDIT PHASES
// =============================================================================

/// Total selections across a test before switching from round-robin to
/// Thompson sampling.
///
/// With the default five variants this is 1000 selections per arm, enough for
/// each Beta posterior to move well away from the uniform prior before the
/// sampler starts concentrating traffic.
pub const EXPLORATION_THRESHOLD: u64 = 5000;

/// Two-sided z value for a ~95% Wilson score interval.
pub const WILSON_Z_95: f64 = 1.96;

// =============================================================================
// GENERATION
// =============================================================================

/// Subject line variants created per test.
pub const DEFAULT_VARIANTS_PER_TEST: usize = 5;

/// How long a generation result stays in the cache (1 hour).
pub const GENERATION_CACHE_TTL_SECS: u64 = 3600;

/// Entries kept in the generation cache before LRU eviction.
pub const GENERATION_CACHE_CAPACITY: u64 = 10_000;

/// Longest subject line kept from the generator, in characters.
///
/// Most mail clients truncate around 60 characters; the generator is prompted
/// for that length and anything far beyond it is cut here.
pub const MAX_SUBJECT_LINE_CHARS: usize = 120;

// =============================================================================
// ANALYTICS
// =============================================================================

/// Window used for "tests created this week" in the dashboard.
pub const DASHBOARD_RECENT_DAYS: i64 = 7;

/// Default minimum sends before a variant shows up in top performers.
pub const TOP_PERFORMERS_MIN_SENDS: u64 = 100;

/// Default number of top performers returned.
pub const TOP_PERFORMERS_LIMIT: usize = 10;

/// Sends the leading variant needs before a comparison declares a winner.
/// Also the floor for the dashboard's single top performer.
pub const WINNER_MIN_SENDS: u64 = 100;

/// Window for the per-variant recent activity counts (24 hours).
pub const VARIANT_ACTIVITY_WINDOW_HOURS: i64 = 24;
