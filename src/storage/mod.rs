//! Persistence boundary for tests, variants and events
//!
//! The bandit core never mutates rows in memory and flushes them later.
//! Every counter change is an explicit increment command issued inside a
//! [`StoreTransaction`]; the store is responsible for making those commands
//! linearizable per variant (row locks in RocksDB, a held guard in memory)
//! and for discarding everything on rollback.
//!
//! Two backends implement [`BanditStore`]:
//! - [`MemoryBanditStore`]: process-local, used by tests and development
//! - [`RocksBanditStore`]: RocksDB `TransactionDB` with pessimistic row locks

pub mod memory;
pub mod rocks;

pub use memory::MemoryBanditStore;
pub use rocks::RocksBanditStore;

use crate::bandit::types::{
    EventKind, EventRecord, Fingerprint, Test, TestId, TestStatus, Variant, VariantId,
};

/// Failures from the storage layer. All of them leave no partial writes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("storage operation timed out: {0}")]
    Timeout(String),

    #[error("failed to encode or decode stored value: {0}")]
    Codec(String),

    #[error("row disappeared during transaction: {0}")]
    MissingRow(String),
}

impl StoreError {
    /// Whether the caller may retry the whole operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Timeout(_) | Self::Backend(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read access plus transaction factory for bandit state
pub trait BanditStore: Send + Sync {
    fn load_test(&self, id: TestId) -> StoreResult<Option<Test>>;

    fn find_test_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Test>>;

    /// Variants of a test, ordered by `index`
    fn load_variants(&self, test_id: TestId) -> StoreResult<Vec<Variant>>;

    fn load_variant(&self, id: VariantId) -> StoreResult<Option<Variant>>;

    fn list_tests(&self) -> StoreResult<Vec<Test>>;

    /// Audit trail for a variant, oldest first
    fn load_events(&self, variant_id: VariantId) -> StoreResult<Vec<EventRecord>>;

    /// Create a test and its variants atomically.
    ///
    /// Idempotent on the fingerprint: if a test with the same fingerprint
    /// already exists, nothing is written and the stored test is returned.
    fn create_test(&self, test: &Test, variants: &[Variant]) -> StoreResult<Test>;

    /// Overwrite the status of a test. Returns the updated test, or `None`
    /// when the test does not exist.
    fn set_status(&self, id: TestId, status: TestStatus) -> StoreResult<Option<Test>>;

    /// Delete a test with its variants and events. Returns whether it existed.
    fn delete_test(&self, id: TestId) -> StoreResult<bool>;

    /// Open a transaction for counter updates and event inserts
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;

    /// Backend name for health output
    fn backend_name(&self) -> &'static str;
}

/// A unit of work over variant counters and the event log.
///
/// Dropping a transaction without calling [`commit`](StoreTransaction::commit)
/// rolls it back.
pub trait StoreTransaction {
    /// `times_selected += 1`; returns the row as it will be committed
    fn increment_selected(&mut self, variant_id: VariantId) -> StoreResult<Variant>;

    /// Apply the single counter increment `kind` maps to
    fn apply_event_counter(&mut self, variant_id: VariantId, kind: EventKind)
        -> StoreResult<Variant>;

    fn insert_event(&mut self, record: &EventRecord) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}
