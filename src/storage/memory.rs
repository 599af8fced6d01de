//! In-process bandit store
//!
//! All state sits behind one mutex. A transaction holds the guard from
//! `begin()` until commit or drop, so transactions are serialized and
//! read-modify-write on counters cannot lose updates. Staged writes are only
//! applied to the shared state on commit.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{BanditStore, StoreError, StoreResult, StoreTransaction};
use crate::bandit::types::{
    EventKind, EventRecord, Fingerprint, Test, TestId, TestStatus, Variant, VariantId,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct MemoryState {
    tests: HashMap<TestId, Test>,
    by_fingerprint: HashMap<Fingerprint, TestId>,
    variants: HashMap<VariantId, Variant>,
    events: Vec<EventRecord>,
}

/// Mutex-guarded store for tests and local development
pub struct MemoryBanditStore {
    state: Mutex<MemoryState>,
    lock_timeout: Duration,
}

impl Default for MemoryBanditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBanditStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Store whose lock acquisition fails with [`StoreError::Timeout`] after `timeout`
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lock_timeout: timeout,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.try_lock_for(self.lock_timeout).ok_or_else(|| {
            StoreError::Timeout(format!(
                "memory store lock not acquired within {:?}",
                self.lock_timeout
            ))
        })
    }

    /// Number of stored events (all tests)
    pub fn event_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.events.len())
    }
}

impl BanditStore for MemoryBanditStore {
    fn load_test(&self, id: TestId) -> StoreResult<Option<Test>> {
        Ok(self.lock()?.tests.get(&id).cloned())
    }

    fn find_test_by_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<Option<Test>> {
        let state = self.lock()?;
        Ok(state
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| state.tests.get(id))
            .cloned())
    }

    fn load_variants(&self, test_id: TestId) -> StoreResult<Vec<Variant>> {
        let state = self.lock()?;
        let mut variants: Vec<Variant> = state
            .variants
            .values()
            .filter(|v| v.test_id == test_id)
            .cloned()
            .collect();
        variants.sort_by_key(|v| v.index);
        Ok(variants)
    }

    fn load_variant(&self, id: VariantId) -> StoreResult<Option<Variant>> {
        Ok(self.lock()?.variants.get(&id).cloned())
    }

    fn list_tests(&self) -> StoreResult<Vec<Test>> {
        let state = self.lock()?;
        let mut tests: Vec<Test> = state.tests.values().cloned().collect();
        tests.sort_by_key(|t| t.created_at);
        Ok(tests)
    }

    fn load_events(&self, variant_id: VariantId) -> StoreResult<Vec<EventRecord>> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.variant_id == variant_id)
            .cloned()
            .collect())
    }

    fn create_test(&self, test: &Test, variants: &[Variant]) -> StoreResult<Test> {
        let mut state = self.lock()?;

        if let Some(existing) = state
            .by_fingerprint
            .get(&test.fingerprint)
            .and_then(|id| state.tests.get(id))
        {
            return Ok(existing.clone());
        }

        state
            .by_fingerprint
            .insert(test.fingerprint.clone(), test.id);
        state.tests.insert(test.id, test.clone());
        for variant in variants {
            state.variants.insert(variant.id, variant.clone());
        }
        Ok(test.clone())
    }

    fn set_status(&self, id: TestId, status: TestStatus) -> StoreResult<Option<Test>> {
        let mut state = self.lock()?;
        Ok(state.tests.get_mut(&id).map(|test| {
            test.status = status;
            test.clone()
        }))
    }

    fn delete_test(&self, id: TestId) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(test) = state.tests.remove(&id) else {
            return Ok(false);
        };
        state.by_fingerprint.remove(&test.fingerprint);
        state.variants.retain(|_, v| v.test_id != id);
        state.events.retain(|e| e.test_id != id);
        Ok(true)
    }

    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            guard: self.lock()?,
            staged_variants: HashMap::new(),
            staged_events: Vec::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, MemoryState>,
    staged_variants: HashMap<VariantId, Variant>,
    staged_events: Vec<EventRecord>,
}

impl MemoryTransaction<'_> {
    /// Current view of a variant: staged copy if touched, else committed row
    fn working_copy(&self, id: VariantId) -> StoreResult<Variant> {
        self.staged_variants
            .get(&id)
            .or_else(|| self.guard.variants.get(&id))
            .cloned()
            .ok_or_else(|| StoreError::MissingRow(format!("variant {id}")))
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn increment_selected(&mut self, variant_id: VariantId) -> StoreResult<Variant> {
        let mut variant = self.working_copy(variant_id)?;
        variant.counters.times_selected += 1;
        self.staged_variants.insert(variant_id, variant.clone());
        Ok(variant)
    }

    fn apply_event_counter(
        &mut self,
        variant_id: VariantId,
        kind: EventKind,
    ) -> StoreResult<Variant> {
        let mut variant = self.working_copy(variant_id)?;
        variant.counters.apply(kind);
        self.staged_variants.insert(variant_id, variant.clone());
        Ok(variant)
    }

    fn insert_event(&mut self, record: &EventRecord) -> StoreResult<()> {
        self.staged_events.push(record.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut guard,
            staged_variants,
            staged_events,
        } = *self;

        // A variant deleted with its test cannot reappear: the guard is held
        // for the whole transaction, so this only guards against misuse.
        if let Some(id) = staged_variants
            .keys()
            .find(|id| !guard.variants.contains_key(id))
        {
            return Err(StoreError::MissingRow(format!("variant {id}")));
        }

        guard.variants.extend(staged_variants);
        guard.events.extend(staged_events);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Staged writes die with the box; dropping the guard releases the lock
        Ok(())
    }
}
