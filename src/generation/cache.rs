//! Cache of provisioning results keyed by content fingerprint

use std::time::Duration;

use moka::sync::Cache;

use super::ProvisionedTest;
use crate::bandit::types::Fingerprint;

/// Lookaside cache in front of the store's fingerprint index
pub trait GenerationCache: Send + Sync {
    fn get(&self, fingerprint: &Fingerprint) -> Option<ProvisionedTest>;

    fn set(&self, fingerprint: Fingerprint, value: ProvisionedTest);

    fn invalidate(&self, fingerprint: &Fingerprint);
}

/// In-process TTL + size-bounded cache
pub struct MokaGenerationCache {
    inner: Cache<Fingerprint, ProvisionedTest>,
}

impl MokaGenerationCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl GenerationCache for MokaGenerationCache {
    fn get(&self, fingerprint: &Fingerprint) -> Option<ProvisionedTest> {
        self.inner.get(fingerprint)
    }

    fn set(&self, fingerprint: Fingerprint, value: ProvisionedTest) {
        self.inner.insert(fingerprint, value);
    }

    fn invalidate(&self, fingerprint: &Fingerprint) {
        self.inner.invalidate(fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::types::TestId;

    fn provisioned(fingerprint: &Fingerprint) -> ProvisionedTest {
        ProvisionedTest {
            test_id: TestId::new(),
            fingerprint: fingerprint.clone(),
            original_subject: None,
            variants: Vec::new(),
            cached: false,
        }
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = MokaGenerationCache::new(Duration::from_secs(60), 100);
        let fp = Fingerprint::of("cached content");
        assert!(cache.get(&fp).is_none());

        let value = provisioned(&fp);
        cache.set(fp.clone(), value.clone());
        assert_eq!(cache.get(&fp).unwrap().test_id, value.test_id);

        cache.invalidate(&fp);
        assert!(cache.get(&fp).is_none());
    }

    #[test]
    fn test_entries_expire() {
        let cache = MokaGenerationCache::new(Duration::from_millis(50), 100);
        let fp = Fingerprint::of("short lived");
        cache.set(fp.clone(), provisioned(&fp));
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get(&fp).is_none());
    }
}
