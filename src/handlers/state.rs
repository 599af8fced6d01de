//! Experiment Manager - Core State Management
//!
//! Owns the store, the bandit selector and the test provisioner. All three
//! share one `Arc<dyn BanditStore>`, so a test created through the
//! provisioner is immediately visible to selection and tracking.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::bandit::BanditSelector;
use crate::config::{ServerConfig, StoreBackend};
use crate::generation::{
    GenerationCache, MokaGenerationCache, OpenAiSubjectGenerator, SubjectLineGenerator,
    TestProvisioner,
};
use crate::storage::{BanditStore, MemoryBanditStore, RocksBanditStore};

/// Central state for the server
pub struct ExperimentManager {
    config: ServerConfig,
    store: Arc<dyn BanditStore>,
    selector: BanditSelector,
    provisioner: TestProvisioner,
}

impl ExperimentManager {
    /// Open the configured store and build the production collaborators
    pub fn new(config: ServerConfig) -> Result<Self> {
        let lock_timeout = Duration::from_millis(config.store.lock_timeout_ms);
        let store: Arc<dyn BanditStore> = match config.store.backend {
            StoreBackend::RocksDb => Arc::new(
                RocksBanditStore::open(&config.store.storage_path, lock_timeout).with_context(
                    || format!("Failed to open store at {:?}", config.store.storage_path),
                )?,
            ),
            StoreBackend::Memory => Arc::new(MemoryBanditStore::with_lock_timeout(lock_timeout)),
        };

        let generator = Arc::new(
            OpenAiSubjectGenerator::from_config(&config.generation)
                .context("Failed to build subject line generator")?,
        );

        Ok(Self::with_components(config, store, generator))
    }

    /// Assemble a manager from explicit collaborators
    pub fn with_components(
        config: ServerConfig,
        store: Arc<dyn BanditStore>,
        generator: Arc<dyn SubjectLineGenerator>,
    ) -> Self {
        let cache: Arc<dyn GenerationCache> = Arc::new(MokaGenerationCache::new(
            Duration::from_secs(config.generation.cache_ttl_secs),
            config.generation.cache_capacity,
        ));
        let selector = BanditSelector::new(store.clone(), config.bandit.clone());
        let provisioner = TestProvisioner::new(
            store.clone(),
            generator,
            cache,
            config.generation.variants_per_test,
        );

        info!(
            backend = store.backend_name(),
            generator = provisioner.generator_name(),
            "Experiment manager ready"
        );

        Self {
            config,
            store,
            selector,
            provisioner,
        }
    }

    pub fn selector(&self) -> &BanditSelector {
        &self.selector
    }

    pub fn provisioner(&self) -> &TestProvisioner {
        &self.provisioner
    }

    pub fn store(&self) -> &Arc<dyn BanditStore> {
        &self.store
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.config
    }
}
