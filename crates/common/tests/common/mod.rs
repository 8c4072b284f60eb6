//! Shared test utilities for volume integration tests
#![allow(dead_code)]

use std::sync::Arc;

use common::config::EngineConfig;
use common::pool::{PoolHandle, WorkerPool};
use common::testkit::FaultyStore;
use common::volume::{
    CreateOptions, MountOptions, MountReport, Volume, VolumeError, VolumeFormat, VolumeInfo,
};
use store::SharedStore;

pub const PASSWORD: &str = "correct horse battery staple";
pub const BLOCK: u32 = 4096;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fault-injecting memory store, a worker pool and test-sized settings.
pub struct TestEnv {
    pub faulty: Arc<FaultyStore>,
    pub store: SharedStore,
    pub pool: WorkerPool,
    pub config: EngineConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::for_testing())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let faulty = FaultyStore::memory();
        let store: SharedStore = faulty.clone();
        Self {
            faulty,
            store,
            pool: WorkerPool::new(config.workers),
            config,
        }
    }

    /// Cache bounded to `blocks` test blocks.
    pub fn with_cache_blocks(blocks: u64) -> Self {
        let mut config = EngineConfig::for_testing();
        config.cache.max_bytes = blocks * BLOCK as u64;
        Self::with_config(config)
    }

    pub fn handle(&self) -> PoolHandle {
        self.pool.handle()
    }

    pub async fn create(&self, name: &str, format: VolumeFormat, blocks: u64) -> VolumeInfo {
        Volume::create(
            self.store.clone(),
            name,
            PASSWORD,
            &CreateOptions::new(format, blocks * BLOCK as u64).block_size(BLOCK),
            &self.config,
            &self.handle(),
        )
        .await
        .unwrap()
    }

    pub async fn mount_with(
        &self,
        name: &str,
        password: &str,
        options: MountOptions,
    ) -> Result<(Volume, MountReport), VolumeError> {
        Volume::mount(
            self.store.clone(),
            name,
            password,
            options,
            &self.config,
            self.handle(),
        )
        .await
    }

    pub async fn mount(&self, name: &str) -> Volume {
        self.mount_with(name, PASSWORD, MountOptions::default())
            .await
            .unwrap()
            .0
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        self.store.list(prefix).await.unwrap()
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

/// Deterministic, seed-dependent bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
