//! Integration tests for the bounded write-back cache under a volume

mod common;

use ::common::config::{CacheKind, EngineConfig};
use ::common::volume::{VolumeError, VolumeFormat};
use crate::common::{pattern, TestEnv, BLOCK};

const BS: usize = BLOCK as usize;
const CACHE_BLOCKS: u64 = 8;

#[tokio::test]
async fn test_resident_bytes_stay_bounded_and_evictions_flush() {
    let env = TestEnv::with_cache_blocks(CACHE_BLOCKS);
    env.create("vol", VolumeFormat::Block, 64).await;
    let volume = env.mount("vol").await;

    for i in 0..32u64 {
        volume
            .write(i * BS as u64, &pattern(BS, i as u8))
            .await
            .unwrap();
        let stats = volume.stats().cache;
        assert!(stats.resident_bytes <= CACHE_BLOCKS * BS as u64);
    }
    let stats = volume.stats().cache;
    assert!(stats.evictions >= 24);
    // every evicted block was dirty and had to reach the store first
    assert!(env.keys("vol/data").await.len() >= 24);
    volume.unmount().await.unwrap();

    let volume = env.mount("vol").await;
    for i in 0..32u64 {
        assert_eq!(
            volume.read(i * BS as u64, BS).await.unwrap(),
            pattern(BS, i as u8),
            "block {i}"
        );
        assert!(volume.stats().cache.resident_bytes <= CACHE_BLOCKS * BS as u64);
    }
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_transient_put_absorbed_by_flush_retries() {
    let env = TestEnv::with_cache_blocks(CACHE_BLOCKS);
    env.create("vol", VolumeFormat::Block, 16).await;
    let volume = env.mount("vol").await;
    for i in 0..CACHE_BLOCKS {
        volume.write(i * BS as u64, &pattern(BS, 1)).await.unwrap();
    }

    // admitting one more block evicts a dirty one; its first put fails
    env.faulty.reset_counts();
    env.faulty.fail_transiently(1);
    volume
        .write(CACHE_BLOCKS * BS as u64, &pattern(BS, 2))
        .await
        .unwrap();
    assert_eq!(env.faulty.puts(), 2);
    volume.unmount().await.unwrap();

    let volume = env.mount("vol").await;
    assert_eq!(volume.read(0, BS).await.unwrap(), pattern(BS, 1));
    assert_eq!(
        volume.read(CACHE_BLOCKS * BS as u64, BS).await.unwrap(),
        pattern(BS, 2)
    );
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_failed_eviction_flush_surfaces_and_keeps_data() {
    let env = TestEnv::with_cache_blocks(CACHE_BLOCKS);
    env.create("vol", VolumeFormat::Block, 16).await;
    let volume = env.mount("vol").await;
    for i in 0..CACHE_BLOCKS {
        volume.write(i * BS as u64, &pattern(BS, i as u8)).await.unwrap();
    }

    env.faulty.fail_puts(|key| key.contains("/data/"));
    let err = volume
        .write(CACHE_BLOCKS * BS as u64, &pattern(BS, 99))
        .await
        .unwrap_err();
    assert!(matches!(err, VolumeError::Cache(_)), "{err}");
    // the victim was not dropped
    assert_eq!(volume.read(0, BS).await.unwrap(), pattern(BS, 0));

    env.faulty.heal();
    volume
        .write(CACHE_BLOCKS * BS as u64, &pattern(BS, 99))
        .await
        .unwrap();
    volume.unmount().await.unwrap();

    let volume = env.mount("vol").await;
    for i in 0..CACHE_BLOCKS {
        assert_eq!(
            volume.read(i * BS as u64, BS).await.unwrap(),
            pattern(BS, i as u8)
        );
    }
    assert_eq!(
        volume.read(CACHE_BLOCKS * BS as u64, BS).await.unwrap(),
        pattern(BS, 99)
    );
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_file_cache_spills_to_disk_and_cleans_up() {
    let spill = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::for_testing();
    config.cache.kind = CacheKind::File;
    config.cache.path = Some(spill.path().to_path_buf());
    config.cache.max_bytes = CACHE_BLOCKS * BS as u64;
    let env = TestEnv::with_config(config);
    env.create("vol", VolumeFormat::Block, 32).await;

    let volume = env.mount("vol").await;
    let data = pattern(12 * BS, 5);
    volume.write(0, &data).await.unwrap();
    assert_eq!(std::fs::read_dir(spill.path()).unwrap().count(), 1);
    assert_eq!(volume.read(0, data.len()).await.unwrap(), data);
    volume.unmount().await.unwrap();
    drop(volume);

    let volume = env.mount("vol").await;
    assert_eq!(volume.read(0, data.len()).await.unwrap(), data);
    volume.unmount().await.unwrap();
    drop(volume);
    env.shutdown().await;
    assert_eq!(std::fs::read_dir(spill.path()).unwrap().count(), 0);
}
