//! Integration tests for failures in the middle of a commit

mod common;

use ::common::volume::{fsck, FsckOptions, MountOptions, VolumeError, VolumeFormat, VolumeState};
use crate::common::{pattern, TestEnv, BLOCK, PASSWORD};

const BS: usize = BLOCK as usize;

fn forced() -> MountOptions {
    MountOptions {
        readonly: false,
        force: true,
    }
}

#[tokio::test]
async fn test_failed_superblock_write_keeps_prior_generation() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 8).await;

    let volume = env.mount("vol").await;
    volume.write(0, &pattern(2 * BS, 1)).await.unwrap();
    assert_eq!(volume.unmount().await.unwrap(), 1);

    let volume = env.mount("vol").await;
    volume.write(0, &pattern(2 * BS, 2)).await.unwrap();
    volume.write(5 * BS as u64, &pattern(BS, 3)).await.unwrap();
    env.faulty.fail_puts(|key| key.ends_with("/superblock"));
    let err = volume.unmount().await.unwrap_err();
    assert!(matches!(err, VolumeError::UnmountFailed { .. }));
    assert_eq!(volume.state(), VolumeState::Dirty);
    assert_eq!(volume.generation(), 1);

    // the process dies here: the marker from this session stays behind
    drop(volume);
    env.faulty.heal();

    assert!(matches!(
        env.mount_with("vol", PASSWORD, MountOptions::default()).await,
        Err(VolumeError::AlreadyMounted { .. })
    ));
    let (volume, report) = env.mount_with("vol", PASSWORD, forced()).await.unwrap();
    assert_eq!(report.generation, 1);
    assert_eq!(volume.read(0, 2 * BS).await.unwrap(), pattern(2 * BS, 1));
    assert_eq!(volume.read(5 * BS as u64, BS).await.unwrap(), vec![0; BS]);
    assert_eq!(volume.unmount().await.unwrap(), 2);

    // chunks of the lost commit that were not overwritten are garbage
    let report = fsck(
        env.store.clone(),
        "vol",
        PASSWORD,
        FsckOptions {
            repair: true,
            force: false,
        },
        &env.config,
        &env.handle(),
    )
    .await
    .unwrap();
    assert!(report.missing.is_empty() && report.corrupt.is_empty());
    assert!(!report.orphans.is_empty());
    assert!(report.repaired);

    let volume = env.mount("vol").await;
    assert_eq!(volume.read(0, 2 * BS).await.unwrap(), pattern(2 * BS, 1));
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_failed_flush_leaves_volume_mounted_and_retryable() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 8).await;
    let volume = env.mount("vol").await;
    volume.write(0, &pattern(3 * BS, 4)).await.unwrap();

    env.faulty.fail_puts(|key| key.contains("/data/"));
    assert!(matches!(
        volume.unmount().await,
        Err(VolumeError::UnmountFailed { .. })
    ));
    assert_eq!(volume.state(), VolumeState::Dirty);
    assert_eq!(volume.read(0, 3 * BS).await.unwrap(), pattern(3 * BS, 4));

    env.faulty.heal();
    assert_eq!(volume.unmount().await.unwrap(), 1);

    let volume = env.mount("vol").await;
    assert_eq!(volume.read(0, 3 * BS).await.unwrap(), pattern(3 * BS, 4));
    volume.unmount().await.unwrap();
    env.shutdown().await;
}
