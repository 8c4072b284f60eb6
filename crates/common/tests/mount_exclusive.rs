//! Integration tests for the exclusive-mount marker

mod common;

use std::time::{Duration, Instant};

use ::common::config::EngineConfig;
use ::common::volume::{list_volumes, MountOptions, VolumeError, VolumeFormat};
use crate::common::{pattern, TestEnv, BLOCK, PASSWORD};

const BS: usize = BLOCK as usize;

#[tokio::test]
async fn test_second_mount_is_refused() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 4).await;
    let first = env.mount("vol").await;

    let second = env.mount_with("vol", PASSWORD, MountOptions::default()).await;
    match second {
        Err(VolumeError::AlreadyMounted { marker, .. }) => {
            assert_eq!(marker.holder, first.holder());
            assert_eq!(marker.pid, std::process::id());
        }
        other => panic!("expected AlreadyMounted, got {other:?}"),
    }

    // the marker is visible without the password
    let listed = list_volumes(&env.store).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(
        listed[0].mounted.as_ref().map(|m| m.holder),
        Some(first.holder())
    );

    first.unmount().await.unwrap();
    let again = env.mount("vol").await;
    again.unmount().await.unwrap();
    assert!(list_volumes(&env.store).await.unwrap()[0].mounted.is_none());
    env.shutdown().await;
}

#[tokio::test]
async fn test_forced_mount_reports_overridden_marker() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 4).await;
    let stale = env.mount("vol").await;
    stale.write(0, &pattern(BS, 1)).await.unwrap();

    let (forced, report) = env
        .mount_with(
            "vol",
            PASSWORD,
            MountOptions {
                readonly: false,
                force: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        report.forced_over.as_ref().map(|m| m.holder),
        Some(stale.holder())
    );
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("forced"));

    // the stale session can no longer commit over the new holder
    assert!(matches!(
        stale.commit().await,
        Err(VolumeError::AlreadyMounted { .. })
    ));
    assert!(matches!(
        stale.unmount().await,
        Err(VolumeError::UnmountFailed { .. })
    ));
    stale.abandon().await.unwrap();

    // abandoning the stale session left the new marker alone
    let listed = list_volumes(&env.store).await.unwrap();
    assert_eq!(
        listed[0].mounted.as_ref().map(|m| m.holder),
        Some(forced.holder())
    );
    assert_eq!(forced.unmount().await.unwrap(), 1);
    env.shutdown().await;
}

#[tokio::test]
async fn test_overridden_session_cannot_clobber_successor_commit() {
    let mut config = EngineConfig::for_testing();
    config.writeback_secs = 1;
    let env = TestEnv::with_config(config);
    env.create("vol", VolumeFormat::Block, 4).await;

    let stale = env.mount("vol").await;
    stale.write(0, &[0xaa; BS]).await.unwrap();

    let (successor, _) = env
        .mount_with(
            "vol",
            PASSWORD,
            MountOptions {
                readonly: false,
                force: true,
            },
        )
        .await
        .unwrap();
    successor.write(0, &[0xbb; BS]).await.unwrap();
    assert_eq!(successor.unmount().await.unwrap(), 1);

    // the stale session's background flusher still pushes its block out
    stale.start_writeback();
    let deadline = Instant::now() + Duration::from_secs(10);
    while stale.stats().cache.dirty > 0 {
        assert!(Instant::now() < deadline, "write-back never ran");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(stale.unmount().await.is_err());
    stale.abandon().await.unwrap();

    let volume = env.mount("vol").await;
    assert_eq!(volume.generation(), 1);
    assert_eq!(volume.read(0, BS).await.unwrap(), vec![0xbb; BS]);
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_readonly_mount_alongside_writer_warns() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 4).await;
    let writer = env.mount("vol").await;

    let (reader, report) = env
        .mount_with(
            "vol",
            PASSWORD,
            MountOptions {
                readonly: true,
                force: false,
            },
        )
        .await
        .unwrap();
    assert!(report.forced_over.is_none());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(reader.read(0, 16).await.unwrap(), vec![0; 16]);
    reader.unmount().await.unwrap();

    // the reader did not disturb the writer's marker
    writer.write(0, &[1; 16]).await.unwrap();
    assert_eq!(writer.unmount().await.unwrap(), 1);
    env.shutdown().await;
}

#[tokio::test]
async fn test_abandon_discards_uncommitted_writes() {
    let env = TestEnv::new();
    env.create("vol", VolumeFormat::Block, 4).await;
    let volume = env.mount("vol").await;
    volume.write(0, &pattern(BS, 1)).await.unwrap();
    volume.commit().await.unwrap();
    volume.write(0, &pattern(BS, 2)).await.unwrap();
    volume.abandon().await.unwrap();

    let volume = env.mount("vol").await;
    assert_eq!(volume.generation(), 1);
    assert_eq!(volume.read(0, BS).await.unwrap(), pattern(BS, 1));
    volume.unmount().await.unwrap();
    env.shutdown().await;
}
