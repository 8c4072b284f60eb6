//! Integration tests for deleting and listing volumes

mod common;

use ::common::chunk::superblock_key;
use ::common::volume::{delete, list_volumes, CreateOptions, Volume, VolumeError, VolumeFormat};
use crate::common::{pattern, TestEnv, BLOCK, PASSWORD};

const BS: usize = BLOCK as usize;

async fn populate(env: &TestEnv, name: &str) -> usize {
    env.create(name, VolumeFormat::Block, 8).await;
    let volume = env.mount(name).await;
    volume.write(0, &pattern(3 * BS, 1)).await.unwrap();
    volume.unmount().await.unwrap();
    env.keys(name).await.len()
}

#[tokio::test]
async fn test_delete_removes_every_object() {
    let env = TestEnv::new();
    let objects = populate(&env, "alpha").await;
    env.create("beta", VolumeFormat::Tree, 4).await;

    let names: Vec<_> = list_volumes(&env.store)
        .await
        .unwrap()
        .into_iter()
        .map(|info| (info.name, info.format))
        .collect();
    assert_eq!(
        names,
        vec![
            ("alpha".to_string(), VolumeFormat::Block),
            ("beta".to_string(), VolumeFormat::Tree)
        ]
    );

    let report = delete(&env.store, "alpha", &env.handle(), false)
        .await
        .unwrap();
    assert!(report.had_superblock);
    assert_eq!(report.deleted, objects);
    assert!(env.keys("alpha").await.is_empty());
    assert_eq!(list_volumes(&env.store).await.unwrap().len(), 1);

    assert!(matches!(
        delete(&env.store, "alpha", &env.handle(), false).await,
        Err(VolumeError::NotFound(_))
    ));
    assert!(matches!(
        env.mount_with("alpha", PASSWORD, Default::default()).await,
        Err(VolumeError::NotFound(_))
    ));
    env.shutdown().await;
}

#[tokio::test]
async fn test_mounted_volume_needs_force() {
    let env = TestEnv::new();
    populate(&env, "vol").await;
    let volume = env.mount("vol").await;

    assert!(matches!(
        delete(&env.store, "vol", &env.handle(), false).await,
        Err(VolumeError::AlreadyMounted { .. })
    ));
    assert!(!env.keys("vol").await.is_empty());

    delete(&env.store, "vol", &env.handle(), true).await.unwrap();
    assert!(env.keys("vol").await.is_empty());
    // the session cannot commit into a deleted volume
    assert!(volume.unmount().await.is_err());
    volume.abandon().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_delete_keeps_superblock_and_resumes() {
    let env = TestEnv::new();
    let objects = populate(&env, "vol").await;

    env.faulty.fail_deletes(|key| key.contains("/data/"));
    assert!(matches!(
        delete(&env.store, "vol", &env.handle(), false).await,
        Err(VolumeError::Store(_))
    ));
    // still listed, since the superblock goes last
    assert_eq!(list_volumes(&env.store).await.unwrap().len(), 1);

    env.faulty.heal();
    let report = delete(&env.store, "vol", &env.handle(), false)
        .await
        .unwrap();
    assert!(report.had_superblock);
    assert!(report.deleted < objects);
    assert!(env.keys("vol").await.is_empty());
    env.shutdown().await;
}

#[tokio::test]
async fn test_stray_chunks_without_superblock_are_removed() {
    let env = TestEnv::new();
    let objects = populate(&env, "vol").await;
    env.store.delete(&superblock_key("vol")).await.unwrap();
    assert!(list_volumes(&env.store).await.unwrap().is_empty());

    // leftovers block a fresh create unless it overwrites
    let options = CreateOptions::new(VolumeFormat::Block, 8 * BLOCK as u64).block_size(BLOCK);
    assert!(matches!(
        Volume::create(
            env.store.clone(),
            "vol",
            PASSWORD,
            &options,
            &env.config,
            &env.handle()
        )
        .await,
        Err(VolumeError::AlreadyExists(_))
    ));

    let report = delete(&env.store, "vol", &env.handle(), false)
        .await
        .unwrap();
    assert!(!report.had_superblock);
    assert_eq!(report.deleted, objects - 1);
    assert!(env.keys("vol").await.is_empty());

    env.create("vol", VolumeFormat::Block, 8).await;
    let volume = env.mount("vol").await;
    assert_eq!(volume.read(0, BS).await.unwrap(), vec![0; BS]);
    volume.unmount().await.unwrap();
    env.shutdown().await;
}

#[tokio::test]
async fn test_invalid_names_are_rejected() {
    let env = TestEnv::new();
    for name in ["", "../etc", "a/b", ".hidden"] {
        assert!(
            matches!(
                delete(&env.store, name, &env.handle(), false).await,
                Err(VolumeError::InvalidName(_))
            ),
            "{name:?}"
        );
    }
    env.shutdown().await;
}
