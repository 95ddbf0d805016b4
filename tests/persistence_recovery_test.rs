//! Integration tests for recovery of stored values on a real directory.
//!
//! These tests validate the complete load path across process restarts:
//! - Value saved → hub dropped → new hub → value loaded
//! - Primary corrupted on disk → newest backup used and written back
//! - Storage key rotated → old values readable and resealed
//! - Legacy plaintext found → migrated into an envelope
//!
//! Every test runs against `FileStore` in a fresh temp directory.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use larder::crypto::LarderKeyring;
use larder::persistence::{
    Codec, FileStore, KeyValueStore, LoadOptions, LoadSource, PersistenceHub, StorageRecord,
};
use tempfile::TempDir;

// === Test Fixtures ===

const KEY_MATERIAL: [u8; 32] = [42u8; 32];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
}

fn profile(name: &str, visits: u32) -> Profile {
    Profile {
        name: name.to_string(),
        visits,
    }
}

fn codec_at_epoch(epoch: u32) -> Codec {
    let keyring = LarderKeyring::from_key_material(&KEY_MATERIAL, epoch).unwrap();
    Codec::from_keyring(&keyring).unwrap()
}

async fn open_hub(dir: &TempDir, epoch: u32) -> (Arc<dyn KeyValueStore>, PersistenceHub) {
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let hub = PersistenceHub::new(kv.clone(), codec_at_epoch(epoch)).unwrap();
    (kv, hub)
}

// === Tests ===

#[tokio::test]
async fn test_back_to_back_saves_last_enqueued_wins() {
    let dir = TempDir::new().unwrap();
    let (_kv, hub) = open_hub(&dir, 1).await;

    let first = hub.save("profile", &json!({"name": "A"}));
    let second = hub.save("profile", &json!({"name": "B"}));
    // Completion order does not matter, only enqueue order
    second.await.unwrap();
    first.await.unwrap();

    let loaded = hub.load("profile", json!({}), LoadOptions::default()).await;
    assert_eq!(loaded, json!({"name": "B"}));
}

#[tokio::test]
async fn test_object_marker_on_disk_loads_default() {
    let dir = TempDir::new().unwrap();
    let (kv, hub) = open_hub(&dir, 1).await;

    kv.set("events", "[object Object]").await.unwrap();

    let outcome = hub
        .load_with_report("events", Vec::<String>::new(), LoadOptions::default())
        .await;
    assert_eq!(outcome.value, Vec::<String>::new());
    assert_eq!(outcome.source, LoadSource::Default);
}

#[tokio::test]
async fn test_value_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (_kv, hub) = open_hub(&dir, 1).await;
        let store = hub.store("profile", Profile::default(), LoadOptions::default());
        store.save(&profile("A", 3)).await.unwrap();
        store.flush().await;
    }

    let (_kv, hub) = open_hub(&dir, 1).await;
    let outcome = hub
        .load_with_report("profile", Profile::default(), LoadOptions::default())
        .await;
    assert_eq!(outcome.value, profile("A", 3));
    assert_eq!(outcome.source, LoadSource::Primary);
}

#[tokio::test]
async fn test_corrupted_primary_recovered_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (_kv, hub) = open_hub(&dir, 1).await;
        let store = hub.store("profile", Profile::default(), LoadOptions::default());
        store.save(&profile("A", 1)).await.unwrap();
        store.flush().await;
    }

    // Truncated mid-write by something outside the store
    let (kv, hub) = open_hub(&dir, 1).await;
    kv.set("profile", r#"{"larder":1,"key":"prof"#).await.unwrap();

    let outcome = hub
        .load_with_report("profile", Profile::default(), LoadOptions::default())
        .await;
    assert_eq!(outcome.value, profile("A", 1));
    assert_eq!(outcome.source, LoadSource::Backup { generation: 0 });

    hub.store("profile", Profile::default(), LoadOptions::default())
        .flush()
        .await;
    let raw = kv.get("profile").await.unwrap().unwrap();
    assert!(StorageRecord::parse(&raw, "profile").is_ok());
}

#[tokio::test]
async fn test_wrong_key_with_no_backup_loads_default() {
    let dir = TempDir::new().unwrap();
    let no_backup = LoadOptions {
        backup: false,
        ..LoadOptions::default()
    };

    {
        let (_kv, hub) = open_hub(&dir, 1).await;
        let store = hub.store("profile", Profile::default(), no_backup.clone());
        store.save(&profile("A", 1)).await.unwrap();
        store.flush().await;
    }

    let kv: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let other = Codec::new(&[7u8; 32]).unwrap();
    let hub = PersistenceHub::new(kv, other).unwrap();

    let outcome = hub
        .load_with_report("profile", Profile::default(), no_backup)
        .await;
    assert_eq!(outcome.value, Profile::default());
    assert_eq!(outcome.source, LoadSource::Default);
}

#[tokio::test]
async fn test_key_rotation_reseals_on_read() {
    let dir = TempDir::new().unwrap();

    {
        let (_kv, hub) = open_hub(&dir, 1).await;
        let store = hub.store("profile", Profile::default(), LoadOptions::default());
        store.save(&profile("A", 1)).await.unwrap();
        store.flush().await;
    }

    let (kv, hub) = open_hub(&dir, 2).await;
    let store = hub.store("profile", Profile::default(), LoadOptions::default());
    let outcome = store.load_with_report().await;
    assert_eq!(outcome.value, profile("A", 1));
    assert_eq!(outcome.source, LoadSource::Primary);
    store.flush().await;

    // Only the epoch 2 key is needed now
    let epoch2 = LarderKeyring::from_key_material(&KEY_MATERIAL, 2).unwrap();
    let active_only = Codec::new(epoch2.storage_key()).unwrap();
    let raw = kv.get("profile").await.unwrap().unwrap();
    let record = StorageRecord::parse(&raw, "profile").unwrap();
    let opened = active_only.open(&record.envelope).unwrap();
    assert!(!opened.retired_key);
    assert_eq!(
        serde_json::from_slice::<Profile>(&opened.plaintext).unwrap(),
        profile("A", 1)
    );
}

#[tokio::test]
async fn test_legacy_plaintext_migrated() {
    let dir = TempDir::new().unwrap();
    let (kv, hub) = open_hub(&dir, 1).await;

    kv.set("profile", r#"{"name":"Old","visits":9}"#).await.unwrap();

    let store = hub.store("profile", Profile::default(), LoadOptions::default());
    let outcome = store.load_with_report().await;
    assert_eq!(outcome.value, profile("Old", 9));
    assert_eq!(outcome.source, LoadSource::Migrated);

    store.flush().await;
    let raw = kv.get("profile").await.unwrap().unwrap();
    assert!(!raw.contains("Old"));
    assert!(StorageRecord::parse(&raw, "profile").is_ok());
}

#[tokio::test]
async fn test_backup_ring_bounded_on_disk() {
    let dir = TempDir::new().unwrap();
    let (kv, hub) = open_hub(&dir, 1).await;
    let options = LoadOptions {
        backup_interval: Duration::ZERO,
        retention: 3,
        ..LoadOptions::default()
    };

    let store = hub.store("profile", Profile::default(), options);
    for visits in 0..5 {
        store.save(&profile("A", visits)).await.unwrap();
    }
    store.flush().await;

    assert_eq!(store.generations().await, vec![4, 3, 2]);

    let mut keys = kv.list_keys().await.unwrap();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "profile",
            "profile__backup__0",
            "profile__backup__1",
            "profile__backup__2",
        ]
    );
}

#[tokio::test]
async fn test_clear_removes_value_and_backups() {
    let dir = TempDir::new().unwrap();
    let (kv, hub) = open_hub(&dir, 1).await;

    let store = hub.store("profile", Profile::default(), LoadOptions::default());
    store.save(&profile("A", 1)).await.unwrap();
    store.flush().await;
    store.clear().await.unwrap();

    assert!(kv.list_keys().await.unwrap().is_empty());
    assert_eq!(store.load().await, Profile::default());
}
