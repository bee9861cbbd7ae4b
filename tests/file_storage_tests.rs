// ABOUTME: Tests for the JSON-file backed value storage
// ABOUTME: Verifies persistence across reopen, removal, clearing and destination ids

use chatwire::file_storage::FileValueStorage;
use chatwire_core::{StorageKey, ValueStorage};

#[test]
fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("storage.json");

    let storage = FileValueStorage::open(&path).unwrap();
    assert!(storage.get(StorageKey::AuthToken).is_none());
    storage.set(StorageKey::AuthToken, Some("tok-1".into()));
    storage.set(StorageKey::CustomerId, Some("cust-1".into()));
    assert!(path.exists());

    let reopened = FileValueStorage::open(&path).unwrap();
    assert_eq!(reopened.get(StorageKey::AuthToken).as_deref(), Some("tok-1"));
    assert_eq!(reopened.get(StorageKey::CustomerId).as_deref(), Some("cust-1"));
    assert_eq!(reopened.entries().get(StorageKey::AuthToken.key()).map(String::as_str), Some("tok-1"));
}

#[test]
fn test_setting_none_removes_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let storage = FileValueStorage::open(&path).unwrap();
    storage.set(StorageKey::AuthToken, Some("tok-1".into()));
    storage.set(StorageKey::AuthToken, None);

    let reopened = FileValueStorage::open(&path).unwrap();
    assert!(reopened.get(StorageKey::AuthToken).is_none());
    assert!(reopened.entries().is_empty());
}

#[test]
fn test_clear_all_empties_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let storage = FileValueStorage::open(&path).unwrap();
    for key in StorageKey::ALL {
        storage.set(key, Some("value".into()));
    }
    storage.clear_all();

    assert!(storage.entries().is_empty());
    assert!(FileValueStorage::open(&path).unwrap().entries().is_empty());
}

#[test]
fn test_destination_id_is_per_instance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let first = FileValueStorage::open(&path).unwrap();
    assert_eq!(first.destination_id(), first.destination_id());
    first.set(StorageKey::AuthToken, Some("tok".into()));

    let second = FileValueStorage::open(&path).unwrap();
    assert_ne!(first.destination_id(), second.destination_id());
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains(&first.destination_id().to_string()));
}

#[test]
fn test_empty_and_corrupt_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    std::fs::write(&path, "").unwrap();
    assert!(FileValueStorage::open(&path).unwrap().entries().is_empty());

    std::fs::write(&path, "{ not json").unwrap();
    assert!(FileValueStorage::open(&path).is_err());
}
