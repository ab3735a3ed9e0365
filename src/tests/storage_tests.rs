use crate::mapping::{MappingKey, Protocol};
use crate::storage::*;
use crate::Error;
use tempfile::tempdir;

#[test]
fn test_store_path() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());
    assert_eq!(store.path(), dir.path().join(MAPPINGS_FILE));
}

#[test]
fn test_missing_file_loads_empty() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path().join("not-created-yet"));
    assert!(store.load().expect("load").is_empty());
}

#[test]
fn test_empty_file_loads_empty() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());
    std::fs::write(store.path(), "  \n").expect("write");
    assert!(store.load().expect("load").is_empty());
}

#[test]
fn test_add_and_reload() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());

    let record = store
        .add(7000, 7000, Protocol::Udp, "game")
        .expect("add");
    assert_eq!(record.key(), MappingKey::new(7000, 7000, Protocol::Udp));
    store.add(22, 2222, Protocol::Tcp, "ssh").expect("add");

    let reopened = MappingStore::new(dir.path());
    let loaded = reopened.load().expect("load");
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0], record);
    assert_eq!(loaded[1].description, "ssh");
    assert!(!dir.path().join("manual_mappings.json.tmp").exists());
}

#[test]
fn test_add_replaces_same_key() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());
    store.add(7000, 7000, Protocol::Udp, "old").expect("add");
    store.add(7000, 7000, Protocol::Udp, "new").expect("add");
    store.add(7000, 7000, Protocol::Tcp, "tcp twin").expect("add");

    let loaded = store.load().expect("load");
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().any(|m| m.description == "new"));
    assert!(!loaded.iter().any(|m| m.description == "old"));
}

#[test]
fn test_remove() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());
    store.add(7000, 0, Protocol::Tcp, "web").expect("add");

    let removed = store.remove(7000, 0, Protocol::Tcp).expect("remove");
    assert_eq!(removed.description, "web");
    assert!(store.load().expect("load").is_empty());

    match store.remove(7000, 0, Protocol::Tcp) {
        Err(Error::Storage(msg)) => assert!(msg.contains("7000:0:tcp")),
        other => panic!("Expected storage error, got {:?}", other),
    }
}

#[test]
fn test_corrupt_file_moved_aside() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::new(dir.path());
    std::fs::write(store.path(), "{ not json").expect("write");

    assert!(store.load().expect("load").is_empty());
    assert!(dir.path().join("manual_mappings.json.corrupt").exists());
    assert!(!store.path().exists());

    store.add(7001, 0, Protocol::Udp, "fresh").expect("add after corruption");
    assert_eq!(store.load().expect("load").len(), 1);
}

#[test]
fn test_save_overwrites() {
    let dir = tempdir().expect("tempdir");
    let store = MappingStore::at_path(dir.path().join("nested").join("custom.json"));
    store.add(1, 1, Protocol::Tcp, "a").expect("add");

    let replacement = vec![StoredMapping::new(2, 2, Protocol::Udp, "b")];
    store.save(&replacement).expect("save");
    assert_eq!(store.load().expect("load"), replacement);
}

#[test]
fn test_stored_json_shape() {
    let record = StoredMapping::new(7000, 0, Protocol::Udp, "game");
    let json = serde_json::to_value(&record).expect("serialize");
    assert_eq!(json["internal_port"], 7000);
    assert_eq!(json["external_port"], 0);
    assert_eq!(json["protocol"], "udp");
    assert_eq!(json["description"], "game");
    assert!(json["created_at"].is_string());
}
