use super::*;

fn key(device: &str, group: &str, item: &str) -> PropertyKey {
    PropertyKey::new(device, group, item).expect("key")
}

#[tokio::test]
async fn last_write_wins_per_key() {
    let store = PropertyStore::spawn();
    let frame = key("Imager Agent", "AGENT_IMAGER_STATS", "FRAME");

    for value in ["1", "2", "3"] {
        store.set(frame.clone(), value, PropertyState::Busy, None);
    }

    let record = store.get(&frame).await.expect("record");
    assert_eq!(record.value, "3");
    assert_eq!(record.state, PropertyState::Busy);
}

#[tokio::test]
async fn delete_after_set_leaves_key_absent() {
    let store = PropertyStore::spawn();
    let frame = key("Imager Agent", "AGENT_IMAGER_STATS", "FRAME");

    store.set(frame.clone(), "1", PropertyState::Ok, None);
    store.delete(frame.clone());
    assert_eq!(store.get(&frame).await, None);

    store.set(frame.clone(), "4", PropertyState::Ok, Some("5".into()));
    let record = store.get(&frame).await.expect("record");
    assert_eq!(record.value, "4");
    assert_eq!(record.target.as_deref(), Some("5"));
}

#[tokio::test]
async fn deleting_missing_key_is_a_no_op() {
    let store = PropertyStore::spawn();
    store.delete(key("Server", "INFO", "VERSION"));
    assert!(store.keys().await.is_empty());
}

#[tokio::test]
async fn clear_removes_every_previous_key() {
    let store = PropertyStore::spawn();
    let keys = [
        key("Imager Agent", "CCD_COOLER", "ON"),
        key("Mount Agent", "MOUNT_PARK", "PARKED"),
        key("Guider Agent", "CCD_PREVIEW", "ENABLED"),
    ];
    for k in &keys {
        store.set(k.clone(), "true", PropertyState::Ok, None);
    }
    assert_eq!(store.keys().await.len(), 3);

    store.clear();
    for _ in 0..3 {
        for k in &keys {
            assert_eq!(store.get(k).await, None);
        }
    }
    assert!(store.snapshot().await.updated_at().is_some());
}

#[tokio::test]
async fn writes_from_before_a_clear_are_dropped() {
    let store = PropertyStore::spawn();
    let frame = key("Imager Agent", "AGENT_IMAGER_STATS", "FRAME");
    let old = store.epoch();

    let stale = store.writer(old);
    stale.set_record(frame.clone(), PropertyRecord::new("1", PropertyState::Busy, None));
    let current = store.clear();
    assert_eq!(current, old + 1);
    assert_eq!(store.epoch(), current);

    stale.set_record(frame.clone(), PropertyRecord::new("2", PropertyState::Busy, None));
    stale.delete_device("Mount Agent");
    assert!(store.keys().await.is_empty());

    store
        .writer(current)
        .set_record(frame.clone(), PropertyRecord::new("3", PropertyState::Ok, None));
    stale.delete(frame.clone());
    assert_eq!(store.get(&frame).await.map(|r| r.value), Some("3".to_string()));
}

#[tokio::test]
async fn delete_vector_and_device_scope_removals() {
    let store = PropertyStore::spawn();
    store.set(key("Imager Agent", "A", "X"), "1", PropertyState::Ok, None);
    store.set(key("Imager Agent", "A", "Y"), "1", PropertyState::Ok, None);
    store.set(key("Imager Agent", "B", "X"), "1", PropertyState::Ok, None);
    store.set(key("Mount Agent", "A", "X"), "1", PropertyState::Ok, None);

    store.delete_vector("Imager Agent", "A");
    let keys = store.keys().await;
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&key("Imager Agent", "B", "X")));

    store.delete_device("Imager Agent");
    let keys = store.keys().await;
    assert_eq!(keys.len(), 1);
    assert!(keys.contains(&key("Mount Agent", "A", "X")));
}

#[tokio::test]
async fn concurrent_writers_are_serialized() {
    let store = PropertyStore::spawn();
    let mut tasks = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..50 {
                store.set(
                    key("Server", "COUNTERS", &format!("W{writer}")),
                    n.to_string(),
                    PropertyState::Ok,
                    None,
                );
            }
        }));
    }
    for task in tasks {
        task.await.expect("writer");
    }

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.len(), 8);
    for writer in 0..8 {
        let record = snapshot
            .lookup("Server", "COUNTERS", &format!("W{writer}"))
            .expect("record");
        assert_eq!(record.value, "49");
    }
}

#[test]
fn table_lookup_ignores_malformed_components() {
    let mut table = PropertyTable::new();
    table.set(key("Server", "INFO", "VERSION"), PropertyRecord::new("2.0", PropertyState::Ok, None));
    assert!(table.lookup("Server", "INFO", "VERSION").is_some());
    assert!(table.lookup("", "INFO", "VERSION").is_none());
    assert!(!table.delete(&key("Server", "INFO", "OTHER")));
    assert_eq!(table.delete_matching("Server", None), 1);
    assert!(table.is_empty());
}
