use cashd_storage::memory::MemoryStore;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn column_names_are_stable() {
    assert_eq!(Column::Utxo.as_str(), "utxo_set");
    assert_eq!(Column::SpendJournal.as_str(), "spend_journal");
    assert_eq!(Column::Meta.as_str(), "meta");
    for (idx, column) in Column::ALL.iter().enumerate() {
        assert_eq!(column.index(), idx);
    }
}

#[test]
fn columns_are_isolated() {
    let store = MemoryStore::new();
    store.put(Column::Utxo, b"key", b"utxo").expect("put");
    store.put(Column::Meta, b"key", b"meta").expect("put");

    assert_eq!(
        store.get(Column::Utxo, b"key").expect("get"),
        Some(b"utxo".to_vec())
    );
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"meta".to_vec())
    );
    assert_eq!(store.get(Column::SpendJournal, b"key").expect("get"), None);
}

#[test]
fn batch_applies_in_order() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    batch.put(Column::Utxo, b"a".to_vec(), b"1".to_vec());
    batch.put(Column::Utxo, b"a".to_vec(), b"2".to_vec());
    batch.delete(Column::Utxo, b"b".to_vec());
    store.write_batch(&batch).expect("batch");

    assert_eq!(
        store.get(Column::Utxo, b"a").expect("get"),
        Some(b"2".to_vec())
    );
}

#[test]
fn clear_column_only_touches_one_column() {
    let store = MemoryStore::new();
    store.put(Column::Utxo, b"a", b"1").expect("put");
    store.put(Column::Utxo, b"b", b"2").expect("put");
    store.put(Column::Meta, b"a", b"3").expect("put");

    store.clear_column(Column::Utxo).expect("clear");
    assert_eq!(store.len(Column::Utxo), 0);
    assert_eq!(
        store.get(Column::Meta, b"a").expect("get"),
        Some(b"3".to_vec())
    );
}

#[test]
fn scan_prefix_filters() {
    let store = MemoryStore::new();
    store.put(Column::SpendJournal, b"aa1", b"x").expect("put");
    store.put(Column::SpendJournal, b"aa2", b"y").expect("put");
    store.put(Column::SpendJournal, b"bb1", b"z").expect("put");

    let hits = store.scan_prefix(Column::SpendJournal, b"aa").expect("scan");
    assert_eq!(hits.len(), 2);
}
