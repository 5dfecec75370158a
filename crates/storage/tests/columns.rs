use std::collections::HashSet;

use hybridd_storage::memory::MemoryStore;
use hybridd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn column_indexes_and_names_are_unique() {
    let mut names = HashSet::new();
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        assert!(names.insert(column.as_str()), "duplicate name for {column:?}");
    }
    assert_eq!(names.len(), Column::COUNT);
}

#[test]
fn shared_store_behind_arc_sees_the_same_writes() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let view = std::sync::Arc::clone(&store);
    let mut batch = WriteBatch::new();
    batch.put(Column::Stake, b"block", vec![1]);
    store.write_batch(&batch).expect("write");
    assert_eq!(view.get(Column::Stake, b"block").expect("get"), Some(vec![1]));
    assert_eq!(store.len(Column::Stake), 1);
}
