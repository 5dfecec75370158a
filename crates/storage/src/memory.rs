use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile store used by tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<[ColumnMap; Column::COUNT]>,
    batches_written: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held in `column`.
    pub fn len(&self, column: Column) -> usize {
        self.columns
            .read()
            .map(|columns| columns[column.index()].len())
            .unwrap_or(0)
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("memory store lock poisoned".to_string())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().map_err(|_| Self::poisoned())?;
        Ok(columns[column.index()].get(key).cloned())
    }

    fn multi_get(
        &self,
        column: Column,
        keys: &[&[u8]],
    ) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let columns = self.columns.read().map_err(|_| Self::poisoned())?;
        let map = &columns[column.index()];
        Ok(keys.iter().map(|key| map.get(*key).cloned()).collect())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let columns = self.columns.read().map_err(|_| Self::poisoned())?;
        Ok(columns[column.index()]
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| Self::poisoned())?;
        for op in batch.iter() {
            let map = &mut columns[op.column().index()];
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.to_vec(), value.clone());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key.as_slice());
                }
            }
        }
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, b"a", vec![1]);
        batch.put(Column::Coins, b"a", vec![2]);
        batch.put(Column::Stake, b"a", vec![3]);
        batch.delete(Column::Stake, b"a");
        store.write_batch(&batch).expect("write");

        assert_eq!(store.get(Column::Coins, b"a").expect("get"), Some(vec![2]));
        assert_eq!(store.get(Column::Stake, b"a").expect("get"), None);
        assert_eq!(store.batches_written(), 1);
    }

    #[test]
    fn prefix_scan_is_column_scoped() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"tip", vec![1]);
        batch.put(Column::Meta, b"tip-height", vec![2]);
        batch.put(Column::Meta, b"other", vec![3]);
        batch.put(Column::Coins, b"tip", vec![4]);
        store.write_batch(&batch).expect("write");

        let found = store.scan_prefix(Column::Meta, b"tip").expect("scan");
        assert_eq!(found.len(), 2);
        let values = store
            .multi_get(Column::Meta, &[b"tip".as_slice(), b"missing".as_slice()])
            .expect("multi_get");
        assert_eq!(values, vec![Some(vec![1]), None]);
    }
}
