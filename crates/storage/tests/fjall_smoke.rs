#![cfg(feature = "fjall")]

use hybridd_storage::fjall::FjallStore;
use hybridd_storage::{Column, KeyValueStore, WriteBatch};

fn coin_key(txid: u8) -> [u8; 32] {
    [txid; 32]
}

#[test]
fn coin_and_rewind_columns_stay_separate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");

    let mut batch = WriteBatch::new();
    batch.put(Column::Coins, &coin_key(1), b"coin-1".to_vec());
    batch.put(Column::Coins, &coin_key(2), b"coin-2".to_vec());
    batch.put(Column::CoinsRewind, &7u32.to_be_bytes(), b"undo-7".to_vec());
    store.write_batch(&batch).expect("commit");

    let first = coin_key(1);
    let missing = coin_key(3);
    let found = store
        .multi_get(Column::Coins, &[first.as_slice(), missing.as_slice()])
        .expect("multi get");
    assert_eq!(found, vec![Some(b"coin-1".to_vec()), None]);
    assert!(store
        .get(Column::Coins, &7u32.to_be_bytes())
        .expect("get")
        .is_none());
    assert_eq!(
        store.scan_prefix(Column::Coins, &[]).expect("scan").len(),
        2
    );
}

#[test]
fn spending_deletes_and_undo_lands_in_one_batch() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let store = FjallStore::open(dir.path()).expect("open fjall");
        let mut connect = WriteBatch::new();
        connect.put(Column::Coins, &coin_key(1), b"coin-1".to_vec());
        store.write_batch(&connect).expect("connect");

        let mut spend = WriteBatch::new();
        spend.delete(Column::Coins, &coin_key(1));
        spend.put(Column::CoinsRewind, &2u32.to_be_bytes(), b"coin-1".to_vec());
        spend.put(Column::Meta, b"coin_tip", vec![2; 32]);
        store.write_batch(&spend).expect("spend");
        store.persist().expect("persist");
    }

    let store = FjallStore::open(dir.path()).expect("reopen");
    assert!(store.get(Column::Coins, &coin_key(1)).expect("get").is_none());
    assert_eq!(
        store
            .get(Column::CoinsRewind, &2u32.to_be_bytes())
            .expect("get"),
        Some(b"coin-1".to_vec())
    );
    assert_eq!(
        store.get(Column::Meta, b"coin_tip").expect("get"),
        Some(vec![2; 32])
    );
}
