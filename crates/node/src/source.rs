//! Where the orchestrator pulls downloaded blocks from.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hybridd_chainstate::PeerId;
use hybridd_primitives::block::Block;
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub enum Pulled {
    Block {
        block: Arc<Block>,
        peer: Option<PeerId>,
    },
    /// The best header chain changed; the consumer should rewind and follow it.
    Reorg,
}

/// Pull interface over the block download pipeline.
pub trait BlockSource: Send + Sync {
    /// The next item after the cursor, or `None` when nothing is buffered yet.
    fn try_next(&self) -> Option<Pulled>;

    /// Resumes delivery at `height`.
    fn set_cursor(&self, height: u32);

    /// Up to `limit` buffered blocks that follow the cursor, in height order.
    fn lookahead(&self, limit: usize) -> Vec<Arc<Block>>;

    /// Woken whenever new data may be available.
    fn arrival(&self) -> Arc<Notify>;
}

#[derive(Clone)]
struct Downloaded {
    block: Arc<Block>,
    peer: Option<PeerId>,
}

#[derive(Default)]
struct QueueState {
    blocks: BTreeMap<u32, Downloaded>,
    cursor: u32,
    reorg: bool,
}

/// In-memory source keyed by height along the best header chain.
pub struct BlockQueue {
    state: Mutex<QueueState>,
    arrival: Arc<Notify>,
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockQueue {
    /// A queue that starts delivering at height 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                cursor: 1,
                ..QueueState::default()
            }),
            arrival: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a downloaded block, replacing whatever was held at `height`.
    pub fn push(&self, height: u32, block: Arc<Block>, peer: Option<PeerId>) {
        self.lock().blocks.insert(height, Downloaded { block, peer });
        self.arrival.notify_one();
    }

    /// Drops every buffered block at or above `height`.
    pub fn truncate(&self, height: u32) {
        self.lock().blocks.split_off(&height);
    }

    /// Tells the consumer that the best header chain moved to another branch.
    pub fn signal_reorg(&self) {
        self.lock().reorg = true;
        self.arrival.notify_one();
    }

    pub fn cursor(&self) -> u32 {
        self.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockSource for BlockQueue {
    fn try_next(&self) -> Option<Pulled> {
        let mut state = self.lock();
        if state.reorg {
            state.reorg = false;
            return Some(Pulled::Reorg);
        }
        let cursor = state.cursor;
        let next = state.blocks.get(&cursor).cloned()?;
        state.cursor = cursor + 1;
        Some(Pulled::Block {
            block: next.block,
            peer: next.peer,
        })
    }

    fn set_cursor(&self, height: u32) {
        self.lock().cursor = height;
        self.arrival.notify_one();
    }

    fn lookahead(&self, limit: usize) -> Vec<Arc<Block>> {
        let state = self.lock();
        state
            .blocks
            .range(state.cursor..)
            .take(limit)
            .map(|(_, downloaded)| Arc::clone(&downloaded.block))
            .collect()
    }

    fn arrival(&self) -> Arc<Notify> {
        Arc::clone(&self.arrival)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridd_primitives::block::BlockHeader;

    fn block(nonce: u32) -> Arc<Block> {
        Arc::new(Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce,
            },
            transactions: Vec::new(),
            signature: None,
        })
    }

    fn pulled_nonce(item: Option<Pulled>) -> Option<u32> {
        match item {
            Some(Pulled::Block { block, .. }) => Some(block.header.nonce),
            _ => None,
        }
    }

    #[test]
    fn delivers_in_height_order_from_the_cursor() {
        let queue = BlockQueue::new();
        queue.push(2, block(2), None);
        assert!(queue.try_next().is_none());
        queue.push(1, block(1), Some(7));
        assert_eq!(pulled_nonce(queue.try_next()), Some(1));
        assert_eq!(pulled_nonce(queue.try_next()), Some(2));
        assert!(queue.try_next().is_none());
        assert_eq!(queue.cursor(), 3);
    }

    #[test]
    fn reorg_signal_comes_first_and_once() {
        let queue = BlockQueue::new();
        queue.push(1, block(1), None);
        queue.signal_reorg();
        assert!(matches!(queue.try_next(), Some(Pulled::Reorg)));
        assert_eq!(pulled_nonce(queue.try_next()), Some(1));
    }

    #[test]
    fn cursor_reset_replays_replaced_blocks() {
        let queue = BlockQueue::new();
        for height in 1..=3 {
            queue.push(height, block(height), None);
        }
        while queue.try_next().is_some() {}
        queue.truncate(2);
        queue.push(2, block(20), None);
        queue.set_cursor(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(pulled_nonce(queue.try_next()), Some(20));
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn lookahead_starts_at_the_cursor() {
        let queue = BlockQueue::new();
        for height in 1..=5 {
            queue.push(height, block(height), None);
        }
        queue.try_next();
        let ahead: Vec<u32> = queue
            .lookahead(2)
            .iter()
            .map(|block| block.header.nonce)
            .collect();
        assert_eq!(ahead, vec![2, 3]);
    }
}
