//! Peer discipline, accepted-block notifications and the invalid-block list.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use hybridd_chainstate::{Capability, ChainedHeader, PeerId};
use hybridd_consensus::{hash256_to_hex, Hash256};
use hybridd_primitives::block::Block;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub trait PeerSink: Send + Sync {
    fn ban(&self, peer: PeerId, duration_secs: u64, reason: &str);

    /// Asks peers (the sender first, when known) for an optional service.
    fn request_capability(&self, capability: Capability, peer: Option<PeerId>);
}

pub trait EventSink: Send + Sync {
    fn on_block_accepted(&self, block: &Arc<Block>, header: &ChainedHeader);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BanEntry {
    pub until: u64,
    pub reason: String,
}

/// Peer sink that remembers bans and outstanding capability requests.
pub struct BanList {
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
    bans: Mutex<HashMap<PeerId, BanEntry>>,
    requested: Mutex<HashSet<(Capability, Option<PeerId>)>>,
}

impl BanList {
    pub fn new(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            bans: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_banned(&self, peer: PeerId) -> bool {
        let now = (self.clock)();
        let mut bans = lock(&self.bans);
        match bans.get(&peer) {
            Some(entry) if entry.until > now => true,
            Some(_) => {
                bans.remove(&peer);
                false
            }
            None => false,
        }
    }

    pub fn ban_entry(&self, peer: PeerId) -> Option<BanEntry> {
        lock(&self.bans).get(&peer).cloned()
    }

    pub fn banned_count(&self) -> usize {
        lock(&self.bans).len()
    }

    pub fn capability_requested(&self, capability: Capability) -> bool {
        lock(&self.requested)
            .iter()
            .any(|(requested, _)| *requested == capability)
    }
}

impl PeerSink for BanList {
    fn ban(&self, peer: PeerId, duration_secs: u64, reason: &str) {
        let until = (self.clock)().saturating_add(duration_secs);
        log_info!("Banning peer {peer} for {duration_secs}s: {reason}");
        lock(&self.bans).insert(
            peer,
            BanEntry {
                until,
                reason: reason.to_string(),
            },
        );
    }

    fn request_capability(&self, capability: Capability, peer: Option<PeerId>) {
        if lock(&self.requested).insert((capability, peer)) {
            log_info!("Requesting {capability:?} service from peers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockAccepted {
    pub hash: Hash256,
    pub height: u32,
    pub block: Arc<Block>,
}

/// Fans accepted blocks out over a crossbeam channel.
pub struct ChannelEventSink {
    sender: Sender<BlockAccepted>,
}

impl ChannelEventSink {
    /// `capacity` of `None` gives an unbounded channel.
    pub fn new(capacity: Option<usize>) -> (Self, Receiver<BlockAccepted>) {
        let (sender, receiver) = match capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn on_block_accepted(&self, block: &Arc<Block>, header: &ChainedHeader) {
        let event = BlockAccepted {
            hash: header.hash,
            height: header.height,
            block: Arc::clone(block),
        };
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log_debug!(
                    "accepted-block subscriber lagging; dropped {}",
                    hash256_to_hex(&event.hash)
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Blocks rejected recently, each with the time it may be retried.
#[derive(Default)]
pub struct InvalidBlockStore {
    entries: Mutex<HashMap<Hash256, u64>>,
}

impl InvalidBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, hash: Hash256, until: u64) {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(hash).or_insert(until);
        *entry = (*entry).max(until);
    }

    /// True while `hash` is marked and its window has not passed.
    pub fn is_invalid(&self, hash: &Hash256, now: u64) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(hash) {
            Some(until) if *until > now => true,
            Some(_) => {
                entries.remove(hash);
                false
            }
            None => false,
        }
    }

    pub fn purge_expired(&self, now: u64) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, until| *until > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
