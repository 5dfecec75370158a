//! Hardened checkpoints loaded from JSON configuration data.
//!
//! Each network ships an embedded table; operators may replace it with a
//! file of the same shape:
//!
//! ```json
//! [{"height": 2, "hash": "<64 hex>", "stake_modifier": "<64 hex>"}]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::params::{hash256_from_hex, HexError, Network};
use crate::Hash256;

const POW_MAINNET_CHECKPOINTS: &str = include_str!("../checkpoints/pow-main.json");
const POW_REGTEST_CHECKPOINTS: &str = include_str!("../checkpoints/pow-regtest.json");
const POS_MAINNET_CHECKPOINTS: &str = include_str!("../checkpoints/pos-main.json");
const POS_REGTEST_CHECKPOINTS: &str = include_str!("../checkpoints/pos-regtest.json");

#[derive(Debug)]
pub enum CheckpointError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Hex { height: u32, err: HexError },
    Duplicate(u32),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(err) => write!(f, "checkpoint file: {err}"),
            CheckpointError::Json(err) => write!(f, "checkpoint json: {err}"),
            CheckpointError::Hex { height, err } => {
                write!(f, "checkpoint at height {height}: {err}")
            }
            CheckpointError::Duplicate(height) => {
                write!(f, "duplicate checkpoint at height {height}")
            }
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Io(err)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Json(err)
    }
}

#[derive(Deserialize)]
struct RawCheckpoint {
    height: u32,
    hash: String,
    #[serde(default)]
    stake_modifier: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointInfo {
    pub hash: Hash256,
    pub stake_modifier: Option<Hash256>,
}

/// Immutable height-to-hash table for one network.
#[derive(Clone, Debug, Default)]
pub struct CheckpointTable {
    entries: BTreeMap<u32, CheckpointInfo>,
    enabled: bool,
}

impl CheckpointTable {
    pub fn new(entries: impl IntoIterator<Item = (u32, CheckpointInfo)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            enabled: true,
        }
    }

    /// A table that never constrains a block.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn for_network(network: Network) -> Result<Self, CheckpointError> {
        let raw = match network {
            Network::PowMainnet => POW_MAINNET_CHECKPOINTS,
            Network::PowRegtest => POW_REGTEST_CHECKPOINTS,
            Network::PosMainnet => POS_MAINNET_CHECKPOINTS,
            Network::PosRegtest => POS_REGTEST_CHECKPOINTS,
        };
        Self::from_json(raw)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CheckpointError> {
        let records: Vec<RawCheckpoint> = serde_json::from_str(raw)?;
        let mut entries = BTreeMap::new();
        for record in records {
            let hash = hash256_from_hex(&record.hash).map_err(|err| CheckpointError::Hex {
                height: record.height,
                err,
            })?;
            let stake_modifier = record
                .stake_modifier
                .as_deref()
                .map(hash256_from_hex)
                .transpose()
                .map_err(|err| CheckpointError::Hex {
                    height: record.height,
                    err,
                })?;
            let info = CheckpointInfo {
                hash,
                stake_modifier,
            };
            if entries.insert(record.height, info).is_some() {
                return Err(CheckpointError::Duplicate(record.height));
            }
        }
        Ok(Self {
            entries,
            enabled: true,
        })
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True unless a checkpoint exists at `height` with a different hash.
    pub fn check_hardened(&self, height: u32, hash: &Hash256) -> bool {
        if !self.enabled {
            return true;
        }
        self.entries
            .get(&height)
            .map_or(true, |checkpoint| checkpoint.hash == *hash)
    }

    pub fn last_checkpoint_height(&self) -> u32 {
        if !self.enabled {
            return 0;
        }
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub fn checkpoint(&self, height: u32) -> Option<&CheckpointInfo> {
        if !self.enabled {
            return None;
        }
        self.entries.get(&height)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"[
        {"height": 2, "hash": "00000000000000000000000000000000000000000000000000000000000000aa"},
        {"height": 50, "hash": "00000000000000000000000000000000000000000000000000000000000000bb",
         "stake_modifier": "00000000000000000000000000000000000000000000000000000000000000cc"}
    ]"#;

    fn byte_hash(byte: u8) -> Hash256 {
        let mut hash = [0u8; 32];
        hash[0] = byte;
        hash
    }

    #[test]
    fn hardened_heights_match_only_their_hash() {
        let table = CheckpointTable::from_json(TABLE).expect("table");
        for (height, byte) in [(2u32, 0xaau8), (50, 0xbb)] {
            assert!(table.check_hardened(height, &byte_hash(byte)));
            assert!(!table.check_hardened(height, &byte_hash(byte ^ 1)));
        }
        for height in [0u32, 1, 3, 49, 51, u32::MAX] {
            assert!(table.check_hardened(height, &byte_hash(0x11)));
        }
    }

    #[test]
    fn last_height_and_modifier() {
        let table = CheckpointTable::from_json(TABLE).expect("table");
        assert_eq!(table.last_checkpoint_height(), 50);
        assert_eq!(
            table.checkpoint(50).and_then(|c| c.stake_modifier),
            Some(byte_hash(0xcc))
        );
        assert_eq!(table.checkpoint(2).and_then(|c| c.stake_modifier), None);
    }

    #[test]
    fn disabled_table_constrains_nothing() {
        let mut table = CheckpointTable::from_json(TABLE).expect("table");
        table.set_enabled(false);
        assert!(table.check_hardened(2, &byte_hash(0x01)));
        assert_eq!(table.last_checkpoint_height(), 0);
        assert!(table.checkpoint(50).is_none());
    }

    #[test]
    fn duplicate_heights_are_rejected() {
        let raw = r#"[
            {"height": 1, "hash": "00000000000000000000000000000000000000000000000000000000000000aa"},
            {"height": 1, "hash": "00000000000000000000000000000000000000000000000000000000000000bb"}
        ]"#;
        assert!(matches!(
            CheckpointTable::from_json(raw),
            Err(CheckpointError::Duplicate(1))
        ));
    }

    #[test]
    fn loads_override_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(TABLE.as_bytes()).expect("write");
        let table = CheckpointTable::load(file.path()).expect("load");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn embedded_tables_parse() {
        for network in Network::ALL {
            CheckpointTable::for_network(network).expect("embedded table");
        }
    }
}
