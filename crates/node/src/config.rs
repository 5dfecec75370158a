//! Node configuration read from `key=value` conf text.

use std::fmt;
use std::path::{Path, PathBuf};

use hybridd_chainstate::{CoinCacheConfig, EngineConfig};
use hybridd_consensus::{
    consensus_params, hash256_from_hex, CheckpointError, CheckpointTable, ConsensusParams,
    Hash256, Network,
};

use crate::logging::{Format, Level, LogConfig};
use crate::orchestrator::ManagerConfig;

pub const DEFAULT_BAN_TIME_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_INVALID_BLOCK_WINDOW_SECS: u64 = 60 * 60;
pub const DEFAULT_PREFETCH_LOOKAHEAD: usize = 8;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, err: std::io::Error },
    UnknownKey { line: usize, key: String },
    InvalidValue { line: usize, key: String, value: String },
    Checkpoints(CheckpointError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, err } => write!(f, "failed to read {}: {err}", path.display()),
            ConfigError::UnknownKey { line, key } => {
                write!(f, "unknown key '{key}' on line {line}")
            }
            ConfigError::InvalidValue { line, key, value } => {
                write!(f, "invalid {key} '{value}' on line {line}")
            }
            ConfigError::Checkpoints(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<CheckpointError> for ConfigError {
    fn from(err: CheckpointError) -> Self {
        ConfigError::Checkpoints(err)
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: Network,
    pub assume_valid: Option<Hash256>,
    pub checkpoints: bool,
    pub checkpoints_file: Option<PathBuf>,
    pub coin_cache_flush: usize,
    pub coin_cache_max: usize,
    pub stake_cache_max: usize,
    /// Overrides the network's max tip age when set.
    pub max_tip_age: Option<u64>,
    pub ban_time: u64,
    pub invalid_block_window: u64,
    pub prefetch_lookahead: usize,
    /// Seconds between status lines; 0 disables the sampler.
    pub stats_interval: u64,
    pub script_threads: usize,
    pub log_level: Level,
    pub log_format: Format,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let cache = CoinCacheConfig::default();
        let engine = EngineConfig::default();
        Self {
            network: Network::PowMainnet,
            assume_valid: None,
            checkpoints: true,
            checkpoints_file: None,
            coin_cache_flush: cache.flush_threshold,
            coin_cache_max: cache.max_entries,
            stake_cache_max: engine.stake_cache_max,
            max_tip_age: None,
            ban_time: DEFAULT_BAN_TIME_SECS,
            invalid_block_window: DEFAULT_INVALID_BLOCK_WINDOW_SECS,
            prefetch_lookahead: DEFAULT_PREFETCH_LOOKAHEAD,
            stats_interval: DEFAULT_STATS_INTERVAL_SECS,
            script_threads: engine.script_threads,
            log_level: Level::Info,
            log_format: Format::Text,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            err,
        })?;
        Self::parse(&contents)
    }

    /// Parses conf text. Later assignments of a key win; a bare key means `1`.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw_line) in contents.lines().enumerate() {
            let line_no = index + 1;
            let mut line = raw_line.trim();
            if let Some(idx) = line.find('#') {
                line = &line[..idx];
            }
            line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, "1"),
            };
            config.apply(line_no, &key.to_ascii_lowercase(), value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "network" => self.network = Network::parse(value).ok_or_else(invalid)?,
            "assumevalid" => {
                self.assume_valid = if value.is_empty() || value == "0" {
                    None
                } else {
                    Some(hash256_from_hex(value).map_err(|_| invalid())?)
                };
            }
            "checkpoints" => self.checkpoints = parse_conf_bool(value).ok_or_else(invalid)?,
            "checkpointsfile" => {
                self.checkpoints_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "coincacheflush" => self.coin_cache_flush = value.parse().map_err(|_| invalid())?,
            "coincachemax" => self.coin_cache_max = value.parse().map_err(|_| invalid())?,
            "stakecachemax" => self.stake_cache_max = value.parse().map_err(|_| invalid())?,
            "maxtipage" => self.max_tip_age = Some(value.parse().map_err(|_| invalid())?),
            "bantime" => self.ban_time = value.parse().map_err(|_| invalid())?,
            "invalidblockwindow" => {
                self.invalid_block_window = value.parse().map_err(|_| invalid())?
            }
            "prefetchlookahead" => {
                self.prefetch_lookahead = value.parse().map_err(|_| invalid())?
            }
            "statsinterval" => self.stats_interval = value.parse().map_err(|_| invalid())?,
            "scriptthreads" => self.script_threads = value.parse().map_err(|_| invalid())?,
            "loglevel" => self.log_level = Level::parse(value).ok_or_else(invalid)?,
            "logformat" => self.log_format = Format::parse(value).ok_or_else(invalid)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    line,
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Network parameters with the configured assume-valid hash applied.
    pub fn consensus_params(&self) -> ConsensusParams {
        let mut params = consensus_params(self.network);
        if self.assume_valid.is_some() {
            params.assume_valid = self.assume_valid;
        }
        params
    }

    pub fn checkpoint_table(&self) -> Result<CheckpointTable, ConfigError> {
        let mut table = match &self.checkpoints_file {
            Some(path) => CheckpointTable::load(path)?,
            None => CheckpointTable::for_network(self.network)?,
        };
        table.set_enabled(self.checkpoints);
        Ok(table)
    }

    pub fn engine_config(&self, params: &ConsensusParams) -> EngineConfig {
        EngineConfig {
            coin_cache: CoinCacheConfig {
                flush_threshold: self.coin_cache_flush,
                max_entries: self.coin_cache_max,
            },
            stake_cache_max: self.stake_cache_max,
            max_tip_age: self.max_tip_age.unwrap_or(params.max_tip_age),
            script_threads: self.script_threads,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            ban_time: self.ban_time,
            invalid_block_window: self.invalid_block_window,
            prefetch_lookahead: self.prefetch_lookahead,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            ..LogConfig::default()
        }
    }
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_every_key() {
        let text = "\
# consensus node
network=pos-regtest
assumevalid=00000000000000000000000000000000000000000000000000000000000000ff
checkpoints=0
coincacheflush=100
coincachemax=1000
stakecachemax=50
maxtipage=600
bantime=30
invalidblockwindow=90
prefetchlookahead=4
statsinterval=0   # quiet
scriptthreads=2
loglevel=debug
logformat=json
";
        let config = NodeConfig::parse(text).expect("parse");
        assert_eq!(config.network, Network::PosRegtest);
        let mut expected = [0u8; 32];
        expected[0] = 0xff;
        assert_eq!(config.assume_valid, Some(expected));
        assert!(!config.checkpoints);
        assert_eq!(config.coin_cache_flush, 100);
        assert_eq!(config.coin_cache_max, 1000);
        assert_eq!(config.stake_cache_max, 50);
        assert_eq!(config.max_tip_age, Some(600));
        assert_eq!(config.ban_time, 30);
        assert_eq!(config.invalid_block_window, 90);
        assert_eq!(config.prefetch_lookahead, 4);
        assert_eq!(config.stats_interval, 0);
        assert_eq!(config.script_threads, 2);
        assert_eq!(config.log_level, Level::Debug);
        assert_eq!(config.log_format, Format::Json);

        let params = config.consensus_params();
        assert_eq!(params.assume_valid, Some(expected));
        let engine = config.engine_config(&params);
        assert_eq!(engine.max_tip_age, 600);
        assert_eq!(engine.coin_cache.flush_threshold, 100);
    }

    #[test]
    fn unknown_key_names_its_line() {
        let err = NodeConfig::parse("network=pow-regtest\n\nrpcport=1\n").expect_err("unknown");
        match err {
            ConfigError::UnknownKey { line, key } => {
                assert_eq!(line, 3);
                assert_eq!(key, "rpcport");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = NodeConfig::parse("bantime=soon").expect_err("invalid");
        assert_eq!(err.to_string(), "invalid bantime 'soon' on line 1");
        assert!(NodeConfig::parse("network=testnet").is_err());
        assert!(NodeConfig::parse("checkpoints=maybe").is_err());
    }

    #[test]
    fn bare_key_enables_a_flag() {
        let config = NodeConfig::parse("checkpoints=0\ncheckpoints\n").expect("parse");
        assert!(config.checkpoints);
    }

    #[test]
    fn checkpoints_file_overrides_the_embedded_table() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"[{{"height": 7, "hash": "{}"}}]"#,
            "11".repeat(32)
        )
        .expect("write");
        let text = format!(
            "network=pow-regtest\ncheckpointsfile={}\n",
            file.path().display()
        );
        let config = NodeConfig::parse(&text).expect("parse");
        let table = config.checkpoint_table().expect("table");
        assert_eq!(table.last_checkpoint_height(), 7);

        let disabled = NodeConfig::parse(&format!("{text}checkpoints=0\n")).expect("parse");
        let table = disabled.checkpoint_table().expect("table");
        assert_eq!(table.last_checkpoint_height(), 0);
    }
}
