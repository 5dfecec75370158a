use hybridd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::emit($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod config;
pub mod orchestrator;
pub mod peers;
pub mod prefetch;
pub mod source;
pub mod stats;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hybridd_chainstate::{
    ConsensusRuleEngine, KvCoinStore, KvStakeStore, SystemTimeProvider,
};
use hybridd_consensus::{hash256_to_hex, Network, NetworkKind};
use hybridd_primitives::block::Block;
use hybridd_primitives::encoding::TxFormat;
use hybridd_storage::fjall::FjallStore;
use hybridd_storage::memory::MemoryStore;
use hybridd_storage::KeyValueStore;
use tokio::sync::watch;

pub use config::{ConfigError, NodeConfig};
pub use orchestrator::{ConsensusManager, ManagerConfig, NodeError};
pub use peers::{BanList, ChannelEventSink, EventSink, InvalidBlockStore, PeerSink};
pub use prefetch::Prefetcher;
pub use source::{BlockQueue, BlockSource, Pulled};

const DEFAULT_CONF_FILE_NAME: &str = "hybridd.conf";
const IMPORT_POLL_MILLIS: u64 = 200;

#[derive(Debug, Default)]
struct CliArgs {
    conf_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    import: Option<PathBuf>,
    network: Option<Network>,
}

enum CliAction {
    Run(CliArgs),
    PrintHelp,
    PrintVersion,
}

fn usage() -> String {
    [
        "Usage: hybridd [OPTIONS]",
        "",
        "Options:",
        "  --help, -h     Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --conf         Config file path (default: <data-dir>/hybridd.conf)",
        "  --data-dir     Keep the coin and stake stores on disk here (default: in memory)",
        "  --network      pow-main | pow-regtest | pos-main | pos-regtest",
        "  --import       Validate hex-encoded blocks, one per line, then exit",
    ]
    .join("\n")
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                parsed.conf_path = Some(PathBuf::from(value));
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                parsed.data_dir = Some(PathBuf::from(value));
            }
            "--import" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --import\n{}", usage()))?;
                parsed.import = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                parsed.network = Some(
                    Network::parse(&value)
                        .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?,
                );
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }
    Ok(CliAction::Run(parsed))
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let hex = input.trim();
    if hex.is_empty() || hex.len() % 2 == 1 {
        return Err("hex string must have an even, non-zero length".to_string());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| "invalid hex string".to_string())
        })
        .collect()
}

/// Reads one hex-encoded block per line; blank lines and `#` comments are skipped.
fn read_import_file(path: &Path, kind: NetworkKind) -> Result<Vec<Block>, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let format = match kind {
        NetworkKind::ProofOfWork => TxFormat::Plain,
        NetworkKind::ProofOfStake => TxFormat::Timestamped,
    };
    let mut blocks = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bytes = decode_hex(line)
            .map_err(|err| format!("{}:{}: {err}", path.display(), index + 1))?;
        let block = Block::decode(&bytes, format)
            .map_err(|err| format!("{}:{}: {err}", path.display(), index + 1))?;
        blocks.push(block);
    }
    Ok(blocks)
}

/// Indexes the headers of `blocks` and queues the blocks by height, playing
/// the part of header sync and block download.
pub fn stage_blocks(
    engine: &ConsensusRuleEngine,
    queue: &BlockQueue,
    blocks: Vec<Block>,
) -> Result<u32, NodeError> {
    let chain = engine.chain();
    let mut last = chain.genesis().hash;
    for block in blocks {
        let header = chain.add_header(block.header.clone(), block.is_proof_of_stake())?;
        last = header.hash;
        queue.push(header.height, Arc::new(block), None);
    }
    let tip = chain.set_best_tip(&last)?;
    Ok(tip.height)
}

fn load_config(args: &CliArgs) -> Result<NodeConfig, String> {
    let default_path = args
        .data_dir
        .as_ref()
        .map(|dir| dir.join(DEFAULT_CONF_FILE_NAME));
    let mut config = match (&args.conf_path, default_path) {
        (Some(path), _) => NodeConfig::load(path).map_err(|err| err.to_string())?,
        (None, Some(path)) if path.exists() => {
            NodeConfig::load(&path).map_err(|err| err.to_string())?
        }
        _ => NodeConfig::default(),
    };
    if let Some(network) = args.network {
        config.network = network;
    }
    Ok(config)
}

pub async fn run_entry() -> Result<(), String> {
    let args = match parse_args_from(std::env::args().skip(1))? {
        CliAction::Run(args) => args,
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("hybridd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    let config = load_config(&args)?;
    logging::init(config.log_config());

    match &args.data_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .map_err(|err| format!("failed to create {}: {err}", dir.display()))?;
            let store = FjallStore::open(dir.join("db")).map_err(|err| err.to_string())?;
            run_node(Arc::new(store), &config, args.import.as_deref()).await
        }
        None => run_node(Arc::new(MemoryStore::new()), &config, args.import.as_deref()).await,
    }
}

async fn run_node<S: KeyValueStore + 'static>(
    store: Arc<S>,
    config: &NodeConfig,
    import: Option<&Path>,
) -> Result<(), String> {
    let params = config.consensus_params();
    let checkpoints = config.checkpoint_table().map_err(|err| err.to_string())?;
    let engine_config = config.engine_config(&params);
    let kind = params.kind;
    let engine = Arc::new(
        ConsensusRuleEngine::initialize(
            params,
            checkpoints,
            Arc::new(KvCoinStore::new(Arc::clone(&store))),
            Arc::new(KvStakeStore::new(store)),
            Arc::new(SystemTimeProvider),
            engine_config,
        )
        .map_err(|err| err.to_string())?,
    );

    let queue = Arc::new(BlockQueue::new());
    let target = match import {
        Some(path) => {
            let blocks = read_import_file(path, kind)?;
            log_info!("Importing {} block(s) from {}", blocks.len(), path.display());
            Some(stage_blocks(&engine, &queue, blocks).map_err(|err| err.to_string())?)
        }
        None => None,
    };

    let bans = Arc::new(BanList::new(|| {
        hybridd_chainstate::TimeProvider::adjusted_time(&SystemTimeProvider)
    }));
    let (events, accepted) = ChannelEventSink::new(Some(1024));
    std::thread::spawn(move || {
        for event in accepted.iter() {
            log_debug!(
                "block {} accepted at height {}",
                hash256_to_hex(&event.hash),
                event.height
            );
        }
    });

    let manager = Arc::new(
        ConsensusManager::new(
            Arc::clone(&engine),
            Arc::clone(&queue) as Arc<dyn BlockSource>,
            bans,
            Arc::new(events),
            config.manager_config(),
        )
        .map_err(|err| err.to_string())?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (prefetcher, prefetch_task) = Prefetcher::spawn(
        Arc::clone(&engine),
        prefetch::DEFAULT_RECENT_BLOCKS,
        shutdown_rx.clone(),
    );
    manager.set_prefetcher(prefetcher);
    let start_time = Instant::now();
    let stats_task = stats::spawn_stats_sampler(
        Arc::clone(&manager),
        config.stats_interval,
        start_time,
        shutdown_rx.clone(),
    );

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info!("Interrupt received; shutting down.");
            let _ = signal_tx.send(true);
        }
    });

    if let Some(target) = target {
        let watched = Arc::clone(&manager);
        let done_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(IMPORT_POLL_MILLIS));
            loop {
                ticker.tick().await;
                let tip = watched.tip();
                if tip.height >= target || watched.engine().chain().best_height() < target {
                    log_info!(
                        "Import finished at height {} ({})",
                        tip.height,
                        hash256_to_hex(&tip.hash)
                    );
                    let _ = done_tx.send(true);
                    break;
                }
            }
        });
    }

    let result = Arc::clone(&manager).run(shutdown_rx).await;
    let _ = shutdown_tx.send(true);
    let _ = prefetch_task.await;
    if let Some(task) = stats_task {
        let _ = task.await;
    }

    let final_stats = stats::snapshot_stats(&manager, start_time);
    log_info!("{}", stats::status_line(&final_stats, None));
    result.map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<CliAction, String> {
        parse_args_from(raw.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn cli_reads_paths_and_network() {
        let Ok(CliAction::Run(parsed)) = args(&[
            "--conf",
            "node.conf",
            "--network",
            "pos-regtest",
            "--import",
            "blocks.hex",
        ]) else {
            panic!("expected run action");
        };
        assert_eq!(parsed.conf_path, Some(PathBuf::from("node.conf")));
        assert_eq!(parsed.network, Some(Network::PosRegtest));
        assert_eq!(parsed.import, Some(PathBuf::from("blocks.hex")));
        assert!(parsed.data_dir.is_none());
    }

    #[test]
    fn cli_rejects_unknown_arguments() {
        assert!(args(&["--rpcport", "1"]).is_err());
        assert!(args(&["--network", "testnet"]).is_err());
        assert!(args(&["--conf"]).is_err());
        assert!(matches!(args(&["-V"]), Ok(CliAction::PrintVersion)));
    }

    #[test]
    fn hex_decoding_is_strict() {
        assert_eq!(decode_hex("00ff10"), Ok(vec![0x00, 0xff, 0x10]));
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert!(decode_hex("").is_err());
    }
}
