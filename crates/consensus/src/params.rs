//! Consensus parameter definitions.

use std::fmt;

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    PowMainnet,
    PowRegtest,
    PosMainnet,
    PosRegtest,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::PowMainnet,
        Network::PowRegtest,
        Network::PosMainnet,
        Network::PosRegtest,
    ];

    pub fn kind(self) -> NetworkKind {
        match self {
            Network::PowMainnet | Network::PowRegtest => NetworkKind::ProofOfWork,
            Network::PosMainnet | Network::PosRegtest => NetworkKind::ProofOfStake,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Network::PowMainnet => "pow-main",
            Network::PowRegtest => "pow-regtest",
            Network::PosMainnet => "pos-main",
            Network::PosRegtest => "pos-regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|network| raw.eq_ignore_ascii_case(network.name()))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which validation pipeline a network runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NetworkKind {
    ProofOfWork,
    ProofOfStake,
}

/// Heights at which soft-fork rules start to apply. `u32::MAX` means never.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deployments {
    pub bip34_height: u32,
    pub bip65_height: u32,
    pub bip66_height: u32,
    pub csv_height: u32,
    pub segwit_height: u32,
}

impl Deployments {
    pub const fn always() -> Self {
        Self {
            bip34_height: 0,
            bip65_height: 0,
            bip66_height: 0,
            csv_height: 0,
            segwit_height: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub message: &'static str,
    pub output_script: &'static [u8],
    pub reward: Amount,
}

#[derive(Clone, Debug)]
pub struct SubsidyParams {
    /// Proof-of-work subsidy before any halving.
    pub initial_subsidy: Amount,
    /// Blocks between halvings; `None` keeps the subsidy flat.
    pub halving_interval: Option<u32>,
    /// One exact height that pays `premine_reward` instead of the schedule.
    pub premine_height: Option<u32>,
    pub premine_reward: Amount,
    /// Flat proof-of-stake reward on top of fees.
    pub pos_reward: Amount,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub kind: NetworkKind,
    pub genesis: GenesisParams,
    pub subsidy: SubsidyParams,
    pub deployments: Deployments,
    /// Compact encoding of the easiest allowed proof-of-work target.
    pub pow_limit: u32,
    /// Compact encoding of the stake target ceiling.
    pub pos_limit: u32,
    pub pow_target_spacing: u32,
    pub pow_target_timespan: u32,
    pub pow_no_retargeting: bool,
    pub pos_target_spacing: u32,
    pub pos_retarget_timespan: u32,
    pub pos_no_retargeting: bool,
    /// Last height at which a proof-of-work block is accepted on a stake network.
    pub last_pow_height: Option<u32>,
    pub coinbase_maturity: u32,
    pub stake_min_confirmations: u32,
    pub stake_timestamp_mask: u32,
    /// Seconds a header time may run ahead of the local clock.
    pub max_future_drift: u32,
    /// Tip age above which the node considers itself still syncing.
    pub max_tip_age: u64,
    /// Little-endian chain work the best tip must exceed to leave initial download.
    pub minimum_chain_work: Hash256,
    /// Blocks exempt from the duplicate-transaction rule.
    pub bip30_exceptions: Vec<(u32, Hash256)>,
    pub assume_valid: Option<Hash256>,
}

impl ConsensusParams {
    pub fn is_proof_of_stake(&self) -> bool {
        self.kind == NetworkKind::ProofOfStake
    }

    /// Blocks per proof-of-work retarget window.
    pub fn difficulty_adjustment_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing.max(1)).max(1)
    }

    /// The `N` of the stake retarget formula.
    pub fn pos_retarget_interval(&self) -> u64 {
        u64::from(self.pos_retarget_timespan / self.pos_target_spacing.max(1)).max(1)
    }

    pub fn is_bip30_exception(&self, height: u32, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|(exempt_height, exempt_hash)| *exempt_height == height && exempt_hash == hash)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 64 characters"),
            HexError::InvalidHex => write!(f, "hash hex contains a non-hex character"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    if !hex.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(HexError::InvalidHex);
    }

    let mut out = [0u8; 32];
    for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|_| HexError::InvalidHex)?;
        out[31 - index] = u8::from_str_radix(pair, 16).map_err(|_| HexError::InvalidHex)?;
    }
    Ok(out)
}

/// Renders a hash in display (big-endian) order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    hash.iter().rev().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::PowMainnet => pow_mainnet_params(),
        Network::PowRegtest => pow_regtest_params(),
        Network::PosMainnet => pos_mainnet_params(),
        Network::PosRegtest => pos_regtest_params(),
    }
}

const GENESIS_MESSAGE: &str = "hybridd genesis: work and stake, one ledger";
const GENESIS_OUTPUT_SCRIPT: &[u8] = &[0x51];

fn pow_mainnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::PowMainnet,
        kind: NetworkKind::ProofOfWork,
        genesis: GenesisParams {
            version: 1,
            time: 1_700_000_000,
            bits: 0x1d00_ffff,
            nonce: 0,
            message: GENESIS_MESSAGE,
            output_script: GENESIS_OUTPUT_SCRIPT,
            reward: 50 * COIN,
        },
        subsidy: SubsidyParams {
            initial_subsidy: 50 * COIN,
            halving_interval: Some(210_000),
            premine_height: None,
            premine_reward: 0,
            pos_reward: 0,
        },
        deployments: Deployments {
            bip34_height: 1,
            bip65_height: 1,
            bip66_height: 1,
            csv_height: 1,
            segwit_height: 1,
        },
        pow_limit: 0x1d00_ffff,
        pos_limit: 0x1d00_ffff,
        pow_target_spacing: 600,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_no_retargeting: false,
        pos_target_spacing: 600,
        pos_retarget_timespan: 14 * 24 * 60 * 60,
        pos_no_retargeting: false,
        last_pow_height: None,
        coinbase_maturity: 100,
        stake_min_confirmations: 0,
        stake_timestamp_mask: 0,
        max_future_drift: 2 * 60 * 60,
        max_tip_age: 24 * 60 * 60,
        minimum_chain_work: [0u8; 32],
        bip30_exceptions: Vec::new(),
        assume_valid: None,
    }
}

fn pow_regtest_params() -> ConsensusParams {
    let mut params = pow_mainnet_params();
    params.network = Network::PowRegtest;
    params.genesis.bits = 0x207f_ffff;
    params.genesis.time = 1_700_000_000;
    params.subsidy.halving_interval = Some(150);
    params.deployments = Deployments {
        bip34_height: 500,
        bip65_height: 1_351,
        bip66_height: 1_251,
        csv_height: 432,
        segwit_height: 0,
    };
    params.pow_limit = 0x207f_ffff;
    params.pos_limit = 0x207f_ffff;
    params.pow_no_retargeting = true;
    params
}

fn pos_mainnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::PosMainnet,
        kind: NetworkKind::ProofOfStake,
        genesis: GenesisParams {
            version: 1,
            time: 1_700_000_000,
            bits: 0x1e0f_ffff,
            nonce: 0,
            message: GENESIS_MESSAGE,
            output_script: GENESIS_OUTPUT_SCRIPT,
            reward: 0,
        },
        subsidy: SubsidyParams {
            initial_subsidy: 4 * COIN,
            halving_interval: None,
            premine_height: Some(2),
            premine_reward: 98_000_000 * COIN,
            pos_reward: COIN,
        },
        deployments: Deployments::always(),
        pow_limit: 0x1e0f_ffff,
        pos_limit: 0x1e0f_ffff,
        pow_target_spacing: 64,
        pow_target_timespan: 16 * 60,
        pow_no_retargeting: false,
        pos_target_spacing: 64,
        pos_retarget_timespan: 16 * 60,
        pos_no_retargeting: false,
        last_pow_height: Some(12_500),
        coinbase_maturity: 50,
        stake_min_confirmations: 50,
        stake_timestamp_mask: 0x0f,
        max_future_drift: 15,
        max_tip_age: 2 * 60 * 60,
        minimum_chain_work: [0u8; 32],
        bip30_exceptions: Vec::new(),
        assume_valid: None,
    }
}

fn pos_regtest_params() -> ConsensusParams {
    let mut params = pos_mainnet_params();
    params.network = Network::PosRegtest;
    params.genesis.bits = 0x207f_ffff;
    params.subsidy.premine_height = None;
    params.subsidy.premine_reward = 0;
    params.pow_limit = 0x207f_ffff;
    params.pos_limit = 0x207f_ffff;
    params.pow_no_retargeting = true;
    params.pos_no_retargeting = true;
    params.coinbase_maturity = 10;
    params.stake_min_confirmations = 10;
    params.max_tip_age = 24 * 60 * 60;
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_display_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("valid hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError::InvalidLength));
        let bad = "zz".repeat(32);
        assert_eq!(hash256_from_hex(&bad), Err(HexError::InvalidHex));
    }

    #[test]
    fn networks_declare_their_kind() {
        for network in Network::ALL {
            let params = consensus_params(network);
            assert_eq!(params.kind, network.kind());
            assert_eq!(Network::parse(network.name()), Some(network));
        }
    }

    #[test]
    fn stake_retarget_interval_is_window_over_spacing() {
        let params = consensus_params(Network::PosMainnet);
        assert_eq!(params.pos_retarget_interval(), 15);
        let pow = consensus_params(Network::PowMainnet);
        assert_eq!(pow.difficulty_adjustment_interval(), 2016);
    }
}
