//! Network parameters.
//!
//! Static, per-network consensus constants. Construct with
//! [`ChainParams::mainnet`] or [`ChainParams::regtest`], or look one up by
//! [`Network`].

use crate::params::INITIAL_SUBSIDY;
use crate::validation::merkle_root;
use crate::{compact_to_target, Block, BlockHeader, Hash256, OutPoint, ScriptFlags, Transaction, TxIn, TxOut};
use num_bigint::BigUint;
use std::fmt;
use std::str::FromStr;

const GENESIS_COINBASE_SCRIPT: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";
const GENESIS_OUTPUT_SCRIPT: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Regtest => f.write_str("regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// A block allowed to violate the duplicate-output rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bip30Exception {
    pub height: i32,
    pub hash: Hash256,
}

/// Network-specific consensus parameters.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Which network these parameters describe.
    pub network: Network,
    genesis: Block,
    /// Easiest allowed target, compact form.
    pub pow_limit_bits: u32,
    /// Skip header proof-of-work checks entirely.
    pub skip_pow: bool,
    /// Blocks between subsidy halvings.
    pub subsidy_halving_interval: i32,
    /// Confirmations required before a coinbase output is spendable.
    pub coinbase_maturity: i32,
    /// Maximum serialized block size.
    pub max_block_size: usize,
    /// Blocks exempt from the duplicate-output check.
    pub bip30_exceptions: Vec<Bip30Exception>,
    /// Height from which coinbases commit to their height.
    pub bip34_height: i32,
    /// Hash of the block at `bip34_height`, if known.
    pub bip34_hash: Option<Hash256>,
    /// Height from which strict DER signatures are required.
    pub bip66_height: i32,
}

fn hash(s: &str) -> Hash256 {
    // Constant inputs only; a typo here is caught by the genesis tests.
    s.parse().unwrap_or(Hash256::ZERO)
}

fn genesis_block(time: u32, bits: u32, nonce: u32) -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn::new(
            OutPoint::null(),
            hex::decode(GENESIS_COINBASE_SCRIPT).unwrap_or_default(),
        )],
        outputs: vec![TxOut::new(
            INITIAL_SUBSIDY,
            hex::decode(GENESIS_OUTPUT_SCRIPT).unwrap_or_default(),
        )],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    let header = BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: merkle_root(&transactions),
        time,
        bits,
        nonce,
    };
    Block::new(header, transactions)
}

impl ChainParams {
    /// Main network.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            genesis: genesis_block(1_231_006_505, 0x1d00ffff, 2_083_236_893),
            pow_limit_bits: 0x1d00ffff,
            skip_pow: false,
            subsidy_halving_interval: 210_000,
            coinbase_maturity: 100,
            max_block_size: 32 * 1024 * 1024,
            bip30_exceptions: vec![
                Bip30Exception {
                    height: 91_842,
                    hash: hash("00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec"),
                },
                Bip30Exception {
                    height: 91_880,
                    hash: hash("00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721"),
                },
            ],
            bip34_height: 227_931,
            bip34_hash: Some(hash(
                "000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8",
            )),
            bip66_height: 363_725,
        }
    }

    /// Local regression-test network: trivial difficulty, short halvings.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            genesis: genesis_block(1_296_688_602, 0x207fffff, 2),
            pow_limit_bits: 0x207fffff,
            skip_pow: false,
            subsidy_halving_interval: 150,
            coinbase_maturity: 100,
            max_block_size: 32 * 1024 * 1024,
            bip30_exceptions: Vec::new(),
            bip34_height: 100_000_000,
            bip34_hash: None,
            bip66_height: 1_251,
        }
    }

    /// Parameters for `network`.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// The genesis block.
    pub fn genesis_block(&self) -> Block {
        self.genesis.clone()
    }

    /// Hash of the genesis block.
    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }

    /// Easiest allowed target.
    pub fn pow_limit(&self) -> BigUint {
        compact_to_target(self.pow_limit_bits).unwrap_or_default()
    }

    /// Whether the block at `height` with `hash` is exempt from the
    /// duplicate-output check.
    pub fn is_bip30_exception(&self, height: i32, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|e| e.height == height && e.hash == *hash)
    }

    /// Script verification flags for a block at `height`.
    pub fn script_flags(&self, height: i32) -> ScriptFlags {
        let mut flags = ScriptFlags::P2SH;
        if height >= self.bip66_height {
            flags |= ScriptFlags::DERSIG;
        }
        flags
    }

    /// Total coins ever issued through subsidy.
    pub fn total_subsidy(&self) -> i64 {
        let mut total = 0i64;
        let mut reward = INITIAL_SUBSIDY;
        while reward > 0 {
            total += reward * self.subsidy_halving_interval as i64;
            reward >>= 1;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MAX_MONEY;

    #[test]
    fn test_mainnet_genesis_hash() {
        let params = ChainParams::mainnet();
        assert_eq!(
            params.genesis_block().header.merkle_root.to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(
            params.genesis_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_regtest_genesis_hash() {
        assert_eq!(
            ChainParams::regtest().genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_bip30_exceptions() {
        let params = ChainParams::mainnet();
        let exception = params.bip30_exceptions[0];
        assert!(params.is_bip30_exception(exception.height, &exception.hash));
        assert!(!params.is_bip30_exception(exception.height + 1, &exception.hash));
        assert!(ChainParams::regtest().bip30_exceptions.is_empty());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("Mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("testnet9".parse::<Network>().is_err());
    }

    #[test]
    fn test_total_subsidy_below_max_money() {
        assert!(ChainParams::mainnet().total_subsidy() <= MAX_MONEY);
    }
}
