//! Node configuration.

use crate::Args;
use anyhow::{anyhow, Context, Result};
use ferrite_consensus::Network;
use ferrite_mempool::MempoolConfig;
use ferrite_state::ChainConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name.
    pub node_name: String,
    /// Network (mainnet, regtest).
    pub network: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Chainstate tuning.
    #[serde(default)]
    pub chain: ChainConfig,
    /// Mempool limits.
    #[serde(default)]
    pub mempool: MempoolConfig,
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let network = args.network.as_deref().unwrap_or("mainnet");
        let mut config: Self = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(network)
        };

        // Only override what was given on the command line
        if let Some(ref network) = args.network {
            config.network = network.clone();
        }
        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(threads) = args.script_threads {
            config.chain.script_threads = threads;
        }
        if args.no_parallel_validation {
            config.chain.parallel_validation = false;
        }

        config.network_kind()?;
        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let data_dir = match network {
            "regtest" => PathBuf::from(".ferrite-regtest"),
            _ => PathBuf::from(".ferrite"),
        };

        Self {
            node_name: "ferrite-node".to_string(),
            network: network.to_string(),
            data_dir,
            chain: ChainConfig::default(),
            mempool: MempoolConfig::default(),
        }
    }

    pub fn network_kind(&self) -> Result<Network> {
        self.network.parse::<Network>().map_err(|e| anyhow!(e))
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
