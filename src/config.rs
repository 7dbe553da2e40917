//! Engine configuration
//!
//! Values come from command-line flags with environment fallbacks
//! (`CUSTODY_NETWORK`, `CUSTODY_DATA_DIR`, `CUSTODY_SEED_HEX`,
//! `CUSTODY_SEED_FILE`), resolved by the binary.

use bitcoin::Network;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::{KeyDerivationEngine, KeyError, MasterSeed};
use crate::storage::StorageConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    #[error("No seed configured: set CUSTODY_SEED_HEX or CUSTODY_SEED_FILE")]
    MissingSeed,
    #[error("Seed error: {0}")]
    Seed(#[from] KeyError),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Network the engine derives keys and addresses for
    pub network: Network,
    /// Directory holding the ledger and its backups
    pub data_dir: PathBuf,
    /// File containing the hex seed
    pub seed_file: Option<PathBuf>,
    /// Hex seed given directly; takes precedence over `seed_file`
    pub seed_hex: Option<Zeroizing<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            data_dir: PathBuf::from(".custody_data"),
            seed_file: None,
            seed_hex: None,
        }
    }
}

impl EngineConfig {
    /// Load the master seed from the configured source
    pub fn load_seed(&self) -> Result<MasterSeed, ConfigError> {
        if let Some(seed_hex) = &self.seed_hex {
            return Ok(MasterSeed::from_hex(seed_hex)?);
        }
        match &self.seed_file {
            Some(path) => Ok(MasterSeed::load(path)?),
            None => Err(ConfigError::MissingSeed),
        }
    }

    /// Key derivation engine for the configured seed and network
    pub fn engine(&self) -> Result<KeyDerivationEngine, ConfigError> {
        Ok(KeyDerivationEngine::new(self.load_seed()?, self.network))
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            ..Default::default()
        }
    }
}

/// Parse a network name. `mainnet` is accepted for `bitcoin`.
pub fn parse_network(name: &str) -> Result<Network, ConfigError> {
    let normalized = name.trim().to_lowercase();
    let canonical = match normalized.as_str() {
        "mainnet" | "main" => "bitcoin",
        "test" => "testnet",
        other => other,
    };
    Network::from_str(canonical).map_err(|_| ConfigError::UnknownNetwork(name.to_string()))
}
