//! Chain data access
//!
//! The engine never talks to a node directly. Everything it needs from the
//! chain (unspent outputs of an address, raw transactions, fee estimates and
//! broadcast) goes through [`ChainDataProvider`], so an Esplora client, a
//! bitcoind RPC client or an in-memory fake can be plugged in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::fee::FeeEstimates;

/// Errors reported by a chain data provider
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// An unspent output as reported by the chain backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUtxo {
    pub txid: String,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

/// Read access to the chain plus transaction broadcast
pub trait ChainDataProvider: Send + Sync {
    /// Unspent outputs currently paying `address`
    fn address_utxos(&self, address: &str) -> Result<Vec<ChainUtxo>, ChainError>;

    /// Raw transaction as hex
    fn raw_transaction(&self, txid: &str) -> Result<String, ChainError>;

    /// Fee rates by confirmation target
    fn fee_estimates(&self) -> Result<FeeEstimates, ChainError>;

    /// Broadcast a raw transaction (hex), returning its txid
    fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ChainError>;
}
