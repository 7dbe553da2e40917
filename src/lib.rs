//! Multisig Custody: a custodial two-factor Bitcoin multisig engine
//!
//! The server holds one key of every m-of-n P2WSH wallet; participants hold
//! the rest. This crate provides:
//! - BIP48 server key derivation from a master seed
//! - Sorted-multisig witness scripts, addresses and descriptors
//! - Fee and size estimation across script types
//! - Greedy coin selection with change and dust handling
//! - PSBT assembly and BIP143 signing
//! - The threshold signing and finalization state machine
//! - JSON persistence of the custody ledger
//!
//! # Example
//!
//! ```rust,ignore
//! use multisig_custody::keys::{KeyDerivationEngine, MasterSeed};
//! use multisig_custody::multisig::{MultisigManager, ParticipantKey, WalletConfig};
//! use multisig_custody::storage::MemoryLedger;
//! use bitcoin::Network;
//!
//! let engine = KeyDerivationEngine::new(MasterSeed::generate(), Network::Testnet);
//! let manager = MultisigManager::new(engine, MemoryLedger::new());
//!
//! // 2-of-2: server plus one participant
//! let config = WalletConfig::new("treasury", 2, 2, vec![ParticipantKey::new(tpub)])?;
//! let wallet = manager.create_wallet(config)?;
//!
//! // Hand out a deposit address
//! let address = manager.handout_addresses(&wallet.id, 1, false)?;
//! println!("Deposit to {}", address[0].address);
//! ```

pub mod chain;
pub mod cli;
pub mod config;
pub mod core;
pub mod keys;
pub mod multisig;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use chain::{ChainDataProvider, ChainError, ChainUtxo};
pub use config::{ConfigError, EngineConfig};
pub use self::core::{FeeEstimates, FeeRate, MultisigShape, Priority, ScriptKind};
pub use keys::{KeyDerivationEngine, KeyError, MasterSeed, ServerKeyPair};
pub use multisig::{
    AddressInfo, MultisigError, MultisigManager, ParticipantKey, SignatureShare, TxStatus,
    UnsignedTransaction, Wallet, WalletConfig,
};
pub use storage::{LedgerStore, MemoryLedger, Storage, StorageConfig, StorageError};
pub use wallet::{Receiver, SelectionOrder, SpendRequest, Utxo};
