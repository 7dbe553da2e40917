//! Multi-signature wallet records
//!
//! A wallet is one server signer plus `n - 1` participant extended keys,
//! spending with an m-of-n sorted multisig behind P2WSH.

use bitcoin::bip32::Xpub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::core::fee::{FeeError, MultisigShape};
use crate::core::transaction::TransactionError;
use crate::keys::KeyError;
use crate::storage::StorageError;

/// Server signers per wallet; fixed at one for every wallet
pub const SERVER_SIGNERS: u8 = 1;

/// Largest key count OP_N can encode with a single opcode
pub const MAX_MULTISIG_KEYS: u8 = 16;

/// Errors related to multisig operations
#[derive(Error, Debug)]
pub enum MultisigError {
    #[error("Account index must be between 0 and 2147483647, got {0}")]
    InvalidAccountIndex(i64),
    #[error("Address index must be between 0 and 2147483647, got {0}")]
    InvalidAddressIndex(i64),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Script construction failed: {0}")]
    ScriptConstruction(String),
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Address mismatch for {outpoint}: derived {derived}, recorded {recorded}")]
    AddressMismatch {
        outpoint: String,
        derived: String,
        recorded: String,
    },
    #[error("No inputs provided")]
    EmptyInputs,
    #[error("No outputs provided")]
    EmptyOutputs,
    #[error("Transaction {0} is already complete")]
    AlreadyComplete(String),
    #[error("Transaction {0} has been cancelled")]
    AlreadyCancelled(String),
    #[error("Transaction {0} has already been broadcast")]
    AlreadyBroadcasted(String),
    #[error("Transaction {id} is incomplete: input {input} has {have} of {need} signatures")]
    IncompleteTransaction {
        id: String,
        input: usize,
        have: usize,
        need: usize,
    },
    #[error("No server key found for input {0}")]
    ServerKeyNotFound(usize),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("PSBT error: {0}")]
    Psbt(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain data error: {0}")]
    Chain(#[from] crate::chain::ChainError),
}

impl From<KeyError> for MultisigError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidAccountIndex(index) => MultisigError::InvalidAccountIndex(index),
            KeyError::InvalidAddressIndex(index) => MultisigError::InvalidAddressIndex(index),
            other => MultisigError::KeyDerivation(other.to_string()),
        }
    }
}

impl From<TransactionError> for MultisigError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::EmptyInputs => MultisigError::EmptyInputs,
            TransactionError::EmptyOutputs => MultisigError::EmptyOutputs,
            TransactionError::KeyPath(e) => MultisigError::from(e),
            TransactionError::ValueOverflow => {
                MultisigError::InvalidRequest(TransactionError::ValueOverflow.to_string())
            }
            other => MultisigError::Psbt(other.to_string()),
        }
    }
}

impl From<FeeError> for MultisigError {
    fn from(err: FeeError) -> Self {
        MultisigError::ScriptConstruction(err.to_string())
    }
}

/// A participant's extended public key as supplied by the client
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantKey {
    /// Account-level extended public key (base58)
    pub xpub: String,
    /// Path of the account node below the participant's master, if known
    pub derivation_path: Option<String>,
    /// Human readable device name
    pub device_label: Option<String>,
    /// Master key fingerprint as 8 hex characters, if known
    pub master_fingerprint: Option<String>,
}

impl ParticipantKey {
    pub fn new(xpub: impl Into<String>) -> Self {
        Self {
            xpub: xpub.into(),
            derivation_path: None,
            device_label: None,
            master_fingerprint: None,
        }
    }

    pub fn with_origin(mut self, fingerprint: &str, derivation_path: &str) -> Self {
        self.master_fingerprint = Some(fingerprint.to_string());
        self.derivation_path = Some(derivation_path.to_string());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.device_label = Some(label.to_string());
        self
    }
}

/// Validated m-of-n policy for a new wallet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WalletConfig {
    /// Minimum signatures required (M in M-of-N)
    pub m: u8,
    /// Total signers including the server (N)
    pub n: u8,
    pub participants: Vec<ParticipantKey>,
    pub name: String,
}

impl WalletConfig {
    /// Create a new wallet policy
    ///
    /// # Arguments
    /// * `m` - Minimum signatures required
    /// * `n` - Total signers, server included
    /// * `participants` - Exactly `n - 1` participant keys
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the threshold or key count is inconsistent,
    /// `KeyDerivation` if a participant key does not parse
    pub fn new(
        name: &str,
        m: u8,
        n: u8,
        participants: Vec<ParticipantKey>,
    ) -> Result<Self, MultisigError> {
        if m == 0 {
            return Err(MultisigError::InvalidRequest(
                "threshold must be at least 1".to_string(),
            ));
        }
        if m > n {
            return Err(MultisigError::InvalidRequest(format!(
                "threshold {} exceeds signer count {}",
                m, n
            )));
        }
        if n > MAX_MULTISIG_KEYS {
            return Err(MultisigError::InvalidRequest(format!(
                "at most {} signers supported, got {}",
                MAX_MULTISIG_KEYS, n
            )));
        }

        let expected = (n - SERVER_SIGNERS) as usize;
        if participants.len() != expected {
            return Err(MultisigError::InvalidRequest(format!(
                "expected {} keys, got {}",
                expected,
                participants.len()
            )));
        }

        // Check for duplicates
        let mut sorted: Vec<&str> = participants.iter().map(|p| p.xpub.as_str()).collect();
        sorted.sort();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(MultisigError::InvalidRequest(
                "duplicate participant key".to_string(),
            ));
        }

        for participant in &participants {
            Xpub::from_str(&participant.xpub).map_err(|e| {
                MultisigError::KeyDerivation(format!("{}: {}", participant.xpub, e))
            })?;
        }

        Ok(Self {
            m,
            n,
            participants,
            name: name.to_string(),
        })
    }

    /// Get description like "2-of-3"
    pub fn description(&self) -> String {
        format!("{}-of-{}", self.m, self.n)
    }
}

/// A created wallet. Immutable after creation; the descriptor is derived.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Wallet {
    pub id: String,
    pub name: String,
    pub m: u8,
    pub n: u8,
    /// Server key slot reserved for this wallet
    pub account_id: u32,
    pub chain: String,
    pub descriptor: String,
    pub server_signers: u8,
    /// Account path of the server key, e.g. `m/48'/1'/0'/2'`
    pub server_derivation_path: String,
    pub participants: Vec<ParticipantKey>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn participant_xpubs(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.xpub.clone()).collect()
    }

    /// Size shape of this wallet's scripts, for fee estimation
    pub fn shape(&self) -> Result<MultisigShape, MultisigError> {
        Ok(MultisigShape::new(self.m, self.n)?)
    }

    pub fn description(&self) -> String {
        format!("{}-of-{}", self.m, self.n)
    }
}

/// A derived and persisted wallet address
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressRecord {
    pub wallet_id: String,
    pub address_index: u32,
    pub is_change: bool,
    pub address: String,
    /// Witness script as hex
    pub witness_script: String,
    /// P2WSH output script as hex
    pub script_pubkey: String,
    pub handed_out: bool,
    pub used: bool,
}
