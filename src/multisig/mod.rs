//! Multi-signature wallets and threshold signing
//!
//! Wallets are m-of-n P2WSH policies where one key belongs to the server and
//! the remaining n - 1 keys are participant xpubs. Spends are collected as
//! PSBTs and become broadcastable once every input carries m signatures.
//!
//! # Example
//!
//! ```ignore
//! use multisig_custody::multisig::{MultisigManager, ParticipantKey, WalletConfig};
//!
//! // Create a 2-of-3 wallet: server plus two participants
//! let config = WalletConfig::new("treasury", 2, 3, vec![
//!     ParticipantKey::new(xpub_a),
//!     ParticipantKey::new(xpub_b),
//! ])?;
//! let wallet = manager.create_wallet(config)?;
//!
//! // Build a spend, co-sign it, collect a participant signature
//! let tx = manager.build_spend(&wallet.id, &request, "alice", SelectionOrder::Snapshot)?;
//! manager.sign_with_server(&tx.id)?;
//! manager.submit_partial_signatures(&tx.id, fingerprint, &shares)?;
//!
//! // Transaction is now ready to broadcast
//! manager.broadcast(&tx.id, &provider)?;
//! ```

pub mod manager;
pub mod script;
pub mod transaction;
pub mod wallet;

pub use manager::{MultisigManager, MAX_ADDRESS_BATCH};
pub use script::{
    multisig_keys, multisig_threshold, sorted_multisig_script, wallet_descriptor, AddressDeriver,
    AddressInfo, WalletDescriptor, MAX_WITNESS_SCRIPT_SIZE,
};
pub use transaction::{
    sign_input, FinalizedTransaction, OutputRecord, PartialSignature, RejectedSignature,
    ServerKeyLookup, ServerSignOutcome, SignatureShare, SubmitOutcome, TxStatus,
    UnsignedTransaction, SERVER_FINGERPRINT,
};
pub use wallet::{
    AddressRecord, MultisigError, ParticipantKey, Wallet, WalletConfig, MAX_MULTISIG_KEYS,
    SERVER_SIGNERS,
};
