//! Server key management
//!
//! This module provides:
//! - The master seed handle (`MasterSeed`)
//! - BIP48 account and address key derivation (`KeyDerivationEngine`)
//! - Key origin metadata shared with external signers

pub mod derivation;
pub mod seed;

pub use derivation::{
    branch, check_account_index, check_address_index, coin_type, parse_derivation_path,
    KeyDerivationEngine, KeyError, KeyOrigin, ServerKeyPair, CHANGE_BRANCH, MAX_INDEX, PURPOSE,
    RECEIVE_BRANCH, SCRIPT_TYPE_P2WSH,
};
pub use seed::MasterSeed;
