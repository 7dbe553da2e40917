//! Core transaction components
//!
//! This module contains the fundamental building blocks:
//! - Fee and size estimation across script types
//! - Unsigned transaction (PSBT) assembly and BIP143 sighashes

pub mod fee;
pub mod transaction;

pub use fee::{
    estimate_fee, estimate_raw_size, estimate_vbytes, extra_signature_vbytes, output_size,
    FeeError, FeeEstimates, FeeRate, MultisigShape, Priority, ScriptKind,
};
pub use transaction::{
    build_unsigned_psbt, checked_total, p2wsh_sighash, psbt_from_base64, psbt_to_base64,
    SpendInput, SpendOutput, TransactionError, UnsignedPsbt, SEQUENCE_FINAL, TX_VERSION,
};
