//! Unsigned transaction assembly
//!
//! Builds the PSBT that is handed to every co-signer. Each input carries
//! everything an offline signer needs: the spent output, the witness script
//! and the BIP32 origin of every key in that script.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::KeySource;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use secp256k1::Message;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::keys::{KeyError, KeyOrigin};

// =============================================================================
// Constants
// =============================================================================

/// Transaction version used for every spend
pub const TX_VERSION: i32 = 2;

/// Sequence number that disables locktime and opts out of RBF
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("No inputs provided")]
    EmptyInputs,
    #[error("No outputs provided")]
    EmptyOutputs,
    #[error("Outputs ({outputs}) exceed inputs ({inputs})")]
    OutputsExceedInputs { inputs: u64, outputs: u64 },
    #[error("Value overflow: amounts exceed the money supply")]
    ValueOverflow,
    #[error("PSBT error: {0}")]
    Psbt(String),
    #[error("Key path error: {0}")]
    KeyPath(#[from] KeyError),
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// A P2WSH output being spent
#[derive(Debug, Clone)]
pub struct SpendInput {
    pub outpoint: OutPoint,
    pub value: u64,
    /// The P2WSH commitment of the spent output
    pub script_pubkey: ScriptBuf,
    pub witness_script: ScriptBuf,
    /// Origins of every key in `witness_script`
    pub key_origins: Vec<KeyOrigin>,
}

/// A payment to an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendOutput {
    pub address: String,
    pub script_pubkey: ScriptBuf,
    pub value: u64,
}

impl SpendOutput {
    pub fn new(address: &Address, value: u64) -> Self {
        Self {
            address: address.to_string(),
            script_pubkey: address.script_pubkey(),
            value,
        }
    }

    fn to_txout(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Result of [`build_unsigned_psbt`]
#[derive(Debug, Clone)]
pub struct UnsignedPsbt {
    pub psbt: Psbt,
    /// Sum of inputs minus sum of outputs
    pub fee: u64,
    /// Spent outpoints, in input order
    pub inputs: Vec<OutPoint>,
}

impl UnsignedPsbt {
    pub fn txid(&self) -> Txid {
        self.psbt.unsigned_tx.compute_txid()
    }

    pub fn to_base64(&self) -> String {
        psbt_to_base64(&self.psbt)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Build the unsigned PSBT for a spend
///
/// Version 2, locktime 0, every input final. Inputs and outputs keep the
/// order given.
///
/// # Errors
/// Returns `EmptyInputs`/`EmptyOutputs` for empty lists,
/// `OutputsExceedInputs` when the spend would have a negative fee and
/// `ValueOverflow` when either side sums past `MAX_MONEY`
pub fn build_unsigned_psbt(
    inputs: &[SpendInput],
    outputs: &[SpendOutput],
) -> Result<UnsignedPsbt, TransactionError> {
    if inputs.is_empty() {
        return Err(TransactionError::EmptyInputs);
    }
    if outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }

    let total_in = checked_total(inputs.iter().map(|i| i.value))?;
    let total_out = checked_total(outputs.iter().map(|o| o.value))?;
    if total_out > total_in {
        return Err(TransactionError::OutputsExceedInputs {
            inputs: total_in,
            outputs: total_out,
        });
    }

    let tx = Transaction {
        version: Version(TX_VERSION),
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(SEQUENCE_FINAL),
                witness: Witness::new(),
            })
            .collect(),
        output: outputs.iter().map(SpendOutput::to_txout).collect(),
    };

    let mut psbt =
        Psbt::from_unsigned_tx(tx).map_err(|e| TransactionError::Psbt(e.to_string()))?;

    for (psbt_input, input) in psbt.inputs.iter_mut().zip(inputs) {
        psbt_input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(input.value),
            script_pubkey: input.script_pubkey.clone(),
        });
        psbt_input.witness_script = Some(input.witness_script.clone());
        psbt_input.bip32_derivation = key_sources(&input.key_origins)?;
    }

    Ok(UnsignedPsbt {
        psbt,
        fee: total_in - total_out,
        inputs: inputs.iter().map(|i| i.outpoint).collect(),
    })
}

/// Sum of satoshi values, bounded by `MAX_MONEY`
pub fn checked_total(values: impl IntoIterator<Item = u64>) -> Result<u64, TransactionError> {
    values
        .into_iter()
        .try_fold(0u64, |total, value| total.checked_add(value))
        .filter(|total| *total <= Amount::MAX_MONEY.to_sat())
        .ok_or(TransactionError::ValueOverflow)
}

fn key_sources(
    origins: &[KeyOrigin],
) -> Result<BTreeMap<secp256k1::PublicKey, KeySource>, TransactionError> {
    origins
        .iter()
        .map(|origin| -> Result<_, TransactionError> {
            Ok((
                origin.public_key,
                (origin.fingerprint, origin.derivation_path()?),
            ))
        })
        .collect()
}

/// BIP143 signature hash of a P2WSH input, `SIGHASH_ALL`
pub fn p2wsh_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &ScriptBuf,
    value: u64,
) -> Result<Message, TransactionError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            input_index,
            witness_script,
            Amount::from_sat(value),
            EcdsaSighashType::All,
        )
        .map_err(|e| TransactionError::Psbt(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Encode a PSBT in the base64 form wallets exchange
pub fn psbt_to_base64(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

/// Decode a base64 PSBT
pub fn psbt_from_base64(encoded: &str) -> Result<Psbt, TransactionError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TransactionError::Psbt(format!("invalid base64: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| TransactionError::Psbt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derivation::tests::test_engine;
    use bitcoin::bip32::Fingerprint;
    use bitcoin::Network;
    use std::str::FromStr;

    fn sample_input(vout: u32, value: u64) -> SpendInput {
        let engine = test_engine();
        let key = engine.derive_server_key_pair(0, vout, false).unwrap();
        let witness_script = bitcoin::script::Builder::new()
            .push_int(1)
            .push_key(&bitcoin::PublicKey::new(key.public_key))
            .push_int(1)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        SpendInput {
            outpoint: OutPoint {
                txid: Txid::from_str(
                    "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16",
                )
                .unwrap(),
                vout,
            },
            value,
            script_pubkey: ScriptBuf::new_p2wsh(&witness_script.wscript_hash()),
            witness_script,
            key_origins: vec![KeyOrigin {
                public_key: key.public_key,
                fingerprint: Fingerprint::default(),
                path: format!("m/0/{}", vout),
            }],
        }
    }

    fn sample_output(value: u64) -> SpendOutput {
        let address = Address::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
            .unwrap()
            .require_network(Network::Testnet)
            .unwrap();
        SpendOutput::new(&address, value)
    }

    #[test]
    fn test_build_unsigned_psbt() {
        let inputs = vec![sample_input(0, 60_000), sample_input(1, 40_000)];
        let outputs = vec![sample_output(90_000)];

        let unsigned = build_unsigned_psbt(&inputs, &outputs).unwrap();
        assert_eq!(unsigned.fee, 10_000);

        let tx = &unsigned.psbt.unsigned_tx;
        assert_eq!(tx.version, Version::TWO);
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.input.len(), 2);
        assert!(tx.input.iter().all(|i| i.sequence == Sequence::MAX));
        assert_eq!(tx.input[1].previous_output.vout, 1);
        assert_eq!(
            unsigned.inputs,
            vec![inputs[0].outpoint, inputs[1].outpoint]
        );
    }

    #[test]
    fn test_psbt_inputs_carry_signing_metadata() {
        let inputs = vec![sample_input(3, 50_000)];
        let unsigned = build_unsigned_psbt(&inputs, &[sample_output(40_000)]).unwrap();

        let psbt_input = &unsigned.psbt.inputs[0];
        assert_eq!(
            psbt_input.witness_utxo.as_ref().unwrap().value,
            Amount::from_sat(50_000)
        );
        assert_eq!(psbt_input.witness_script.as_ref(), Some(&inputs[0].witness_script));

        let (fingerprint, path) = &psbt_input.bip32_derivation[&inputs[0].key_origins[0].public_key];
        assert_eq!(*fingerprint, Fingerprint::default());
        assert_eq!(path.into_iter().count(), 2);
    }

    #[test]
    fn test_empty_lists_rejected() {
        assert!(matches!(
            build_unsigned_psbt(&[], &[sample_output(1_000)]),
            Err(TransactionError::EmptyInputs)
        ));
        assert!(matches!(
            build_unsigned_psbt(&[sample_input(0, 1_000)], &[]),
            Err(TransactionError::EmptyOutputs)
        ));
    }

    #[test]
    fn test_outputs_exceeding_inputs_rejected() {
        let result = build_unsigned_psbt(&[sample_input(0, 1_000)], &[sample_output(2_000)]);
        assert!(matches!(
            result,
            Err(TransactionError::OutputsExceedInputs {
                inputs: 1_000,
                outputs: 2_000
            })
        ));
    }

    #[test]
    fn test_oversized_amounts_rejected() {
        let half = u64::MAX / 2 + 1;
        let result = build_unsigned_psbt(
            &[sample_input(0, 10_000)],
            &[sample_output(half), sample_output(half)],
        );
        assert!(matches!(result, Err(TransactionError::ValueOverflow)));

        let result = build_unsigned_psbt(
            &[sample_input(0, u64::MAX), sample_input(1, 1)],
            &[sample_output(1_000)],
        );
        assert!(matches!(result, Err(TransactionError::ValueOverflow)));

        assert_eq!(checked_total([1, 2, 3]).unwrap(), 6);
        assert!(checked_total([Amount::MAX_MONEY.to_sat(), 1]).is_err());
    }

    #[test]
    fn test_base64_round_trip_preserves_txid() {
        let unsigned =
            build_unsigned_psbt(&[sample_input(0, 10_000)], &[sample_output(9_000)]).unwrap();
        let decoded = psbt_from_base64(&unsigned.to_base64()).unwrap();
        assert_eq!(decoded.unsigned_tx.compute_txid(), unsigned.txid());
        assert!(psbt_from_base64("!!!").is_err());
    }

    #[test]
    fn test_sighash_commits_to_value() {
        let input = sample_input(0, 10_000);
        let unsigned = build_unsigned_psbt(&[input.clone()], &[sample_output(9_000)]).unwrap();
        let tx = &unsigned.psbt.unsigned_tx;

        let a = p2wsh_sighash(tx, 0, &input.witness_script, 10_000).unwrap();
        let b = p2wsh_sighash(tx, 0, &input.witness_script, 10_001).unwrap();
        assert_ne!(a, b);
        assert!(p2wsh_sighash(tx, 5, &input.witness_script, 10_000).is_err());
    }
}
