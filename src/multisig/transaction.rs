//! Unsigned multi-signature transaction handling
//!
//! An [`UnsignedTransaction`] wraps the PSBT of one spend and moves through
//! `Created -> PartiallySigned -> Complete -> Broadcasting -> Broadcasted`,
//! with `Cancelled` reachable before completion. `Broadcasting` is the claim
//! a single broadcaster holds while the network call is in flight. Every mutating operation works on a copy of
//! the PSBT and only writes it back once the whole operation has succeeded.

use bitcoin::bip32::{ChildNumber, Fingerprint};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{PublicKey, ScriptBuf, Witness};
use chrono::{DateTime, Utc};
use secp256k1::{Secp256k1, SecretKey, Signing, Verification};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;

use super::script::{multisig_keys, multisig_threshold};
use super::wallet::{AddressRecord, MultisigError};
use crate::core::fee::FeeRate;
use crate::core::transaction::{p2wsh_sighash, psbt_from_base64, psbt_to_base64, SpendOutput};
use crate::keys::KeyDerivationEngine;

/// Fingerprint recorded for signatures made by the server
pub const SERVER_FINGERPRINT: &str = "00000000";

/// Status of an unsigned transaction
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxStatus {
    /// No signatures yet
    Created,
    /// Some signatures, not enough for every input
    PartiallySigned,
    /// Every input has its threshold of signatures
    Complete,
    /// Claimed by a broadcaster; the network call is in flight
    Broadcasting,
    /// Handed to the network; terminal
    Broadcasted,
    /// Abandoned before completion; terminal
    Cancelled,
}

impl TxStatus {
    /// Whether a transaction in this state holds its inputs
    pub fn reserves_inputs(self) -> bool {
        self != TxStatus::Cancelled
    }
}

/// A recorded signature from one signer over one input
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialSignature {
    pub unsigned_tx_id: String,
    pub signer_fingerprint: String,
    pub input_index: usize,
    /// Compressed public key (hex)
    pub public_key: String,
    /// DER signature plus sighash byte (hex)
    pub signature: String,
    pub tap_leaf_hash: Option<String>,
    pub signed_at: DateTime<Utc>,
}

/// A signature offered by a participant for one input
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureShare {
    pub input_index: usize,
    /// Compressed public key (hex)
    pub public_key: String,
    /// DER signature plus sighash byte (hex)
    pub signature: String,
}

/// A share that did not pass validation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedSignature {
    pub input_index: usize,
    pub public_key: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: usize,
    pub rejected: Vec<RejectedSignature>,
    pub is_complete: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSignOutcome {
    pub signatures_added: usize,
    pub is_complete: bool,
}

/// A fully signed transaction ready for broadcast
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedTransaction {
    pub txid: String,
    pub raw: Vec<u8>,
}

impl FinalizedTransaction {
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

/// A spend output as recorded on the transaction
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRecord {
    pub address: String,
    pub value: u64,
}

// =============================================================================
// Server key lookup
// =============================================================================

/// Maps the P2WSH commitment of an input to the server key slot that
/// belongs to it
#[derive(Debug, Clone, Default)]
pub struct ServerKeyLookup {
    slots: HashMap<ScriptBuf, (u32, bool)>,
}

impl ServerKeyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, script_pubkey: ScriptBuf, address_index: u32, is_change: bool) {
        self.slots.insert(script_pubkey, (address_index, is_change));
    }

    /// `(address_index, is_change)` of the slot committed to by `script_pubkey`
    pub fn get(&self, script_pubkey: &ScriptBuf) -> Option<(u32, bool)> {
        self.slots.get(script_pubkey).copied()
    }

    /// Add entries from `other` that are not already known
    pub fn merge(&mut self, other: ServerKeyLookup) {
        for (script_pubkey, slot) in other.slots {
            self.slots.entry(script_pubkey).or_insert(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Build from the wallet's provisioned address records
    pub fn from_records(records: &[AddressRecord]) -> Result<Self, MultisigError> {
        let mut lookup = Self::new();
        for record in records {
            let bytes = hex::decode(&record.script_pubkey).map_err(|e| {
                MultisigError::InvalidRequest(format!(
                    "bad script for {}: {}",
                    record.address, e
                ))
            })?;
            lookup.insert(ScriptBuf::from_bytes(bytes), record.address_index, record.is_change);
        }
        Ok(lookup)
    }

    /// Build from the server origins carried in the PSBT
    ///
    /// The server origin has a zero fingerprint and a `{change}/{index}`
    /// path. An entry is only trusted if the server key derived for that
    /// slot is the key in the origin.
    pub fn from_psbt_origins(
        engine: &KeyDerivationEngine,
        account_id: u32,
        psbt: &Psbt,
    ) -> Result<Self, MultisigError> {
        let mut lookup = Self::new();
        for input in &psbt.inputs {
            let Some(utxo) = &input.witness_utxo else {
                continue;
            };
            for (public_key, (fingerprint, path)) in &input.bip32_derivation {
                if *fingerprint != Fingerprint::default() {
                    continue;
                }
                let children: Vec<ChildNumber> = path.into_iter().copied().collect();
                let (change, index) = match children.as_slice() {
                    [ChildNumber::Normal { index: change }, ChildNumber::Normal { index }]
                        if *change <= 1 =>
                    {
                        (*change, *index)
                    }
                    _ => continue,
                };
                let is_change = change == 1;
                let derived = engine.derive_server_public_key(account_id, index, is_change)?;
                if derived == *public_key {
                    lookup.insert(utxo.script_pubkey.clone(), index, is_change);
                }
            }
        }
        Ok(lookup)
    }
}

// =============================================================================
// Unsigned transaction
// =============================================================================

/// A spend awaiting signatures
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnsignedTransaction {
    pub id: String,
    pub wallet_id: String,
    /// Base64 PSBT including every signature collected so far
    pub psbt: String,
    /// Transaction id; stays the same once witnesses are added
    pub txid: String,
    /// Spent outpoints as `txid:vout`
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputRecord>,
    pub fee_per_byte: u64,
    pub fee: u64,
    pub total_spent: u64,
    pub initiated_by: String,
    pub signatures_count: u32,
    pub status: TxStatus,
    pub partial_signatures: Vec<PartialSignature>,
    /// Bumped by the ledger on every stored update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnsignedTransaction {
    /// Wrap a freshly built PSBT
    pub fn new(
        wallet_id: &str,
        psbt: &Psbt,
        outputs: &[SpendOutput],
        fee: u64,
        total_spent: u64,
        fee_rate: FeeRate,
        initiated_by: &str,
    ) -> Self {
        let now = Utc::now();
        let txid = psbt.unsigned_tx.compute_txid().to_string();

        // Generate unique ID from transaction details
        let id_data = format!(
            "{}{}{}",
            wallet_id,
            txid,
            now.timestamp_nanos_opt().unwrap_or(0)
        );
        let id = hex::encode(&Sha256::digest(id_data.as_bytes())[..16]);

        Self {
            id,
            wallet_id: wallet_id.to_string(),
            psbt: psbt_to_base64(psbt),
            txid,
            inputs: psbt
                .unsigned_tx
                .input
                .iter()
                .map(|i| i.previous_output.to_string())
                .collect(),
            outputs: outputs
                .iter()
                .map(|o| OutputRecord {
                    address: o.address.clone(),
                    value: o.value,
                })
                .collect(),
            fee_per_byte: fee_rate.as_sat_per_vbyte(),
            fee,
            total_spent,
            initiated_by: initiated_by.to_string(),
            signatures_count: 0,
            status: TxStatus::Created,
            partial_signatures: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode the stored PSBT
    pub fn decode_psbt(&self) -> Result<Psbt, MultisigError> {
        Ok(psbt_from_base64(&self.psbt)?)
    }

    pub fn is_complete(&self) -> bool {
        self.status == TxStatus::Complete
    }

    pub fn is_broadcasted(&self) -> bool {
        self.status == TxStatus::Broadcasted
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TxStatus::Cancelled
    }

    /// Reject mutation of transactions past `PartiallySigned`
    fn ensure_signable(&self) -> Result<(), MultisigError> {
        match self.status {
            TxStatus::Broadcasting | TxStatus::Broadcasted => {
                Err(MultisigError::AlreadyBroadcasted(self.id.clone()))
            }
            TxStatus::Cancelled => Err(MultisigError::AlreadyCancelled(self.id.clone())),
            TxStatus::Complete => Err(MultisigError::AlreadyComplete(self.id.clone())),
            TxStatus::Created | TxStatus::PartiallySigned => Ok(()),
        }
    }

    /// Add the server's signature to every input
    ///
    /// # Errors
    /// `ServerKeyNotFound` if an input's script is not in `lookup` or does
    /// not contain the derived server key. Nothing is recorded in that case.
    pub fn sign_with_server(
        &mut self,
        engine: &KeyDerivationEngine,
        account_id: u32,
        lookup: &ServerKeyLookup,
    ) -> Result<ServerSignOutcome, MultisigError> {
        self.ensure_signable()?;
        let mut psbt = self.decode_psbt()?;
        let now = Utc::now();
        let mut records = Vec::new();

        for input_index in 0..psbt.inputs.len() {
            let (script_pubkey, witness_script, _) = spend_info(&psbt, input_index)?;
            let (address_index, is_change) = lookup
                .get(&script_pubkey)
                .ok_or(MultisigError::ServerKeyNotFound(input_index))?;

            let key = engine.derive_server_key_pair(account_id, address_index, is_change)?;
            if !multisig_keys(&witness_script).contains(&key.public_key) {
                return Err(MultisigError::ServerKeyNotFound(input_index));
            }

            let public_key = PublicKey::new(key.public_key);
            if psbt.inputs[input_index].partial_sigs.contains_key(&public_key) {
                continue;
            }

            let share = sign_input(engine.secp(), &psbt, input_index, &key.private_key)?;
            let signature = parse_signature(&share.signature)?;
            psbt.inputs[input_index]
                .partial_sigs
                .insert(public_key, signature);
            records.push(self.record(SERVER_FINGERPRINT, &share, now));
        }

        let added = records.len();
        if added > 0 {
            self.commit(&psbt, records, now)?;
            log::info!(
                "Server signed {} inputs of {} ({:?})",
                added,
                self.id,
                self.status
            );
        }

        Ok(ServerSignOutcome {
            signatures_added: added,
            is_complete: self.is_complete(),
        })
    }

    /// Validate and record participant signatures
    ///
    /// Each share must verify against the BIP143 sighash of its input under
    /// the claimed key, and the key must be one of the input's script keys.
    /// Shares that fail are reported back and not recorded.
    pub fn submit_partial_signatures(
        &mut self,
        signer_fingerprint: &str,
        shares: &[SignatureShare],
    ) -> Result<SubmitOutcome, MultisigError> {
        self.ensure_signable()?;
        let mut psbt = self.decode_psbt()?;
        let secp = Secp256k1::verification_only();
        let now = Utc::now();
        let mut records = Vec::new();
        let mut rejected = Vec::new();

        for share in shares {
            match validate_share(&secp, &psbt, share) {
                Ok((public_key, signature)) => {
                    psbt.inputs[share.input_index]
                        .partial_sigs
                        .insert(public_key, signature);
                    records.push(self.record(signer_fingerprint, share, now));
                }
                Err(reason) => {
                    log::warn!(
                        "Rejected signature for input {} of {}: {}",
                        share.input_index,
                        self.id,
                        reason
                    );
                    rejected.push(RejectedSignature {
                        input_index: share.input_index,
                        public_key: share.public_key.clone(),
                        reason,
                    });
                }
            }
        }

        let accepted = records.len();
        if accepted > 0 {
            self.commit(&psbt, records, now)?;
        }

        Ok(SubmitOutcome {
            accepted,
            rejected,
            is_complete: self.is_complete(),
        })
    }

    /// `(valid signatures, threshold)` for every input
    pub fn signature_progress(&self) -> Result<Vec<(usize, usize)>, MultisigError> {
        let psbt = self.decode_psbt()?;
        (0..psbt.inputs.len())
            .map(|i| input_progress(&psbt, i))
            .collect()
    }

    /// Assemble the witness of every input and serialize the transaction
    ///
    /// Signatures are placed in script key order and each is verified once
    /// more before use.
    pub fn finalize(&self) -> Result<FinalizedTransaction, MultisigError> {
        match self.status {
            TxStatus::Broadcasting | TxStatus::Broadcasted => {
                return Err(MultisigError::AlreadyBroadcasted(self.id.clone()))
            }
            TxStatus::Cancelled => return Err(MultisigError::AlreadyCancelled(self.id.clone())),
            _ => {}
        }

        let psbt = self.decode_psbt()?;
        if self.status != TxStatus::Complete {
            let (input, (have, need)) = (0..psbt.inputs.len())
                .map(|i| input_progress(&psbt, i).map(|p| (i, p)))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .find(|(_, (have, need))| have < need)
                .unwrap_or((0, (0, 0)));
            return Err(self.incomplete(input, have, need));
        }

        let secp = Secp256k1::verification_only();
        let mut tx = psbt.unsigned_tx.clone();

        for (input_index, txin) in tx.input.iter_mut().enumerate() {
            let (_, witness_script, value) = spend_info(&psbt, input_index)?;
            let need = threshold(&witness_script, input_index)?;
            let message = p2wsh_sighash(&psbt.unsigned_tx, input_index, &witness_script, value)?;

            let signatures: Vec<EcdsaSignature> = multisig_keys(&witness_script)
                .into_iter()
                .filter_map(|key| {
                    let signature = psbt.inputs[input_index]
                        .partial_sigs
                        .get(&PublicKey::new(key))?;
                    secp.verify_ecdsa(&message, &signature.signature, &key)
                        .ok()
                        .map(|_| *signature)
                })
                .take(need)
                .collect();

            if signatures.len() < need {
                return Err(self.incomplete(input_index, signatures.len(), need));
            }

            // CHECKMULTISIG pops one extra element
            let mut witness = Witness::new();
            witness.push(Vec::<u8>::new());
            for signature in &signatures {
                witness.push(signature.to_vec());
            }
            witness.push(witness_script.as_bytes());
            txin.witness = witness;
        }

        Ok(FinalizedTransaction {
            txid: tx.compute_txid().to_string(),
            raw: bitcoin::consensus::encode::serialize(&tx),
        })
    }

    /// Claim the transaction for broadcasting
    ///
    /// Only a `Complete` transaction can be claimed; a second claimant sees
    /// `AlreadyBroadcasted`.
    pub fn begin_broadcast(&mut self) -> Result<(), MultisigError> {
        match self.status {
            TxStatus::Complete => {
                self.status = TxStatus::Broadcasting;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => self.broadcast_refused(),
        }
    }

    /// Release a broadcast claim after the network refused the transaction
    pub fn abort_broadcast(&mut self) -> Result<(), MultisigError> {
        if self.status != TxStatus::Broadcasting {
            return Err(MultisigError::InvalidRequest(format!(
                "transaction {} is not being broadcast",
                self.id
            )));
        }
        self.status = TxStatus::Complete;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a successful broadcast. Terminal.
    pub fn mark_broadcasted(&mut self) -> Result<(), MultisigError> {
        match self.status {
            TxStatus::Complete | TxStatus::Broadcasting => {
                self.status = TxStatus::Broadcasted;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => self.broadcast_refused(),
        }
    }

    fn broadcast_refused(&self) -> Result<(), MultisigError> {
        Err(match self.status {
            TxStatus::Broadcasting | TxStatus::Broadcasted => {
                MultisigError::AlreadyBroadcasted(self.id.clone())
            }
            TxStatus::Cancelled => MultisigError::AlreadyCancelled(self.id.clone()),
            TxStatus::Complete => MultisigError::AlreadyComplete(self.id.clone()),
            TxStatus::Created | TxStatus::PartiallySigned => {
                let progress = self.signature_progress()?;
                let (input, (have, need)) = progress
                    .into_iter()
                    .enumerate()
                    .find(|(_, (have, need))| have < need)
                    .unwrap_or((0, (0, 0)));
                self.incomplete(input, have, need)
            }
        })
    }

    /// Abandon the spend
    pub fn cancel(&mut self) -> Result<(), MultisigError> {
        self.ensure_signable()?;
        self.status = TxStatus::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn record(&self, fingerprint: &str, share: &SignatureShare, now: DateTime<Utc>) -> PartialSignature {
        PartialSignature {
            unsigned_tx_id: self.id.clone(),
            signer_fingerprint: fingerprint.to_string(),
            input_index: share.input_index,
            public_key: share.public_key.clone(),
            signature: share.signature.clone(),
            tap_leaf_hash: None,
            signed_at: now,
        }
    }

    fn commit(
        &mut self,
        psbt: &Psbt,
        records: Vec<PartialSignature>,
        now: DateTime<Utc>,
    ) -> Result<(), MultisigError> {
        let complete = (0..psbt.inputs.len())
            .map(|i| input_progress(psbt, i))
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .all(|(have, need)| have >= need);

        self.signatures_count += records.len() as u32;
        self.partial_signatures.extend(records);
        self.psbt = psbt_to_base64(psbt);
        self.status = if complete {
            TxStatus::Complete
        } else {
            TxStatus::PartiallySigned
        };
        self.updated_at = now;
        Ok(())
    }

    fn incomplete(&self, input: usize, have: usize, need: usize) -> MultisigError {
        MultisigError::IncompleteTransaction {
            id: self.id.clone(),
            input,
            have,
            need,
        }
    }
}

/// Sign one P2WSH input with `secret_key`, `SIGHASH_ALL`
pub fn sign_input<C: Signing>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    input_index: usize,
    secret_key: &SecretKey,
) -> Result<SignatureShare, MultisigError> {
    let (_, witness_script, value) = spend_info(psbt, input_index)?;
    let message = p2wsh_sighash(&psbt.unsigned_tx, input_index, &witness_script, value)?;
    let signature = EcdsaSignature {
        signature: secp.sign_ecdsa(&message, secret_key),
        sighash_type: EcdsaSighashType::All,
    };

    Ok(SignatureShare {
        input_index,
        public_key: hex::encode(secret_key.public_key(secp).serialize()),
        signature: hex::encode(signature.to_vec()),
    })
}

/// Commitment, witness script and value of a PSBT input
fn spend_info(psbt: &Psbt, input_index: usize) -> Result<(ScriptBuf, ScriptBuf, u64), MultisigError> {
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or_else(|| MultisigError::InvalidRequest(format!("no input {}", input_index)))?;
    let utxo = input.witness_utxo.as_ref().ok_or_else(|| {
        MultisigError::Psbt(format!("input {} has no witness utxo", input_index))
    })?;
    let witness_script = input.witness_script.clone().ok_or_else(|| {
        MultisigError::Psbt(format!("input {} has no witness script", input_index))
    })?;
    Ok((utxo.script_pubkey.clone(), witness_script, utxo.value.to_sat()))
}

/// Threshold read from the script itself
fn threshold(witness_script: &ScriptBuf, input_index: usize) -> Result<usize, MultisigError> {
    multisig_threshold(witness_script).ok_or_else(|| {
        MultisigError::Psbt(format!("input {} script is not multisig", input_index))
    })
}

fn input_progress(psbt: &Psbt, input_index: usize) -> Result<(usize, usize), MultisigError> {
    let (_, witness_script, _) = spend_info(psbt, input_index)?;
    let need = threshold(&witness_script, input_index)?;
    let sigs = &psbt.inputs[input_index].partial_sigs;
    let have = multisig_keys(&witness_script)
        .into_iter()
        .filter(|key| sigs.contains_key(&PublicKey::new(*key)))
        .count();
    Ok((have, need))
}

fn parse_signature(signature_hex: &str) -> Result<EcdsaSignature, MultisigError> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| MultisigError::InvalidSignature(format!("not hex: {}", e)))?;
    EcdsaSignature::from_slice(&bytes).map_err(|e| MultisigError::InvalidSignature(e.to_string()))
}

fn validate_share<C: Verification>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    share: &SignatureShare,
) -> Result<(PublicKey, EcdsaSignature), String> {
    let (_, witness_script, value) =
        spend_info(psbt, share.input_index).map_err(|e| e.to_string())?;

    let public_key = PublicKey::from_str(&share.public_key).map_err(|e| format!("bad public key: {}", e))?;
    if !public_key.compressed || !multisig_keys(&witness_script).contains(&public_key.inner) {
        return Err("public key is not part of the input script".to_string());
    }

    let signature = parse_signature(&share.signature).map_err(|e| e.to_string())?;
    if signature.sighash_type != EcdsaSighashType::All {
        return Err(format!("unsupported sighash type {}", signature.sighash_type));
    }

    let message = p2wsh_sighash(&psbt.unsigned_tx, share.input_index, &witness_script, value)
        .map_err(|e| e.to_string())?;
    secp.verify_ecdsa(&message, &signature.signature, &public_key.inner)
        .map_err(|_| "signature does not verify".to_string())?;

    if psbt.inputs[share.input_index]
        .partial_sigs
        .contains_key(&public_key)
    {
        return Err("input already signed by this key".to_string());
    }

    Ok((public_key, signature))
}
