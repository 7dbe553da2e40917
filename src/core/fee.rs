//! Fee & Size Estimation
//!
//! Pure size model for spend planning:
//! - Per script kind input/output sizes (legacy, wrapped segwit, native segwit, taproot)
//! - Witness discount and segwit header overhead
//! - Virtual size and fee for a given fee rate
//! - Extra vbytes signatures will add to an unsigned PSBT
//!
//! All sizes are tracked internally in weight units (4 WU = 1 vbyte) so the
//! fractional vbyte constants stay exact, and are rounded up only once.

use bitcoin::psbt::Input as PsbtInput;
use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Weight units per virtual byte
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// P2PKH input: 148 vbytes
pub const P2PKH_IN_WU: u64 = 592;
/// P2PKH output: 34 vbytes
pub const P2PKH_OUT_WU: u64 = 136;
/// Any P2SH output (plain or wrapping segwit): 32 vbytes
pub const P2SH_OUT_WU: u64 = 128;
/// P2SH-P2WPKH input: 90.75 vbytes
pub const P2SH_P2WPKH_IN_WU: u64 = 363;
/// P2WPKH input: 67.75 vbytes
pub const P2WPKH_IN_WU: u64 = 271;
/// P2WPKH output: 31 vbytes
pub const P2WPKH_OUT_WU: u64 = 124;
/// P2WSH output: 43 vbytes
pub const P2WSH_OUT_WU: u64 = 172;
/// P2TR output: 43 vbytes
pub const P2TR_OUT_WU: u64 = 172;
/// P2TR key-path input: 57.25 vbytes
pub const P2TR_IN_WU: u64 = 229;

/// Compressed public key
pub const PUBKEY_SIZE: u64 = 33;
/// DER signature upper bound including the sighash byte
pub const SIGNATURE_SIZE: u64 = 72;

/// Witness of a P2WPKH spend: size(sig) + sig + size(pubkey) + pubkey
pub const P2WPKH_WITNESS_SIZE: u64 = 107;
/// Witness of a P2TR key-path spend: size(sig) + schnorr sig
pub const P2TR_WITNESS_SIZE: u64 = 65;

/// Outpoint (32 + 4) plus nSequence (4)
const OUTPOINT_AND_SEQUENCE: u64 = 36 + 4;

/// Default minimum fee rate (sat/vbyte)
pub const MIN_FEE_RATE: u64 = 1;

/// Default maximum fee rate (sat/vbyte)
pub const MAX_FEE_RATE: u64 = 10_000;

/// Fee estimation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FeeError {
    #[error("Invalid multisig shape: {m}-of-{n}")]
    InvalidShape { m: u8, n: u8 },
}

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in satoshis per virtual byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create from satoshis per vbyte
    pub fn from_sat_per_vbyte(rate: u64) -> Self {
        Self(rate)
    }

    /// Round a fractional provider estimate up to a whole sat/vbyte
    pub fn from_estimate(rate: f64) -> Self {
        if !rate.is_finite() || rate <= 0.0 {
            return Self::default();
        }
        Self((rate.ceil() as u64).clamp(MIN_FEE_RATE, MAX_FEE_RATE))
    }

    /// Fee for a given virtual size
    pub fn fee_for_vbytes(&self, vbytes: u64) -> u64 {
        self.0.saturating_mul(vbytes)
    }

    pub fn as_sat_per_vbyte(&self) -> u64 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(MIN_FEE_RATE)
    }
}

// =============================================================================
// Script kinds
// =============================================================================

/// Signature threshold and key count of a bare multisig script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigShape {
    m: u8,
    n: u8,
}

impl MultisigShape {
    /// Single key, single signature; the shape used when nothing better is known
    pub const SINGLE: MultisigShape = MultisigShape { m: 1, n: 1 };

    pub fn new(m: u8, n: u8) -> Result<Self, FeeError> {
        if m == 0 || m > n || n > 20 {
            return Err(FeeError::InvalidShape { m, n });
        }
        Ok(Self { m, n })
    }

    pub fn m(&self) -> u8 {
        self.m
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    /// OP_M <n pushes of 33 byte keys> OP_N OP_CHECKMULTISIG
    pub fn redeem_script_size(&self) -> u64 {
        1 + self.n as u64 * (1 + PUBKEY_SIZE) + 1 + 1
    }

    /// OP_0 dummy, m signatures, then the pushed redeem script
    fn unlock_size(&self) -> u64 {
        let redeem = self.redeem_script_size();
        1 + self.m as u64 * (1 + SIGNATURE_SIZE) + script_length_element_size(redeem) + redeem
    }
}

/// Closed set of input/output script kinds the estimator knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptKind {
    P2pkh,
    P2sh(MultisigShape),
    P2shP2wpkh,
    P2wpkh,
    P2shP2wsh(MultisigShape),
    P2wsh(MultisigShape),
    P2tr,
}

impl ScriptKind {
    /// Whether spending this kind puts data in the witness
    pub fn is_segwit(&self) -> bool {
        !matches!(self, ScriptKind::P2pkh | ScriptKind::P2sh(_))
    }

    /// Input size in weight units, witness already discounted
    pub fn input_weight(&self) -> u64 {
        match self {
            ScriptKind::P2pkh => P2PKH_IN_WU,
            ScriptKind::P2shP2wpkh => P2SH_P2WPKH_IN_WU,
            ScriptKind::P2wpkh => P2WPKH_IN_WU,
            ScriptKind::P2tr => P2TR_IN_WU,
            ScriptKind::P2sh(shape) => {
                let script_sig = shape.unlock_size();
                (OUTPOINT_AND_SEQUENCE + varint_size(script_sig) + script_sig) * WITNESS_SCALE_FACTOR
            }
            ScriptKind::P2wsh(shape) => {
                OUTPOINT_AND_SEQUENCE * WITNESS_SCALE_FACTOR + shape.unlock_size()
            }
            ScriptKind::P2shP2wsh(shape) => {
                // redeem script hash push plus scriptSig overhead
                (OUTPOINT_AND_SEQUENCE + 32 + 3) * WITNESS_SCALE_FACTOR + shape.unlock_size()
            }
        }
    }

    /// Raw witness bytes of one signed input of this kind
    pub fn witness_size(&self) -> u64 {
        match self {
            ScriptKind::P2pkh | ScriptKind::P2sh(_) => 0,
            ScriptKind::P2shP2wpkh | ScriptKind::P2wpkh => P2WPKH_WITNESS_SIZE,
            ScriptKind::P2tr => P2TR_WITNESS_SIZE,
            ScriptKind::P2wsh(shape) | ScriptKind::P2shP2wsh(shape) => shape.unlock_size(),
        }
    }

    /// Output size in weight units
    pub fn output_weight(&self) -> u64 {
        match self {
            ScriptKind::P2pkh => P2PKH_OUT_WU,
            ScriptKind::P2sh(_) | ScriptKind::P2shP2wpkh | ScriptKind::P2shP2wsh(_) => P2SH_OUT_WU,
            ScriptKind::P2wpkh => P2WPKH_OUT_WU,
            ScriptKind::P2wsh(_) => P2WSH_OUT_WU,
            ScriptKind::P2tr => P2TR_OUT_WU,
        }
    }
}

// =============================================================================
// Size helpers
// =============================================================================

/// Bytes of a CompactSize integer
pub fn varint_size(n: u64) -> u64 {
    match n {
        0..=252 => 1,
        253..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Bytes of the push opcode(s) in front of a script element
pub fn script_length_element_size(len: u64) -> u64 {
    match len {
        0..=74 => 1,
        75..=0xFF => 2,
        0x100..=0xFFFF => 3,
        _ => 5,
    }
}

/// Header overhead in weight units: version, counts, locktime, and the
/// segwit marker, flag and per-input witness item counts when applicable
fn overhead_weight(inputs: usize, outputs: usize, input_kind: ScriptKind) -> u64 {
    let base = 4 + varint_size(inputs as u64) + varint_size(outputs as u64) + 4;
    base * WITNESS_SCALE_FACTOR + segwit_overhead_weight(inputs, input_kind)
}

fn segwit_overhead_weight(inputs: usize, input_kind: ScriptKind) -> u64 {
    if input_kind.is_segwit() {
        2 + inputs as u64
    } else {
        0
    }
}

fn weight_to_vbytes(weight: u64) -> u64 {
    weight.div_ceil(WITNESS_SCALE_FACTOR)
}

// =============================================================================
// Estimation
// =============================================================================

/// Virtual size of a transaction, rounded up to a whole vbyte
pub fn estimate_vbytes(
    inputs: usize,
    outputs: usize,
    input_kind: ScriptKind,
    output_kind: ScriptKind,
) -> u64 {
    let weight = overhead_weight(inputs, outputs, input_kind)
        + input_kind.input_weight() * inputs as u64
        + output_kind.output_weight() * outputs as u64;
    weight_to_vbytes(weight)
}

/// Fee for a transaction: `ceil((vbytes + op_return bytes) * rate)`
pub fn estimate_fee(
    inputs: usize,
    outputs: usize,
    rate: FeeRate,
    input_kind: ScriptKind,
    output_kind: ScriptKind,
    op_return: Option<&[u8]>,
) -> u64 {
    let vbytes = estimate_vbytes(inputs, outputs, input_kind, output_kind)
        + op_return.map_or(0, |data| data.len() as u64);
    rate.fee_for_vbytes(vbytes)
}

/// Serialized size in raw bytes, witness counted at full weight
pub fn estimate_raw_size(
    inputs: usize,
    outputs: usize,
    input_kind: ScriptKind,
    output_kind: ScriptKind,
) -> u64 {
    let vbytes = estimate_vbytes(inputs, outputs, input_kind, output_kind);
    let undiscounted = segwit_overhead_weight(inputs, input_kind)
        + input_kind.witness_size() * inputs as u64;
    (vbytes * WITNESS_SCALE_FACTOR + undiscounted * 3).div_ceil(WITNESS_SCALE_FACTOR)
}

/// Size of one output paying `address`: value + script length + script
pub fn output_size(address: &Address) -> u64 {
    let script_len = address.script_pubkey().len() as u64;
    8 + varint_size(script_len) + script_len
}

/// Extra vbytes the signatures will add once every unsigned input is signed
///
/// P2WSH inputs that carry their witness script are sized from it (threshold
/// signatures plus the script); the rest use fixed worst-case figures.
pub fn extra_signature_vbytes(inputs: &[PsbtInput]) -> u64 {
    inputs.iter().map(input_signature_vbytes).sum()
}

fn input_signature_vbytes(input: &PsbtInput) -> u64 {
    if let Some(utxo) = &input.witness_utxo {
        let script = &utxo.script_pubkey;
        if script.is_p2wpkh() {
            // 73 byte sig + 33 byte pubkey
            return weight_to_vbytes(106);
        }
        if script.is_p2tr() {
            return 64 / WITNESS_SCALE_FACTOR;
        }
        if script.is_p2wsh() {
            let witness = match &input.witness_script {
                Some(ws) => {
                    let sigs = threshold_from_script(ws.as_bytes()).unwrap_or(1);
                    let len = ws.len() as u64;
                    1 + sigs * (1 + SIGNATURE_SIZE) + script_length_element_size(len) + len
                }
                None => 73 + script.len() as u64,
            };
            return weight_to_vbytes(witness);
        }
        return 0;
    }

    if input.non_witness_utxo.is_some() {
        return match &input.redeem_script {
            None => 108,
            Some(redeem) if redeem.is_p2wpkh() => 22 + weight_to_vbytes(106),
            Some(redeem) => match threshold_from_script(redeem.as_bytes()) {
                Some(sigs) => 1 + 73 * sigs + redeem.len() as u64 + 1,
                None => 108 + redeem.len() as u64 + 1,
            },
        };
    }

    0
}

/// `m` of a bare multisig script, read from its leading OP_1..OP_16
fn threshold_from_script(script: &[u8]) -> Option<u64> {
    match script.first() {
        Some(&op) if (0x51..=0x60).contains(&op) => Some((op - 0x50) as u64),
        _ => None,
    }
}

// =============================================================================
// Fee Estimates Result
// =============================================================================

/// Fee rates reported by a chain data provider, keyed by confirmation target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeEstimates {
    /// Target in blocks -> sat/vbyte
    pub by_target: BTreeMap<u16, f64>,
}

impl FeeEstimates {
    pub fn new(by_target: BTreeMap<u16, f64>) -> Self {
        Self { by_target }
    }

    /// Rate for the largest known target not exceeding `blocks`
    ///
    /// Falls back to the smallest known target, then to the minimum rate.
    pub fn for_target(&self, blocks: u16) -> FeeRate {
        self.by_target
            .range(..=blocks)
            .next_back()
            .or_else(|| self.by_target.iter().next())
            .map(|(_, rate)| FeeRate::from_estimate(*rate))
            .unwrap_or_default()
    }

    /// Get fee for a given priority level
    pub fn for_priority(&self, priority: Priority) -> FeeRate {
        self.for_target(priority.target_blocks())
    }
}

/// Transaction priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
    Economy,
}

impl Priority {
    /// Confirmation target in blocks
    pub fn target_blocks(&self) -> u16 {
        match self {
            Priority::High => 1,
            Priority::Normal => 3,
            Priority::Low => 6,
            Priority::Economy => 25,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{Amount, ScriptBuf, TxOut};
    use std::str::FromStr;

    fn p2wsh_2of3() -> ScriptKind {
        ScriptKind::P2wsh(MultisigShape::new(2, 3).unwrap())
    }

    #[test]
    fn test_fee_rate() {
        let rate = FeeRate::from_sat_per_vbyte(10);
        assert_eq!(rate.fee_for_vbytes(250), 2500);

        assert_eq!(FeeRate::from_estimate(3.2), FeeRate(4));
        assert_eq!(FeeRate::from_estimate(-1.0), FeeRate::default());
        assert_eq!(FeeRate::from_estimate(f64::NAN), FeeRate::default());
    }

    #[test]
    fn test_varint_thresholds() {
        assert_eq!(varint_size(252), 1);
        assert_eq!(varint_size(253), 3);
        assert_eq!(varint_size(65535), 3);
        assert_eq!(varint_size(65536), 5);
        assert_eq!(varint_size(u32::MAX as u64 + 1), 9);

        assert_eq!(script_length_element_size(74), 1);
        assert_eq!(script_length_element_size(75), 2);
        assert_eq!(script_length_element_size(255), 2);
        assert_eq!(script_length_element_size(256), 3);
    }

    #[test]
    fn test_invalid_shape() {
        assert_eq!(
            MultisigShape::new(0, 2),
            Err(FeeError::InvalidShape { m: 0, n: 2 })
        );
        assert!(MultisigShape::new(3, 2).is_err());
        assert!(MultisigShape::new(15, 15).is_ok());
    }

    #[test]
    fn test_single_key_p2wpkh_transaction() {
        // 10 + 0.5 + 0.25 header, 67.75 input, 2 x 31 outputs = 140.5
        let vbytes = estimate_vbytes(1, 2, ScriptKind::P2wpkh, ScriptKind::P2wpkh);
        assert_eq!(vbytes, 141);
    }

    #[test]
    fn test_legacy_p2pkh_transaction() {
        // 10 header + 148 + 2 x 34, no segwit overhead
        let vbytes = estimate_vbytes(1, 2, ScriptKind::P2pkh, ScriptKind::P2pkh);
        assert_eq!(vbytes, 226);
        assert_eq!(
            estimate_raw_size(1, 2, ScriptKind::P2pkh, ScriptKind::P2pkh),
            226
        );
    }

    #[test]
    fn test_single_sig_p2wsh_matches_reference_model() {
        // redeem 37, witness 1 + 73 + 1 + 37 = 112, input 36 + 28 + 4 = 68
        let kind = ScriptKind::P2wsh(MultisigShape::SINGLE);
        assert_eq!(kind.witness_size(), 112);
        assert_eq!(kind.input_weight(), 272);
        // 10.75 header + 68 + 43 = 121.75
        assert_eq!(estimate_vbytes(1, 1, kind, kind), 122);
    }

    #[test]
    fn test_2of3_p2wsh_input() {
        // redeem 1 + 3*34 + 2 = 105, witness 1 + 2*73 + 2 + 105 = 254
        let kind = p2wsh_2of3();
        assert_eq!(kind.witness_size(), 254);
        // 40 vbytes outpoint/sequence + 63.5 witness
        assert_eq!(kind.input_weight(), 160 + 254);
        // 10.75 header + 103.5 + 2 x 43 = 200.25
        assert_eq!(estimate_vbytes(1, 2, kind, kind), 201);
    }

    #[test]
    fn test_fee_with_op_return() {
        let kind = p2wsh_2of3();
        let vbytes = estimate_vbytes(1, 2, kind, kind);
        let data = [0u8; 20];
        assert_eq!(
            estimate_fee(1, 2, FeeRate(10), kind, kind, Some(&data)),
            (vbytes + 20) * 10
        );
    }

    #[test]
    fn test_fee_monotonicity() {
        let kind = p2wsh_2of3();
        let mut last = 0;
        for inputs in 1..300 {
            let fee = estimate_fee(inputs, 2, FeeRate(5), kind, kind, None);
            assert!(fee >= last);
            last = fee;
        }
        let mut last = 0;
        for outputs in 1..300 {
            let fee = estimate_fee(2, outputs, FeeRate(5), kind, kind, None);
            assert!(fee >= last);
            last = fee;
        }
        let mut last = 0;
        for rate in 1..100 {
            let fee = estimate_fee(2, 2, FeeRate(rate), kind, kind, None);
            assert!(fee >= last);
            last = fee;
        }
    }

    #[test]
    fn test_raw_size_counts_full_witness() {
        let kind = p2wsh_2of3();
        let vbytes = estimate_vbytes(2, 2, kind, kind);
        let raw = estimate_raw_size(2, 2, kind, kind);
        assert!(raw > vbytes);
    }

    #[test]
    fn test_output_size() {
        let p2wpkh = Address::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
            .unwrap()
            .assume_checked();
        assert_eq!(output_size(&p2wpkh), 8 + 1 + 22);
    }

    #[test]
    fn test_extra_signature_vbytes() {
        let p2wpkh_spk =
            ScriptBuf::from_hex("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        let p2wpkh_input = PsbtInput {
            witness_utxo: Some(TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: p2wpkh_spk,
            }),
            ..Default::default()
        };
        assert_eq!(extra_signature_vbytes(&[p2wpkh_input.clone()]), 27);

        // OP_2 <33> <33> OP_2 OP_CHECKMULTISIG
        let mut ws = vec![0x52];
        for _ in 0..2 {
            ws.push(0x21);
            ws.extend_from_slice(&[0x02; 33]);
        }
        ws.extend_from_slice(&[0x52, 0xae]);
        let witness_script = ScriptBuf::from_bytes(ws);
        let p2wsh_input = PsbtInput {
            witness_utxo: Some(TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: witness_script.to_p2wsh(),
            }),
            witness_script: Some(witness_script.clone()),
            ..Default::default()
        };
        // dummy + 2 signatures + one length byte for the 71 byte script
        let expected = (1 + 2 * 73 + 1 + witness_script.len() as u64).div_ceil(4);
        assert_eq!(extra_signature_vbytes(&[p2wsh_input.clone()]), expected);

        assert_eq!(
            extra_signature_vbytes(&[p2wpkh_input, p2wsh_input]),
            27 + expected
        );
        assert_eq!(extra_signature_vbytes(&[PsbtInput::default()]), 0);
    }

    #[test]
    fn test_fee_estimates_targets() {
        let mut by_target = BTreeMap::new();
        by_target.insert(1, 25.3);
        by_target.insert(3, 12.0);
        by_target.insert(6, 8.7);
        by_target.insert(144, 1.0);
        let estimates = FeeEstimates::new(by_target);

        assert_eq!(estimates.for_priority(Priority::High), FeeRate(26));
        assert_eq!(estimates.for_priority(Priority::Normal), FeeRate(12));
        assert_eq!(estimates.for_priority(Priority::Low), FeeRate(9));
        assert_eq!(estimates.for_priority(Priority::Economy), FeeRate(9));
        assert_eq!(estimates.for_target(500), FeeRate(1));
        assert_eq!(FeeEstimates::default().for_target(2), FeeRate::default());
    }
}
