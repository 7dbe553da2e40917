//! Coin selection and spend planning
//!
//! Greedy single-pass accumulation over the wallet's UTXO snapshot. The fee
//! is re-estimated after every added input, and every selected input is
//! re-derived so a ledger row that no longer matches its derivation slot
//! stops the spend.

use bitcoin::{Address, Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::fee::{estimate_fee, FeeRate, ScriptKind};
use crate::core::transaction::{checked_total, SpendInput, SpendOutput};
use crate::multisig::script::{AddressDeriver, AddressInfo};
use crate::multisig::wallet::MultisigError;

/// Outputs below this value are not created (satoshis)
pub const DUST_THRESHOLD: u64 = 546;

/// An unspent output owned by a wallet address
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    /// Value in satoshis
    pub value: u64,
    pub address: String,
    pub address_index: u32,
    pub is_change: bool,
    pub confirmed: bool,
    pub spent: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> Result<OutPoint, MultisigError> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| MultisigError::InvalidRequest(format!("bad txid {}: {}", self.txid, e)))?;
        Ok(OutPoint {
            txid,
            vout: self.vout,
        })
    }

    /// `txid:vout`
    pub fn outpoint_string(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// A payment requested by the caller
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receiver {
    pub address: String,
    pub value: u64,
}

/// Which UTXOs are tried first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionOrder {
    /// The order the ledger first saw them
    #[default]
    Snapshot,
    /// Largest value first, fewer inputs
    LargestFirst,
}

#[derive(Clone, Debug)]
pub struct SpendRequest {
    pub receivers: Vec<Receiver>,
    pub fee_rate: FeeRate,
}

/// A selected UTXO together with its re-derived script
#[derive(Clone, Debug)]
pub struct PlannedInput {
    pub utxo: Utxo,
    pub address: AddressInfo,
}

/// Result of planning a spend
#[derive(Clone, Debug)]
pub struct SpendPlan {
    pub inputs: Vec<PlannedInput>,
    /// Receivers in request order, then the change output if any
    pub outputs: Vec<SpendOutput>,
    pub fee: u64,
    /// Receiver total plus fee
    pub total_spent: u64,
    /// Index of the change address used, if a change output was created
    pub change_index: Option<u32>,
}

impl SpendPlan {
    pub fn input_value(&self) -> u64 {
        self.inputs.iter().map(|i| i.utxo.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Inputs in the form the PSBT builder consumes
    pub fn spend_inputs(&self) -> Result<Vec<SpendInput>, MultisigError> {
        self.inputs
            .iter()
            .map(|input| -> Result<SpendInput, MultisigError> {
                Ok(SpendInput {
                    outpoint: input.utxo.outpoint()?,
                    value: input.utxo.value,
                    script_pubkey: input.address.script_pubkey.clone(),
                    witness_script: input.address.witness_script.clone(),
                    key_origins: input.address.key_origins.clone(),
                })
            })
            .collect()
    }
}

/// Plans spends for one wallet
pub struct SpendPlanner<'a> {
    deriver: &'a AddressDeriver<'a>,
    order: SelectionOrder,
    dust_threshold: u64,
}

impl<'a> SpendPlanner<'a> {
    pub fn new(deriver: &'a AddressDeriver<'a>) -> Self {
        Self {
            deriver,
            order: SelectionOrder::default(),
            dust_threshold: DUST_THRESHOLD,
        }
    }

    pub fn with_order(mut self, order: SelectionOrder) -> Self {
        self.order = order;
        self
    }

    /// Check receivers and fee rate, returning the receiver outputs
    pub fn validate(&self, request: &SpendRequest) -> Result<Vec<SpendOutput>, MultisigError> {
        if request.receivers.is_empty() {
            return Err(MultisigError::EmptyOutputs);
        }
        if request.fee_rate.as_sat_per_vbyte() < 1 {
            return Err(MultisigError::InvalidRequest(
                "fee rate must be at least 1 sat/vbyte".to_string(),
            ));
        }

        let network = self.deriver.network();
        request
            .receivers
            .iter()
            .map(|receiver| -> Result<SpendOutput, MultisigError> {
                if receiver.value > Amount::MAX_MONEY.to_sat() {
                    return Err(MultisigError::InvalidRequest(format!(
                        "amount {} to {} exceeds the money supply",
                        receiver.value, receiver.address
                    )));
                }
                if receiver.value < self.dust_threshold {
                    return Err(MultisigError::InvalidRequest(format!(
                        "amount {} to {} is below the dust threshold of {}",
                        receiver.value, receiver.address, self.dust_threshold
                    )));
                }
                let address = Address::from_str(&receiver.address)
                    .map_err(|e| {
                        MultisigError::InvalidRequest(format!("{}: {}", receiver.address, e))
                    })?
                    .require_network(network)
                    .map_err(|e| {
                        MultisigError::InvalidRequest(format!("{}: {}", receiver.address, e))
                    })?;
                Ok(SpendOutput::new(&address, receiver.value))
            })
            .collect()
    }

    /// Select inputs and build outputs for `request`
    ///
    /// `allocate_change` is called at most once, and only when the change is
    /// at least the dust threshold. It must return a fresh change address.
    ///
    /// Accumulation stops once the inputs cover the receivers plus the fee of
    /// a spend with change. A snapshot that runs out before that point is
    /// still accepted when it covers the fee of a spend without change; the
    /// remainder then goes to the miner.
    ///
    /// # Errors
    /// `InsufficientFunds` when the snapshot cannot cover receivers plus fee,
    /// `InvalidRequest` when amounts sum past `MAX_MONEY`,
    /// `AddressMismatch` when a selected UTXO's recorded address differs from
    /// the one derived for its slot
    pub fn plan<F>(
        &self,
        request: &SpendRequest,
        utxos: &[Utxo],
        allocate_change: F,
    ) -> Result<SpendPlan, MultisigError>
    where
        F: FnOnce() -> Result<AddressInfo, MultisigError>,
    {
        let mut outputs = self.validate(request)?;
        let to_send = total_value(outputs.iter().map(|o| o.value))?;

        let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| !u.spent).collect();
        if self.order == SelectionOrder::LargestFirst {
            candidates.sort_by(|a, b| b.value.cmp(&a.value));
        }

        let available = total_value(candidates.iter().map(|u| u.value))?;
        if available < to_send {
            log::info!("Insufficient funds: have {}, sending {}", available, to_send);
            return Err(MultisigError::InsufficientFunds {
                have: available,
                need: to_send,
            });
        }

        let kind = ScriptKind::P2wsh(self.deriver.shape()?);
        let receiver_count = outputs.len();

        let mut inputs: Vec<PlannedInput> = Vec::new();
        let mut input_value = 0u64;
        let mut fee = 0u64;

        for utxo in candidates {
            let derived = self
                .deriver
                .derive_address(utxo.address_index, utxo.is_change)?;
            if derived.address != utxo.address {
                log::error!(
                    "Address mismatch for {}: slot {}/{} derives {}, ledger has {}",
                    utxo.outpoint_string(),
                    utxo.is_change as u8,
                    utxo.address_index,
                    derived.address,
                    utxo.address
                );
                return Err(MultisigError::AddressMismatch {
                    outpoint: utxo.outpoint_string(),
                    derived: derived.address,
                    recorded: utxo.address.clone(),
                });
            }

            input_value = total_value([input_value, utxo.value])?;
            inputs.push(PlannedInput {
                utxo: utxo.clone(),
                address: derived,
            });

            // Assume a change output while accumulating
            fee = estimate_fee(
                inputs.len(),
                receiver_count + 1,
                request.fee_rate,
                kind,
                kind,
                None,
            );
            if input_value >= to_send.saturating_add(fee) {
                break;
            }
        }

        let change = if input_value >= to_send.saturating_add(fee) {
            input_value - to_send - fee
        } else {
            let bare_fee = estimate_fee(
                inputs.len(),
                receiver_count,
                request.fee_rate,
                kind,
                kind,
                None,
            );
            let need = to_send.saturating_add(bare_fee);
            if input_value < need {
                log::info!(
                    "Insufficient funds: have {}, need {} including fee",
                    input_value,
                    need
                );
                return Err(MultisigError::InsufficientFunds {
                    have: input_value,
                    need,
                });
            }
            0
        };

        let mut change_index = None;
        if change >= self.dust_threshold {
            let change_address = allocate_change()?;
            change_index = Some(change_address.address_index);
            outputs.push(SpendOutput {
                address: change_address.address,
                script_pubkey: change_address.script_pubkey,
                value: change,
            });
        } else {
            // Dust goes to the miner
            fee = input_value - to_send;
        }

        log::debug!(
            "Planned spend: {} inputs, {} outputs, fee {}",
            inputs.len(),
            outputs.len(),
            fee
        );

        Ok(SpendPlan {
            inputs,
            outputs,
            fee,
            total_spent: to_send + fee,
            change_index,
        })
    }
}

fn total_value(values: impl IntoIterator<Item = u64>) -> Result<u64, MultisigError> {
    checked_total(values).map_err(|_| {
        MultisigError::InvalidRequest("amounts exceed the money supply".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derivation::tests::{participant_xpub, test_engine};
    use crate::keys::KeyDerivationEngine;

    const RECEIVER: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    fn deriver(engine: &KeyDerivationEngine) -> AddressDeriver<'_> {
        AddressDeriver::new(engine, 0, 2, &[participant_xpub(1)]).unwrap()
    }

    fn utxo_at(deriver: &AddressDeriver, index: u32, vout: u32, value: u64) -> Utxo {
        Utxo {
            txid: format!("{:02x}", vout).repeat(32),
            vout,
            value,
            address: deriver.derive_address(index, false).unwrap().address,
            address_index: index,
            is_change: false,
            confirmed: true,
            spent: false,
        }
    }

    fn request(value: u64, rate: u64) -> SpendRequest {
        SpendRequest {
            receivers: vec![Receiver {
                address: RECEIVER.to_string(),
                value,
            }],
            fee_rate: FeeRate::from_sat_per_vbyte(rate),
        }
    }

    #[test]
    fn test_spend_with_change() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);
        let utxos = vec![utxo_at(&deriver, 0, 0, 1_000_000)];

        let plan = planner
            .plan(&request(500_000, 10), &utxos, || deriver.derive_address(0, true))
            .unwrap();

        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.outputs.len(), 2);
        assert!(plan.fee > 0 && plan.fee < 100_000);
        assert_eq!(plan.change_index, Some(0));
        assert_eq!(plan.total_spent, 500_000 + plan.fee);

        // Conservation
        assert_eq!(plan.output_value() + plan.fee, plan.input_value());

        // Fee is the estimate for the final shape
        let kind = ScriptKind::P2wsh(deriver.shape().unwrap());
        let expected = estimate_fee(1, 2, FeeRate::from_sat_per_vbyte(10), kind, kind, None);
        assert_eq!(plan.fee, expected);
    }

    #[test]
    fn test_accumulates_until_covered() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);
        let utxos = vec![
            utxo_at(&deriver, 0, 0, 3_000),
            utxo_at(&deriver, 1, 1, 3_000),
            utxo_at(&deriver, 2, 2, 50_000),
            utxo_at(&deriver, 3, 3, 50_000),
        ];

        let plan = planner
            .plan(&request(10_000, 2), &utxos, || deriver.derive_address(0, true))
            .unwrap();
        assert_eq!(plan.inputs.len(), 3);
        assert_eq!(plan.output_value() + plan.fee, plan.input_value());
    }

    #[test]
    fn test_insufficient_snapshot() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);
        let utxos = vec![utxo_at(&deriver, 0, 0, 1_000), utxo_at(&deriver, 0, 1, 1_000)];

        let result = planner.plan(&request(100_000_000, 10), &utxos, || {
            deriver.derive_address(0, true)
        });
        assert!(matches!(
            result,
            Err(MultisigError::InsufficientFunds {
                have: 2_000,
                need: 100_000_000
            })
        ));
    }

    #[test]
    fn test_insufficient_after_fee() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);
        let utxos = vec![utxo_at(&deriver, 0, 0, 10_000)];

        let result = planner.plan(&request(10_000, 5), &utxos, || deriver.derive_address(0, true));
        match result {
            Err(MultisigError::InsufficientFunds { have, need }) => {
                assert_eq!(have, 10_000);
                assert!(need > 10_000);
            }
            other => panic!("expected InsufficientFunds, got {:?}", other),
        }
    }

    #[test]
    fn test_dust_change_goes_to_fee() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let kind = ScriptKind::P2wsh(deriver.shape().unwrap());
        let estimate = estimate_fee(1, 2, FeeRate::from_sat_per_vbyte(3), kind, kind, None);
        let utxos = vec![utxo_at(&deriver, 0, 0, 20_000 + estimate + 300)];

        let plan = planner
            .plan(&request(20_000, 3), &utxos, || {
                panic!("no change address should be requested")
            })
            .unwrap();

        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.change_index, None);
        assert_eq!(plan.fee, estimate + 300);
        assert_eq!(plan.output_value() + plan.fee, plan.input_value());
    }

    #[test]
    fn test_exhausted_snapshot_spends_without_change() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let rate = FeeRate::from_sat_per_vbyte(10);
        let kind = ScriptKind::P2wsh(deriver.shape().unwrap());
        let bare = estimate_fee(1, 1, rate, kind, kind, None);
        let with_change = estimate_fee(1, 2, rate, kind, kind, None);
        assert!(bare + 100 < with_change);

        let value = 100_000 + bare + 100;
        let utxos = vec![utxo_at(&deriver, 0, 0, value)];

        let plan = planner
            .plan(&request(100_000, 10), &utxos, || {
                panic!("no change address should be requested")
            })
            .unwrap();
        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.change_index, None);
        assert_eq!(plan.fee, value - 100_000);
        assert_eq!(plan.total_spent, value);

        // One satoshi short of the bare fee still fails
        let utxos = vec![utxo_at(&deriver, 0, 0, 100_000 + bare - 1)];
        let result = planner.plan(&request(100_000, 10), &utxos, || {
            deriver.derive_address(0, true)
        });
        assert!(matches!(
            result,
            Err(MultisigError::InsufficientFunds { need, .. }) if need == 100_000 + bare
        ));
    }

    #[test]
    fn test_oversized_amounts_rejected() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let half = u64::MAX / 2 + 1;
        let huge = SpendRequest {
            receivers: vec![
                Receiver {
                    address: RECEIVER.to_string(),
                    value: half,
                },
                Receiver {
                    address: RECEIVER.to_string(),
                    value: half,
                },
            ],
            fee_rate: FeeRate::from_sat_per_vbyte(1),
        };
        let result = planner.plan(&huge, &[], || deriver.derive_address(0, true));
        assert!(matches!(result, Err(MultisigError::InvalidRequest(_))));

        // Each value is legal, the sum is not
        let max = Amount::MAX_MONEY.to_sat();
        let over = SpendRequest {
            receivers: vec![
                Receiver {
                    address: RECEIVER.to_string(),
                    value: max,
                },
                Receiver {
                    address: RECEIVER.to_string(),
                    value: max,
                },
            ],
            fee_rate: FeeRate::from_sat_per_vbyte(1),
        };
        assert_eq!(planner.validate(&over).unwrap().len(), 2);
        let result = planner.plan(&over, &[], || deriver.derive_address(0, true));
        assert!(matches!(result, Err(MultisigError::InvalidRequest(_))));

        // A corrupt ledger value cannot wrap the snapshot total
        let utxos = vec![
            utxo_at(&deriver, 0, 0, u64::MAX),
            utxo_at(&deriver, 1, 1, 1),
        ];
        let result = planner.plan(&request(10_000, 1), &utxos, || {
            deriver.derive_address(0, true)
        });
        assert!(matches!(result, Err(MultisigError::InvalidRequest(_))));
    }

    #[test]
    fn test_address_mismatch_is_fatal() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let mut utxo = utxo_at(&deriver, 0, 0, 100_000);
        utxo.address_index = 1;

        let result = planner.plan(&request(10_000, 1), &[utxo], || deriver.derive_address(0, true));
        assert!(matches!(result, Err(MultisigError::AddressMismatch { .. })));
    }

    #[test]
    fn test_spent_outputs_skipped() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let mut spent = utxo_at(&deriver, 0, 0, 500_000);
        spent.spent = true;
        let utxos = vec![spent, utxo_at(&deriver, 1, 1, 100_000)];

        let plan = planner
            .plan(&request(50_000, 1), &utxos, || deriver.derive_address(0, true))
            .unwrap();
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.inputs[0].utxo.vout, 1);
    }

    #[test]
    fn test_selection_order() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let utxos = vec![
            utxo_at(&deriver, 0, 0, 20_000),
            utxo_at(&deriver, 1, 1, 1_000_000),
        ];

        let snapshot = SpendPlanner::new(&deriver)
            .plan(&request(5_000, 1), &utxos, || deriver.derive_address(0, true))
            .unwrap();
        assert_eq!(snapshot.inputs[0].utxo.value, 20_000);

        let largest = SpendPlanner::new(&deriver)
            .with_order(SelectionOrder::LargestFirst)
            .plan(&request(5_000, 1), &utxos, || deriver.derive_address(0, true))
            .unwrap();
        assert_eq!(largest.inputs[0].utxo.value, 1_000_000);
    }

    #[test]
    fn test_request_validation() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);

        let empty = SpendRequest {
            receivers: Vec::new(),
            fee_rate: FeeRate::default(),
        };
        assert!(matches!(planner.validate(&empty), Err(MultisigError::EmptyOutputs)));

        assert!(matches!(
            planner.validate(&request(545, 1)),
            Err(MultisigError::InvalidRequest(_))
        ));
        assert!(matches!(
            planner.validate(&request(10_000, 0)),
            Err(MultisigError::InvalidRequest(_))
        ));

        let mainnet = SpendRequest {
            receivers: vec![Receiver {
                address: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
                value: 10_000,
            }],
            fee_rate: FeeRate::default(),
        };
        assert!(matches!(
            planner.validate(&mainnet),
            Err(MultisigError::InvalidRequest(_))
        ));

        assert_eq!(planner.validate(&request(546, 1)).unwrap().len(), 1);
    }

    #[test]
    fn test_spend_inputs_carry_scripts() {
        let engine = test_engine();
        let deriver = deriver(&engine);
        let planner = SpendPlanner::new(&deriver);
        let utxos = vec![utxo_at(&deriver, 4, 0, 100_000)];

        let plan = planner
            .plan(&request(10_000, 1), &utxos, || deriver.derive_address(0, true))
            .unwrap();
        let inputs = plan.spend_inputs().unwrap();
        assert_eq!(inputs[0].value, 100_000);
        assert_eq!(inputs[0].key_origins.len(), 2);
        assert!(inputs[0].script_pubkey.is_p2wsh());
    }
}
