//! Custody ledger
//!
//! The ledger keeps wallets, provisioned addresses, the UTXO snapshot and
//! unsigned transactions. [`LedgerStore`] is the seam the manager talks to;
//! [`MemoryLedger`] is the in-process implementation that
//! [`Storage`](super::Storage) persists to disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::StorageError;
use crate::keys::MAX_INDEX;
use crate::multisig::transaction::UnsignedTransaction;
use crate::multisig::wallet::{AddressRecord, Wallet};
use crate::wallet::Utxo;

/// Persistence contract for the custody engine
///
/// Implementations must make `allocate_address_indices`,
/// `insert_unsigned_tx` and `update_unsigned_tx` atomic: two concurrent
/// callers never receive the same index, two stored transactions that hold
/// their inputs never share one, and an update whose `expected_version` is
/// stale is rejected.
pub trait LedgerStore: Send + Sync {
    /// Reserve the next unused server account id
    fn reserve_account_id(&self) -> Result<u32, StorageError>;

    fn insert_wallet(&self, wallet: Wallet) -> Result<(), StorageError>;
    fn wallet(&self, wallet_id: &str) -> Result<Wallet, StorageError>;
    fn wallets(&self) -> Result<Vec<Wallet>, StorageError>;

    /// Reserve `count` fresh indices on the receive or change branch
    fn allocate_address_indices(
        &self,
        wallet_id: &str,
        is_change: bool,
        count: u32,
    ) -> Result<Range<u32>, StorageError>;
    fn insert_addresses(&self, records: Vec<AddressRecord>) -> Result<(), StorageError>;
    fn addresses(&self, wallet_id: &str) -> Result<Vec<AddressRecord>, StorageError>;
    fn find_address(&self, address: &str) -> Result<Option<AddressRecord>, StorageError>;
    fn mark_address_used(&self, address: &str) -> Result<(), StorageError>;

    /// Insert or refresh a UTXO. Returns `true` when it was not known before.
    fn upsert_utxo(&self, wallet_id: &str, utxo: Utxo) -> Result<bool, StorageError>;
    /// Unspent outputs in the order they were first recorded
    fn unspent_utxos(&self, wallet_id: &str) -> Result<Vec<Utxo>, StorageError>;
    fn mark_utxos_spent(
        &self,
        wallet_id: &str,
        outpoints: &[(String, u32)],
    ) -> Result<(), StorageError>;

    /// Store a new transaction. Rejected with `InputsReserved` when one of
    /// its inputs is held by a stored transaction that is not cancelled.
    fn insert_unsigned_tx(&self, tx: UnsignedTransaction) -> Result<(), StorageError>;
    fn unsigned_tx(&self, tx_id: &str) -> Result<UnsignedTransaction, StorageError>;
    fn unsigned_txs(&self, wallet_id: &str) -> Result<Vec<UnsignedTransaction>, StorageError>;

    /// Replace a stored transaction if its version still equals
    /// `expected_version`; the stored copy gets `expected_version + 1`
    fn update_unsigned_tx(
        &self,
        tx: UnsignedTransaction,
        expected_version: u64,
    ) -> Result<UnsignedTransaction, StorageError>;
}

/// Next free index per branch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressCursor {
    pub receive: u32,
    pub change: u32,
}

/// Serializable contents of the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub next_account_id: u32,
    pub wallets: BTreeMap<String, Wallet>,
    pub cursors: BTreeMap<String, AddressCursor>,
    pub addresses: BTreeMap<String, Vec<AddressRecord>>,
    pub utxos: BTreeMap<String, Vec<Utxo>>,
    pub unsigned_txs: BTreeMap<String, UnsignedTransaction>,
}

/// In-memory ledger guarded by a single lock
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LedgerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current contents, for persistence
    pub fn snapshot(&self) -> Result<LedgerState, StorageError> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, StorageError> {
        self.state.read().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, StorageError> {
        self.state.write().map_err(|_| StorageError::Poisoned)
    }
}

impl LedgerStore for MemoryLedger {
    fn reserve_account_id(&self) -> Result<u32, StorageError> {
        let mut state = self.write()?;
        let id = state.next_account_id;
        if id > MAX_INDEX {
            return Err(StorageError::InvalidData(
                "server account ids exhausted".to_string(),
            ));
        }
        state.next_account_id += 1;
        Ok(id)
    }

    fn insert_wallet(&self, wallet: Wallet) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.wallets.contains_key(&wallet.id) {
            return Err(StorageError::Duplicate(format!("wallet {}", wallet.id)));
        }
        state.cursors.insert(wallet.id.clone(), AddressCursor::default());
        state.wallets.insert(wallet.id.clone(), wallet);
        Ok(())
    }

    fn wallet(&self, wallet_id: &str) -> Result<Wallet, StorageError> {
        self.read()?
            .wallets
            .get(wallet_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("wallet {}", wallet_id)))
    }

    fn wallets(&self) -> Result<Vec<Wallet>, StorageError> {
        Ok(self.read()?.wallets.values().cloned().collect())
    }

    fn allocate_address_indices(
        &self,
        wallet_id: &str,
        is_change: bool,
        count: u32,
    ) -> Result<Range<u32>, StorageError> {
        let mut state = self.write()?;
        let cursor = state
            .cursors
            .get_mut(wallet_id)
            .ok_or_else(|| StorageError::NotFound(format!("wallet {}", wallet_id)))?;

        let next = if is_change {
            &mut cursor.change
        } else {
            &mut cursor.receive
        };
        let start = *next;
        let end = start as u64 + count as u64;
        if end > MAX_INDEX as u64 + 1 {
            return Err(StorageError::InvalidData(format!(
                "address indices exhausted for wallet {}",
                wallet_id
            )));
        }
        *next = end as u32;
        Ok(start..end as u32)
    }

    fn insert_addresses(&self, records: Vec<AddressRecord>) -> Result<(), StorageError> {
        let mut state = self.write()?;
        for record in records {
            let list = state.addresses.entry(record.wallet_id.clone()).or_default();
            if list.iter().any(|r| r.address == record.address) {
                return Err(StorageError::Duplicate(format!("address {}", record.address)));
            }
            list.push(record);
        }
        Ok(())
    }

    fn addresses(&self, wallet_id: &str) -> Result<Vec<AddressRecord>, StorageError> {
        Ok(self
            .read()?
            .addresses
            .get(wallet_id)
            .cloned()
            .unwrap_or_default())
    }

    fn find_address(&self, address: &str) -> Result<Option<AddressRecord>, StorageError> {
        Ok(self
            .read()?
            .addresses
            .values()
            .flatten()
            .find(|r| r.address == address)
            .cloned())
    }

    fn mark_address_used(&self, address: &str) -> Result<(), StorageError> {
        let mut state = self.write()?;
        let record = state
            .addresses
            .values_mut()
            .flatten()
            .find(|r| r.address == address)
            .ok_or_else(|| StorageError::NotFound(format!("address {}", address)))?;
        record.used = true;
        Ok(())
    }

    fn upsert_utxo(&self, wallet_id: &str, utxo: Utxo) -> Result<bool, StorageError> {
        let mut state = self.write()?;
        let list = state.utxos.entry(wallet_id.to_string()).or_default();
        match list
            .iter_mut()
            .find(|u| u.txid == utxo.txid && u.vout == utxo.vout)
        {
            Some(existing) => {
                // Confirmation status may change; spent flag is ours
                existing.confirmed = utxo.confirmed;
                Ok(false)
            }
            None => {
                list.push(utxo);
                Ok(true)
            }
        }
    }

    fn unspent_utxos(&self, wallet_id: &str) -> Result<Vec<Utxo>, StorageError> {
        Ok(self
            .read()?
            .utxos
            .get(wallet_id)
            .map(|list| list.iter().filter(|u| !u.spent).cloned().collect())
            .unwrap_or_default())
    }

    fn mark_utxos_spent(
        &self,
        wallet_id: &str,
        outpoints: &[(String, u32)],
    ) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if let Some(list) = state.utxos.get_mut(wallet_id) {
            for utxo in list.iter_mut() {
                if outpoints
                    .iter()
                    .any(|(txid, vout)| *txid == utxo.txid && *vout == utxo.vout)
                {
                    utxo.spent = true;
                }
            }
        }
        Ok(())
    }

    fn insert_unsigned_tx(&self, tx: UnsignedTransaction) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.unsigned_txs.contains_key(&tx.id) {
            return Err(StorageError::Duplicate(format!("transaction {}", tx.id)));
        }
        let holder = state
            .unsigned_txs
            .values()
            .filter(|open| open.status.reserves_inputs())
            .find_map(|open| {
                tx.inputs
                    .iter()
                    .find(|input| open.inputs.contains(input))
                    .map(|input| (input.clone(), open.id.clone()))
            });
        if let Some((outpoint, tx_id)) = holder {
            return Err(StorageError::InputsReserved { outpoint, tx_id });
        }
        state.unsigned_txs.insert(tx.id.clone(), tx);
        Ok(())
    }

    fn unsigned_tx(&self, tx_id: &str) -> Result<UnsignedTransaction, StorageError> {
        self.read()?
            .unsigned_txs
            .get(tx_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", tx_id)))
    }

    fn unsigned_txs(&self, wallet_id: &str) -> Result<Vec<UnsignedTransaction>, StorageError> {
        let state = self.read()?;
        let mut txs: Vec<UnsignedTransaction> = state
            .unsigned_txs
            .values()
            .filter(|tx| tx.wallet_id == wallet_id)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }

    fn update_unsigned_tx(
        &self,
        mut tx: UnsignedTransaction,
        expected_version: u64,
    ) -> Result<UnsignedTransaction, StorageError> {
        let mut state = self.write()?;
        let stored = state
            .unsigned_txs
            .get_mut(&tx.id)
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", tx.id)))?;

        if stored.version != expected_version {
            return Err(StorageError::VersionConflict {
                id: tx.id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }

        tx.version = expected_version + 1;
        *stored = tx.clone();
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::transaction::TxStatus;
    use chrono::Utc;

    fn wallet(id: &str) -> Wallet {
        Wallet {
            id: id.to_string(),
            name: "test".to_string(),
            m: 2,
            n: 2,
            account_id: 0,
            chain: "bitcoin".to_string(),
            descriptor: String::new(),
            server_signers: 1,
            server_derivation_path: "m/48'/1'/0'/2'".to_string(),
            participants: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn utxo(txid: &str, vout: u32, value: u64) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            vout,
            value,
            address: "tb1qexample".to_string(),
            address_index: 0,
            is_change: false,
            confirmed: false,
            spent: false,
        }
    }

    #[test]
    fn test_account_ids_are_unique() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.reserve_account_id().unwrap(), 0);
        assert_eq!(ledger.reserve_account_id().unwrap(), 1);
        assert_eq!(ledger.reserve_account_id().unwrap(), 2);
    }

    #[test]
    fn test_wallet_insert_and_lookup() {
        let ledger = MemoryLedger::new();
        ledger.insert_wallet(wallet("w1")).unwrap();
        assert_eq!(ledger.wallet("w1").unwrap().id, "w1");
        assert!(matches!(ledger.wallet("w2"), Err(StorageError::NotFound(_))));
        assert!(matches!(
            ledger.insert_wallet(wallet("w1")),
            Err(StorageError::Duplicate(_))
        ));
    }

    #[test]
    fn test_index_allocation_per_branch() {
        let ledger = MemoryLedger::new();
        ledger.insert_wallet(wallet("w1")).unwrap();

        assert_eq!(ledger.allocate_address_indices("w1", false, 3).unwrap(), 0..3);
        assert_eq!(ledger.allocate_address_indices("w1", false, 2).unwrap(), 3..5);
        assert_eq!(ledger.allocate_address_indices("w1", true, 1).unwrap(), 0..1);
        assert!(ledger.allocate_address_indices("nope", false, 1).is_err());
    }

    #[test]
    fn test_index_allocation_is_serialized() {
        let ledger = std::sync::Arc::new(MemoryLedger::new());
        ledger.insert_wallet(wallet("w1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.allocate_address_indices("w1", false, 1).unwrap())
            })
            .collect();

        let mut starts: Vec<u32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().start)
            .collect();
        starts.sort();
        assert_eq!(starts, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_utxo_snapshot_order_and_spending() {
        let ledger = MemoryLedger::new();
        assert!(ledger.upsert_utxo("w1", utxo("bb", 0, 500)).unwrap());
        assert!(ledger.upsert_utxo("w1", utxo("aa", 1, 700)).unwrap());

        let mut refreshed = utxo("bb", 0, 500);
        refreshed.confirmed = true;
        assert!(!ledger.upsert_utxo("w1", refreshed).unwrap());

        let unspent = ledger.unspent_utxos("w1").unwrap();
        assert_eq!(unspent.len(), 2);
        assert_eq!(unspent[0].txid, "bb");
        assert!(unspent[0].confirmed);

        ledger
            .mark_utxos_spent("w1", &[("bb".to_string(), 0)])
            .unwrap();
        let unspent = ledger.unspent_utxos("w1").unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].txid, "aa");
    }

    #[test]
    fn test_address_records() {
        let ledger = MemoryLedger::new();
        let record = AddressRecord {
            wallet_id: "w1".to_string(),
            address_index: 0,
            is_change: false,
            address: "tb1qexample".to_string(),
            witness_script: String::new(),
            script_pubkey: String::new(),
            handed_out: true,
            used: false,
        };
        ledger.insert_addresses(vec![record.clone()]).unwrap();
        assert!(ledger.insert_addresses(vec![record]).is_err());

        ledger.mark_address_used("tb1qexample").unwrap();
        let found = ledger.find_address("tb1qexample").unwrap().unwrap();
        assert!(found.used);
        assert!(ledger.find_address("tb1qother").unwrap().is_none());
        assert_eq!(ledger.addresses("w1").unwrap().len(), 1);
    }

    fn unsigned_tx(id: &str) -> UnsignedTransaction {
        spending(id, &[0])
    }

    fn spending(id: &str, vouts: &[u32]) -> UnsignedTransaction {
        let now = Utc::now();
        UnsignedTransaction {
            id: id.to_string(),
            wallet_id: "w1".to_string(),
            psbt: String::new(),
            txid: "ab".repeat(32),
            inputs: vouts
                .iter()
                .map(|vout| format!("{}:{}", "cd".repeat(32), vout))
                .collect(),
            outputs: Vec::new(),
            fee_per_byte: 1,
            fee: 200,
            total_spent: 10_200,
            initiated_by: "alice".to_string(),
            signatures_count: 0,
            status: TxStatus::Created,
            partial_signatures: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_unsigned_tx_versioning() {
        let ledger = MemoryLedger::new();
        ledger.insert_unsigned_tx(unsigned_tx("t1")).unwrap();
        assert!(matches!(
            ledger.insert_unsigned_tx(unsigned_tx("t1")),
            Err(StorageError::Duplicate(_))
        ));

        let first = ledger.unsigned_tx("t1").unwrap();
        let mut signed = first.clone();
        signed.status = TxStatus::PartiallySigned;
        let stored = ledger.update_unsigned_tx(signed, first.version).unwrap();
        assert_eq!(stored.version, 1);

        // A writer still holding version 0 loses
        let mut cancelled = first.clone();
        cancelled.status = TxStatus::Cancelled;
        assert!(matches!(
            ledger.update_unsigned_tx(cancelled, first.version),
            Err(StorageError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            })
        ));
        assert_eq!(
            ledger.unsigned_tx("t1").unwrap().status,
            TxStatus::PartiallySigned
        );
        assert_eq!(ledger.unsigned_txs("w1").unwrap().len(), 1);
        assert!(ledger.unsigned_txs("w2").unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_inputs_rejected() {
        let ledger = MemoryLedger::new();
        ledger.insert_unsigned_tx(spending("t1", &[0, 1])).unwrap();

        let err = ledger.insert_unsigned_tx(spending("t2", &[1, 2])).unwrap_err();
        match err {
            StorageError::InputsReserved { outpoint, tx_id } => {
                assert_eq!(outpoint, format!("{}:1", "cd".repeat(32)));
                assert_eq!(tx_id, "t1");
            }
            other => panic!("expected InputsReserved, got {:?}", other),
        }
        assert!(matches!(
            ledger.unsigned_tx("t2"),
            Err(StorageError::NotFound(_))
        ));

        // Disjoint inputs are fine
        ledger.insert_unsigned_tx(spending("t3", &[2])).unwrap();

        // Broadcast transactions keep holding their inputs
        let t3 = ledger.unsigned_tx("t3").unwrap();
        let mut sent = t3.clone();
        sent.status = TxStatus::Broadcasted;
        ledger.update_unsigned_tx(sent, t3.version).unwrap();
        assert!(ledger.insert_unsigned_tx(spending("t4", &[2])).is_err());

        // Cancelling releases them
        let t1 = ledger.unsigned_tx("t1").unwrap();
        let mut cancelled = t1.clone();
        cancelled.status = TxStatus::Cancelled;
        ledger.update_unsigned_tx(cancelled, t1.version).unwrap();
        ledger.insert_unsigned_tx(spending("t2", &[1])).unwrap();
    }

    #[test]
    fn test_concurrent_conflicting_inserts() {
        let ledger = std::sync::Arc::new(MemoryLedger::new());
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.insert_unsigned_tx(spending(&format!("t{}", i), &[7]))
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(ledger.unsigned_txs("w1").unwrap().len(), 1);
    }
}
