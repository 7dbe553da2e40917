//! Multi-signature wallet and transaction manager
//!
//! Coordinates key derivation, address provisioning, spend planning and the
//! signing state machine on top of a [`LedgerStore`].

use bitcoin::OutPoint;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::chain::ChainDataProvider;
use crate::core::fee::{FeeRate, Priority};
use crate::core::transaction::build_unsigned_psbt;
use crate::keys::{check_address_index, KeyDerivationEngine};
use crate::multisig::script::{wallet_descriptor, AddressDeriver, AddressInfo, WalletDescriptor};
use crate::multisig::transaction::{
    FinalizedTransaction, ServerKeyLookup, ServerSignOutcome, SignatureShare, SubmitOutcome,
    TxStatus, UnsignedTransaction,
};
use crate::multisig::wallet::{AddressRecord, MultisigError, Wallet, WalletConfig, SERVER_SIGNERS};
use crate::storage::{LedgerStore, MemoryLedger, StorageError};
use crate::wallet::{SelectionOrder, SpendPlanner, SpendRequest, Utxo};

/// Most addresses handed out by a single request
pub const MAX_ADDRESS_BATCH: u32 = 1000;

/// Manager for multisig wallets and unsigned transactions
#[derive(Debug)]
pub struct MultisigManager<S: LedgerStore = MemoryLedger> {
    engine: KeyDerivationEngine,
    store: S,
}

impl<S: LedgerStore> MultisigManager<S> {
    pub fn new(engine: KeyDerivationEngine, store: S) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &KeyDerivationEngine {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // =========================================================================
    // Wallets
    // =========================================================================

    /// Create a new multisig wallet on a freshly reserved server account
    pub fn create_wallet(&self, config: WalletConfig) -> Result<Wallet, MultisigError> {
        let account_id = self.store.reserve_account_id()?;
        let descriptor = wallet_descriptor(&self.engine, account_id, config.m, &config.participants)?;

        // Generate unique ID from the policy
        let now = Utc::now();
        let id_data = format!(
            "{}{}{}",
            config.name,
            descriptor.descriptor,
            now.timestamp_nanos_opt().unwrap_or(0)
        );
        let id = hex::encode(&Sha256::digest(id_data.as_bytes())[..16]);

        let wallet = Wallet {
            id,
            name: config.name.clone(),
            m: config.m,
            n: config.n,
            account_id,
            chain: self.engine.network().to_string(),
            descriptor: descriptor.descriptor,
            server_signers: SERVER_SIGNERS,
            server_derivation_path: descriptor.server_path,
            participants: config.participants,
            created_at: now,
        };

        self.store.insert_wallet(wallet.clone())?;
        log::info!(
            "Created {} wallet {} ({}) on account {}",
            wallet.description(),
            wallet.id,
            wallet.name,
            account_id
        );
        Ok(wallet)
    }

    /// Get a wallet by ID
    pub fn get_wallet(&self, wallet_id: &str) -> Result<Wallet, MultisigError> {
        self.store
            .wallet(wallet_id)
            .map_err(|e| wallet_missing(e, wallet_id))
    }

    /// List all wallets
    pub fn list_wallets(&self) -> Result<Vec<Wallet>, MultisigError> {
        Ok(self.store.wallets()?)
    }

    /// Descriptor for importing the wallet into watch-only software
    pub fn wallet_descriptor(&self, wallet_id: &str) -> Result<WalletDescriptor, MultisigError> {
        let wallet = self.get_wallet(wallet_id)?;
        wallet_descriptor(&self.engine, wallet.account_id, wallet.m, &wallet.participants)
    }

    // =========================================================================
    // Addresses and UTXOs
    // =========================================================================

    /// Allocate, derive and persist `count` fresh addresses
    pub fn handout_addresses(
        &self,
        wallet_id: &str,
        count: u32,
        is_change: bool,
    ) -> Result<Vec<AddressInfo>, MultisigError> {
        if count == 0 || count > MAX_ADDRESS_BATCH {
            return Err(MultisigError::InvalidRequest(format!(
                "address count must be between 1 and {}, got {}",
                MAX_ADDRESS_BATCH, count
            )));
        }

        let wallet = self.get_wallet(wallet_id)?;
        let deriver = AddressDeriver::for_wallet(&self.engine, &wallet)?;

        let range = self
            .store
            .allocate_address_indices(wallet_id, is_change, count)
            .map_err(|e| wallet_missing(e, wallet_id))?;
        let infos = deriver.derive_address_range(range.start, count, is_change)?;

        let records = infos
            .iter()
            .map(|info| AddressRecord {
                handed_out: true,
                ..info.to_record(wallet_id)
            })
            .collect();
        self.store.insert_addresses(records)?;

        log::debug!(
            "Handed out {} {} addresses for {} starting at {}",
            count,
            if is_change { "change" } else { "receive" },
            wallet_id,
            range.start
        );
        Ok(infos)
    }

    /// Persisted addresses of a wallet
    pub fn list_addresses(&self, wallet_id: &str) -> Result<Vec<AddressRecord>, MultisigError> {
        self.get_wallet(wallet_id)?;
        Ok(self.store.addresses(wallet_id)?)
    }

    /// Register an output paying one of the wallet's addresses
    ///
    /// The address must have been provisioned for `wallet_id`, and the slot
    /// it was recorded under must still derive to the same address.
    /// Returns `true` when the output was not known before.
    pub fn record_incoming_output(
        &self,
        wallet_id: &str,
        address: &str,
        txid: &str,
        vout: u32,
        value: u64,
        confirmed: bool,
    ) -> Result<bool, MultisigError> {
        let wallet = self.get_wallet(wallet_id)?;
        let record = self
            .store
            .find_address(address)?
            .filter(|r| r.wallet_id == wallet_id)
            .ok_or_else(|| {
                MultisigError::InvalidRequest(format!(
                    "{} is not an address of wallet {}",
                    address, wallet_id
                ))
            })?;

        let deriver = AddressDeriver::for_wallet(&self.engine, &wallet)?;
        let derived = deriver.derive_address(record.address_index, record.is_change)?;
        let utxo = Utxo {
            txid: txid.to_string(),
            vout,
            value,
            address: address.to_string(),
            address_index: record.address_index,
            is_change: record.is_change,
            confirmed,
            spent: false,
        };
        if derived.address != record.address {
            log::error!(
                "Recorded address {} does not match derived {} for {}",
                record.address,
                derived.address,
                utxo.outpoint_string()
            );
            return Err(MultisigError::AddressMismatch {
                outpoint: utxo.outpoint_string(),
                derived: derived.address,
                recorded: record.address,
            });
        }

        let is_new = self.store.upsert_utxo(wallet_id, utxo)?;
        if is_new {
            self.store.mark_address_used(address)?;
            log::info!("Recorded {} sats to {} ({}:{})", value, address, txid, vout);
        }
        Ok(is_new)
    }

    /// Pull unspent outputs of every provisioned address from the chain
    ///
    /// Returns the number of outputs seen for the first time.
    pub fn sync_utxos(
        &self,
        wallet_id: &str,
        provider: &dyn ChainDataProvider,
    ) -> Result<usize, MultisigError> {
        let mut added = 0;
        for record in self.list_addresses(wallet_id)? {
            for utxo in provider.address_utxos(&record.address)? {
                if self.record_incoming_output(
                    wallet_id,
                    &record.address,
                    &utxo.txid,
                    utxo.vout,
                    utxo.value,
                    utxo.confirmed,
                )? {
                    added += 1;
                }
            }
        }
        log::debug!("Synced {}: {} new outputs", wallet_id, added);
        Ok(added)
    }

    /// Unspent outputs not committed to an open transaction
    pub fn spendable_utxos(&self, wallet_id: &str) -> Result<Vec<Utxo>, MultisigError> {
        self.get_wallet(wallet_id)?;
        let reserved: HashSet<String> = self
            .store
            .unsigned_txs(wallet_id)?
            .into_iter()
            .filter(|tx| tx.status.reserves_inputs())
            .flat_map(|tx| tx.inputs)
            .collect();

        Ok(self
            .store
            .unspent_utxos(wallet_id)?
            .into_iter()
            .filter(|u| !reserved.contains(&u.outpoint_string()))
            .collect())
    }

    /// Sum of spendable outputs
    pub fn balance(&self, wallet_id: &str) -> Result<u64, MultisigError> {
        Ok(self.spendable_utxos(wallet_id)?.iter().map(|u| u.value).sum())
    }

    /// Fee rate for `priority` from the provider's estimates
    pub fn suggest_fee_rate(
        &self,
        provider: &dyn ChainDataProvider,
        priority: Priority,
    ) -> Result<FeeRate, MultisigError> {
        Ok(provider.fee_estimates()?.for_priority(priority))
    }

    // =========================================================================
    // Spends
    // =========================================================================

    /// Select coins, build the PSBT and store it as a new unsigned transaction
    pub fn build_spend(
        &self,
        wallet_id: &str,
        request: &SpendRequest,
        initiated_by: &str,
        order: SelectionOrder,
    ) -> Result<UnsignedTransaction, MultisigError> {
        let wallet = self.get_wallet(wallet_id)?;
        let deriver = AddressDeriver::for_wallet(&self.engine, &wallet)?;
        let utxos = self.spendable_utxos(wallet_id)?;

        let planner = SpendPlanner::new(&deriver).with_order(order);
        let plan = planner.plan(request, &utxos, || -> Result<AddressInfo, MultisigError> {
            let range = self.store.allocate_address_indices(wallet_id, true, 1)?;
            let info = deriver.derive_address(range.start, true)?;
            self.store.insert_addresses(vec![info.to_record(wallet_id)])?;
            Ok(info)
        })?;

        let unsigned = build_unsigned_psbt(&plan.spend_inputs()?, &plan.outputs)?;
        let tx = UnsignedTransaction::new(
            wallet_id,
            &unsigned.psbt,
            &plan.outputs,
            plan.fee,
            plan.total_spent,
            request.fee_rate,
            initiated_by,
        );
        self.store.insert_unsigned_tx(tx.clone())?;

        log::info!(
            "Built spend {} for {}: {} inputs, {} outputs, fee {} sats",
            tx.id,
            wallet_id,
            plan.inputs.len(),
            plan.outputs.len(),
            plan.fee
        );
        Ok(tx)
    }

    /// Get an unsigned transaction by ID
    pub fn get_transaction(&self, tx_id: &str) -> Result<UnsignedTransaction, MultisigError> {
        self.store
            .unsigned_tx(tx_id)
            .map_err(|e| transaction_missing(e, tx_id))
    }

    /// Unsigned transactions of a wallet, oldest first
    pub fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<UnsignedTransaction>, MultisigError> {
        self.get_wallet(wallet_id)?;
        let mut txs = self.store.unsigned_txs(wallet_id)?;
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }

    /// Add the server's signature to every input of a transaction
    pub fn sign_with_server(&self, tx_id: &str) -> Result<ServerSignOutcome, MultisigError> {
        let tx = self.get_transaction(tx_id)?;
        let wallet = self.get_wallet(&tx.wallet_id)?;

        let mut lookup = ServerKeyLookup::from_records(&self.store.addresses(&wallet.id)?)?;
        lookup.merge(ServerKeyLookup::from_psbt_origins(
            &self.engine,
            wallet.account_id,
            &tx.decode_psbt()?,
        )?);

        let mut updated = tx.clone();
        let outcome = updated.sign_with_server(&self.engine, wallet.account_id, &lookup)?;
        if outcome.signatures_added > 0 {
            self.store.update_unsigned_tx(updated, tx.version)?;
        }
        Ok(outcome)
    }

    /// Validate and record signatures from a participant
    pub fn submit_partial_signatures(
        &self,
        tx_id: &str,
        signer_fingerprint: &str,
        shares: &[SignatureShare],
    ) -> Result<SubmitOutcome, MultisigError> {
        let tx = self.get_transaction(tx_id)?;
        let mut updated = tx.clone();
        let outcome = updated.submit_partial_signatures(signer_fingerprint, shares)?;
        if outcome.accepted > 0 {
            self.store.update_unsigned_tx(updated, tx.version)?;
        }
        log::info!(
            "Signer {} on {}: {} accepted, {} rejected",
            signer_fingerprint,
            tx_id,
            outcome.accepted,
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// Assemble the signed transaction without broadcasting it
    pub fn finalize(&self, tx_id: &str) -> Result<FinalizedTransaction, MultisigError> {
        self.get_transaction(tx_id)?.finalize()
    }

    /// Finalize, broadcast and record the spend
    pub fn broadcast(
        &self,
        tx_id: &str,
        provider: &dyn ChainDataProvider,
    ) -> Result<String, MultisigError> {
        let tx = self.get_transaction(tx_id)?;
        let finalized = tx.finalize()?;
        let outpoints: Vec<OutPoint> = tx
            .decode_psbt()?
            .unsigned_tx
            .input
            .iter()
            .map(|i| i.previous_output)
            .collect();

        // Claim first; a concurrent broadcaster loses on the version check
        let mut claim = tx.clone();
        claim.begin_broadcast()?;
        let claimed = self.store.update_unsigned_tx(claim, tx.version)?;

        let txid = match provider.broadcast(&finalized.raw_hex()) {
            Ok(txid) => txid,
            Err(err) => {
                log::warn!("Broadcast of {} refused: {}", tx_id, err);
                let mut released = claimed.clone();
                released.abort_broadcast()?;
                self.store.update_unsigned_tx(released, claimed.version)?;
                return Err(MultisigError::Chain(err));
            }
        };
        if txid != finalized.txid {
            log::warn!("Provider reported txid {}, expected {}", txid, finalized.txid);
        }

        let mut sent = claimed.clone();
        sent.mark_broadcasted()?;
        self.store.update_unsigned_tx(sent, claimed.version)?;

        let spent: Vec<(String, u32)> = outpoints
            .iter()
            .map(|o| (o.txid.to_string(), o.vout))
            .collect();
        self.store.mark_utxos_spent(&tx.wallet_id, &spent)?;

        log::info!("Broadcast {} as {}", tx_id, finalized.txid);
        Ok(finalized.txid)
    }

    /// Cancel an unfinished transaction, releasing its inputs
    pub fn cancel(&self, tx_id: &str) -> Result<UnsignedTransaction, MultisigError> {
        let tx = self.get_transaction(tx_id)?;
        let mut updated = tx.clone();
        updated.cancel()?;
        let stored = self.store.update_unsigned_tx(updated, tx.version)?;
        log::info!("Cancelled {}", tx_id);
        Ok(stored)
    }

    /// Derive one address without allocating it
    pub fn peek_address(
        &self,
        wallet_id: &str,
        address_index: i64,
        is_change: bool,
    ) -> Result<AddressInfo, MultisigError> {
        let index = check_address_index(address_index)?;
        let wallet = self.get_wallet(wallet_id)?;
        AddressDeriver::for_wallet(&self.engine, &wallet)?.derive_address(index, is_change)
    }
}

fn wallet_missing(err: StorageError, wallet_id: &str) -> MultisigError {
    match err {
        StorageError::NotFound(_) => MultisigError::WalletNotFound(wallet_id.to_string()),
        other => other.into(),
    }
}

fn transaction_missing(err: StorageError, tx_id: &str) -> MultisigError {
    match err {
        StorageError::NotFound(_) => MultisigError::TransactionNotFound(tx_id.to_string()),
        other => other.into(),
    }
}
