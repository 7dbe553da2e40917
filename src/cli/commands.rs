//! CLI commands for the custody engine
//!
//! Implements all command handlers for the CLI interface.

use std::fs;
use std::path::Path;

use crate::config::EngineConfig;
use crate::core::fee::{estimate_fee, estimate_vbytes, FeeRate, MultisigShape, ScriptKind};
use crate::keys::{check_account_index, MasterSeed};
use crate::multisig::{
    MultisigManager, ParticipantKey, SignatureShare, UnsignedTransaction, WalletConfig,
};
use crate::storage::{MemoryLedger, Storage};
use crate::wallet::{Receiver, SelectionOrder, SpendRequest};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub manager: MultisigManager<MemoryLedger>,
    pub storage: Storage,
    pub config: EngineConfig,
}

impl AppState {
    /// Initialize application state
    pub fn new(config: EngineConfig) -> CliResult<Self> {
        let engine = config.engine()?;
        let storage = Storage::new(config.storage_config())?;
        let ledger = storage.load_or_default()?;

        Ok(Self {
            manager: MultisigManager::new(engine, ledger),
            storage,
            config,
        })
    }

    /// Save the current state
    pub fn save(&self) -> CliResult<()> {
        self.storage.save(self.manager.store())?;
        Ok(())
    }
}

/// Generate a new master seed
pub fn cmd_gen_seed(output: Option<&Path>) -> CliResult<()> {
    let seed = MasterSeed::generate();

    match output {
        Some(path) => {
            if path.exists() {
                println!("⚠️  Refusing to overwrite existing seed file {:?}", path);
                return Ok(());
            }
            fs::write(path, seed.to_hex().as_bytes())?;
            println!("🔐 New {}-byte seed written to {:?}", seed.len(), path);
        }
        None => {
            println!("🔐 New {}-byte seed:", seed.len());
            println!("   {}", seed.to_hex().as_str());
        }
    }
    println!("\n   ⚠️  IMPORTANT: This seed controls the server key of every wallet.");
    println!("   Store it offline; it is never written to the ledger.");

    Ok(())
}

/// Show the server account xpub
pub fn cmd_xpub(state: &AppState, account: i64) -> CliResult<()> {
    let account_id = check_account_index(account)?;
    let (xpub, path) = state.manager.engine().account_xpub(account_id)?;

    println!("🔑 Server account {}", account_id);
    println!("   ├─ Path: {}", path);
    println!("   └─ Xpub: {}", xpub);

    Ok(())
}

/// Parse `xpub` or `[fingerprint/path]xpub`
pub fn parse_participant(expression: &str) -> CliResult<ParticipantKey> {
    let expression = expression.trim();
    let Some(rest) = expression.strip_prefix('[') else {
        return Ok(ParticipantKey::new(expression));
    };
    let (origin, xpub) = rest
        .split_once(']')
        .ok_or_else(|| format!("unterminated key origin in {}", expression))?;

    let key = match origin.split_once('/') {
        Some((fingerprint, path)) => {
            ParticipantKey::new(xpub).with_origin(fingerprint, &format!("m/{}", path))
        }
        None => {
            let mut key = ParticipantKey::new(xpub);
            key.master_fingerprint = Some(origin.to_string());
            key
        }
    };
    Ok(key)
}

/// Parse `address:amount`
pub fn parse_receiver(expression: &str) -> CliResult<Receiver> {
    let (address, value) = expression
        .rsplit_once(':')
        .ok_or_else(|| format!("expected address:amount, got {}", expression))?;
    Ok(Receiver {
        address: address.to_string(),
        value: value.parse()?,
    })
}

/// Create a new multisig wallet
pub fn cmd_wallet_create(
    state: &mut AppState,
    name: &str,
    m: u8,
    n: u8,
    keys: &[String],
    labels: &[String],
) -> CliResult<()> {
    let participants = keys
        .iter()
        .enumerate()
        .map(|(i, key)| -> CliResult<ParticipantKey> {
            let participant = parse_participant(key)?;
            Ok(match labels.get(i) {
                Some(label) => participant.with_label(label),
                None => participant,
            })
        })
        .collect::<CliResult<Vec<_>>>()?;

    let config = WalletConfig::new(name, m, n, participants)?;
    let wallet = state.manager.create_wallet(config)?;
    state.save()?;

    println!("🔐 New {} wallet created!", wallet.description());
    println!("   ├─ ID: {}", wallet.id);
    println!("   ├─ Name: {}", wallet.name);
    println!("   ├─ Chain: {}", wallet.chain);
    println!("   ├─ Server path: {}", wallet.server_derivation_path);
    println!("   └─ Descriptor: {}", wallet.descriptor);

    Ok(())
}

/// List all wallets
pub fn cmd_wallet_list(state: &AppState) -> CliResult<()> {
    let wallets = state.manager.list_wallets()?;

    if wallets.is_empty() {
        println!("📭 No wallets found. Create one with: custody wallet create");
        return Ok(());
    }

    println!("📋 Wallets:");
    for wallet in &wallets {
        let balance = state.manager.balance(&wallet.id)?;
        println!(
            "   {} ({}) {} - {} sats",
            wallet.id,
            wallet.name,
            wallet.description(),
            balance
        );
    }

    Ok(())
}

/// Show a wallet's descriptor
pub fn cmd_wallet_descriptor(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let descriptor = state.manager.wallet_descriptor(wallet_id)?;

    println!("📜 Descriptor for {}", wallet_id);
    println!("   ├─ Server path: {}", descriptor.server_path);
    println!("   ├─ Server xpub: {}", descriptor.server_xpub);
    println!("   └─ {}", descriptor.descriptor);

    Ok(())
}

/// Hand out fresh addresses
pub fn cmd_address_new(
    state: &mut AppState,
    wallet_id: &str,
    count: u32,
    change: bool,
) -> CliResult<()> {
    let addresses = state.manager.handout_addresses(wallet_id, count, change)?;
    state.save()?;

    println!("📍 {} new address(es):", addresses.len());
    for info in &addresses {
        println!(
            "   [{}] {} ({})",
            info.address_index, info.address, info.server_key_derivation_path
        );
    }

    Ok(())
}

/// List provisioned addresses
pub fn cmd_address_list(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let records = state.manager.list_addresses(wallet_id)?;

    if records.is_empty() {
        println!("📭 No addresses yet. Create one with: custody address new");
        return Ok(());
    }

    println!("📋 Addresses of {}:", wallet_id);
    for record in &records {
        println!(
            "   {}/{} {}{}",
            if record.is_change { 1 } else { 0 },
            record.address_index,
            record.address,
            if record.used { " (used)" } else { "" }
        );
    }

    Ok(())
}

/// Record an observed output
pub fn cmd_utxo_add(
    state: &mut AppState,
    wallet_id: &str,
    address: &str,
    txid: &str,
    vout: u32,
    value: u64,
    unconfirmed: bool,
) -> CliResult<()> {
    let is_new = state
        .manager
        .record_incoming_output(wallet_id, address, txid, vout, value, !unconfirmed)?;
    state.save()?;

    if is_new {
        println!("✅ Recorded {}:{} = {} sats", txid, vout, value);
    } else {
        println!("🔄 Refreshed {}:{}", txid, vout);
    }
    println!(
        "💰 Spendable balance: {} sats",
        state.manager.balance(wallet_id)?
    );

    Ok(())
}

/// List spendable outputs
pub fn cmd_utxo_list(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let utxos = state.manager.spendable_utxos(wallet_id)?;
    let total: u64 = utxos.iter().map(|u| u.value).sum();

    println!("💰 Balance for {}", wallet_id);
    println!("   Total: {} sats", total);
    println!("   UTXOs: {}", utxos.len());
    for utxo in &utxos {
        println!(
            "   └─ {} = {} sats{}",
            utxo.outpoint_string(),
            utxo.value,
            if utxo.confirmed { "" } else { " (unconfirmed)" }
        );
    }

    Ok(())
}

/// Estimate size and fee for a P2WSH multisig spend
pub fn cmd_fee_estimate(inputs: usize, outputs: usize, rate: u64, m: u8, n: u8) -> CliResult<()> {
    let kind = ScriptKind::P2wsh(MultisigShape::new(m, n)?);
    let rate = FeeRate::from_sat_per_vbyte(rate);
    let vbytes = estimate_vbytes(inputs, outputs, kind, kind);
    let fee = estimate_fee(inputs, outputs, rate, kind, kind, None);

    println!("🧮 {}-of-{} P2WSH, {} in / {} out", m, n, inputs, outputs);
    println!("   ├─ Size: {} vbytes", vbytes);
    println!("   └─ Fee at {} sat/vB: {} sats", rate.as_sat_per_vbyte(), fee);

    Ok(())
}

/// Build an unsigned spend
pub fn cmd_spend_build(
    state: &mut AppState,
    wallet_id: &str,
    receivers: &[String],
    fee_rate: u64,
    initiated_by: &str,
    largest_first: bool,
) -> CliResult<()> {
    let request = SpendRequest {
        receivers: receivers
            .iter()
            .map(|r| parse_receiver(r))
            .collect::<CliResult<Vec<_>>>()?,
        fee_rate: FeeRate::from_sat_per_vbyte(fee_rate),
    };
    let order = if largest_first {
        SelectionOrder::LargestFirst
    } else {
        SelectionOrder::Snapshot
    };

    let tx = state
        .manager
        .build_spend(wallet_id, &request, initiated_by, order)?;
    state.save()?;

    println!("📤 Spend created:");
    print_transaction(&tx);

    Ok(())
}

/// Co-sign with the server key
pub fn cmd_spend_sign(state: &mut AppState, tx_id: &str) -> CliResult<()> {
    let outcome = state.manager.sign_with_server(tx_id)?;
    state.save()?;

    println!("✍️  Server added {} signature(s)", outcome.signatures_added);
    if outcome.is_complete {
        println!("✅ Transaction is fully signed");
    }

    Ok(())
}

/// Submit participant signatures from a JSON file
pub fn cmd_spend_submit(
    state: &mut AppState,
    tx_id: &str,
    fingerprint: &str,
    file: &Path,
) -> CliResult<()> {
    let data = fs::read_to_string(file)?;
    let shares: Vec<SignatureShare> = serde_json::from_str(&data)?;

    let outcome = state
        .manager
        .submit_partial_signatures(tx_id, fingerprint, &shares)?;
    state.save()?;

    println!("✍️  Accepted {} signature(s)", outcome.accepted);
    for rejected in &outcome.rejected {
        println!(
            "   ❌ input {} ({}...): {}",
            rejected.input_index,
            &rejected.public_key[..rejected.public_key.len().min(16)],
            rejected.reason
        );
    }
    if outcome.is_complete {
        println!("✅ Transaction is fully signed");
    }

    Ok(())
}

/// Print or write the finalized raw transaction
pub fn cmd_spend_finalize(state: &AppState, tx_id: &str, output: Option<&Path>) -> CliResult<()> {
    let finalized = state.manager.finalize(tx_id)?;

    println!("📦 Finalized {}", finalized.txid);
    match output {
        Some(path) => {
            fs::write(path, finalized.raw_hex())?;
            println!("   Raw transaction written to {:?}", path);
        }
        None => println!("   {}", finalized.raw_hex()),
    }

    Ok(())
}

/// Cancel an open spend
pub fn cmd_spend_cancel(state: &mut AppState, tx_id: &str) -> CliResult<()> {
    state.manager.cancel(tx_id)?;
    state.save()?;

    println!("🗑️  Cancelled {}", tx_id);
    Ok(())
}

/// Show a spend, or every spend of a wallet
pub fn cmd_spend_show(state: &AppState, tx_id: Option<&str>, wallet_id: Option<&str>) -> CliResult<()> {
    if let Some(tx_id) = tx_id {
        let tx = state.manager.get_transaction(tx_id)?;
        print_transaction(&tx);
        println!("\n   PSBT: {}", tx.psbt);
        return Ok(());
    }

    let wallet_id = wallet_id.ok_or("either --tx or --wallet is required")?;
    let txs = state.manager.list_transactions(wallet_id)?;
    if txs.is_empty() {
        println!("📭 No spends for {}", wallet_id);
        return Ok(());
    }
    for tx in &txs {
        println!(
            "   {} {:?} {} sats ({} sigs)",
            tx.id, tx.status, tx.total_spent, tx.signatures_count
        );
    }

    Ok(())
}

fn print_transaction(tx: &UnsignedTransaction) {
    println!("   ├─ ID: {}", tx.id);
    println!("   ├─ Txid: {}", tx.txid);
    println!("   ├─ Status: {:?}", tx.status);
    println!("   ├─ Inputs: {}", tx.inputs.len());
    for output in &tx.outputs {
        println!("   ├─ Pay {} sats to {}", output.value, output.address);
    }
    println!("   ├─ Fee: {} sats ({} sat/vB)", tx.fee, tx.fee_per_byte);
    println!("   ├─ Total spent: {} sats", tx.total_spent);
    println!("   └─ Signatures: {}", tx.signatures_count);
}
