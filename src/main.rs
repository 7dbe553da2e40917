//! Multisig Custody CLI Application
//!
//! A command-line interface for operating custodial multisig wallets.

use clap::{Parser, Subcommand};
use multisig_custody::cli::{self, AppState};
use multisig_custody::config::{parse_network, EngineConfig};
use std::path::PathBuf;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "custody")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Custodial two-factor Bitcoin multisig engine", long_about = None)]
struct Cli {
    /// Data directory for the ledger
    #[arg(short, long, env = "CUSTODY_DATA_DIR", default_value = ".custody_data")]
    data_dir: PathBuf,

    /// Network: bitcoin/mainnet, testnet, signet or regtest
    #[arg(short, long, env = "CUSTODY_NETWORK", default_value = "testnet")]
    network: String,

    /// File holding the hex master seed
    #[arg(long, env = "CUSTODY_SEED_FILE")]
    seed_file: Option<PathBuf>,

    /// Hex master seed
    #[arg(long, env = "CUSTODY_SEED_HEX", hide_env_values = true)]
    seed_hex: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new master seed
    GenSeed {
        /// Write the seed to this file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the server xpub of an account
    Xpub {
        /// Account index
        #[arg(short, long, default_value = "0")]
        account: i64,
    },

    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Address operations
    Address {
        #[command(subcommand)]
        action: AddressCommands,
    },

    /// UTXO operations
    Utxo {
        #[command(subcommand)]
        action: UtxoCommands,
    },

    /// Fee estimation
    Fee {
        #[command(subcommand)]
        action: FeeCommands,
    },

    /// Spend operations
    Spend {
        #[command(subcommand)]
        action: SpendCommands,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new m-of-n wallet
    Create {
        /// Wallet name
        #[arg(long)]
        name: String,

        /// Required signatures
        #[arg(short)]
        m: u8,

        /// Total signers, server included
        #[arg(short)]
        n: u8,

        /// Participant key, `xpub` or `[fingerprint/path]xpub` (repeat n - 1 times)
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Device label for each key, in order
        #[arg(long = "label")]
        labels: Vec<String>,
    },

    /// List all wallets
    List,

    /// Show the output descriptor of a wallet
    Descriptor {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,
    },
}

#[derive(Subcommand)]
enum AddressCommands {
    /// Hand out fresh addresses
    New {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,

        /// Number of addresses
        #[arg(short, long, default_value = "1")]
        count: u32,

        /// Use the change branch
        #[arg(long)]
        change: bool,
    },

    /// List handed out addresses
    List {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,
    },
}

#[derive(Subcommand)]
enum UtxoCommands {
    /// Record an output paying one of the wallet's addresses
    Add {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,

        /// Receiving address
        #[arg(short, long)]
        address: String,

        /// Funding transaction id
        #[arg(long)]
        txid: String,

        /// Output index
        #[arg(long)]
        vout: u32,

        /// Amount in satoshis
        #[arg(long)]
        value: u64,

        /// Output is not yet confirmed
        #[arg(long)]
        unconfirmed: bool,
    },

    /// List spendable outputs
    List {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,
    },
}

#[derive(Subcommand)]
enum FeeCommands {
    /// Estimate size and fee of a multisig spend
    Estimate {
        #[arg(short, long, default_value = "1")]
        inputs: usize,

        #[arg(short, long, default_value = "2")]
        outputs: usize,

        /// Fee rate in sat/vbyte
        #[arg(short, long, default_value = "1")]
        rate: u64,

        #[arg(short, default_value = "2")]
        m: u8,

        #[arg(short, default_value = "3")]
        n: u8,
    },
}

#[derive(Subcommand)]
enum SpendCommands {
    /// Build an unsigned spend
    Build {
        /// Wallet ID
        #[arg(short, long)]
        wallet: String,

        /// Receiver as `address:amount` (repeatable)
        #[arg(short, long = "to")]
        to: Vec<String>,

        /// Fee rate in sat/vbyte
        #[arg(short, long, default_value = "1")]
        fee_rate: u64,

        /// Who requested the spend
        #[arg(long, default_value = "cli")]
        by: String,

        /// Spend the largest outputs first
        #[arg(long)]
        largest_first: bool,
    },

    /// Co-sign with the server key
    Sign {
        /// Transaction ID
        #[arg(short, long)]
        tx: String,
    },

    /// Submit participant signatures from a JSON file
    Submit {
        /// Transaction ID
        #[arg(short, long)]
        tx: String,

        /// Signer master fingerprint
        #[arg(long)]
        fingerprint: String,

        /// JSON array of `{input_index, public_key, signature}`
        #[arg(long)]
        file: PathBuf,
    },

    /// Assemble the signed transaction
    Finalize {
        /// Transaction ID
        #[arg(short, long)]
        tx: String,

        /// Write the raw hex here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Cancel an open spend
    Cancel {
        /// Transaction ID
        #[arg(short, long)]
        tx: String,
    },

    /// Show one spend or all spends of a wallet
    Show {
        /// Transaction ID
        #[arg(short, long)]
        tx: Option<String>,

        /// Wallet ID
        #[arg(short, long)]
        wallet: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Commands that need no seed or ledger
    match &cli.command {
        Commands::GenSeed { output } => return cli::cmd_gen_seed(output.as_deref()),
        Commands::Fee {
            action:
                FeeCommands::Estimate {
                    inputs,
                    outputs,
                    rate,
                    m,
                    n,
                },
        } => return cli::cmd_fee_estimate(*inputs, *outputs, *rate, *m, *n),
        _ => {}
    }

    let config = EngineConfig {
        network: parse_network(&cli.network)?,
        data_dir: cli.data_dir.clone(),
        seed_file: cli.seed_file.clone(),
        seed_hex: cli.seed_hex.clone().map(Zeroizing::new),
    };

    // Initialize application state
    let mut state = AppState::new(config)?;

    // Process commands
    match cli.command {
        Commands::GenSeed { .. } | Commands::Fee { .. } => unreachable!(),

        Commands::Xpub { account } => {
            cli::cmd_xpub(&state, account)?;
        }

        Commands::Wallet { action } => match action {
            WalletCommands::Create {
                name,
                m,
                n,
                keys,
                labels,
            } => {
                cli::cmd_wallet_create(&mut state, &name, m, n, &keys, &labels)?;
            }
            WalletCommands::List => {
                cli::cmd_wallet_list(&state)?;
            }
            WalletCommands::Descriptor { wallet } => {
                cli::cmd_wallet_descriptor(&state, &wallet)?;
            }
        },

        Commands::Address { action } => match action {
            AddressCommands::New {
                wallet,
                count,
                change,
            } => {
                cli::cmd_address_new(&mut state, &wallet, count, change)?;
            }
            AddressCommands::List { wallet } => {
                cli::cmd_address_list(&state, &wallet)?;
            }
        },

        Commands::Utxo { action } => match action {
            UtxoCommands::Add {
                wallet,
                address,
                txid,
                vout,
                value,
                unconfirmed,
            } => {
                cli::cmd_utxo_add(&mut state, &wallet, &address, &txid, vout, value, unconfirmed)?;
            }
            UtxoCommands::List { wallet } => {
                cli::cmd_utxo_list(&state, &wallet)?;
            }
        },

        Commands::Spend { action } => match action {
            SpendCommands::Build {
                wallet,
                to,
                fee_rate,
                by,
                largest_first,
            } => {
                cli::cmd_spend_build(&mut state, &wallet, &to, fee_rate, &by, largest_first)?;
            }
            SpendCommands::Sign { tx } => {
                cli::cmd_spend_sign(&mut state, &tx)?;
            }
            SpendCommands::Submit {
                tx,
                fingerprint,
                file,
            } => {
                cli::cmd_spend_submit(&mut state, &tx, &fingerprint, &file)?;
            }
            SpendCommands::Finalize { tx, output } => {
                cli::cmd_spend_finalize(&state, &tx, output.as_deref())?;
            }
            SpendCommands::Cancel { tx } => {
                cli::cmd_spend_cancel(&mut state, &tx)?;
            }
            SpendCommands::Show { tx, wallet } => {
                cli::cmd_spend_show(&state, tx.as_deref(), wallet.as_deref())?;
            }
        },
    }

    Ok(())
}
