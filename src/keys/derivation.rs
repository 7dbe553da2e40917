//! Hierarchical key derivation for the server signer
//!
//! Every wallet gets one hardened account node under the BIP48 multisig
//! template `m/48'/coin'/account'/2'`. Address keys are non-hardened children
//! `{0|1}/{index}` of that node, so the account xpub can be exported to
//! hardware-wallet software and derive the same public keys.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::{Network, NetworkKind};
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::MasterSeed;

// =============================================================================
// Constants
// =============================================================================

/// Largest non-hardened BIP32 index (2^31 - 1)
pub const MAX_INDEX: u32 = 0x7FFF_FFFF;

/// BIP48 purpose (multisig)
pub const PURPOSE: u32 = 48;

/// BIP48 script type for native segwit multisig (P2WSH)
pub const SCRIPT_TYPE_P2WSH: u32 = 2;

/// Receive branch under the account node
pub const RECEIVE_BRANCH: u32 = 0;

/// Change branch under the account node
pub const CHANGE_BRANCH: u32 = 1;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Account index must be between 0 and 2147483647, got {0}")]
    InvalidAccountIndex(i64),
    #[error("Address index must be between 0 and 2147483647, got {0}")]
    InvalidAddressIndex(i64),
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("BIP32 error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}

/// Validate an untrusted account index
pub fn check_account_index(index: i64) -> Result<u32, KeyError> {
    if (0..=MAX_INDEX as i64).contains(&index) {
        Ok(index as u32)
    } else {
        Err(KeyError::InvalidAccountIndex(index))
    }
}

/// Validate an untrusted address index
pub fn check_address_index(index: i64) -> Result<u32, KeyError> {
    if (0..=MAX_INDEX as i64).contains(&index) {
        Ok(index as u32)
    } else {
        Err(KeyError::InvalidAddressIndex(index))
    }
}

/// BIP44 coin type: 0 on mainnet, 1 on every test network
pub fn coin_type(network: Network) -> u32 {
    if network == Network::Bitcoin {
        0
    } else {
        1
    }
}

/// Branch number for receive (0) or change (1) addresses
pub fn branch(is_change: bool) -> u32 {
    if is_change {
        CHANGE_BRANCH
    } else {
        RECEIVE_BRANCH
    }
}

/// Parse a textual derivation path, with or without the leading `m/`
///
/// Accepts both `'` and `h` as hardened markers. An empty path or a bare
/// `m` yields the empty path.
pub fn parse_derivation_path(path: &str) -> Result<DerivationPath, KeyError> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix("m/")
        .or_else(|| if trimmed == "m" { Some("") } else { None })
        .unwrap_or(trimmed);

    if body.is_empty() {
        return Ok(DerivationPath::from(Vec::<ChildNumber>::new()));
    }

    let children = body
        .split('/')
        .map(|part| {
            ChildNumber::from_str(part)
                .map_err(|_| KeyError::InvalidPath(format!("bad component {:?} in {:?}", part, path)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DerivationPath::from(children))
}

// =============================================================================
// Key material
// =============================================================================

/// A server key for one address slot. Derived on demand and dropped after use.
pub struct ServerKeyPair {
    pub public_key: PublicKey,
    pub private_key: SecretKey,
    /// Full path from the master node, e.g. `m/48'/1'/0'/2'/0/5`
    pub derivation_path: String,
}

impl ServerKeyPair {
    /// Compressed public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }
}

impl fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public_key", &self.public_key_hex())
            .field("private_key", &"<redacted>")
            .field("derivation_path", &self.derivation_path)
            .finish()
    }
}

/// Where a multisig key comes from: the metadata a signer needs to recognise
/// its own key inside a script it did not build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrigin {
    pub public_key: PublicKey,
    pub fingerprint: Fingerprint,
    /// Path as presented to signers (`m/0/5` for the server, `{account path}/0/5`
    /// or `0/5` for participants)
    pub path: String,
}

impl KeyOrigin {
    pub fn derivation_path(&self) -> Result<DerivationPath, KeyError> {
        parse_derivation_path(&self.path)
    }
}

// =============================================================================
// Derivation engine
// =============================================================================

/// Deterministic key derivation from the server master seed.
///
/// Holds no caches: every call re-derives from the seed.
pub struct KeyDerivationEngine {
    seed: MasterSeed,
    network: Network,
    secp: Secp256k1<All>,
}

impl KeyDerivationEngine {
    /// Create an engine that owns the seed for the process lifetime
    pub fn new(seed: MasterSeed, network: Network) -> Self {
        Self {
            seed,
            network,
            secp: Secp256k1::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The network kind that xpubs accepted by this engine must carry
    pub fn network_kind(&self) -> NetworkKind {
        NetworkKind::from(self.network)
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Hardened account path for the given account, e.g. `m/48'/1'/7'/2'`
    pub fn account_path(&self, account_id: u32) -> String {
        format!(
            "m/{}'/{}'/{}'/{}'",
            PURPOSE,
            coin_type(self.network),
            account_id,
            SCRIPT_TYPE_P2WSH
        )
    }

    /// Derive the hardened account node for a wallet's server key slot
    ///
    /// # Errors
    /// Returns `KeyError::InvalidAccountIndex` if `account_id` exceeds 2^31 - 1
    pub fn derive_account_node(&self, account_id: u32) -> Result<(Xpriv, String), KeyError> {
        if account_id > MAX_INDEX {
            return Err(KeyError::InvalidAccountIndex(account_id as i64));
        }

        let master = Xpriv::new_master(self.network, self.seed.as_bytes())?;
        let path = [
            ChildNumber::from_hardened_idx(PURPOSE)?,
            ChildNumber::from_hardened_idx(coin_type(self.network))?,
            ChildNumber::from_hardened_idx(account_id)?,
            ChildNumber::from_hardened_idx(SCRIPT_TYPE_P2WSH)?,
        ];
        let account_node = master.derive_priv(&self.secp, &path)?;

        Ok((account_node, self.account_path(account_id)))
    }

    /// Derive the server key for one address slot
    ///
    /// # Errors
    /// Returns `KeyError::InvalidAccountIndex` or `KeyError::InvalidAddressIndex`
    /// when either index exceeds 2^31 - 1
    pub fn derive_server_key_pair(
        &self,
        account_id: u32,
        address_index: u32,
        is_change: bool,
    ) -> Result<ServerKeyPair, KeyError> {
        let (account_node, path) = self.derive_account_node(account_id)?;

        if address_index > MAX_INDEX {
            return Err(KeyError::InvalidAddressIndex(address_index as i64));
        }

        let change = branch(is_change);
        let child_path = [
            ChildNumber::from_normal_idx(change)?,
            ChildNumber::from_normal_idx(address_index)?,
        ];
        let child = account_node.derive_priv(&self.secp, &child_path)?;

        Ok(ServerKeyPair {
            public_key: child.private_key.public_key(&self.secp),
            private_key: child.private_key,
            derivation_path: format!("{}/{}/{}", path, change, address_index),
        })
    }

    /// Public key only for one address slot
    pub fn derive_server_public_key(
        &self,
        account_id: u32,
        address_index: u32,
        is_change: bool,
    ) -> Result<PublicKey, KeyError> {
        Ok(self
            .derive_server_key_pair(account_id, address_index, is_change)?
            .public_key)
    }

    /// Neutered account node, safe to hand to wallet software
    pub fn account_xpub(&self, account_id: u32) -> Result<(Xpub, String), KeyError> {
        let (account_node, path) = self.derive_account_node(account_id)?;
        Ok((Xpub::from_priv(&self.secp, &account_node), path))
    }
}

impl fmt::Debug for KeyDerivationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDerivationEngine")
            .field("seed", &self.seed)
            .field("network", &self.network)
            .finish()
    }
}
