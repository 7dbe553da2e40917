//! Sorted-multisig script and address construction
//!
//! Keys for one address slot are the server key plus the same
//! `{change}/{index}` child of every participant xpub. They are sorted by
//! their compressed serialization (BIP67) so the address does not depend on
//! the order participants were registered in.

use bitcoin::bip32::{ChildNumber, Fingerprint, Xpub};
use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::wallet::{AddressRecord, MultisigError, ParticipantKey, Wallet, MAX_MULTISIG_KEYS};
use crate::core::fee::MultisigShape;
use crate::keys::{branch, parse_derivation_path, KeyDerivationEngine, KeyOrigin, MAX_INDEX};

/// Largest witness script relayed by standard nodes
pub const MAX_WITNESS_SCRIPT_SIZE: usize = 3600;

/// One derived multisig address with everything needed to spend from it
#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub address: String,
    pub witness_script: ScriptBuf,
    pub script_pubkey: ScriptBuf,
    /// Full server path, e.g. `m/48'/1'/0'/2'/0/5`. Never handed to clients.
    pub server_key_derivation_path: String,
    pub server_public_key: String,
    pub address_index: u32,
    pub is_change: bool,
    /// One origin per key, server first, in registration order (not sorted)
    pub key_origins: Vec<KeyOrigin>,
}

impl AddressInfo {
    pub fn to_record(&self, wallet_id: &str) -> AddressRecord {
        AddressRecord {
            wallet_id: wallet_id.to_string(),
            address_index: self.address_index,
            is_change: self.is_change,
            address: self.address.clone(),
            witness_script: hex::encode(self.witness_script.as_bytes()),
            script_pubkey: hex::encode(self.script_pubkey.as_bytes()),
            handed_out: false,
            used: false,
        }
    }
}

/// Output descriptor for importing a wallet into watch-only software
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub descriptor: String,
    pub server_path: String,
    pub server_xpub: String,
}

/// Derives the multisig addresses of one wallet
pub struct AddressDeriver<'a> {
    engine: &'a KeyDerivationEngine,
    account_id: u32,
    m: u8,
    participants: Vec<Xpub>,
    fingerprints: Vec<Fingerprint>,
    paths: Vec<Option<String>>,
}

impl<'a> AddressDeriver<'a> {
    /// Create a deriver for `m`-of-(1 + participants)
    ///
    /// # Errors
    /// Returns `KeyDerivation` if an xpub is malformed or belongs to another
    /// network
    pub fn new(
        engine: &'a KeyDerivationEngine,
        account_id: u32,
        m: u8,
        participant_xpubs: &[String],
    ) -> Result<Self, MultisigError> {
        let participants = participant_xpubs
            .iter()
            .map(|xpub| parse_xpub(engine, xpub))
            .collect::<Result<Vec<_>, _>>()?;
        let count = participants.len();

        Ok(Self {
            engine,
            account_id,
            m,
            participants,
            fingerprints: vec![Fingerprint::default(); count],
            paths: vec![None; count],
        })
    }

    /// Deriver for a stored wallet, carrying each participant's origin
    pub fn for_wallet(
        engine: &'a KeyDerivationEngine,
        wallet: &Wallet,
    ) -> Result<Self, MultisigError> {
        let deriver =
            Self::new(engine, wallet.account_id, wallet.m, &wallet.participant_xpubs())?;
        let fingerprints: Vec<Option<String>> = wallet
            .participants
            .iter()
            .map(|p| p.master_fingerprint.clone())
            .collect();
        let paths: Vec<Option<String>> = wallet
            .participants
            .iter()
            .map(|p| p.derivation_path.clone())
            .collect();
        deriver.with_fingerprints(&fingerprints)?.with_paths(&paths)
    }

    /// Master fingerprints of the participants, in xpub order. `None`
    /// entries stay zero-filled.
    pub fn with_fingerprints(
        mut self,
        fingerprints: &[Option<String>],
    ) -> Result<Self, MultisigError> {
        if fingerprints.is_empty() {
            return Ok(self);
        }
        if fingerprints.len() != self.participants.len() {
            return Err(MultisigError::KeyDerivation(format!(
                "number of fingerprints ({}) must match number of xpubs ({})",
                fingerprints.len(),
                self.participants.len()
            )));
        }

        self.fingerprints = fingerprints
            .iter()
            .map(|fp| match fp {
                Some(hex_fp) => Fingerprint::from_str(hex_fp).map_err(|e| {
                    MultisigError::KeyDerivation(format!("bad fingerprint {:?}: {}", hex_fp, e))
                }),
                None => Ok(Fingerprint::default()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self)
    }

    /// Account node paths of the participants below their own masters
    pub fn with_paths(mut self, paths: &[Option<String>]) -> Result<Self, MultisigError> {
        if paths.is_empty() {
            return Ok(self);
        }
        if paths.len() != self.participants.len() {
            return Err(MultisigError::KeyDerivation(format!(
                "number of paths ({}) must match number of xpubs ({})",
                paths.len(),
                self.participants.len()
            )));
        }
        for path in paths.iter().flatten() {
            parse_derivation_path(path)?;
        }

        self.paths = paths
            .iter()
            .map(|p| p.as_ref().map(|s| s.trim_end_matches('/').to_string()))
            .collect();
        Ok(self)
    }

    /// Derive the address for one slot
    ///
    /// # Errors
    /// `InvalidAddressIndex` outside `[0, 2^31 - 1]`, `ScriptConstruction`
    /// when the threshold cannot be encoded
    pub fn derive_address(
        &self,
        address_index: u32,
        is_change: bool,
    ) -> Result<AddressInfo, MultisigError> {
        if address_index > MAX_INDEX {
            return Err(MultisigError::InvalidAddressIndex(address_index as i64));
        }

        let secp = self.engine.secp();
        let change = branch(is_change);
        let child_path = [
            ChildNumber::from_normal_idx(change).map_err(key_derivation)?,
            ChildNumber::from_normal_idx(address_index).map_err(key_derivation)?,
        ];

        let server = self
            .engine
            .derive_server_key_pair(self.account_id, address_index, is_change)?;

        // Server path is truncated so the account number is not revealed
        let mut key_origins = vec![KeyOrigin {
            public_key: server.public_key,
            fingerprint: Fingerprint::default(),
            path: format!("m/{}/{}", change, address_index),
        }];

        for (i, xpub) in self.participants.iter().enumerate() {
            let child = xpub.derive_pub(secp, &child_path).map_err(key_derivation)?;
            let path = match &self.paths[i] {
                Some(prefix) => format!("{}/{}/{}", prefix, change, address_index),
                None => format!("{}/{}", change, address_index),
            };
            key_origins.push(KeyOrigin {
                public_key: child.public_key,
                fingerprint: self.fingerprints[i],
                path,
            });
        }

        let keys: Vec<secp256k1::PublicKey> = key_origins.iter().map(|o| o.public_key).collect();
        let witness_script = sorted_multisig_script(self.m, &keys)?;
        let address = Address::p2wsh(&witness_script, self.engine.network());

        log::debug!(
            "Derived {}-of-{} address {} at {}/{}",
            self.m,
            keys.len(),
            address,
            change,
            address_index
        );

        Ok(AddressInfo {
            address: address.to_string(),
            script_pubkey: address.script_pubkey(),
            witness_script,
            server_key_derivation_path: server.derivation_path.clone(),
            server_public_key: server.public_key_hex(),
            address_index,
            is_change,
            key_origins,
        })
    }

    /// Derive `count` consecutive addresses starting at `start_index`
    pub fn derive_address_range(
        &self,
        start_index: u32,
        count: u32,
        is_change: bool,
    ) -> Result<Vec<AddressInfo>, MultisigError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let last = start_index as u64 + count as u64 - 1;
        if last > MAX_INDEX as u64 {
            return Err(MultisigError::InvalidAddressIndex(last as i64));
        }

        (start_index..=last as u32)
            .map(|index| self.derive_address(index, is_change))
            .collect()
    }

    /// Number of keys in every script of this wallet
    pub fn key_count(&self) -> usize {
        self.participants.len() + 1
    }

    /// Size shape of this wallet's scripts, for fee estimation
    pub fn shape(&self) -> Result<MultisigShape, MultisigError> {
        Ok(MultisigShape::new(self.m, self.key_count() as u8)?)
    }

    pub fn network(&self) -> Network {
        self.engine.network()
    }
}

fn key_derivation(err: bitcoin::bip32::Error) -> MultisigError {
    MultisigError::KeyDerivation(err.to_string())
}

fn parse_xpub(engine: &KeyDerivationEngine, xpub: &str) -> Result<Xpub, MultisigError> {
    let parsed = Xpub::from_str(xpub.trim())
        .map_err(|e| MultisigError::KeyDerivation(format!("invalid xpub {}: {}", xpub, e)))?;
    if parsed.network != engine.network_kind() {
        return Err(MultisigError::KeyDerivation(format!(
            "xpub {} is not for {}",
            xpub,
            engine.network()
        )));
    }
    Ok(parsed)
}

/// `OP_m <sorted keys> OP_n OP_CHECKMULTISIG`
pub fn sorted_multisig_script(
    m: u8,
    keys: &[secp256k1::PublicKey],
) -> Result<ScriptBuf, MultisigError> {
    let n = keys.len();
    if m == 0 || m as usize > n || n > MAX_MULTISIG_KEYS as usize {
        return Err(MultisigError::ScriptConstruction(format!(
            "cannot encode {}-of-{} multisig",
            m, n
        )));
    }

    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.serialize());

    let mut builder = Builder::new().push_int(m as i64);
    for key in sorted {
        builder = builder.push_key(&PublicKey::new(key));
    }
    let script = builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();

    if script.len() > MAX_WITNESS_SCRIPT_SIZE {
        return Err(MultisigError::ScriptConstruction(format!(
            "witness script is {} bytes",
            script.len()
        )));
    }
    Ok(script)
}

/// Signature threshold of a bare multisig script
pub fn multisig_threshold(script: &Script) -> Option<usize> {
    match script.instructions().next() {
        Some(Ok(Instruction::Op(op))) => {
            let code = op.to_u8();
            if (0x51..=0x60).contains(&code) {
                Some((code - 0x50) as usize)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Public keys of a multisig script, in script order
pub fn multisig_keys(script: &Script) -> Vec<secp256k1::PublicKey> {
    script
        .instructions()
        .filter_map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => {
                secp256k1::PublicKey::from_slice(bytes.as_bytes()).ok()
            }
            _ => None,
        })
        .collect()
}

/// Descriptor `wsh(sortedmulti(m,server/<0;1>/*,xpub/<0;1>/*,...))`
pub fn wallet_descriptor(
    engine: &KeyDerivationEngine,
    account_id: u32,
    m: u8,
    participants: &[ParticipantKey],
) -> Result<WalletDescriptor, MultisigError> {
    for participant in participants {
        parse_xpub(engine, &participant.xpub)?;
    }

    let (server_xpub, server_path) = engine.account_xpub(account_id)?;
    let server_xpub = server_xpub.to_string();

    let keys: Vec<String> = std::iter::once(server_xpub.as_str())
        .chain(participants.iter().map(|p| p.xpub.as_str()))
        .map(|xpub| format!("{}/<0;1>/*", xpub))
        .collect();

    Ok(WalletDescriptor {
        descriptor: format!("wsh(sortedmulti({},{}))", m, keys.join(",")),
        server_path,
        server_xpub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derivation::tests::{participant_xpub, test_engine};
    use crate::keys::MasterSeed;

    fn xpubs(fills: &[u8]) -> Vec<String> {
        fills.iter().map(|f| participant_xpub(*f)).collect()
    }

    #[test]
    fn test_two_of_two_testnet_address() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1])).unwrap();
        let info = deriver.derive_address(0, false).unwrap();

        assert!(info.address.starts_with("tb1"));
        assert_eq!(info.server_key_derivation_path, "m/48'/1'/0'/2'/0/0");
        assert_eq!(multisig_threshold(&info.witness_script), Some(2));
        assert_eq!(multisig_keys(&info.witness_script).len(), 2);
        assert!(info.script_pubkey.is_p2wsh());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 3, 2, &xpubs(&[1, 2])).unwrap();
        let a = deriver.derive_address(11, true).unwrap();
        let b = deriver.derive_address(11, true).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.witness_script, b.witness_script);
    }

    #[test]
    fn test_address_independent_of_participant_order() {
        let engine = test_engine();
        let forward = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1, 2])).unwrap();
        let reverse = AddressDeriver::new(&engine, 0, 2, &xpubs(&[2, 1])).unwrap();

        let a = forward.derive_address(4, false).unwrap();
        let b = reverse.derive_address(4, false).unwrap();
        assert_eq!(a.address, b.address);

        // Origins keep registration order
        assert_eq!(a.key_origins[1].public_key, b.key_origins[2].public_key);
    }

    #[test]
    fn test_script_keys_are_sorted() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1, 2, 3])).unwrap();
        let info = deriver.derive_address(0, false).unwrap();

        let keys: Vec<[u8; 33]> = multisig_keys(&info.witness_script)
            .iter()
            .map(|k| k.serialize())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_slots_produce_distinct_addresses() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1])).unwrap();
        let receive = deriver.derive_address(0, false).unwrap();
        let change = deriver.derive_address(0, true).unwrap();
        let next = deriver.derive_address(1, false).unwrap();
        assert_ne!(receive.address, change.address);
        assert_ne!(receive.address, next.address);

        let other_account = AddressDeriver::new(&engine, 1, 2, &xpubs(&[1])).unwrap();
        assert_ne!(other_account.derive_address(0, false).unwrap().address, receive.address);
    }

    #[test]
    fn test_key_origins() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 5, 2, &xpubs(&[1, 2]))
            .unwrap()
            .with_fingerprints(&[Some("d34db33f".to_string()), None])
            .unwrap()
            .with_paths(&[Some("m/48'/1'/0'/2'".to_string()), None])
            .unwrap();
        let info = deriver.derive_address(7, true).unwrap();

        let server = &info.key_origins[0];
        assert_eq!(server.fingerprint, Fingerprint::default());
        assert_eq!(server.path, "m/1/7");

        let first = &info.key_origins[1];
        assert_eq!(first.fingerprint.to_string(), "d34db33f");
        assert_eq!(first.path, "m/48'/1'/0'/2'/1/7");

        let second = &info.key_origins[2];
        assert_eq!(second.fingerprint, Fingerprint::default());
        assert_eq!(second.path, "1/7");
    }

    #[test]
    fn test_fingerprint_count_must_match() {
        let engine = test_engine();
        let result = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1, 2]))
            .unwrap()
            .with_fingerprints(&[Some("00000000".to_string())]);
        assert!(matches!(result, Err(MultisigError::KeyDerivation(_))));
    }

    #[test]
    fn test_malformed_and_foreign_xpubs_rejected() {
        let engine = test_engine();
        assert!(matches!(
            AddressDeriver::new(&engine, 0, 2, &["tpubGARBAGE".to_string()]),
            Err(MultisigError::KeyDerivation(_))
        ));

        let mainnet = KeyDerivationEngine::new(
            MasterSeed::from_bytes(vec![9; 32]).unwrap(),
            Network::Bitcoin,
        );
        let mainnet_xpub = mainnet.account_xpub(0).unwrap().0.to_string();
        assert!(matches!(
            AddressDeriver::new(&engine, 0, 2, &[mainnet_xpub]),
            Err(MultisigError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_unencodable_threshold() {
        let engine = test_engine();
        let zero = AddressDeriver::new(&engine, 0, 0, &xpubs(&[1])).unwrap();
        assert!(matches!(
            zero.derive_address(0, false),
            Err(MultisigError::ScriptConstruction(_))
        ));

        let too_high = AddressDeriver::new(&engine, 0, 3, &xpubs(&[1])).unwrap();
        assert!(matches!(
            too_high.derive_address(0, false),
            Err(MultisigError::ScriptConstruction(_))
        ));
    }

    #[test]
    fn test_index_bounds() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 1, &xpubs(&[1])).unwrap();
        assert!(deriver.derive_address(MAX_INDEX, false).is_ok());
        assert!(matches!(
            deriver.derive_address(MAX_INDEX + 1, false),
            Err(MultisigError::InvalidAddressIndex(_))
        ));
        assert!(matches!(
            deriver.derive_address_range(MAX_INDEX, 2, false),
            Err(MultisigError::InvalidAddressIndex(_))
        ));
    }

    #[test]
    fn test_address_range() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1])).unwrap();
        let range = deriver.derive_address_range(10, 3, false).unwrap();
        let indices: Vec<u32> = range.iter().map(|a| a.address_index).collect();
        assert_eq!(indices, vec![10, 11, 12]);
        assert_eq!(range[1].address, deriver.derive_address(11, false).unwrap().address);
        assert!(deriver.derive_address_range(0, 0, false).unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_format() {
        let engine = test_engine();
        let participants = vec![ParticipantKey::new(participant_xpub(1))];
        let descriptor = wallet_descriptor(&engine, 0, 2, &participants).unwrap();

        assert_eq!(descriptor.server_path, "m/48'/1'/0'/2'");
        assert!(descriptor.server_xpub.starts_with("tpub"));
        assert_eq!(
            descriptor.descriptor,
            format!(
                "wsh(sortedmulti(2,{}/<0;1>/*,{}/<0;1>/*))",
                descriptor.server_xpub,
                participant_xpub(1)
            )
        );
    }

    #[test]
    fn test_record_conversion() {
        let engine = test_engine();
        let deriver = AddressDeriver::new(&engine, 0, 2, &xpubs(&[1])).unwrap();
        let record = deriver.derive_address(2, true).unwrap().to_record("w1");
        assert_eq!(record.wallet_id, "w1");
        assert_eq!(record.address_index, 2);
        assert!(record.is_change);
        assert!(!record.handed_out);
        assert!(record.script_pubkey.starts_with("0020"));
    }
}
