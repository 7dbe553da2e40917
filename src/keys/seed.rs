//! Server master seed handling
//!
//! The seed is the single process-wide secret. It is loaded once at startup,
//! handed to the [`KeyDerivationEngine`](super::KeyDerivationEngine) by value
//! and only ever borrowed from there.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};

use super::KeyError;

/// Minimum seed length accepted by BIP32 (128 bits)
pub const MIN_SEED_LEN: usize = 16;

/// Maximum seed length accepted by BIP32 (512 bits)
pub const MAX_SEED_LEN: usize = 64;

/// Length of freshly generated seeds (256 bits)
pub const GENERATED_SEED_LEN: usize = 32;

/// Secret seed bytes, wiped on drop.
///
/// Deliberately neither `Clone` nor `Serialize`; `Debug` never prints the bytes.
pub struct MasterSeed {
    bytes: Vec<u8>,
}

impl MasterSeed {
    /// Wrap raw seed bytes
    ///
    /// # Errors
    /// Returns `KeyError::InvalidSeed` if the length is outside 16..=64 bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, KeyError> {
        let mut bytes = bytes;
        if bytes.len() < MIN_SEED_LEN || bytes.len() > MAX_SEED_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(KeyError::InvalidSeed(format!(
                "seed must be {}..={} bytes, got {}",
                MIN_SEED_LEN, MAX_SEED_LEN, len
            )));
        }
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded seed
    pub fn from_hex(hex_seed: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_seed.trim())
            .map_err(|_| KeyError::InvalidSeed("seed is not valid hex".to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Generate a new random 256-bit seed from the OS RNG
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_SEED_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Load a hex-encoded seed from a file
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            KeyError::InvalidSeed(format!("cannot read seed file {:?}: {}", path, e))
        })?);
        Self::from_hex(&contents)
    }

    /// Hex form of the seed, for the one-time export done by `gen-seed`
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Seed length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for MasterSeed {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSeed(<redacted {} bytes>)", self.bytes.len())
    }
}
