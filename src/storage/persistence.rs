//! Ledger persistence layer
//!
//! Provides save/load functionality for the custody ledger.

use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::ledger::{LedgerState, MemoryLedger};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    Duplicate(String),
    #[error("Concurrent update of {id}: expected version {expected}, found {found}")]
    VersionConflict { id: String, expected: u64, found: u64 },
    #[error("Input {outpoint} is already reserved by transaction {tx_id}")]
    InputsReserved { outpoint: String, tx_id: String },
    #[error("Ledger lock poisoned")]
    Poisoned,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub ledger_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".custody_data"),
            ledger_file: "ledger.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// Ledger storage manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Create a storage manager rooted at `data_dir` with default settings
    pub fn in_dir(data_dir: &Path) -> Result<Self, StorageError> {
        Self::new(StorageConfig {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        })
    }

    fn ledger_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.ledger_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.ledger_file, index))
    }

    /// Save the ledger to disk
    pub fn save(&self, ledger: &MemoryLedger) -> Result<(), StorageError> {
        let state = ledger.snapshot()?;
        let path = self.ledger_path();

        if self.config.backup_enabled && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // Write to temporary file first
        let temp_path = self.config.data_dir.join("ledger.tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, &state)?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;

        log::debug!(
            "Saved ledger with {} wallets to {:?}",
            state.wallets.len(),
            path
        );
        Ok(())
    }

    /// Load the ledger from disk
    pub fn load(&self) -> Result<MemoryLedger, StorageError> {
        let path = self.ledger_path();

        if !path.exists() {
            return Err(StorageError::NotFound(format!("ledger file {:?}", path)));
        }

        Ok(MemoryLedger::from_state(read_state(&path)?))
    }

    /// Load the ledger, or start an empty one if none was saved yet
    pub fn load_or_default(&self) -> Result<MemoryLedger, StorageError> {
        if self.exists() {
            self.load()
        } else {
            log::info!("No ledger at {:?}, starting empty", self.ledger_path());
            Ok(MemoryLedger::new())
        }
    }

    /// Check if a saved ledger exists
    pub fn exists(&self) -> bool {
        self.ledger_path().exists()
    }

    /// Rotate backup files
    fn rotate_backups(&self) -> Result<(), StorageError> {
        // Delete oldest backup
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        // Shift existing backups
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// Restore from a backup
    pub fn restore_backup(&self, backup_index: usize) -> Result<MemoryLedger, StorageError> {
        let backup_path = self.backup_path(backup_index);

        if !backup_path.exists() {
            return Err(StorageError::NotFound(format!(
                "backup {}",
                backup_index
            )));
        }

        Ok(MemoryLedger::from_state(read_state(&backup_path)?))
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }
}

fn read_state(path: &Path) -> Result<LedgerState, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LedgerStore;
    use crate::wallet::Utxo;

    fn sample_utxo(vout: u32) -> Utxo {
        Utxo {
            txid: "cd".repeat(32),
            vout,
            value: 10_000,
            address: "tb1qexample".to_string(),
            address_index: vout,
            is_change: false,
            confirmed: true,
            spent: false,
        }
    }

    #[test]
    fn test_save_load_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();

        let ledger = MemoryLedger::new();
        ledger.reserve_account_id().unwrap();
        ledger.upsert_utxo("w1", sample_utxo(0)).unwrap();

        // Save
        storage.save(&ledger).unwrap();
        assert!(storage.exists());

        // Load
        let loaded = storage.load().unwrap();
        assert_eq!(loaded.reserve_account_id().unwrap(), 1);
        assert_eq!(loaded.unspent_utxos("w1").unwrap(), vec![sample_utxo(0)]);
    }

    #[test]
    fn test_missing_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();

        assert!(matches!(storage.load(), Err(StorageError::NotFound(_))));
        let empty = storage.load_or_default().unwrap();
        assert!(empty.wallets().unwrap().is_empty());
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 3,
            ..Default::default()
        };

        let storage = Storage::new(config).unwrap();
        let ledger = MemoryLedger::new();

        // Save multiple times
        for vout in 0..5 {
            ledger.upsert_utxo("w1", sample_utxo(vout)).unwrap();
            storage.save(&ledger).unwrap();
        }

        assert_eq!(storage.list_backups(), vec![0, 1, 2]);

        // Newest backup is the save before the last one
        let restored = storage.restore_backup(0).unwrap();
        assert_eq!(restored.unspent_utxos("w1").unwrap().len(), 4);
        assert!(storage.restore_backup(7).is_err());
    }
}
