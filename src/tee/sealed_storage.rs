//! Sealed Storage — persistent records protected by the TEE sealing key
//!
//! The KTA persists a handful of named records (trust anchor material and the
//! cache/queue snapshot). Writes go through [`SecureStorage::commit`], which is
//! all-or-nothing: a crash part way through a commit never leaves a mix of old
//! and new records visible.
//!
//! - [`SealedFileStorage`]: one sealed JSON file per record plus a redo journal
//! - [`MemoryStorage`]: process-local store with fault injection, for tests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "journal.json";
const RECORD_EXT: &str = "sealed";

/// Storage-layer errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Sealing error: {0}")]
    SealingError(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),
}

/// Secure-storage primitives the KTA relies on
pub trait SecureStorage {
    /// Read a record, `None` if it was never written
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write every record or none of them
    fn commit(&mut self, writes: &[(&str, &[u8])]) -> Result<(), StorageError>;

    /// Remove records; missing ones are ignored
    fn erase(&mut self, names: &[&str]) -> Result<(), StorageError>;
}

/// On-disk form of a sealed record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedRecord {
    name: String,
    /// nonce || ciphertext || mac, hex-encoded
    sealed: String,
    sealed_at: DateTime<Utc>,
}

/// File-backed sealed storage
pub struct SealedFileStorage {
    storage_dir: PathBuf,
    sealing_key: Vec<u8>,
}

impl SealedFileStorage {
    /// Open the store, replaying a journal left behind by an interrupted commit
    pub fn open(storage_dir: impl AsRef<Path>, device_secret: &str) -> Result<Self, StorageError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)
            .map_err(|e| StorageError::Io(format!("Create dir: {}", e)))?;

        let store = Self {
            storage_dir,
            sealing_key: derive_sealing_key(device_secret),
        };
        store.replay_journal()?;
        Ok(store)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.{}", name, RECORD_EXT))
    }

    fn replay_journal(&self) -> Result<(), StorageError> {
        let path = self.storage_dir.join(JOURNAL_FILE);
        if !path.exists() {
            return Ok(());
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Read journal: {}", e)))?;
        match serde_json::from_str::<Vec<SealedRecord>>(&json) {
            Ok(records) => {
                log::warn!("Replaying interrupted storage commit ({} records)", records.len());
                self.apply(&records)?;
            }
            Err(e) => {
                // The journal rename is the commit point, so an unreadable one was never committed
                log::warn!("Discarding unreadable storage journal: {}", e);
            }
        }
        std::fs::remove_file(&path).map_err(|e| StorageError::Io(format!("Remove journal: {}", e)))
    }

    fn apply(&self, records: &[SealedRecord]) -> Result<(), StorageError> {
        for record in records {
            let json = serde_json::to_string_pretty(record)
                .map_err(|e| StorageError::SealingError(format!("Serialize: {}", e)))?;
            write_atomic(&self.record_path(&record.name), json.as_bytes())?;
        }
        Ok(())
    }

    /// Restore overwritten records, then drop the journal.
    ///
    /// If a record cannot be restored the journal is kept, so the next open
    /// replays the whole commit instead of exposing a mix of old and new.
    fn roll_back(&self, applied: &[SealedRecord], previous: &[Option<Vec<u8>>], journal_path: &Path) {
        let mut restored = true;
        for (record, prior) in applied.iter().zip(previous) {
            let path = self.record_path(&record.name);
            let result = match prior {
                Some(bytes) => write_atomic(&path, bytes),
                None => std::fs::remove_file(&path)
                    .map_err(|e| StorageError::Io(format!("Remove {}: {}", record.name, e))),
            };
            if let Err(e) = result {
                log::error!("Could not restore '{}' after failed commit: {}", record.name, e);
                restored = false;
            }
        }
        if restored {
            if let Err(e) = std::fs::remove_file(journal_path) {
                log::error!("Could not remove journal after rollback: {}", e);
            }
        }
    }
}

impl SecureStorage for SealedFileStorage {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Read {}: {}", name, e)))?;
        let record: SealedRecord = serde_json::from_str(&json)
            .map_err(|e| StorageError::SealingError(format!("Parse {}: {}", name, e)))?;
        if record.name != name {
            return Err(StorageError::IntegrityError(format!(
                "record '{}' stored under '{}'",
                record.name, name
            )));
        }
        let sealed = hex::decode(&record.sealed)
            .map_err(|e| StorageError::SealingError(format!("Hex decode {}: {}", name, e)))?;
        unseal(&self.sealing_key, name, &sealed).map(Some)
    }

    fn commit(&mut self, writes: &[(&str, &[u8])]) -> Result<(), StorageError> {
        let now = Utc::now();
        let records: Vec<SealedRecord> = writes
            .iter()
            .map(|(name, data)| SealedRecord {
                name: name.to_string(),
                sealed: hex::encode(seal(&self.sealing_key, name, data)),
                sealed_at: now,
            })
            .collect();

        // Prior contents, so a failed apply can be undone before anyone sees it
        let previous = records
            .iter()
            .map(|record| read_existing(&self.record_path(&record.name)))
            .collect::<Result<Vec<_>, _>>()?;

        let journal = serde_json::to_vec(&records)
            .map_err(|e| StorageError::SealingError(format!("Serialize journal: {}", e)))?;
        let journal_path = self.storage_dir.join(JOURNAL_FILE);
        write_atomic(&journal_path, &journal)?;

        for (applied, record) in records.iter().enumerate() {
            if let Err(e) = self.apply(std::slice::from_ref(record)) {
                log::warn!("Sealed commit failed on '{}', rolling back: {}", record.name, e);
                self.roll_back(&records[..applied], &previous[..applied], &journal_path);
                return Err(e);
            }
        }
        std::fs::remove_file(&journal_path)
            .map_err(|e| StorageError::Io(format!("Remove journal: {}", e)))?;

        log::debug!("Committed {} sealed records", records.len());
        Ok(())
    }

    fn erase(&mut self, names: &[&str]) -> Result<(), StorageError> {
        for name in names {
            let path = self.record_path(name);
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| StorageError::Io(format!("Remove {}: {}", name, e)))?;
            }
        }
        Ok(())
    }
}

/// In-memory store. Records are kept unsealed.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: HashMap<String, Vec<u8>>,
    fail_next_commit: bool,
    commits: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail without writing anything
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> usize {
        self.commits
    }
}

impl SecureStorage for MemoryStorage {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.get(name).cloned())
    }

    fn commit(&mut self, writes: &[(&str, &[u8])]) -> Result<(), StorageError> {
        if self.fail_next_commit {
            self.fail_next_commit = false;
            return Err(StorageError::Io("injected commit failure".into()));
        }
        for (name, data) in writes {
            self.records.insert(name.to_string(), data.to_vec());
        }
        self.commits += 1;
        Ok(())
    }

    fn erase(&mut self, names: &[&str]) -> Result<(), StorageError> {
        for name in names {
            self.records.remove(*name);
        }
        Ok(())
    }
}

// --- Sealing (simulated hardware key: SHA256 keystream + MAC) ---

fn derive_sealing_key(device_secret: &str) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(device_secret.as_bytes());
    h.update(b"kta-sealing-key-v1");
    h.finalize().to_vec()
}

fn seal(key: &[u8], name: &str, plaintext: &[u8]) -> Vec<u8> {
    let nonce: [u8; 16] = rand::random();
    let keystream = keystream(key, &nonce, plaintext.len());

    let mut sealed = Vec::with_capacity(16 + plaintext.len() + 32);
    sealed.extend_from_slice(&nonce);
    sealed.extend(plaintext.iter().zip(&keystream).map(|(b, k)| b ^ k));
    sealed.extend_from_slice(&mac(key, &nonce, name, plaintext));
    sealed
}

fn unseal(key: &[u8], name: &str, sealed: &[u8]) -> Result<Vec<u8>, StorageError> {
    if sealed.len() < 48 {
        // 16 nonce + 0 data + 32 mac
        return Err(StorageError::SealingError("Sealed data too short".into()));
    }
    let nonce = &sealed[..16];
    let tag = &sealed[sealed.len() - 32..];
    let ciphertext = &sealed[16..sealed.len() - 32];

    let keystream = keystream(key, nonce, ciphertext.len());
    let plaintext: Vec<u8> = ciphertext.iter().zip(&keystream).map(|(b, k)| b ^ k).collect();

    if tag != mac(key, nonce, name, &plaintext).as_slice() {
        return Err(StorageError::IntegrityError(format!("MAC mismatch on '{}'", name)));
    }
    Ok(plaintext)
}

fn keystream(key: &[u8], nonce: &[u8], len: usize) -> Vec<u8> {
    let mut keystream = Vec::with_capacity(len);
    let mut counter = 0u64;
    while keystream.len() < len {
        let mut h = Sha256::new();
        h.update(key);
        h.update(nonce);
        h.update(counter.to_le_bytes());
        keystream.extend_from_slice(&h.finalize());
        counter += 1;
    }
    keystream.truncate(len);
    keystream
}

fn mac(key: &[u8], nonce: &[u8], name: &str, plaintext: &[u8]) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(key);
    h.update(nonce);
    h.update(name.as_bytes());
    h.update(plaintext);
    h.update(b"kta-record-mac-v1");
    h.finalize().to_vec()
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    std::fs::read(path)
        .map(Some)
        .map_err(|e| StorageError::Io(format!("Read {}: {}", path.display(), e)))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(|e| StorageError::Io(format!("Write: {}", e)))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::Io(format!("Rename: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kta-sealed-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_commit_and_load() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();

        storage
            .commit(&[("kcmpub", &b"kcm-public-key"[..]), ("ktacert", &b"kta-cert"[..])])
            .unwrap();

        assert_eq!(storage.load("kcmpub").unwrap().unwrap(), b"kcm-public-key");
        assert_eq!(storage.load("ktacert").unwrap().unwrap(), b"kta-cert");
        assert!(storage.load("ktakey").unwrap().is_none());
        assert!(!dir.join(JOURNAL_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_records_are_not_plaintext() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
        storage.commit(&[("ktakey", &b"very-private-key-bytes"[..])]).unwrap();

        let raw = std::fs::read_to_string(dir.join("ktakey.sealed")).unwrap();
        assert!(!raw.contains(&hex::encode(b"very-private-key-bytes")));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = test_dir();
        {
            let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
            storage.commit(&[("ktastate", &b"{}"[..])]).unwrap();
        }
        let storage = SealedFileStorage::open(&dir, "secret").unwrap();
        assert_eq!(storage.load("ktastate").unwrap().unwrap(), b"{}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_wrong_device_secret_fails_integrity() {
        let dir = test_dir();
        {
            let mut storage = SealedFileStorage::open(&dir, "secret-a").unwrap();
            storage.commit(&[("ktacert", &b"cert"[..])]).unwrap();
        }
        let storage = SealedFileStorage::open(&dir, "secret-b").unwrap();
        assert!(matches!(
            storage.load("ktacert"),
            Err(StorageError::IntegrityError(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_swapped_record_is_rejected() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
        storage.commit(&[("kcmpub", &b"a"[..]), ("ktacert", &b"b"[..])]).unwrap();

        std::fs::copy(dir.join("kcmpub.sealed"), dir.join("ktacert.sealed")).unwrap();
        assert!(storage.load("ktacert").is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_interrupted_commit_is_replayed() {
        let dir = test_dir();
        let key = derive_sealing_key("secret");
        let records = vec![
            SealedRecord {
                name: "kcmpub".into(),
                sealed: hex::encode(seal(&key, "kcmpub", b"pub")),
                sealed_at: Utc::now(),
            },
            SealedRecord {
                name: "ktacert".into(),
                sealed: hex::encode(seal(&key, "ktacert", b"cert")),
                sealed_at: Utc::now(),
            },
        ];
        // Journal written, records never applied
        std::fs::write(dir.join(JOURNAL_FILE), serde_json::to_vec(&records).unwrap()).unwrap();

        let storage = SealedFileStorage::open(&dir, "secret").unwrap();
        assert_eq!(storage.load("kcmpub").unwrap().unwrap(), b"pub");
        assert_eq!(storage.load("ktacert").unwrap().unwrap(), b"cert");
        assert!(!dir.join(JOURNAL_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_apply_rolls_back() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
        storage.commit(&[("kcmpub", &b"old-pub"[..])]).unwrap();

        // A directory in place of the temp file makes the third write fail
        std::fs::create_dir(dir.join("ktakey.tmp")).unwrap();
        let result = storage.commit(&[
            ("kcmpub", &b"new-pub"[..]),
            ("ktacert", &b"cert"[..]),
            ("ktakey", &b"key"[..]),
        ]);
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(!dir.join(JOURNAL_FILE).exists());
        assert_eq!(storage.load("kcmpub").unwrap().unwrap(), b"old-pub");
        assert!(storage.load("ktacert").unwrap().is_none());
        assert!(storage.load("ktakey").unwrap().is_none());

        // Nothing resurfaces after a restart
        std::fs::remove_dir(dir.join("ktakey.tmp")).unwrap();
        drop(storage);
        let storage = SealedFileStorage::open(&dir, "secret").unwrap();
        assert_eq!(storage.load("kcmpub").unwrap().unwrap(), b"old-pub");
        assert!(storage.load("ktacert").unwrap().is_none());
        assert!(storage.load("ktakey").unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_commit_succeeds_after_failed_one() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
        std::fs::create_dir(dir.join("b.tmp")).unwrap();
        assert!(storage.commit(&[("a", &b"1"[..]), ("b", &b"2"[..])]).is_err());

        std::fs::remove_dir(dir.join("b.tmp")).unwrap();
        storage.commit(&[("a", &b"1"[..]), ("b", &b"2"[..])]).unwrap();
        assert_eq!(storage.load("a").unwrap().unwrap(), b"1");
        assert_eq!(storage.load("b").unwrap().unwrap(), b"2");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_erase() {
        let dir = test_dir();
        let mut storage = SealedFileStorage::open(&dir, "secret").unwrap();
        storage.commit(&[("a", &b"1"[..]), ("b", &b"2"[..])]).unwrap();
        storage.erase(&["a", "missing"]).unwrap();
        assert!(storage.load("a").unwrap().is_none());
        assert!(storage.load("b").unwrap().is_some());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_memory_fault_injection() {
        let mut storage = MemoryStorage::new();
        storage.fail_next_commit();
        assert!(storage.commit(&[("a", &b"1"[..])]).is_err());
        assert!(!storage.contains("a"));

        storage.commit(&[("a", &b"1"[..])]).unwrap();
        assert!(storage.contains("a"));
        assert_eq!(storage.commit_count(), 1);
    }
}
