//! TA Key Cache — per-TA key material held inside the TEE
//!
//! One entry per `(ta_identity, key_id)`. Entries are created `Pending` on a
//! cache miss and resolved by a later reply; they are never removed while a
//! command that references them is still outstanding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Longest accepted key identifier, in bytes
pub const MAX_KEY_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Request outstanding with KCM
    Pending,
    /// Key material available
    Ready,
    /// Deleted locally; KCM notification may still be in flight
    Deleted,
    /// Request failed; consumed by the next lookup
    Failed,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TaKeyEntry {
    pub ta_identity: Uuid,
    pub key_id: String,
    key_material: Option<Vec<u8>>,
    pub status: KeyStatus,
    /// Sequence number of the latest command issued for this entry
    pub last_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl TaKeyEntry {
    pub fn key_material(&self) -> Option<&[u8]> {
        self.key_material.as_deref()
    }
}

impl fmt::Debug for TaKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaKeyEntry")
            .field("ta_identity", &self.ta_identity)
            .field("key_id", &self.key_id)
            .field("status", &self.status)
            .field("last_sequence", &self.last_sequence)
            .field("has_material", &self.key_material.is_some())
            .finish()
    }
}

/// Count of entries per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub pending: usize,
    pub ready: usize,
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaKeyCache {
    /// Keyed by "<ta uuid>/<key id>"
    entries: BTreeMap<String, TaKeyEntry>,
}

fn entry_key(ta: &Uuid, key_id: &str) -> String {
    format!("{}/{}", ta, key_id)
}

/// Reject empty, oversized or non-printable key identifiers
pub fn validate_key_id(key_id: &str) -> bool {
    !key_id.is_empty()
        && key_id.len() <= MAX_KEY_ID_LEN
        && !key_id.chars().any(char::is_control)
}

impl TaKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ta: &Uuid, key_id: &str) -> Option<&TaKeyEntry> {
        self.entries.get(&entry_key(ta, key_id))
    }

    /// Create or reset an entry as `Pending` on `sequence`
    pub fn mark_pending(&mut self, ta: Uuid, key_id: &str, sequence: u64) {
        let entry = self
            .entries
            .entry(entry_key(&ta, key_id))
            .or_insert_with(|| TaKeyEntry {
                ta_identity: ta,
                key_id: key_id.to_string(),
                key_material: None,
                status: KeyStatus::Pending,
                last_sequence: sequence,
                updated_at: Utc::now(),
            });
        entry.key_material = None;
        entry.status = KeyStatus::Pending;
        entry.last_sequence = sequence;
        entry.updated_at = Utc::now();
        log::debug!("Cache {}/{} -> Pending (seq {})", ta, key_id, sequence);
    }

    /// Resolve a pending entry. Only applies if `sequence` is the entry's latest command.
    pub fn mark_ready(&mut self, ta: &Uuid, key_id: &str, sequence: u64, material: Vec<u8>) -> bool {
        match self.pending_for(ta, key_id, sequence) {
            Some(entry) => {
                entry.key_material = Some(material);
                entry.status = KeyStatus::Ready;
                entry.updated_at = Utc::now();
                log::debug!("Cache {}/{} -> Ready (seq {})", ta, key_id, sequence);
                true
            }
            None => false,
        }
    }

    /// Fail a pending entry. Only applies if `sequence` is the entry's latest command.
    pub fn mark_failed(&mut self, ta: &Uuid, key_id: &str, sequence: u64) -> bool {
        match self.pending_for(ta, key_id, sequence) {
            Some(entry) => {
                entry.status = KeyStatus::Failed;
                entry.updated_at = Utc::now();
                log::debug!("Cache {}/{} -> Failed (seq {})", ta, key_id, sequence);
                true
            }
            None => false,
        }
    }

    /// Re-point a pending entry at a follow-up command
    pub fn repoint(&mut self, ta: &Uuid, key_id: &str, from: u64, to: u64) -> bool {
        match self.pending_for(ta, key_id, from) {
            Some(entry) => {
                entry.last_sequence = to;
                entry.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Mark deleted (creating a tombstone if absent); key material is wiped
    pub fn mark_deleted(&mut self, ta: Uuid, key_id: &str, sequence: u64) {
        let entry = self
            .entries
            .entry(entry_key(&ta, key_id))
            .or_insert_with(|| TaKeyEntry {
                ta_identity: ta,
                key_id: key_id.to_string(),
                key_material: None,
                status: KeyStatus::Deleted,
                last_sequence: sequence,
                updated_at: Utc::now(),
            });
        entry.key_material = None;
        entry.status = KeyStatus::Deleted;
        entry.last_sequence = sequence;
        entry.updated_at = Utc::now();
        log::debug!("Cache {}/{} -> Deleted (seq {})", ta, key_id, sequence);
    }

    pub fn remove(&mut self, ta: &Uuid, key_id: &str) -> Option<TaKeyEntry> {
        self.entries.remove(&entry_key(ta, key_id))
    }

    /// Key ids held for a TA, in key order
    pub fn keys_for_ta(&self, ta: &Uuid) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.ta_identity == *ta)
            .map(|e| e.key_id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaKeyEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.values() {
            match entry.status {
                KeyStatus::Pending => stats.pending += 1,
                KeyStatus::Ready => stats.ready += 1,
                KeyStatus::Deleted => stats.deleted += 1,
                KeyStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn pending_for(&mut self, ta: &Uuid, key_id: &str, sequence: u64) -> Option<&mut TaKeyEntry> {
        self.entries
            .get_mut(&entry_key(ta, key_id))
            .filter(|e| e.status == KeyStatus::Pending && e.last_sequence == sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_then_ready() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();

        cache.mark_pending(ta, "k1", 1);
        assert_eq!(cache.get(&ta, "k1").unwrap().status, KeyStatus::Pending);

        assert!(cache.mark_ready(&ta, "k1", 1, vec![1, 2, 3]));
        let entry = cache.get(&ta, "k1").unwrap();
        assert_eq!(entry.status, KeyStatus::Ready);
        assert_eq!(entry.key_material(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_stale_sequence_ignored() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        cache.mark_pending(ta, "k1", 1);
        cache.mark_deleted(ta, "k1", 2);

        assert!(!cache.mark_ready(&ta, "k1", 1, vec![9]));
        assert_eq!(cache.get(&ta, "k1").unwrap().status, KeyStatus::Deleted);
    }

    #[test]
    fn test_unique_per_pair() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        let other = Uuid::new_v4();

        cache.mark_pending(ta, "k1", 1);
        cache.mark_pending(ta, "k1", 2);
        cache.mark_pending(other, "k1", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&ta, "k1").unwrap().last_sequence, 2);
    }

    #[test]
    fn test_delete_wipes_material() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        cache.mark_pending(ta, "k1", 1);
        cache.mark_ready(&ta, "k1", 1, vec![7; 32]);
        cache.mark_deleted(ta, "k1", 2);

        let entry = cache.get(&ta, "k1").unwrap();
        assert_eq!(entry.status, KeyStatus::Deleted);
        assert!(entry.key_material().is_none());
    }

    #[test]
    fn test_repoint_and_fail() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        cache.mark_pending(ta, "k1", 1);

        assert!(cache.repoint(&ta, "k1", 1, 5));
        assert!(!cache.mark_failed(&ta, "k1", 1));
        assert!(cache.mark_failed(&ta, "k1", 5));
        assert_eq!(cache.stats().failed, 1);
    }

    #[test]
    fn test_keys_for_ta() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        cache.mark_pending(ta, "b", 1);
        cache.mark_pending(ta, "a", 2);
        cache.mark_pending(Uuid::new_v4(), "c", 3);
        assert_eq!(cache.keys_for_ta(&ta), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_validate_key_id() {
        assert!(validate_key_id("k1"));
        assert!(!validate_key_id(""));
        assert!(!validate_key_id(&"x".repeat(MAX_KEY_ID_LEN + 1)));
        assert!(!validate_key_id("bad\nid"));
    }

    #[test]
    fn test_debug_hides_material() {
        let mut cache = TaKeyCache::new();
        let ta = Uuid::new_v4();
        cache.mark_pending(ta, "k1", 1);
        cache.mark_ready(&ta, "k1", 1, b"secret-bytes".to_vec());
        let printed = format!("{:?}", cache.get(&ta, "k1").unwrap());
        assert!(!printed.contains("key_material"));
        assert!(printed.contains("has_material: true"));
    }
}
