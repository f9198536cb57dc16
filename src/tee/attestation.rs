//! Local Attestation — gate key operations on a TA's measured identity
//!
//! KA registers the measurements of trusted TAs (SEND_TA_HASH). A TA must
//! present one of them before the KTA acts on its behalf:
//! 1. TA presents its measurement (hash of its signed image)
//! 2. Gate checks it against the allow-list
//! 3. On acceptance the TA stays verified until revoked or the enclave restarts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Length of a TA measurement (SHA-256)
pub const MEASUREMENT_LEN: usize = 32;

/// Maximum number of measurements accepted in one registration
pub const MAX_TA_HASHES: usize = 32;

/// A TA measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaMeasurement(#[serde(with = "hex_array")] [u8; MEASUREMENT_LEN]);

impl TaMeasurement {
    pub fn from_bytes(bytes: [u8; MEASUREMENT_LEN]) -> Self {
        Self(bytes)
    }

    /// Measure a TA image
    pub fn compute(image: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(image);
        Self(h.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; MEASUREMENT_LEN] {
        &self.0
    }
}

impl fmt::Display for TaMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Attestation state of a TA identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaTrustState {
    Unverified,
    Verified {
        measurement: TaMeasurement,
        verified_at: DateTime<Utc>,
    },
}

/// Result of presenting a measurement to the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationVerdict {
    Trusted,
    Untrusted { reason: String },
}

impl AttestationVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, AttestationVerdict::Trusted)
    }
}

/// Allow-list plus per-TA verdicts
///
/// Only the allow-list is persisted; verdicts live for the enclave lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttestationGate {
    allow_list: BTreeSet<TaMeasurement>,
    #[serde(skip)]
    verified: HashMap<Uuid, TaTrustState>,
}

impl AttestationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add trusted measurements; returns how many were new
    pub fn register(&mut self, measurements: &[TaMeasurement]) -> usize {
        let added = measurements
            .iter()
            .filter(|m| self.allow_list.insert(**m))
            .count();
        log::info!(
            "Registered {} TA measurements ({} new, {} total)",
            measurements.len(),
            added,
            self.allow_list.len()
        );
        added
    }

    pub fn is_allowed(&self, measurement: &TaMeasurement) -> bool {
        self.allow_list.contains(measurement)
    }

    /// Present a measurement on behalf of `ta`
    pub fn attest(&mut self, ta: Uuid, measurement: TaMeasurement) -> AttestationVerdict {
        if !self.allow_list.contains(&measurement) {
            log::warn!("TA {} presented unknown measurement {}", ta, measurement);
            return AttestationVerdict::Untrusted {
                reason: "measurement not in allow-list".into(),
            };
        }
        if let Some(TaTrustState::Verified { measurement: known, .. }) = self.verified.get(&ta) {
            if *known != measurement {
                log::warn!("TA {} presented a different measurement than before", ta);
                return AttestationVerdict::Untrusted {
                    reason: "measurement differs from the verified one".into(),
                };
            }
            return AttestationVerdict::Trusted;
        }
        self.verified.insert(
            ta,
            TaTrustState::Verified {
                measurement,
                verified_at: Utc::now(),
            },
        );
        log::debug!("TA {} verified", ta);
        AttestationVerdict::Trusted
    }

    pub fn state(&self, ta: &Uuid) -> TaTrustState {
        self.verified
            .get(ta)
            .cloned()
            .unwrap_or(TaTrustState::Unverified)
    }

    pub fn is_verified(&self, ta: &Uuid) -> bool {
        matches!(self.verified.get(ta), Some(TaTrustState::Verified { .. }))
    }

    /// Drop a TA back to `Unverified`; returns whether it was verified
    pub fn revoke(&mut self, ta: &Uuid) -> bool {
        let revoked = self.verified.remove(ta).is_some();
        if revoked {
            log::info!("Revoked attestation of TA {}", ta);
        }
        revoked
    }

    pub fn allow_list_len(&self) -> usize {
        self.allow_list.len()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }
}

/// Split a SEND_TA_HASH buffer into measurements
pub fn parse_measurements(buffer: &[u8], count: usize) -> Option<Vec<TaMeasurement>> {
    if count == 0 || count > MAX_TA_HASHES || buffer.len() != count * MEASUREMENT_LEN {
        return None;
    }
    buffer
        .chunks_exact(MEASUREMENT_LEN)
        .map(|c| c.try_into().ok().map(TaMeasurement))
        .collect()
}

mod hex_array {
    use super::MEASUREMENT_LEN;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; MEASUREMENT_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; MEASUREMENT_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("measurement must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(image: &[u8]) -> (AttestationGate, TaMeasurement) {
        let mut gate = AttestationGate::new();
        let m = TaMeasurement::compute(image);
        gate.register(&[m]);
        (gate, m)
    }

    #[test]
    fn test_unverified_by_default() {
        let gate = AttestationGate::new();
        let ta = Uuid::new_v4();
        assert_eq!(gate.state(&ta), TaTrustState::Unverified);
        assert!(!gate.is_verified(&ta));
    }

    #[test]
    fn test_attest_known_measurement() {
        let (mut gate, m) = gate_with(b"ta-image-v1");
        let ta = Uuid::new_v4();

        assert!(gate.attest(ta, m).is_trusted());
        assert!(gate.is_verified(&ta));
        // Presenting again stays trusted
        assert!(gate.attest(ta, m).is_trusted());
    }

    #[test]
    fn test_attest_unknown_measurement() {
        let (mut gate, _) = gate_with(b"ta-image-v1");
        let ta = Uuid::new_v4();

        let verdict = gate.attest(ta, TaMeasurement::compute(b"tampered"));
        assert!(!verdict.is_trusted());
        assert!(!gate.is_verified(&ta));
    }

    #[test]
    fn test_measurement_switch_rejected() {
        let mut gate = AttestationGate::new();
        let a = TaMeasurement::compute(b"a");
        let b = TaMeasurement::compute(b"b");
        gate.register(&[a, b]);
        let ta = Uuid::new_v4();

        assert!(gate.attest(ta, a).is_trusted());
        assert!(!gate.attest(ta, b).is_trusted());
    }

    #[test]
    fn test_revoke() {
        let (mut gate, m) = gate_with(b"img");
        let ta = Uuid::new_v4();
        gate.attest(ta, m);

        assert!(gate.revoke(&ta));
        assert!(!gate.is_verified(&ta));
        assert!(!gate.revoke(&ta));
    }

    #[test]
    fn test_register_dedups() {
        let mut gate = AttestationGate::new();
        let m = TaMeasurement::compute(b"x");
        assert_eq!(gate.register(&[m, m]), 1);
        assert_eq!(gate.register(&[m]), 0);
        assert_eq!(gate.allow_list_len(), 1);
    }

    #[test]
    fn test_verdicts_not_serialized() {
        let (mut gate, m) = gate_with(b"img");
        let ta = Uuid::new_v4();
        gate.attest(ta, m);

        let json = serde_json::to_string(&gate).unwrap();
        let restored: AttestationGate = serde_json::from_str(&json).unwrap();
        assert!(restored.is_allowed(&m));
        assert!(!restored.is_verified(&ta));
    }

    #[test]
    fn test_parse_measurements() {
        let buf = vec![7u8; 64];
        let parsed = parse_measurements(&buf, 2).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].as_bytes(), &[7u8; 32]);

        assert!(parse_measurements(&buf, 3).is_none());
        assert!(parse_measurements(&buf, 0).is_none());
        assert!(parse_measurements(&vec![0u8; 33 * 32], 33).is_none());
    }
}
