//! TEE services used by the Key Trust Agent
//!
//! - **Attestation**: local attestation gate over registered TA measurements
//! - **Sealed Storage**: persistent records protected by the device sealing key

pub mod attestation;
pub mod sealed_storage;

pub use attestation::{
    parse_measurements, AttestationGate, AttestationVerdict, TaMeasurement, TaTrustState,
    MAX_TA_HASHES, MEASUREMENT_LEN,
};
pub use sealed_storage::{MemoryStorage, SealedFileStorage, SecureStorage, StorageError};
