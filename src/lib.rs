//! KTA — Key Trust Agent
//!
//! Remote key custody for Trusted Applications: an in-TEE key cache and
//! command queue driven one invocation at a time by a normal-world relay
//! that carries requests to the key management service.

pub mod config;
pub mod kta;
pub mod relay;
pub mod tee;

pub use config::KtaConfig;
pub use kta::{KeyLookup, KeyTrustAgent, KtaError};
pub use relay::{InMemoryKcm, KeyAgent, KtaSession, LocalTee};
pub use tee::{MemoryStorage, SealedFileStorage, SecureStorage, TaMeasurement};
