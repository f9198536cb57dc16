//! Key Trust Agent — remote key custody for Trusted Applications
//!
//! The KTA keeps a per-TA key cache inside the TEE and reaches the external
//! key management service (KCM) only through a polling relay (KA):
//! - **Trust anchor**: one-time bootstrap of KCM's key and the KTA identity
//! - **Cache**: per-TA key entries with their request status
//! - **Queue**: bounded, sequence-numbered commands waiting for KA
//! - **Agent**: the state machine tying them together across invocations
//! - **Invoke**: the relay-facing command identifiers and parameter checks

pub mod agent;
pub mod cache;
pub mod error;
pub mod invoke;
pub mod protocol;
pub mod queue;
pub mod trust_anchor;

pub use agent::{KeyLookup, KeyTrustAgent, KtaState, KtaStatus, PolledRequests, ReplyOutcome};
pub use cache::{CacheStats, KeyStatus, TaKeyCache, TaKeyEntry};
pub use error::KtaError;
pub use invoke::{KtaCommand, Memref, Param, ParamType, Params};
pub use protocol::{CommandReply, ReplyResult, RequestBatch, WireCommand};
pub use queue::{Command, CommandKind, CommandQueue, CommandStatus};
pub use trust_anchor::TrustAnchor;
