//! Relay side (KA) — everything that runs outside the TEE
//!
//! - **Session**: scoped sessions over a [`TrustedEndpoint`]
//! - **KCM**: the key management service seam and an in-memory service
//! - **Agent**: the polling loop carrying commands and replies

pub mod agent;
pub mod kcm;
pub mod session;

pub use agent::{KeyAgent, PollReport, RelayConfig};
pub use kcm::{InMemoryKcm, KeyManagementService};
pub use session::{KtaSession, LocalTee, TrustedEndpoint};
