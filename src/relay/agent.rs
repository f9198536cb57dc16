//! Key Agent — normal-world relay between the KTA and KCM
//!
//! The KTA cannot reach the network, so KA polls it: each poll opens a
//! session, drains queued commands, forwards them to KCM and hands every
//! answer back as a separate RESPOND_REQUEST.

use super::kcm::KeyManagementService;
use super::session::{KtaSession, TrustedEndpoint};
use crate::kta::KtaError;
use crate::tee::TaMeasurement;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Configuration for the polling relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Delay between polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Upper bound on GET_REQUEST rounds within one poll
    pub max_rounds: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_rounds: 16,
        }
    }
}

/// What one poll accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub rounds: usize,
    pub delivered: usize,
    pub accepted: usize,
    pub rejected: usize,
}

pub struct KeyAgent<E: TrustedEndpoint, K: KeyManagementService> {
    pub config: RelayConfig,
    endpoint: E,
    kcm: K,
}

impl<E: TrustedEndpoint, K: KeyManagementService> KeyAgent<E, K> {
    pub fn new(endpoint: E, kcm: K, config: RelayConfig) -> Self {
        Self {
            config,
            endpoint,
            kcm,
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn kcm(&self) -> &K {
        &self.kcm
    }

    /// Provision the KTA and register its certificate with KCM
    pub fn bootstrap(
        &mut self,
        kcm_public_key: &[u8],
        kta_certificate: &[u8],
        kta_private_key: &[u8],
    ) -> Result<Vec<u8>, KtaError> {
        let session = KtaSession::open(&self.endpoint)?;
        let certificate = session.initialize(kcm_public_key, kta_certificate, kta_private_key)?;
        self.kcm.register_kta(&certificate);
        info!("KTA bootstrapped through session {}", session.id());
        Ok(certificate)
    }

    pub fn register_ta_hashes(&self, measurements: &[TaMeasurement]) -> Result<(), KtaError> {
        KtaSession::open(&self.endpoint)?.send_ta_hashes(measurements)
    }

    /// Tear the KTA down (testing)
    pub fn close_kta(&self) -> Result<(), KtaError> {
        KtaSession::open(&self.endpoint)?.close_kta()
    }

    /// Drain the KTA until a poll comes back empty
    pub fn poll_once(&mut self) -> Result<PollReport, KtaError> {
        let session = KtaSession::open(&self.endpoint)?;
        let mut report = PollReport::default();

        while report.rounds < self.config.max_rounds {
            let batch = session.get_requests()?;
            report.rounds += 1;
            if batch.commands.is_empty() && batch.remaining == 0 {
                break;
            }
            report.delivered += batch.commands.len();

            for command in &batch.commands {
                let reply = self.kcm.handle(command);
                match session.respond(&reply) {
                    Ok(true) => report.accepted += 1,
                    Ok(false) => report.rejected += 1,
                    Err(e) => {
                        warn!("KTA rejected reply for seq {}: {}", command.sequence, e);
                        report.rejected += 1;
                    }
                }
            }
        }

        if report.delivered > 0 {
            info!(
                "Relayed {} commands in {} rounds ({} rejected)",
                report.delivered, report.rounds, report.rejected
            );
        }
        Ok(report)
    }

    /// Poll on an interval until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut interval = time::interval(Duration::from_millis(self.config.poll_interval_ms));
        info!("Key agent polling every {} ms", self.config.poll_interval_ms);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once() {
                        warn!("Poll failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Key agent stopped");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KtaConfig;
    use crate::kta::{KeyLookup, KeyTrustAgent};
    use crate::relay::{InMemoryKcm, LocalTee};
    use crate::tee::MemoryStorage;
    use uuid::Uuid;

    fn setup(config: RelayConfig) -> (KeyAgent<LocalTee<MemoryStorage>, InMemoryKcm>, LocalTee<MemoryStorage>, Uuid) {
        let kta = KeyTrustAgent::open(KtaConfig::default(), MemoryStorage::new()).unwrap();
        let tee = LocalTee::new(kta);
        let mut agent = KeyAgent::new(tee.clone(), InMemoryKcm::new(), config);

        agent.bootstrap(b"kcm-pub", b"kta-cert", b"kta-key").unwrap();
        let m = TaMeasurement::compute(b"ta-image");
        agent.register_ta_hashes(&[m]).unwrap();

        let ta = Uuid::new_v4();
        tee.with_agent(|kta| kta.attest_ta(ta, m)).unwrap().unwrap();
        (agent, tee, ta)
    }

    #[test]
    fn test_bootstrap_registers_certificate() {
        let (agent, _, _) = setup(RelayConfig::default());
        assert_eq!(agent.kcm().kta_certificates(), &[b"kta-cert".to_vec()]);
    }

    #[test]
    fn test_poll_resolves_miss_via_generate() {
        let (mut agent, tee, ta) = setup(RelayConfig::default());
        let lookup = tee.with_agent(|kta| kta.search_key(ta, "k1")).unwrap().unwrap();
        assert_eq!(lookup, KeyLookup::Pending { sequence: 1 });

        // Search comes back NotFound, the follow-up generate goes out next round
        let report = agent.poll_once().unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 0);

        let expected = agent.kcm().key(&ta, "k1").unwrap().to_vec();
        let lookup = tee.with_agent(|kta| kta.search_key(ta, "k1")).unwrap().unwrap();
        assert_eq!(lookup, KeyLookup::Ready(expected));
        assert_eq!(tee.open_sessions(), 0);
    }

    #[test]
    fn test_poll_with_empty_queue() {
        let (mut agent, _, _) = setup(RelayConfig::default());
        let report = agent.poll_once().unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_poll_relays_many_commands() {
        let (mut agent, tee, ta) = setup(RelayConfig::default());
        tee.with_agent(|kta| {
            for i in 0..20 {
                kta.generate_key(ta, &format!("k{}", i), &[]).unwrap();
            }
        })
        .unwrap();
        let report = agent.poll_once().unwrap();
        assert_eq!(report.accepted, 20);
        let stats = tee.with_agent(|kta| kta.status().cache).unwrap();
        assert_eq!(stats.ready, 20);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let config = RelayConfig {
            poll_interval_ms: 10,
            ..RelayConfig::default()
        };
        let (agent, tee, ta) = setup(config);
        tee.with_agent(|kta| kta.search_key(ta, "k1")).unwrap().unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(agent.run(rx));
        time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let agent = handle.await.unwrap();

        assert!(agent.kcm().handled() >= 2);
        let lookup = tee.with_agent(|kta| kta.search_key(ta, "k1")).unwrap().unwrap();
        assert!(matches!(lookup, KeyLookup::Ready(_)));
    }
}
