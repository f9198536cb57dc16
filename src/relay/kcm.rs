//! Key and Certificate Management service seam
//!
//! KA forwards every shipped command to a [`KeyManagementService`] and relays
//! its answer back. [`InMemoryKcm`] keeps keys in a table for demos and tests.

use crate::kta::{CommandKind, CommandReply, WireCommand};
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Length of keys minted by the in-memory service
pub const GENERATED_KEY_LEN: usize = 32;

pub trait KeyManagementService {
    /// Record the certificate a freshly bootstrapped KTA presented
    fn register_kta(&mut self, certificate: &[u8]);

    fn handle(&mut self, command: &WireCommand) -> CommandReply;
}

#[derive(Debug, Default)]
pub struct InMemoryKcm {
    keys: HashMap<(Uuid, String), Vec<u8>>,
    revoked: HashSet<(Uuid, String)>,
    kta_certificates: Vec<Vec<u8>>,
    handled: usize,
}

impl InMemoryKcm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key as if it had been provisioned earlier
    pub fn preload(&mut self, ta: Uuid, key_id: &str, material: &[u8]) {
        self.keys.insert((ta, key_id.to_string()), material.to_vec());
    }

    pub fn key(&self, ta: &Uuid, key_id: &str) -> Option<&[u8]> {
        self.keys.get(&(*ta, key_id.to_string())).map(Vec::as_slice)
    }

    pub fn is_revoked(&self, ta: &Uuid, key_id: &str) -> bool {
        self.revoked.contains(&(*ta, key_id.to_string()))
    }

    pub fn kta_certificates(&self) -> &[Vec<u8>] {
        &self.kta_certificates
    }

    pub fn handled(&self) -> usize {
        self.handled
    }
}

impl KeyManagementService for InMemoryKcm {
    fn register_kta(&mut self, certificate: &[u8]) {
        log::info!("KCM registered KTA certificate ({} bytes)", certificate.len());
        self.kta_certificates.push(certificate.to_vec());
    }

    fn handle(&mut self, command: &WireCommand) -> CommandReply {
        self.handled += 1;
        let id = (command.ta_identity, command.key_id.clone());

        match command.kind {
            CommandKind::SearchKey => match self.keys.get(&id) {
                Some(material) => CommandReply::success(command.sequence, material),
                None => CommandReply::not_found(command.sequence),
            },
            CommandKind::GenerateKey => {
                if self.revoked.contains(&id) {
                    log::warn!("KCM refusing to regenerate revoked key {}/{}", id.0, id.1);
                    return CommandReply::failure(command.sequence);
                }
                let material = self.keys.entry(id).or_insert_with(|| {
                    let mut key = vec![0u8; GENERATED_KEY_LEN];
                    rand::thread_rng().fill_bytes(&mut key);
                    key
                });
                CommandReply::success(command.sequence, material)
            }
            CommandKind::DeleteKey => {
                if self.keys.remove(&id).is_none() {
                    log::debug!("KCM had no record of {}/{} to retire", id.0, id.1);
                }
                CommandReply::success(command.sequence, &[])
            }
            CommandKind::DestroyKey => {
                self.keys.remove(&id);
                self.revoked.insert(id);
                CommandReply::success(command.sequence, &[])
            }
        }
    }
}
