//! Key Trust Agent — cross-invocation state machine
//!
//! Each method is one invocation: it runs to completion, never waits on KA or
//! KCM, and leaves all progress in persisted state. A request moves
//! `RequestedLocally → Pending(seq) → Ready | Failed`; the first transition
//! happens inside the TA call that missed the cache, the second only inside a
//! later RESPOND_REQUEST carrying the reply for `seq`.
//!
//! Mutations run against a copy of the state which is persisted and only then
//! swapped in, so a failing invocation leaves no partial effects.

use super::cache::{validate_key_id, CacheStats, KeyStatus, TaKeyCache};
use super::error::KtaError;
use super::protocol::{CommandReply, ReplyResult, RequestBatch, WireCommand};
use super::queue::{Command, CommandKind, CommandQueue, CommandStatus};
use super::trust_anchor::{TrustAnchor, ANCHOR_RECORDS, MAX_KEY_LEN};
use crate::config::KtaConfig;
use crate::tee::{AttestationGate, AttestationVerdict, SecureStorage, StorageError, TaMeasurement, MAX_TA_HASHES};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record holding the cache/queue/allow-list snapshot
pub const STATE_RECORD: &str = "ktastate";

/// Everything the KTA keeps between invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KtaState {
    pub cache: TaKeyCache,
    pub queue: CommandQueue,
    pub gate: AttestationGate,
}

impl KtaState {
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            cache: TaKeyCache::new(),
            queue: CommandQueue::new(max_queue_depth),
            gate: AttestationGate::new(),
        }
    }
}

/// Answer to a TA key lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLookup {
    Ready(Vec<u8>),
    /// Request outstanding; retry later
    Pending { sequence: u64 },
    /// The last request failed; the next lookup starts over
    Failed,
}

/// Outcome of a GET_REQUEST
#[derive(Debug, Clone)]
pub struct PolledRequests {
    pub batch: RequestBatch,
    pub returned: usize,
    pub remaining: usize,
    pub expired: usize,
}

/// Outcome of an accepted reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub sequence: u64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    /// Follow-up GenerateKey issued after a search came back empty
    pub follow_up: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KtaStatus {
    pub initialized: bool,
    pub cache: CacheStats,
    pub queue_depth: usize,
    pub queued: usize,
    pub max_queue_depth: usize,
    pub next_sequence: u64,
    pub trusted_measurements: usize,
    pub verified_tas: usize,
}

pub struct KeyTrustAgent<S: SecureStorage> {
    config: KtaConfig,
    storage: S,
    anchor: Option<TrustAnchor>,
    state: KtaState,
}

impl<S: SecureStorage> KeyTrustAgent<S> {
    /// Start the agent, restoring whatever a previous run persisted
    pub fn open(config: KtaConfig, storage: S) -> Result<Self, KtaError> {
        config
            .validate()
            .map_err(|e| KtaError::BadParameters(e.to_string()))?;

        let anchor = TrustAnchor::load(&storage)?;
        let mut state = match (&anchor, storage.load(STATE_RECORD)?) {
            (Some(_), Some(bytes)) => serde_json::from_slice::<KtaState>(&bytes).map_err(|e| {
                KtaError::Storage(StorageError::IntegrityError(format!("state snapshot: {}", e)))
            })?,
            (None, Some(bytes)) => {
                // Left behind by a close: only the sequence counter carries over
                let mut fresh = KtaState::new(config.max_queue_depth);
                match serde_json::from_slice::<KtaState>(&bytes) {
                    Ok(saved) => fresh.queue.resume_from(saved.queue.next_sequence()),
                    Err(e) => log::warn!("Ignoring unreadable state snapshot: {}", e),
                }
                fresh
            }
            (_, None) => KtaState::new(config.max_queue_depth),
        };
        state.queue.set_max_depth(config.max_queue_depth);

        log::info!(
            "KTA opened: initialized={}, {} cache entries, {} queued commands",
            anchor.is_some(),
            state.cache.len(),
            state.queue.depth()
        );

        Ok(Self {
            config,
            storage,
            anchor,
            state,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn trust_anchor(&self) -> Option<&TrustAnchor> {
        self.anchor.as_ref()
    }

    pub fn state(&self) -> &KtaState {
        &self.state
    }

    pub fn config(&self) -> &KtaConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn status(&self) -> KtaStatus {
        KtaStatus {
            initialized: self.is_initialized(),
            cache: self.state.cache.stats(),
            queue_depth: self.state.queue.depth(),
            queued: self.state.queue.queued_count(),
            max_queue_depth: self.state.queue.max_depth(),
            next_sequence: self.state.queue.next_sequence(),
            trusted_measurements: self.state.gate.allow_list_len(),
            verified_tas: self.state.gate.verified_count(),
        }
    }

    // --- Bootstrap and administration (KA side) ---

    /// Provision the trust anchor; returns the stored KTA certificate for KCM
    pub fn initialize(
        &mut self,
        kcm_public_key: &[u8],
        kta_certificate: &[u8],
        kta_private_key: &[u8],
    ) -> Result<Vec<u8>, KtaError> {
        let anchor = TrustAnchor::new(kcm_public_key, kta_certificate, kta_private_key)?;
        if self.anchor.is_some() {
            log::warn!("Rejecting re-initialization of an initialized KTA");
            return Err(KtaError::AlreadyInitialized);
        }

        let mut state = KtaState::new(self.config.max_queue_depth);
        state.queue.resume_from(self.state.queue.next_sequence());
        let snapshot = encode_state(&state)?;
        let mut writes = anchor.records().to_vec();
        writes.push((STATE_RECORD, snapshot.as_slice()));
        self.storage.commit(&writes)?;

        let certificate = anchor.kta_certificate().to_vec();
        self.anchor = Some(anchor);
        self.state = state;
        log::info!("KTA initialized, certificate {} bytes", certificate.len());
        Ok(certificate)
    }

    /// Add trusted TA measurements to the allow-list
    pub fn register_ta_hashes(&mut self, measurements: &[TaMeasurement]) -> Result<usize, KtaError> {
        self.require_initialized()?;
        if measurements.is_empty() || measurements.len() > MAX_TA_HASHES {
            return Err(KtaError::BadParameters(format!(
                "hash count must be 1..={}, got {}",
                MAX_TA_HASHES,
                measurements.len()
            )));
        }
        self.transact(|s| Ok(s.gate.register(measurements)))
    }

    /// Drain up to `max_count` commands for KA.
    ///
    /// `emit` receives the encoded batch before anything is committed; an error
    /// from it (e.g. output buffer too small) aborts the poll with no effect.
    pub fn poll_requests(
        &mut self,
        max_count: usize,
        emit: impl FnOnce(&[u8]) -> Result<(), KtaError>,
    ) -> Result<PolledRequests, KtaError> {
        self.require_initialized()?;
        let reply_timeout = self.config.reply_timeout_polls;

        self.transact(|s| {
            let batch = s.queue.drain_for_poll(max_count, reply_timeout)?;
            for cmd in &batch.expired {
                fail_entry(s, cmd);
                collect_tombstone(s, &cmd.ta_identity, &cmd.key_id);
            }

            let wire = RequestBatch::new(
                batch.commands.iter().map(WireCommand::from).collect(),
                batch.remaining,
            );
            let bytes = wire
                .to_bytes()
                .map_err(|e| KtaError::GenericFailure(format!("encode batch: {}", e)))?;
            emit(&bytes)?;

            Ok(PolledRequests {
                returned: batch.commands.len(),
                remaining: batch.remaining,
                expired: batch.expired.len(),
                batch: wire,
            })
        })
    }

    /// Convenience wrapper over [`poll_requests`](Self::poll_requests) without an output buffer
    pub fn get_requests(&mut self, max_count: usize) -> Result<PolledRequests, KtaError> {
        self.poll_requests(max_count, |_| Ok(()))
    }

    /// Apply KCM's reply to a shipped command
    pub fn submit_reply(&mut self, reply: &CommandReply) -> Result<ReplyOutcome, KtaError> {
        self.require_initialized()?;
        let payload = reply.decode_payload()?;

        self.transact(|s| {
            let kind = s.queue.get(reply.sequence).map(|c| c.kind);
            let yields_key = kind.map_or(false, |k| k.yields_key());
            if yields_key
                && reply.result == ReplyResult::Success
                && (payload.is_empty() || payload.len() > MAX_KEY_LEN)
            {
                return Err(KtaError::BadBufferData(format!(
                    "key material must be 1..={} bytes, got {}",
                    MAX_KEY_LEN,
                    payload.len()
                )));
            }

            // NotFound only completes a search; anything else asked for something that exists
            let success = match reply.result {
                ReplyResult::Success => true,
                ReplyResult::NotFound => kind == Some(CommandKind::SearchKey),
                ReplyResult::Failure => false,
            };
            let cmd = s.queue.finalize(reply.sequence, success)?;
            let mut follow_up = None;

            match (cmd.kind, reply.result) {
                (CommandKind::SearchKey | CommandKind::GenerateKey, ReplyResult::Success) => {
                    s.cache
                        .mark_ready(&cmd.ta_identity, &cmd.key_id, cmd.sequence, payload);
                }
                (CommandKind::SearchKey, ReplyResult::NotFound) => {
                    let pending = s
                        .cache
                        .get(&cmd.ta_identity, &cmd.key_id)
                        .map_or(false, |e| {
                            e.status == KeyStatus::Pending && e.last_sequence == cmd.sequence
                        });
                    if pending {
                        let seq = s.queue.enqueue(
                            CommandKind::GenerateKey,
                            cmd.ta_identity,
                            &cmd.key_id,
                            Vec::new(),
                        )?;
                        s.cache
                            .repoint(&cmd.ta_identity, &cmd.key_id, cmd.sequence, seq);
                        follow_up = Some(seq);
                    }
                }
                (CommandKind::SearchKey | CommandKind::GenerateKey, _) => fail_entry(s, &cmd),
                (CommandKind::DeleteKey | CommandKind::DestroyKey, _) => {}
            }
            collect_tombstone(s, &cmd.ta_identity, &cmd.key_id);

            log::debug!(
                "Reply seq {} ({:?}) -> {:?}{}",
                cmd.sequence,
                cmd.kind,
                cmd.status,
                follow_up.map(|f| format!(", follow-up seq {}", f)).unwrap_or_default()
            );
            Ok(ReplyOutcome {
                sequence: cmd.sequence,
                kind: cmd.kind,
                status: cmd.status,
                follow_up,
            })
        })
    }

    /// Tear everything down, including persisted records.
    ///
    /// The sequence counter survives, so replies still in flight for the old
    /// queue can never match commands issued after the next INITIALIZE.
    pub fn close(&mut self) -> Result<(), KtaError> {
        self.storage.erase(&ANCHOR_RECORDS)?;
        self.anchor = None;

        let mut state = KtaState::new(self.config.max_queue_depth);
        state.queue.resume_from(self.state.queue.next_sequence());
        self.state = state;
        let snapshot = encode_state(&self.state)?;
        self.storage.commit(&[(STATE_RECORD, snapshot.as_slice())])?;

        log::info!(
            "KTA closed, persisted state erased (sequence continues at {})",
            self.state.queue.next_sequence()
        );
        Ok(())
    }

    // --- TA side ---

    /// Present a TA measurement to the attestation gate
    pub fn attest_ta(&mut self, ta: Uuid, measurement: TaMeasurement) -> Result<(), KtaError> {
        self.require_initialized()?;
        match self.state.gate.attest(ta, measurement) {
            AttestationVerdict::Trusted => Ok(()),
            AttestationVerdict::Untrusted { reason } => Err(KtaError::SecurityError(reason)),
        }
    }

    pub fn revoke_ta(&mut self, ta: &Uuid) -> bool {
        self.state.gate.revoke(ta)
    }

    /// Look a key up, requesting it from KCM on a miss
    pub fn search_key(&mut self, ta: Uuid, key_id: &str) -> Result<KeyLookup, KtaError> {
        self.authorize(&ta, key_id)?;

        if let Some(entry) = self.state.cache.get(&ta, key_id) {
            match entry.status {
                KeyStatus::Ready => {
                    let material = entry.key_material().unwrap_or_default().to_vec();
                    return Ok(KeyLookup::Ready(material));
                }
                KeyStatus::Pending => {
                    return Ok(KeyLookup::Pending {
                        sequence: entry.last_sequence,
                    })
                }
                KeyStatus::Deleted | KeyStatus::Failed => {}
            }
        }

        self.transact(|s| {
            if let Some(entry) = s.cache.get(&ta, key_id) {
                if entry.status == KeyStatus::Failed {
                    let sequence = entry.last_sequence;
                    retire_entry(s, ta, key_id, sequence);
                    return Ok(KeyLookup::Failed);
                }
            }
            let sequence = s.queue.enqueue(CommandKind::SearchKey, ta, key_id, Vec::new())?;
            s.cache.mark_pending(ta, key_id, sequence);
            Ok(KeyLookup::Pending { sequence })
        })
    }

    /// Ask KCM to generate a key; `attributes` travel as the command payload
    pub fn generate_key(
        &mut self,
        ta: Uuid,
        key_id: &str,
        attributes: &[u8],
    ) -> Result<KeyLookup, KtaError> {
        self.authorize(&ta, key_id)?;
        if attributes.len() > MAX_KEY_LEN {
            return Err(KtaError::BadParameters(format!(
                "key attributes exceed {} bytes",
                MAX_KEY_LEN
            )));
        }

        if let Some(entry) = self.state.cache.get(&ta, key_id) {
            match entry.status {
                KeyStatus::Ready => {
                    let material = entry.key_material().unwrap_or_default().to_vec();
                    return Ok(KeyLookup::Ready(material));
                }
                KeyStatus::Pending => {
                    return Ok(KeyLookup::Pending {
                        sequence: entry.last_sequence,
                    })
                }
                KeyStatus::Deleted | KeyStatus::Failed => {}
            }
        }

        self.transact(|s| {
            let sequence =
                s.queue
                    .enqueue(CommandKind::GenerateKey, ta, key_id, attributes.to_vec())?;
            s.cache.mark_pending(ta, key_id, sequence);
            Ok(KeyLookup::Pending { sequence })
        })
    }

    /// Delete locally at once and notify KCM; returns the notification's sequence
    pub fn delete_key(&mut self, ta: Uuid, key_id: &str) -> Result<u64, KtaError> {
        self.authorize(&ta, key_id)?;
        self.transact(|s| {
            let sequence = s.queue.enqueue(CommandKind::DeleteKey, ta, key_id, Vec::new())?;
            s.cache.mark_deleted(ta, key_id, sequence);
            log::info!("Deleted key {}/{} (notify seq {})", ta, key_id, sequence);
            Ok(sequence)
        })
    }

    /// Delete, then ask KCM to revoke the key permanently; returns the revoke's sequence
    pub fn destroy_key(&mut self, ta: Uuid, key_id: &str) -> Result<u64, KtaError> {
        self.authorize(&ta, key_id)?;
        self.transact(|s| {
            let sequence = destroy_entry(s, ta, key_id)?;
            log::info!("Destroyed key {}/{} (revoke seq {})", ta, key_id, sequence);
            Ok(sequence)
        })
    }

    /// Decommission a TA: destroy all its keys and revoke its attestation
    pub fn ta_exit(&mut self, ta: Uuid) -> Result<usize, KtaError> {
        self.require_initialized()?;
        self.require_verified(&ta)?;
        let destroyed = self.transact(|s| {
            let live: Vec<String> = s
                .cache
                .keys_for_ta(&ta)
                .into_iter()
                .filter(|k| {
                    s.cache
                        .get(&ta, k)
                        .map_or(false, |e| e.status != KeyStatus::Deleted)
                })
                .collect();
            for key_id in &live {
                destroy_entry(s, ta, key_id)?;
            }
            s.gate.revoke(&ta);
            Ok(live.len())
        })?;
        log::info!("TA {} exited, {} keys destroyed", ta, destroyed);
        Ok(destroyed)
    }

    // --- Internal helpers ---

    fn require_initialized(&self) -> Result<(), KtaError> {
        if self.anchor.is_none() {
            return Err(KtaError::NotInitialized);
        }
        Ok(())
    }

    fn require_verified(&self, ta: &Uuid) -> Result<(), KtaError> {
        if !self.state.gate.is_verified(ta) {
            log::warn!("Rejecting key operation for unverified TA {}", ta);
            return Err(KtaError::SecurityError(format!("TA {} is not verified", ta)));
        }
        Ok(())
    }

    fn authorize(&self, ta: &Uuid, key_id: &str) -> Result<(), KtaError> {
        self.require_initialized()?;
        self.require_verified(ta)?;
        if !validate_key_id(key_id) {
            return Err(KtaError::BadParameters(format!("invalid key id {:?}", key_id)));
        }
        Ok(())
    }

    fn transact<T>(
        &mut self,
        op: impl FnOnce(&mut KtaState) -> Result<T, KtaError>,
    ) -> Result<T, KtaError> {
        let mut next = self.state.clone();
        let out = op(&mut next)?;
        let snapshot = encode_state(&next)?;
        self.storage.commit(&[(STATE_RECORD, snapshot.as_slice())])?;
        self.state = next;
        Ok(out)
    }
}

fn encode_state(state: &KtaState) -> Result<Vec<u8>, KtaError> {
    serde_json::to_vec(state).map_err(|e| KtaError::GenericFailure(format!("encode state: {}", e)))
}

/// Enqueue delete + revoke for one entry and tombstone it
fn destroy_entry(s: &mut KtaState, ta: Uuid, key_id: &str) -> Result<u64, KtaError> {
    let delete_seq = s.queue.enqueue(CommandKind::DeleteKey, ta, key_id, Vec::new())?;
    s.cache.mark_deleted(ta, key_id, delete_seq);
    let destroy_seq = s.queue.enqueue(CommandKind::DestroyKey, ta, key_id, Vec::new())?;
    s.cache.mark_deleted(ta, key_id, destroy_seq);
    Ok(destroy_seq)
}

fn fail_entry(s: &mut KtaState, cmd: &Command) {
    s.cache.mark_failed(&cmd.ta_identity, &cmd.key_id, cmd.sequence);
}

/// Drop an entry whose result was consumed, keeping a tombstone while commands still reference it
fn retire_entry(s: &mut KtaState, ta: Uuid, key_id: &str, sequence: u64) {
    if s.queue.references(&ta, key_id) {
        s.cache.mark_deleted(ta, key_id, sequence);
    } else {
        s.cache.remove(&ta, key_id);
    }
}

fn collect_tombstone(s: &mut KtaState, ta: &Uuid, key_id: &str) {
    let deleted = s
        .cache
        .get(ta, key_id)
        .map_or(false, |e| e.status == KeyStatus::Deleted);
    if deleted && !s.queue.references(ta, key_id) {
        s.cache.remove(ta, key_id);
        log::debug!("Collected tombstone {}/{}", ta, key_id);
    }
}
