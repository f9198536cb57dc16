//! Command Queue — outstanding requests KA carries to KCM
//!
//! Bounded and FIFO for delivery. Sequence numbers are assigned from a
//! counter that only moves forward and survives restarts with the rest of
//! the persisted state. Replies are matched by sequence number, never by
//! position, so commands may complete out of order.

use super::error::KtaError;
use crate::config::MAX_POLL_BATCH;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    GenerateKey,
    SearchKey,
    DeleteKey,
    /// Permanent revocation, issued when a TA is decommissioned
    DestroyKey,
}

impl CommandKind {
    /// Whether a successful reply carries key material for the cache
    pub fn yields_key(&self) -> bool {
        matches!(self, CommandKind::GenerateKey | CommandKind::SearchKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Queued,
    /// Handed to KA in the latest poll
    Delivered,
    /// KA polled again after delivery, so the batch reached it
    AwaitingReply,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_shipped(&self) -> bool {
        matches!(self, CommandStatus::Delivered | CommandStatus::AwaitingReply)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub sequence: u64,
    pub kind: CommandKind,
    pub ta_identity: Uuid,
    pub key_id: String,
    pub payload: Vec<u8>,
    pub status: CommandStatus,
    pub enqueued_at: DateTime<Utc>,
    /// Polls seen since delivery
    pub polls_outstanding: u32,
}

/// Result of a KA poll
#[derive(Debug, Clone)]
pub struct PollBatch {
    pub commands: Vec<Command>,
    /// Commands still queued after this batch
    pub remaining: usize,
    /// Shipped commands failed by the reply timeout during this poll
    pub expired: Vec<Command>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
    next_sequence: u64,
    max_depth: usize,
}

impl CommandQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            commands: VecDeque::new(),
            next_sequence: 1,
            max_depth,
        }
    }

    /// Append a command; fails with `QueueFull` at capacity without consuming a sequence number
    pub fn enqueue(
        &mut self,
        kind: CommandKind,
        ta_identity: Uuid,
        key_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, KtaError> {
        if self.commands.len() >= self.max_depth {
            log::warn!(
                "Command queue full ({}/{}), rejecting {:?} for {}/{}",
                self.commands.len(),
                self.max_depth,
                kind,
                ta_identity,
                key_id
            );
            return Err(KtaError::QueueFull {
                depth: self.commands.len(),
            });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.commands.push_back(Command {
            sequence,
            kind,
            ta_identity,
            key_id: key_id.to_string(),
            payload,
            status: CommandStatus::Queued,
            enqueued_at: Utc::now(),
            polls_outstanding: 0,
        });
        log::debug!("Enqueued {:?} seq {} for {}/{}", kind, sequence, ta_identity, key_id);
        Ok(sequence)
    }

    /// Hand up to `max_count` oldest queued commands to KA.
    ///
    /// Commands delivered by the previous poll move to `AwaitingReply`; with a
    /// `reply_timeout` set, shipped commands older than that many polls are failed
    /// and removed (returned in `expired`).
    pub fn drain_for_poll(
        &mut self,
        max_count: usize,
        reply_timeout: Option<u32>,
    ) -> Result<PollBatch, KtaError> {
        if max_count == 0 || max_count > MAX_POLL_BATCH {
            return Err(KtaError::BadParameters(format!(
                "poll batch must be 1..={}, got {}",
                MAX_POLL_BATCH, max_count
            )));
        }

        for cmd in self.commands.iter_mut().filter(|c| c.status.is_shipped()) {
            cmd.status = CommandStatus::AwaitingReply;
            cmd.polls_outstanding += 1;
        }

        let mut expired = Vec::new();
        if let Some(limit) = reply_timeout {
            let mut kept = VecDeque::with_capacity(self.commands.len());
            for mut cmd in self.commands.drain(..) {
                if cmd.status.is_shipped() && cmd.polls_outstanding > limit {
                    log::warn!(
                        "Command seq {} unanswered after {} polls, failing it",
                        cmd.sequence,
                        cmd.polls_outstanding
                    );
                    cmd.status = CommandStatus::Failed;
                    expired.push(cmd);
                } else {
                    kept.push_back(cmd);
                }
            }
            self.commands = kept;
        }

        let mut commands = Vec::new();
        for cmd in self
            .commands
            .iter_mut()
            .filter(|c| c.status == CommandStatus::Queued)
            .take(max_count)
        {
            cmd.status = CommandStatus::Delivered;
            commands.push(cmd.clone());
        }

        let remaining = self.queued_count();
        log::debug!(
            "Poll drained {} commands, {} still queued, {} expired",
            commands.len(),
            remaining,
            expired.len()
        );
        Ok(PollBatch {
            commands,
            remaining,
            expired,
        })
    }

    /// Finalize the shipped command `sequence` and remove it from the queue.
    ///
    /// Unknown, never-shipped or already finalized sequence numbers fail with
    /// `BadBufferData` and leave the queue untouched.
    pub fn finalize(&mut self, sequence: u64, success: bool) -> Result<Command, KtaError> {
        let pos = self
            .commands
            .iter()
            .position(|c| c.sequence == sequence)
            .ok_or_else(|| {
                if sequence < self.next_sequence && sequence > 0 {
                    KtaError::BadBufferData(format!("reply for finalized seq {}", sequence))
                } else {
                    KtaError::BadBufferData(format!("reply for unknown seq {}", sequence))
                }
            })?;
        if !self.commands[pos].status.is_shipped() {
            return Err(KtaError::BadBufferData(format!(
                "reply for seq {} which was never delivered",
                sequence
            )));
        }
        let mut cmd = self
            .commands
            .remove(pos)
            .ok_or_else(|| KtaError::GenericFailure("queue index out of range".into()))?;
        cmd.status = if success {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        Ok(cmd)
    }

    pub fn get(&self, sequence: u64) -> Option<&Command> {
        self.commands.iter().find(|c| c.sequence == sequence)
    }

    /// Whether any outstanding command references the entry
    pub fn references(&self, ta: &Uuid, key_id: &str) -> bool {
        self.commands
            .iter()
            .any(|c| c.ta_identity == *ta && c.key_id == key_id)
    }

    pub fn depth(&self) -> usize {
        self.commands.len()
    }

    pub fn queued_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| c.status == CommandStatus::Queued)
            .count()
    }

    pub fn free_slots(&self) -> usize {
        self.max_depth.saturating_sub(self.commands.len())
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Change the bound; commands already queued beyond it stay
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Sequence number the next enqueued command will get
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Continue numbering from a previous queue; never moves backwards
    pub fn resume_from(&mut self, next_sequence: u64) {
        self.next_sequence = self.next_sequence.max(next_sequence);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}
