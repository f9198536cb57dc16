//! KTA ⇄ KA wire messages
//!
//! GET_REQUEST returns a [`RequestBatch`]; RESPOND_REQUEST carries one
//! [`CommandReply`]. Both are JSON with hex-encoded byte payloads.

use super::error::KtaError;
use super::queue::{Command, CommandKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version stamped on every batch
pub const PROTOCOL_VERSION: u32 = 1;

/// A command as shipped to KA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    pub sequence: u64,
    pub kind: CommandKind,
    pub ta_identity: Uuid,
    pub key_id: String,
    /// Hex-encoded request payload
    pub payload: String,
}

impl From<&Command> for WireCommand {
    fn from(cmd: &Command) -> Self {
        Self {
            sequence: cmd.sequence,
            kind: cmd.kind,
            ta_identity: cmd.ta_identity,
            key_id: cmd.key_id.clone(),
            payload: hex::encode(&cmd.payload),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBatch {
    pub version: u32,
    pub commands: Vec<WireCommand>,
    /// Commands still queued after this batch
    pub remaining: usize,
}

impl RequestBatch {
    pub fn new(commands: Vec<WireCommand>, remaining: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            commands,
            remaining,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyResult {
    Success,
    /// KCM holds no such key (search only)
    NotFound,
    Failure,
}

/// KCM's answer to one command, relayed by KA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    pub sequence: u64,
    pub result: ReplyResult,
    /// Hex-encoded result payload (key material for search/generate)
    #[serde(default)]
    pub payload: String,
}

impl CommandReply {
    pub fn success(sequence: u64, payload: &[u8]) -> Self {
        Self {
            sequence,
            result: ReplyResult::Success,
            payload: hex::encode(payload),
        }
    }

    pub fn not_found(sequence: u64) -> Self {
        Self {
            sequence,
            result: ReplyResult::NotFound,
            payload: String::new(),
        }
    }

    pub fn failure(sequence: u64) -> Self {
        Self {
            sequence,
            result: ReplyResult::Failure,
            payload: String::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a reply buffer; anything malformed is `BadBufferData`
    pub fn from_bytes(data: &[u8]) -> Result<Self, KtaError> {
        serde_json::from_slice(data)
            .map_err(|e| KtaError::BadBufferData(format!("malformed reply: {}", e)))
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, KtaError> {
        hex::decode(&self.payload)
            .map_err(|e| KtaError::BadBufferData(format!("reply payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_roundtrip() {
        let batch = RequestBatch::new(
            vec![WireCommand {
                sequence: 1,
                kind: CommandKind::SearchKey,
                ta_identity: Uuid::new_v4(),
                key_id: "k1".into(),
                payload: String::new(),
            }],
            0,
        );
        let decoded = RequestBatch::from_bytes(&batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.commands, batch.commands);
    }

    #[test]
    fn test_reply_payload_hex() {
        let reply = CommandReply::success(4, &[0xde, 0xad]);
        assert_eq!(reply.payload, "dead");
        let decoded = CommandReply::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.decode_payload().unwrap(), vec![0xde, 0xad]);
    }

    #[test]
    fn test_malformed_reply_is_bad_buffer_data() {
        assert!(matches!(
            CommandReply::from_bytes(b"not json"),
            Err(KtaError::BadBufferData(_))
        ));
        let reply = CommandReply {
            sequence: 1,
            result: ReplyResult::Success,
            payload: "zz".into(),
        };
        assert!(matches!(reply.decode_payload(), Err(KtaError::BadBufferData(_))));
    }

    #[test]
    fn test_payload_defaults_to_empty() {
        let reply = CommandReply::from_bytes(br#"{"sequence":2,"result":"NotFound"}"#).unwrap();
        assert_eq!(reply, CommandReply::not_found(2));
    }
}
