//! Relay-facing command dispatch
//!
//! Models the TEE parameter block (four typed slots) and maps the five
//! command identifiers onto [`KeyTrustAgent`] operations. Parameter types and
//! buffer bounds are checked before any state is touched.

use super::agent::KeyTrustAgent;
use super::error::KtaError;
use super::protocol::CommandReply;
use super::trust_anchor::{MAX_CERT_LEN, MAX_KEY_LEN};
use crate::tee::{parse_measurements, SecureStorage, MAX_TA_HASHES, MEASUREMENT_LEN};

pub const CMD_INITIALIZE: u32 = 1;
pub const CMD_SEND_TA_HASH: u32 = 2;
pub const CMD_GET_REQUEST: u32 = 3;
pub const CMD_RESPOND_REQUEST: u32 = 4;
pub const CMD_CLOSE_KTA: u32 = 5;

/// Largest GET_REQUEST output buffer accepted
pub const MAX_REQUEST_BUF_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtaCommand {
    Initialize,
    SendTaHash,
    GetRequest,
    RespondRequest,
    CloseKta,
}

impl KtaCommand {
    pub fn id(&self) -> u32 {
        match self {
            KtaCommand::Initialize => CMD_INITIALIZE,
            KtaCommand::SendTaHash => CMD_SEND_TA_HASH,
            KtaCommand::GetRequest => CMD_GET_REQUEST,
            KtaCommand::RespondRequest => CMD_RESPOND_REQUEST,
            KtaCommand::CloseKta => CMD_CLOSE_KTA,
        }
    }
}

impl TryFrom<u32> for KtaCommand {
    type Error = KtaError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            CMD_INITIALIZE => Ok(KtaCommand::Initialize),
            CMD_SEND_TA_HASH => Ok(KtaCommand::SendTaHash),
            CMD_GET_REQUEST => Ok(KtaCommand::GetRequest),
            CMD_RESPOND_REQUEST => Ok(KtaCommand::RespondRequest),
            CMD_CLOSE_KTA => Ok(KtaCommand::CloseKta),
            other => Err(KtaError::BadParameters(format!("unknown command id {}", other))),
        }
    }
}

/// A memory reference; `buffer: None` is a null pointer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memref {
    pub buffer: Option<Vec<u8>>,
    pub size: usize,
}

impl Memref {
    pub fn input(data: &[u8]) -> Self {
        Self {
            buffer: Some(data.to_vec()),
            size: data.len(),
        }
    }

    /// Caller-owned output buffer of `capacity` bytes
    pub fn output(capacity: usize) -> Self {
        Self {
            buffer: Some(vec![0u8; capacity]),
            size: capacity,
        }
    }

    pub fn null(size: usize) -> Self {
        Self { buffer: None, size }
    }

    /// The first `size` bytes, or nothing if null or inconsistent
    pub fn bytes(&self) -> &[u8] {
        match &self.buffer {
            Some(buf) if self.size <= buf.len() => &buf[..self.size],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    None,
    MemrefInput,
    MemrefOutput,
    ValueInput,
    ValueOutput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Param {
    #[default]
    None,
    MemrefInput(Memref),
    MemrefOutput(Memref),
    ValueInput { a: u32, b: u32 },
    ValueOutput { a: u32, b: u32 },
}

impl Param {
    pub fn param_type(&self) -> ParamType {
        match self {
            Param::None => ParamType::None,
            Param::MemrefInput(_) => ParamType::MemrefInput,
            Param::MemrefOutput(_) => ParamType::MemrefOutput,
            Param::ValueInput { .. } => ParamType::ValueInput,
            Param::ValueOutput { .. } => ParamType::ValueOutput,
        }
    }

    pub fn value_output(&self) -> Option<(u32, u32)> {
        match self {
            Param::ValueOutput { a, b } => Some((*a, *b)),
            _ => None,
        }
    }

    pub fn memref(&self) -> Option<&Memref> {
        match self {
            Param::MemrefInput(m) | Param::MemrefOutput(m) => Some(m),
            _ => None,
        }
    }
}

pub type Params = [Param; 4];

fn check_param_types(params: &Params, expected: [ParamType; 4]) -> Result<(), KtaError> {
    let actual = [
        params[0].param_type(),
        params[1].param_type(),
        params[2].param_type(),
        params[3].param_type(),
    ];
    if actual != expected {
        return Err(KtaError::BadParameters(format!(
            "parameter types {:?}, expected {:?}",
            actual, expected
        )));
    }
    Ok(())
}

fn checked_memref<'a>(memref: &'a Memref, max: usize, what: &str) -> Result<&'a [u8], KtaError> {
    let buffer = memref
        .buffer
        .as_deref()
        .ok_or_else(|| KtaError::BadParameters(format!("{}: null buffer", what)))?;
    if memref.size == 0 || memref.size > max || memref.size > buffer.len() {
        return Err(KtaError::BadParameters(format!(
            "{}: size {} outside 1..={}",
            what, memref.size, max
        )));
    }
    Ok(&buffer[..memref.size])
}

fn input_memref<'a>(param: &'a Param, max: usize, what: &str) -> Result<&'a [u8], KtaError> {
    match param {
        Param::MemrefInput(m) => checked_memref(m, max, what),
        _ => Err(KtaError::BadParameters(format!("{}: expected input memref", what))),
    }
}

fn output_capacity(param: &Param, max: usize, what: &str) -> Result<usize, KtaError> {
    match param {
        Param::MemrefOutput(m) => checked_memref(m, max, what).map(|b| b.len()),
        _ => Err(KtaError::BadParameters(format!("{}: expected output memref", what))),
    }
}

/// Report the size the caller has to provide
fn short_output(param: &mut Param, required: usize, capacity: usize) -> KtaError {
    if let Param::MemrefOutput(memref) = param {
        memref.size = required;
    }
    KtaError::BadBufferData(format!(
        "output needs {} bytes, buffer holds {}",
        required, capacity
    ))
}

/// Copy `data` out; too small a buffer reports the required size
fn write_output(param: &mut Param, data: &[u8]) -> Result<(), KtaError> {
    let Param::MemrefOutput(memref) = param else {
        return Err(KtaError::BadParameters("expected output memref".into()));
    };
    let capacity = memref.buffer.as_ref().map_or(0, |b| b.len()).min(memref.size);
    if data.len() > capacity {
        return Err(short_output(param, data.len(), capacity));
    }
    if let Some(buffer) = memref.buffer.as_mut() {
        buffer[..data.len()].copy_from_slice(data);
    }
    memref.size = data.len();
    Ok(())
}

impl<S: SecureStorage> KeyTrustAgent<S> {
    /// Entry point for one relay invocation
    pub fn invoke_command(&mut self, cmd_id: u32, params: &mut Params) -> Result<(), KtaError> {
        let command = KtaCommand::try_from(cmd_id)?;
        let result = match command {
            KtaCommand::Initialize => self.cmd_initialize(params),
            KtaCommand::SendTaHash => self.cmd_send_ta_hash(params),
            KtaCommand::GetRequest => self.cmd_get_request(params),
            KtaCommand::RespondRequest => self.cmd_respond_request(params),
            KtaCommand::CloseKta => self.cmd_close(params),
        };
        if let Err(e) = &result {
            log::warn!("{:?} failed: {} (0x{:08X})", command, e, e.code());
        }
        result
    }

    fn cmd_initialize(&mut self, params: &mut Params) -> Result<(), KtaError> {
        use ParamType as P;
        check_param_types(params, [P::MemrefInput, P::MemrefInput, P::MemrefInput, P::MemrefOutput])?;

        let kcm_pub = input_memref(&params[0], MAX_KEY_LEN, "KCM public key")?.to_vec();
        let cert = input_memref(&params[1], MAX_CERT_LEN, "KTA certificate")?.to_vec();
        let key = input_memref(&params[2], MAX_KEY_LEN, "KTA private key")?.to_vec();
        if self.is_initialized() {
            return Err(KtaError::AlreadyInitialized);
        }
        let capacity = output_capacity(&params[3], MAX_CERT_LEN, "certificate output")?;
        if capacity < cert.len() {
            return Err(short_output(&mut params[3], cert.len(), capacity));
        }

        let echoed = self.initialize(&kcm_pub, &cert, &key)?;
        write_output(&mut params[3], &echoed)
    }

    fn cmd_send_ta_hash(&mut self, params: &mut Params) -> Result<(), KtaError> {
        use ParamType as P;
        check_param_types(params, [P::MemrefInput, P::ValueInput, P::None, P::None])?;

        let buffer = input_memref(&params[0], MAX_TA_HASHES * MEASUREMENT_LEN, "hash buffer")?;
        let count = match params[1] {
            Param::ValueInput { a, .. } => a as usize,
            _ => 0,
        };
        if count == 0 || count > MAX_TA_HASHES {
            return Err(KtaError::BadParameters(format!(
                "hash count must be 1..={}, got {}",
                MAX_TA_HASHES, count
            )));
        }
        let measurements = parse_measurements(buffer, count).ok_or_else(|| {
            KtaError::BadParameters(format!(
                "hash buffer of {} bytes does not hold {} digests",
                buffer.len(),
                count
            ))
        })?;
        let added = self.register_ta_hashes(&measurements)?;
        log::info!("Registered {} TA measurements ({} new)", count, added);
        Ok(())
    }

    fn cmd_get_request(&mut self, params: &mut Params) -> Result<(), KtaError> {
        use ParamType as P;
        check_param_types(params, [P::MemrefOutput, P::ValueOutput, P::None, P::None])?;
        output_capacity(&params[0], MAX_REQUEST_BUF_LEN, "request buffer")?;

        let max_batch = self.config().max_batch;
        let [out, counts, _, _] = params;
        let polled = self.poll_requests(max_batch, |bytes| write_output(out, bytes))?;
        *counts = Param::ValueOutput {
            a: polled.returned as u32,
            b: polled.remaining as u32,
        };
        Ok(())
    }

    fn cmd_respond_request(&mut self, params: &mut Params) -> Result<(), KtaError> {
        use ParamType as P;
        check_param_types(params, [P::MemrefInput, P::ValueOutput, P::None, P::None])?;

        params[1] = Param::ValueOutput { a: 0, b: 0 };
        let data = input_memref(&params[0], MAX_CERT_LEN, "reply buffer")?;
        let reply = CommandReply::from_bytes(data)?;
        self.submit_reply(&reply)?;
        params[1] = Param::ValueOutput { a: 1, b: 0 };
        Ok(())
    }

    fn cmd_close(&mut self, params: &mut Params) -> Result<(), KtaError> {
        check_param_types(params, [ParamType::None; 4])?;
        self.close()
    }
}
