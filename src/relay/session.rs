//! Sessions with the trusted component
//!
//! [`TrustedEndpoint`] is the raw open/invoke/close seam; [`LocalTee`] serves
//! it in-process. [`KtaSession`] owns one open session and closes it when
//! dropped, so no path out of a relay operation leaves a session behind.

use crate::kta::invoke::{
    Memref, Param, Params, CMD_CLOSE_KTA, CMD_GET_REQUEST, CMD_INITIALIZE, CMD_RESPOND_REQUEST,
    CMD_SEND_TA_HASH, MAX_REQUEST_BUF_LEN,
};
use crate::kta::trust_anchor::MAX_CERT_LEN;
use crate::kta::{CommandReply, KeyTrustAgent, KtaError, RequestBatch};
use crate::tee::{SecureStorage, TaMeasurement, MEASUREMENT_LEN};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Transport to the trusted component
pub trait TrustedEndpoint {
    fn open_session(&self) -> Result<u32, KtaError>;

    fn invoke(&self, session: u32, cmd_id: u32, params: &mut Params) -> Result<(), KtaError>;

    fn close_session(&self, session: u32);
}

/// In-process endpoint; the mutex gives one invocation at a time
pub struct LocalTee<S: SecureStorage> {
    agent: Arc<Mutex<KeyTrustAgent<S>>>,
    sessions: Arc<Mutex<HashSet<u32>>>,
    next_session: Arc<AtomicU32>,
}

impl<S: SecureStorage> Clone for LocalTee<S> {
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            sessions: self.sessions.clone(),
            next_session: self.next_session.clone(),
        }
    }
}

impl<S: SecureStorage> LocalTee<S> {
    pub fn new(agent: KeyTrustAgent<S>) -> Self {
        Self {
            agent: Arc::new(Mutex::new(agent)),
            sessions: Arc::new(Mutex::new(HashSet::new())),
            next_session: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Run a TA-side call against the agent
    pub fn with_agent<R>(&self, f: impl FnOnce(&mut KeyTrustAgent<S>) -> R) -> Result<R, KtaError> {
        let mut agent = self
            .agent
            .lock()
            .map_err(|_| KtaError::GenericFailure("agent lock poisoned".into()))?;
        Ok(f(&mut agent))
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<S: SecureStorage> TrustedEndpoint for LocalTee<S> {
    fn open_session(&self) -> Result<u32, KtaError> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .map_err(|_| KtaError::GenericFailure("session table poisoned".into()))?
            .insert(id);
        log::debug!("Opened session {}", id);
        Ok(id)
    }

    fn invoke(&self, session: u32, cmd_id: u32, params: &mut Params) -> Result<(), KtaError> {
        let open = self
            .sessions
            .lock()
            .map_err(|_| KtaError::GenericFailure("session table poisoned".into()))?
            .contains(&session);
        if !open {
            return Err(KtaError::GenericFailure(format!("no open session {}", session)));
        }
        self.with_agent(|agent| agent.invoke_command(cmd_id, params))?
    }

    fn close_session(&self, session: u32) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.remove(&session) {
                log::debug!("Closed session {}", session);
            }
        }
    }
}

/// One open session, closed on drop
pub struct KtaSession<'a, E: TrustedEndpoint + ?Sized> {
    endpoint: &'a E,
    id: u32,
}

impl<'a, E: TrustedEndpoint + ?Sized> KtaSession<'a, E> {
    pub fn open(endpoint: &'a E) -> Result<Self, KtaError> {
        let id = endpoint.open_session()?;
        Ok(Self { endpoint, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bootstrap the KTA; returns its certificate for KCM
    pub fn initialize(
        &self,
        kcm_public_key: &[u8],
        kta_certificate: &[u8],
        kta_private_key: &[u8],
    ) -> Result<Vec<u8>, KtaError> {
        let mut params = [
            Param::MemrefInput(Memref::input(kcm_public_key)),
            Param::MemrefInput(Memref::input(kta_certificate)),
            Param::MemrefInput(Memref::input(kta_private_key)),
            Param::MemrefOutput(Memref::output(MAX_CERT_LEN)),
        ];
        self.endpoint.invoke(self.id, CMD_INITIALIZE, &mut params)?;
        Ok(output_bytes(&params[3]))
    }

    pub fn send_ta_hashes(&self, measurements: &[TaMeasurement]) -> Result<(), KtaError> {
        let mut buffer = Vec::with_capacity(measurements.len() * MEASUREMENT_LEN);
        for m in measurements {
            buffer.extend_from_slice(m.as_bytes());
        }
        let mut params = [
            Param::MemrefInput(Memref::input(&buffer)),
            Param::ValueInput {
                a: measurements.len() as u32,
                b: 0,
            },
            Param::None,
            Param::None,
        ];
        self.endpoint.invoke(self.id, CMD_SEND_TA_HASH, &mut params)
    }

    pub fn get_requests(&self) -> Result<RequestBatch, KtaError> {
        let mut params = [
            Param::MemrefOutput(Memref::output(MAX_REQUEST_BUF_LEN)),
            Param::ValueOutput { a: 0, b: 0 },
            Param::None,
            Param::None,
        ];
        self.endpoint.invoke(self.id, CMD_GET_REQUEST, &mut params)?;

        let batch = RequestBatch::from_bytes(&output_bytes(&params[0]))
            .map_err(|e| KtaError::GenericFailure(format!("undecodable batch: {}", e)))?;
        let (returned, remaining) = params[1].value_output().unwrap_or_default();
        if returned as usize != batch.commands.len() || remaining as usize != batch.remaining {
            return Err(KtaError::GenericFailure(format!(
                "batch counts disagree: header {}/{}, body {}/{}",
                returned,
                remaining,
                batch.commands.len(),
                batch.remaining
            )));
        }
        Ok(batch)
    }

    /// Deliver one reply; `Ok(true)` once the KTA accepted it
    pub fn respond(&self, reply: &CommandReply) -> Result<bool, KtaError> {
        let data = reply
            .to_bytes()
            .map_err(|e| KtaError::GenericFailure(format!("encode reply: {}", e)))?;
        let mut params = [
            Param::MemrefInput(Memref::input(&data)),
            Param::ValueOutput { a: 0, b: 0 },
            Param::None,
            Param::None,
        ];
        self.endpoint.invoke(self.id, CMD_RESPOND_REQUEST, &mut params)?;
        Ok(params[1].value_output().map_or(false, |(a, _)| a == 1))
    }

    pub fn close_kta(&self) -> Result<(), KtaError> {
        let mut params: Params = Default::default();
        self.endpoint.invoke(self.id, CMD_CLOSE_KTA, &mut params)
    }
}

impl<E: TrustedEndpoint + ?Sized> Drop for KtaSession<'_, E> {
    fn drop(&mut self) {
        self.endpoint.close_session(self.id);
    }
}

fn output_bytes(param: &Param) -> Vec<u8> {
    param.memref().map(|m| m.bytes().to_vec()).unwrap_or_default()
}
