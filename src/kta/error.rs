//! KTA error taxonomy and the TEE result codes it maps to

use crate::tee::StorageError;

pub const TEE_SUCCESS: u32 = 0x0000_0000;
pub const TEE_ERROR_GENERIC: u32 = 0xFFFF_0000;
pub const TEE_ERROR_ACCESS_CONFLICT: u32 = 0xFFFF_0003;
pub const TEE_ERROR_BAD_FORMAT: u32 = 0xFFFF_0005;
pub const TEE_ERROR_BAD_PARAMETERS: u32 = 0xFFFF_0006;
pub const TEE_ERROR_BAD_STATE: u32 = 0xFFFF_0007;
pub const TEE_ERROR_BUSY: u32 = 0xFFFF_000D;
pub const TEE_ERROR_SECURITY: u32 = 0xFFFF_000F;
pub const TEE_ERROR_STORAGE_NOT_AVAILABLE: u32 = 0xF010_0003;

/// Errors surfaced by the Key Trust Agent
#[derive(Debug, thiserror::Error)]
pub enum KtaError {
    /// Malformed, oversized or null buffer at the boundary
    #[error("Bad parameters: {0}")]
    BadParameters(String),

    /// Reply cannot be matched, or an output buffer is too small
    #[error("Bad buffer data: {0}")]
    BadBufferData(String),

    /// Attestation gate rejection
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Command queue at capacity; retry later
    #[error("Command queue full ({depth} outstanding)")]
    QueueFull { depth: usize },

    /// Session/transport failure outside protocol logic
    #[error("Generic failure: {0}")]
    GenericFailure(String),

    #[error("KTA already initialized")]
    AlreadyInitialized,

    #[error("KTA not initialized")]
    NotInitialized,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl KtaError {
    /// TEE result code for this error
    pub fn code(&self) -> u32 {
        match self {
            KtaError::BadParameters(_) => TEE_ERROR_BAD_PARAMETERS,
            KtaError::BadBufferData(_) => TEE_ERROR_BAD_FORMAT,
            KtaError::SecurityError(_) => TEE_ERROR_SECURITY,
            KtaError::QueueFull { .. } => TEE_ERROR_BUSY,
            KtaError::GenericFailure(_) => TEE_ERROR_GENERIC,
            KtaError::AlreadyInitialized => TEE_ERROR_ACCESS_CONFLICT,
            KtaError::NotInitialized => TEE_ERROR_BAD_STATE,
            KtaError::Storage(_) => TEE_ERROR_STORAGE_NOT_AVAILABLE,
        }
    }

    /// Whether the caller may simply retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, KtaError::QueueFull { .. })
    }
}
