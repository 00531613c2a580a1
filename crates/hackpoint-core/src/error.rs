use thiserror::Error;

use crate::binhack::DslError;
use crate::expr::ExpressionError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memory at {address:#010x} is not accessible for {len} bytes")]
    RegionUnavailable { address: u32, len: usize },

    #[error("Failed to read memory at {address:#010x}: {message}")]
    MemoryReadFailed { address: u32, message: String },

    #[error("Failed to write memory at {address:#010x}: {message}")]
    MemoryWriteFailed { address: u32, message: String },

    #[error("Failed to change protection at {address:#010x}: {message}")]
    ProtectFailed { address: u32, message: String },

    #[error("Failed to allocate {size} bytes: {message}")]
    AllocationFailed { size: usize, message: String },

    #[error("Expected bytes not matched at {address:#010x}")]
    ExpectedBytesMismatch { address: u32 },

    #[error("Rendered {written} bytes but {expected} were computed")]
    SizeMismatch { expected: usize, written: usize },

    #[error("Cave size {size} out of range ({min}..={max})")]
    CaveSizeOutOfRange { size: usize, min: usize, max: usize },

    #[error("Breakpoint function '{0}' not found")]
    HandlerNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Dsl(#[from] DslError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Whether this error ends the whole apply run instead of a single entry
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }
}
