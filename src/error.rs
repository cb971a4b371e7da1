use thiserror::Error;

use crate::index::traits::EngineFailure;

#[derive(Error, Debug)]
pub enum QuiverError {
    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Engine errors
    #[error("engine error: {0}")]
    Engine(String),

    #[error("index construction failed: {0}")]
    Construction(String),

    #[error("identifier not found: {id}")]
    NotFound { id: i64 },

    // Serialization errors
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization error: {0}")]
    Bincode(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Box<bincode::ErrorKind>> for QuiverError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        QuiverError::Bincode(e.to_string())
    }
}

impl From<EngineFailure> for QuiverError {
    fn from(e: EngineFailure) -> Self {
        QuiverError::Engine(e.message)
    }
}

pub type Result<T> = std::result::Result<T, QuiverError>;

/// Coarse classification of a [`QuiverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer misuse, detected before any engine call.
    InvalidArgument,
    /// The engine reported a failure; its diagnostic is attached verbatim.
    Engine,
    NotFound,
    Internal,
}

impl QuiverError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QuiverError::InvalidArgument(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QuiverError::InvalidArgument(_)
            | QuiverError::DimensionMismatch { .. }
            | QuiverError::Config(_)
            | QuiverError::Toml(_) => ErrorKind::InvalidArgument,

            QuiverError::Engine(_) | QuiverError::Construction(_) => ErrorKind::Engine,

            QuiverError::NotFound { .. } => ErrorKind::NotFound,

            _ => ErrorKind::Internal,
        }
    }

    /// True when retrying the same call cannot succeed because the caller
    /// passed something malformed.
    pub fn is_caller_error(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }
}
