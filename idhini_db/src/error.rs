use std::fmt;

use thiserror::Error;

use crate::core::SubjectKind;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Not an idhini database file")]
    InvalidMagic,

    #[error("Unsupported database version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("{0}")]
    ValidationFailed(String),

    #[error("Audit chain broken: {0}")]
    ChainValidation(String),

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("Injected fault: {0}")]
    InjectedFault(String),

    #[error("WAL unusable until reopened: {0}")]
    WalUnusable(String),
}

/// Outcome taxonomy of the transition engine.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("User '{0}' cannot resolve a record they created")]
    SelfApproval(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    SelfApproval,
    Storage,
}

impl ErrorKind {
    /// Only infrastructure failures are worth retrying; everything else is
    /// a deterministic answer about the input or the record.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Storage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::SelfApproval => "self_approval",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::NotFound(_) => ErrorKind::NotFound,
            WorkflowError::InvalidState(_) => ErrorKind::InvalidState,
            WorkflowError::SelfApproval(_) => ErrorKind::SelfApproval,
            WorkflowError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// An engine error tagged with the record family it was raised for.
#[derive(Error, Debug)]
#[error("{kind}: {source}")]
pub struct ServiceError {
    pub kind: SubjectKind,
    #[source]
    pub source: WorkflowError,
}

impl ServiceError {
    pub fn new(kind: SubjectKind, source: WorkflowError) -> Self {
        Self { kind, source }
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn message(&self) -> String {
        self.source.to_string()
    }
}
