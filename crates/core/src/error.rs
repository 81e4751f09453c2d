//! Error taxonomy shared by every service crate.
//!
//! Storage backends report failures through [`StoreError`], a small classified
//! enum with an explicit `NotFound` variant. Services switch on the kind and
//! translate it into the caller-facing [`Error`]; nothing in the engine ever
//! inspects backend message strings.

use serde::{Deserialize, Serialize};

/// Classified storage failure returned by every store plugin.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transaction: {0}")]
    Transaction(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Caller-facing errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    #[error("{kind} ({name}) is not found")]
    ResourceNotFound { kind: String, name: String },
    #[error("node ({name}) is not ready for sync")]
    NodeNotReady { name: String },
    #[error("{kind} ({name}) is still referenced by applications")]
    ResourceInUse { kind: String, name: String },
    #[error("name ({0}) is duplicated in the application")]
    AppNameConflict(String),
    #[error("volume ({0}) is mounted but not declared")]
    VolumeNotFoundWhenMount(String),
    #[error("processor ({processor}) is already registered under ({registration})")]
    ProcessConflict {
        registration: String,
        processor: String,
    },
    #[error("processor list ({0}) does not exist")]
    ProcessNotExist(String),
    /// Transient task/processor state, not a hard failure.
    #[error("need retry")]
    NeedRetry,
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Translate a backend `NotFound` into a typed `ResourceNotFound` with
    /// resource context; everything else propagates wrapped.
    pub fn from_store(err: StoreError, kind: &str, name: &str) -> Self {
        match err {
            StoreError::NotFound => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Error::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
