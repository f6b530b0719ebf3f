//! # Error Taxonomy
//!
//! Per-record problems (`ParseError`) are recovered by skipping the record.
//! Data-integrity conflicts (`AliasError::DuplicateAlias`,
//! `RegistryError::DuplicateKey`) are always surfaced and routed to the
//! duplicate-key workflow. Remote failures are transient and left for
//! reconciliation to detect. A `ConsistencyViolation` is fatal to a batch.

use crate::model::{AliasSlot, IdentityKey};
use crate::remote::ObjectLocation;
use thiserror::Error;

/// Errors raised by an `Aliases` instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AliasError {
    #[error("variant {value:?} already present as {existing}")]
    DuplicateAlias { value: String, existing: AliasSlot },
    #[error("variant {value:?} not found")]
    NotFound { value: String },
    #[error("variant {value:?} is the primary and cannot be removed")]
    PrimaryRemoval { value: String },
    #[error("primary {value:?} cannot move into a category without a replacement primary")]
    PrimaryDemotion { value: String },
}

/// Errors raised by the canonical identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("identity key {key} already exists")]
    DuplicateKey { key: IdentityKey },
    #[error("cannot re-key {key}: identity {owner} already exists")]
    KeyCollision { key: IdentityKey, owner: IdentityKey },
    #[error("identity {key} not found")]
    NotFound { key: IdentityKey },
    #[error("duplicate key {key} awaits resolution; registry is frozen")]
    ConflictPending { key: IdentityKey },
    #[error("mutation would change key of {key} to {derived}")]
    KeyInvariant {
        key: IdentityKey,
        derived: IdentityKey,
    },
    #[error(transparent)]
    Alias(#[from] AliasError),
}

/// Errors surfaced by the remote object store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteStoreError {
    #[error("object {0} not found")]
    NotFound(ObjectLocation),
    #[error("transient remote failure during {operation}: {message}")]
    Transient { operation: String, message: String },
    #[error("remote i/o error: {0}")]
    Io(String),
    #[error("could not encode or decode remote object: {0}")]
    Codec(String),
}

impl From<std::io::Error> for RemoteStoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RemoteStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Reason a source record could not be turned into a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseReason {
    MissingName,
    EmptyName,
    UnreadableField,
}

/// A malformed source record. The batch continues without it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {record_key} (row {row_index}) skipped: {reason:?}")]
pub struct ParseError {
    pub row_index: u64,
    pub record_key: String,
    pub reason: ParseReason,
}

/// The three-view store lost objects; a full rewrite pass is required.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "consistency violation: snapshot holds {snapshot_count} identities but folder holds {folder_count}"
)]
pub struct ConsistencyViolation {
    pub snapshot_count: usize,
    pub folder_count: usize,
    pub missing: Vec<IdentityKey>,
}

/// Step of the three-view write-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStage {
    Object,
    Index,
    Snapshot,
}

impl std::fmt::Display for WriteStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStage::Object => write!(f, "object"),
            WriteStage::Index => write!(f, "index"),
            WriteStage::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// A write-through that stopped part way.
///
/// `location` is set when the per-identity object exists (step (i) succeeded).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("write-through for {key} failed at {stage}: {source}")]
pub struct WriteThroughError {
    pub key: IdentityKey,
    pub stage: WriteStage,
    pub location: Option<ObjectLocation>,
    #[source]
    pub source: RemoteStoreError,
}

/// Errors raised by a backfill run.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("progress file {path}: {source}")]
    Progress {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress file {path} is not valid: {source}")]
    ProgressFormat {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Remote(#[from] RemoteStoreError),
}

/// Errors raised by alias mutation and ingestion workflows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("identity {identity} already holds variant {value:?}")]
    AlreadyPresent { value: String, identity: IdentityKey },
    #[error("no disambiguation response for {key}; operation halted")]
    NoResponse { key: IdentityKey },
    #[error("identities left unsynced with the remote views: {keys:?}")]
    Unsynced {
        keys: Vec<IdentityKey>,
        failures: Vec<WriteThroughError>,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Remote(#[from] RemoteStoreError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyViolation),
}

impl From<AliasError> for WorkflowError {
    fn from(err: AliasError) -> Self {
        WorkflowError::Registry(RegistryError::Alias(err))
    }
}
