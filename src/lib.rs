//! # Canondir
//!
//! A canonical identity directory. Records from independent sources are
//! linked to deduplicated identities, each carrying every spelling it has
//! been seen under together with where that spelling came from.
//!
//! The directory is held in memory by a [`Registry`] and persisted as three
//! remote views (bulk snapshot, one object per identity, key index) that
//! [`ThreeViewStore`] keeps consistent through write-through and
//! reconciliation.

pub mod backfill;
pub mod config;
pub mod consistency;
pub mod context;
pub mod error;
pub mod ingest;
pub mod linkage;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod remote;
pub mod similarity;
pub mod source;
pub mod test_support;
pub mod workflows;

// Re-export main types for convenience
pub use backfill::{BackfillJob, BackfillReport, ProgressStore};
pub use config::CanonConfig;
pub use consistency::{ReconcileOutcome, ReconcileReport, ThreeViewStore, ViewLayout};
pub use context::RegistryContext;
pub use error::{RegistryError, RemoteStoreError, WorkflowError};
pub use linkage::{LinkagePipeline, LinkageReport};
pub use model::{AliasCategory, Aliases, AttributedTerm, Identity, IdentityKey, IdentityKind, SourceId};
pub use registry::Registry;
pub use remote::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use similarity::{MatchTier, SimilarityPolicy};
pub use source::{FieldNameExtractor, NameExtractor, SourceRecord};
