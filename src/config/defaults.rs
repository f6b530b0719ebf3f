//! Default constants for canondir configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default root directory of the directory-backed object store
pub const DEFAULT_STORAGE_ROOT: &str = "canondir-data";

/// Folder holding one object per canonical identity
pub const DEFAULT_IDENTITY_FOLDER: &str = "identities";

/// Folder holding the snapshot and index objects
pub const DEFAULT_VIEWS_FOLDER: &str = "views";

/// Object name of the bulk snapshot
pub const DEFAULT_SNAPSHOT_NAME: &str = "snapshot.json";

/// Object name of the key-to-location index
pub const DEFAULT_INDEX_NAME: &str = "index.json";

// =============================================================================
// Backfill Defaults
// =============================================================================

/// Maximum identities written per backfill invocation
/// Keeps one run inside the remote store's rate limits.
pub const DEFAULT_CHUNK_SIZE: usize = 400;

/// Maximum write-throughs in flight at once
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Local file recording which keys a backfill has completed
pub const DEFAULT_PROGRESS_PATH: &str = "canondir-progress.json";

// =============================================================================
// Matching Defaults
// =============================================================================

/// Token-overlap score at or above which a name is a clear match
pub const DEFAULT_CLEAR_THRESHOLD: f64 = crate::similarity::CLEAR_MATCH_THRESHOLD;

/// Token-overlap score at or above which a name needs review
pub const DEFAULT_NEAR_THRESHOLD: f64 = crate::similarity::NEAR_MATCH_THRESHOLD;

/// Shortest token that counts toward the overlap score
pub const DEFAULT_MIN_TOKEN_LEN: usize = crate::similarity::MIN_TOKEN_LEN;

/// Number of alias-home suggestions returned to a reviewer
pub const DEFAULT_SUGGESTION_LIMIT: usize = 5;
