//! # Three-View Consistency
//!
//! The canonical directory is persisted three times in the remote store:
//!
//! 1. **Snapshot**: one object holding every identity by key (content of record)
//! 2. **Identity objects**: one object per identity, named `<KEY>.json`
//! 3. **Index**: one object mapping key to identity-object location (advisory)
//!
//! Writes go object, then index, then snapshot, each view touched with a
//! single-key patch. [`ThreeViewStore::reconcile`] detects and repairs
//! divergence, and refuses to repair lost objects.

use crate::error::{ConsistencyViolation, RemoteStoreError, WriteStage, WriteThroughError};
use crate::model::{Identity, IdentityKey};
use crate::registry::RegistryEntry;
use crate::remote::{ObjectListing, ObjectLocation, ObjectMetadata, ObjectStore};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Folder and object names of the three views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewLayout {
    /// Folder holding the per-identity objects
    pub folder: String,
    /// Folder holding the snapshot and index objects
    pub views_folder: String,
    pub snapshot_name: String,
    pub index_name: String,
}

impl Default for ViewLayout {
    fn default() -> Self {
        Self {
            folder: crate::config::DEFAULT_IDENTITY_FOLDER.to_string(),
            views_folder: crate::config::DEFAULT_VIEWS_FOLDER.to_string(),
            snapshot_name: crate::config::DEFAULT_SNAPSHOT_NAME.to_string(),
            index_name: crate::config::DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

/// Persisted form of one identity, used by the snapshot and the identity objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl StoredIdentity {
    pub fn from_entry(entry: &RegistryEntry) -> Self {
        Self {
            identity: entry.identity.clone(),
            created_at: entry.created_at,
            last_modified_at: entry.last_modified_at,
        }
    }

    pub fn key(&self) -> IdentityKey {
        self.identity.key()
    }
}

/// One entry of the index view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identity_key: IdentityKey,
    /// `None` marks an entry whose object has not been located
    pub location: Option<ObjectLocation>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Name of the identity object for `key`.
pub fn object_name(key: &IdentityKey) -> String {
    format!("{}.json", key.as_str())
}

/// Key encoded in an identity object name.
pub fn key_for_object_name(name: &str) -> Option<IdentityKey> {
    let stem = name.strip_suffix(".json")?;
    let key = IdentityKey::new(stem);
    (!key.as_str().is_empty()).then_some(key)
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// All three views agree
    Consistent,
    /// Divergence was found and fixed
    Repaired,
    /// Identity objects are missing; a full rewrite pass is required
    Stopped,
}

/// What a reconciliation pass saw and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub snapshot_count: usize,
    /// Distinct keys in the identity folder
    pub folder_count: usize,
    pub index_count: usize,
    pub duplicates_removed: Vec<ObjectLocation>,
    pub index_repaired: Vec<IdentityKey>,
    pub index_pruned: Vec<IdentityKey>,
    /// Identity objects missing from the snapshot that were copied into it
    pub adopted: Vec<IdentityKey>,
    /// Snapshot keys with no identity object
    pub missing: Vec<IdentityKey>,
    /// Folder objects whose name or content does not map to a key
    pub foreign: Vec<ObjectLocation>,
}

impl ReconcileReport {
    fn new(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            snapshot_count: 0,
            folder_count: 0,
            index_count: 0,
            duplicates_removed: Vec::new(),
            index_repaired: Vec::new(),
            index_pruned: Vec::new(),
            adopted: Vec::new(),
            missing: Vec::new(),
            foreign: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.outcome == ReconcileOutcome::Consistent
    }

    /// Turn a `Stopped` outcome into an error.
    pub fn into_result(self) -> Result<Self, ConsistencyViolation> {
        match self.outcome {
            ReconcileOutcome::Stopped => Err(ConsistencyViolation {
                snapshot_count: self.snapshot_count,
                folder_count: self.folder_count,
                missing: self.missing,
            }),
            _ => Ok(self),
        }
    }
}

/// Client for the three persisted views over one object store.
pub struct ThreeViewStore {
    store: Arc<dyn ObjectStore>,
    layout: ViewLayout,
    snapshot: ObjectLocation,
    index: ObjectLocation,
}

impl std::fmt::Debug for ThreeViewStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreeViewStore")
            .field("layout", &self.layout)
            .field("snapshot", &self.snapshot)
            .field("index", &self.index)
            .finish()
    }
}

impl ThreeViewStore {
    /// Locate the snapshot and index objects, creating empty ones when absent.
    pub async fn open(store: Arc<dyn ObjectStore>, layout: ViewLayout) -> Result<Self, RemoteStoreError> {
        let views = store.list(&layout.views_folder).await?;
        let snapshot = Self::find_or_create(&store, &layout, &views, &layout.snapshot_name).await?;
        let index = Self::find_or_create(&store, &layout, &views, &layout.index_name).await?;
        debug!(snapshot = %snapshot, index = %index, "opened three-view store");
        Ok(Self {
            store,
            layout,
            snapshot,
            index,
        })
    }

    async fn find_or_create(
        store: &Arc<dyn ObjectStore>,
        layout: &ViewLayout,
        views: &[ObjectListing],
        name: &str,
    ) -> Result<ObjectLocation, RemoteStoreError> {
        if let Some(existing) = views.iter().find(|listing| listing.name == name) {
            return Ok(existing.location.clone());
        }
        info!(name, folder = %layout.views_folder, "creating empty view object");
        store
            .put(&layout.views_folder, b"{}".to_vec(), ObjectMetadata::json(name))
            .await
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn layout(&self) -> &ViewLayout {
        &self.layout
    }

    pub fn snapshot_location(&self) -> &ObjectLocation {
        &self.snapshot
    }

    pub fn index_location(&self) -> &ObjectLocation {
        &self.index
    }

    async fn read_map<T: DeserializeOwned>(
        &self,
        location: &ObjectLocation,
    ) -> Result<BTreeMap<IdentityKey, T>, RemoteStoreError> {
        let bytes = self.store.get(location).await?;
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every identity in the snapshot.
    pub async fn load_snapshot(&self) -> Result<BTreeMap<IdentityKey, StoredIdentity>, RemoteStoreError> {
        self.read_map(&self.snapshot).await
    }

    pub async fn load_index(&self) -> Result<BTreeMap<IdentityKey, IndexEntry>, RemoteStoreError> {
        self.read_map(&self.index).await
    }

    /// Identity-folder listing, oldest first.
    pub async fn list_identity_objects(&self) -> Result<Vec<ObjectListing>, RemoteStoreError> {
        self.store.list(&self.layout.folder).await
    }

    pub async fn read_object(&self, location: &ObjectLocation) -> Result<StoredIdentity, RemoteStoreError> {
        let bytes = self.store.get(location).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Upsert (or with `None`, delete) one key of a map view.
    async fn patch_key<T: Serialize>(
        &self,
        location: &ObjectLocation,
        key: &IdentityKey,
        value: Option<&T>,
    ) -> Result<(), RemoteStoreError> {
        let value = match value {
            Some(value) => serde_json::to_value(value)?,
            None => Value::Null,
        };
        let mut body = Map::new();
        body.insert(key.as_str().to_string(), value);
        self.store
            .patch(location, serde_json::to_vec(&Value::Object(body))?)
            .await
    }

    fn index_entry(stored: &StoredIdentity, location: &ObjectLocation) -> IndexEntry {
        IndexEntry {
            identity_key: stored.key(),
            location: Some(location.clone()),
            created_at: stored.created_at,
            last_modified_at: stored.last_modified_at,
        }
    }

    async fn finish_write_through(
        &self,
        key: &IdentityKey,
        stored: &StoredIdentity,
        location: &ObjectLocation,
    ) -> Result<(), WriteThroughError> {
        let failed = |stage, source| WriteThroughError {
            key: key.clone(),
            stage,
            location: Some(location.clone()),
            source,
        };
        self.patch_key(&self.index, key, Some(&Self::index_entry(stored, location)))
            .await
            .map_err(|err| failed(WriteStage::Index, err))?;
        self.patch_key(&self.snapshot, key, Some(stored))
            .await
            .map_err(|err| failed(WriteStage::Snapshot, err))
    }

    /// Create the identity object, then index it, then add it to the snapshot.
    pub async fn write_through_create(&self, stored: &StoredIdentity) -> Result<ObjectLocation, WriteThroughError> {
        let key = stored.key();
        let bytes = serde_json::to_vec(stored).map_err(|err| WriteThroughError {
            key: key.clone(),
            stage: WriteStage::Object,
            location: None,
            source: err.into(),
        })?;
        let location = self
            .store
            .put(&self.layout.folder, bytes, ObjectMetadata::json(object_name(&key)))
            .await
            .map_err(|err| WriteThroughError {
                key: key.clone(),
                stage: WriteStage::Object,
                location: None,
                source: err,
            })?;
        debug!(key = %key, location = %location, "identity object created");
        self.finish_write_through(&key, stored, &location).await?;
        Ok(location)
    }

    /// Rewrite an existing identity object, then refresh its index and snapshot entries.
    pub async fn write_through_update(
        &self,
        stored: &StoredIdentity,
        location: &ObjectLocation,
    ) -> Result<(), WriteThroughError> {
        let key = stored.key();
        let object_failed = |source| WriteThroughError {
            key: key.clone(),
            stage: WriteStage::Object,
            location: Some(location.clone()),
            source,
        };
        let bytes = serde_json::to_vec(stored).map_err(|err| object_failed(err.into()))?;
        self.store
            .patch(location, bytes)
            .await
            .map_err(object_failed)?;
        debug!(key = %key, location = %location, "identity object updated");
        self.finish_write_through(&key, stored, location).await
    }

    /// Create or update depending on whether the object already exists.
    pub async fn write_through(
        &self,
        stored: &StoredIdentity,
        location: Option<&ObjectLocation>,
    ) -> Result<ObjectLocation, WriteThroughError> {
        match location {
            Some(location) => {
                self.write_through_update(stored, location).await?;
                Ok(location.clone())
            }
            None => self.write_through_create(stored).await,
        }
    }

    /// Delete an identity from all three views, object first.
    pub async fn remove_identity(
        &self,
        key: &IdentityKey,
        location: Option<&ObjectLocation>,
    ) -> Result<(), WriteThroughError> {
        let failed = |stage, source| WriteThroughError {
            key: key.clone(),
            stage,
            location: location.cloned(),
            source,
        };
        if let Some(location) = location {
            match self.store.delete(location).await {
                Ok(()) | Err(RemoteStoreError::NotFound(_)) => {}
                Err(err) => return Err(failed(WriteStage::Object, err)),
            }
        }
        self.patch_key::<IndexEntry>(&self.index, key, None)
            .await
            .map_err(|err| failed(WriteStage::Index, err))?;
        self.patch_key::<StoredIdentity>(&self.snapshot, key, None)
            .await
            .map_err(|err| failed(WriteStage::Snapshot, err))?;
        debug!(key = %key, "identity removed from remote views");
        Ok(())
    }

    /// Identity objects grouped by key, each group oldest first.
    pub async fn folder_objects(
        &self,
    ) -> Result<(BTreeMap<IdentityKey, Vec<ObjectListing>>, Vec<ObjectLocation>), RemoteStoreError> {
        let mut by_key: BTreeMap<IdentityKey, Vec<ObjectListing>> = BTreeMap::new();
        let mut foreign = Vec::new();
        for listing in self.list_identity_objects().await? {
            match key_for_object_name(&listing.name) {
                Some(key) => by_key.entry(key).or_default().push(listing),
                None => foreign.push(listing.location),
            }
        }
        Ok((by_key, foreign))
    }

    /// Compare the three views and repair what can be repaired.
    ///
    /// Snapshot keys without an identity object stop the pass before any
    /// write. Otherwise duplicate objects are deleted (keeping the one the
    /// index points at, else the newest), objects absent from the snapshot
    /// are adopted into it, and index entries are rebuilt from the folder.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, RemoteStoreError> {
        let mut snapshot = self.load_snapshot().await?;
        let index = self.load_index().await?;
        let (mut folder, mut foreign) = self.folder_objects().await?;

        let missing: Vec<IdentityKey> = snapshot
            .keys()
            .filter(|key| !folder.contains_key(*key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!(
                snapshot = snapshot.len(),
                folder = folder.len(),
                missing = missing.len(),
                "identity objects missing; full rewrite required"
            );
            let mut report = ReconcileReport::new(ReconcileOutcome::Stopped);
            report.snapshot_count = snapshot.len();
            report.folder_count = folder.len();
            report.index_count = index.len();
            report.missing = missing;
            report.foreign = foreign;
            return Ok(report);
        }

        let mut report = ReconcileReport::new(ReconcileOutcome::Consistent);

        let mut keepers: BTreeMap<IdentityKey, ObjectLocation> = BTreeMap::new();
        for (key, objects) in folder.iter_mut() {
            let indexed = index.get(key).and_then(|entry| entry.location.as_ref());
            let keep_at = objects
                .iter()
                .position(|listing| Some(&listing.location) == indexed)
                .unwrap_or(objects.len() - 1);
            let keeper = objects.remove(keep_at);
            for duplicate in objects.drain(..) {
                warn!(key = %key, location = %duplicate.location, keep = %keeper.location, "deleting duplicate identity object");
                match self.store.delete(&duplicate.location).await {
                    Ok(()) | Err(RemoteStoreError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                report.duplicates_removed.push(duplicate.location);
            }
            keepers.insert(key.clone(), keeper.location);
        }

        for (key, location) in &keepers {
            if snapshot.contains_key(key) {
                continue;
            }
            let stored = match self.read_object(location).await {
                Ok(stored) if &stored.key() == key => stored,
                Ok(stored) => {
                    warn!(key = %key, content_key = %stored.key(), location = %location, "object name does not match its content");
                    foreign.push(location.clone());
                    continue;
                }
                Err(RemoteStoreError::Codec(message)) => {
                    warn!(key = %key, location = %location, error = %message, "unreadable identity object");
                    foreign.push(location.clone());
                    continue;
                }
                Err(err) => return Err(err),
            };
            info!(key = %key, location = %location, "adopting unindexed identity object into snapshot");
            self.patch_key(&self.snapshot, key, Some(&stored)).await?;
            snapshot.insert(key.clone(), stored);
            report.adopted.push(key.clone());
        }

        let mut index_count = index.len();
        for (key, location) in &keepers {
            let Some(stored) = snapshot.get(key) else {
                continue;
            };
            let current = index.get(key).and_then(|entry| entry.location.as_ref());
            if current == Some(location) {
                continue;
            }
            info!(key = %key, location = %location, stale = ?current, "re-indexing identity object");
            self.patch_key(&self.index, key, Some(&Self::index_entry(stored, location)))
                .await?;
            if !index.contains_key(key) {
                index_count += 1;
            }
            report.index_repaired.push(key.clone());
        }

        let linked: BTreeSet<&IdentityKey> = keepers
            .keys()
            .filter(|key| snapshot.contains_key(*key))
            .collect();
        for key in index.keys() {
            if linked.contains(key) {
                continue;
            }
            info!(key = %key, "pruning index entry with no identity object");
            self.patch_key::<IndexEntry>(&self.index, key, None).await?;
            index_count -= 1;
            report.index_pruned.push(key.clone());
        }

        report.snapshot_count = snapshot.len();
        report.folder_count = linked.len();
        report.index_count = index_count;
        report.foreign = foreign;

        let repaired = !report.duplicates_removed.is_empty()
            || !report.adopted.is_empty()
            || !report.index_repaired.is_empty()
            || !report.index_pruned.is_empty();
        if repaired {
            report.outcome = ReconcileOutcome::Repaired;
        }
        info!(
            outcome = ?report.outcome,
            snapshot = report.snapshot_count,
            folder = report.folder_count,
            index = report.index_count,
            "reconcile finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributedTerm, IdentityKind};
    use crate::remote::{MemoryObjectStore, StoreOp};

    fn stored(name: &str) -> StoredIdentity {
        let now = Utc::now();
        StoredIdentity {
            identity: Identity::from_primary(IdentityKind::Person, AttributedTerm::manual(name, "name")),
            created_at: now,
            last_modified_at: now,
        }
    }

    async fn open(memory: &Arc<MemoryObjectStore>) -> ThreeViewStore {
        ThreeViewStore::open(memory.clone(), ViewLayout::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_object_name_roundtrip() {
        let key = IdentityKey::new("John Smith");
        assert_eq!(object_name(&key), "JOHN SMITH.json");
        assert_eq!(key_for_object_name("JOHN SMITH.json"), Some(key));
        assert_eq!(key_for_object_name("notes.txt"), None);
        assert_eq!(key_for_object_name(".json"), None);
    }

    #[tokio::test]
    async fn test_open_reuses_existing_views() {
        let memory = Arc::new(MemoryObjectStore::new());
        let first = open(&memory).await;
        let second = open(&memory).await;
        assert_eq!(first.snapshot_location(), second.snapshot_location());
        assert_eq!(first.index_location(), second.index_location());
        assert_eq!(memory.object_count("views"), 2);
    }

    #[tokio::test]
    async fn test_write_through_then_consistent() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        let location = views.write_through_create(&stored("John Smith")).await.unwrap();

        let index = views.load_index().await.unwrap();
        assert_eq!(
            index[&IdentityKey::new("JOHN SMITH")].location.as_ref(),
            Some(&location)
        );
        let report = views.reconcile().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Consistent);
        assert_eq!(
            (report.snapshot_count, report.folder_count, report.index_count),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn test_failed_object_step_writes_nothing_else() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        memory.fail_next(StoreOp::Put, 1);
        let patches_before = memory.calls(StoreOp::Patch);

        let err = views.write_through_create(&stored("Mary Jones")).await.unwrap_err();
        assert_eq!(err.stage, WriteStage::Object);
        assert_eq!(err.location, None);
        assert_eq!(memory.calls(StoreOp::Patch), patches_before);
        assert!(views.load_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unindexed_object_is_relinked() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        memory.fail_named(StoreOp::Patch, "index.json", 1);

        let err = views.write_through_create(&stored("Acme Corp")).await.unwrap_err();
        assert_eq!(err.stage, WriteStage::Index);
        let location = err.location.clone().unwrap();

        let report = views.reconcile().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.adopted, vec![IdentityKey::new("ACME CORP")]);
        assert_eq!(report.index_repaired, vec![IdentityKey::new("ACME CORP")]);
        let index = views.load_index().await.unwrap();
        assert_eq!(index[&IdentityKey::new("ACME CORP")].location, Some(location));

        assert!(views.reconcile().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_duplicate_objects_keep_indexed_copy() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        let identity = stored("John Smith");
        let stray = memory
            .put("identities", serde_json::to_vec(&identity).unwrap(), ObjectMetadata::json("JOHN SMITH.json"))
            .await
            .unwrap();
        let indexed = views.write_through_create(&identity).await.unwrap();

        let report = views.reconcile().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.duplicates_removed, vec![stray]);
        assert_eq!(memory.object_count("identities"), 1);
        let index = views.load_index().await.unwrap();
        assert_eq!(index[&identity.key()].location, Some(indexed));
    }

    #[tokio::test]
    async fn test_stale_index_entry_is_pruned() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        let identity = stored("Ghost Owner");
        let location = views.write_through_create(&identity).await.unwrap();
        memory.delete(&location).await.unwrap();
        views
            .patch_key::<StoredIdentity>(views.snapshot_location(), &identity.key(), None)
            .await
            .unwrap();

        let report = views.reconcile().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Repaired);
        assert_eq!(report.index_pruned, vec![identity.key()]);
        assert_eq!(report.index_count, 0);
    }

    #[tokio::test]
    async fn test_missing_object_stops_without_writes() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        let location = views.write_through_create(&stored("Lost Record")).await.unwrap();
        memory.delete(&location).await.unwrap();
        let patches = memory.calls(StoreOp::Patch);

        let report = views.reconcile().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Stopped);
        assert_eq!(report.missing, vec![IdentityKey::new("LOST RECORD")]);
        assert_eq!(memory.calls(StoreOp::Patch), patches);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_remove_identity_clears_all_views() {
        let memory = Arc::new(MemoryObjectStore::new());
        let views = open(&memory).await;
        let identity = stored("Jane Roe");
        let location = views.write_through_create(&identity).await.unwrap();
        views
            .remove_identity(&identity.key(), Some(&location))
            .await
            .unwrap();
        assert!(views.load_snapshot().await.unwrap().is_empty());
        assert!(views.load_index().await.unwrap().is_empty());
        assert_eq!(memory.object_count("identities"), 0);
        assert!(views.reconcile().await.unwrap().is_consistent());
    }
}
