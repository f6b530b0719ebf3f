//! # Remote Object Store
//!
//! The collaborator interface behind the three persisted views, plus two
//! implementations: an in-memory store with fault injection and a
//! directory-backed store used by the command-line tool.
//!
//! `patch` has JSON merge semantics: the stored object and the patch body are
//! both JSON objects, top-level keys in the patch are upserted and a `null`
//! value deletes the key. This is what lets the index and the snapshot take
//! single-key updates without clobbering entries written by other workers.

use crate::error::RemoteStoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store-assigned address of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectLocation(String);

impl ObjectLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata supplied when creating an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// File name, used to map folder listings back to identity keys
    pub name: String,
    pub content_type: String,
}

impl ObjectMetadata {
    pub fn json(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: "application/json".to_string(),
        }
    }
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListing {
    pub location: ObjectLocation,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Generic remote object store. Every call may fail transiently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object's bytes.
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, RemoteStoreError>;

    /// Create a new object in `folder` and return its location.
    async fn put(
        &self,
        folder: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectLocation, RemoteStoreError>;

    /// Merge-patch a JSON object in place.
    async fn patch(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), RemoteStoreError>;

    /// List the objects of a folder, oldest first.
    async fn list(&self, folder: &str) -> Result<Vec<ObjectListing>, RemoteStoreError>;

    /// Delete an object.
    async fn delete(&self, location: &ObjectLocation) -> Result<(), RemoteStoreError>;
}

/// Apply a JSON merge patch to an encoded JSON object.
pub fn merge_patch(existing: &[u8], patch: &[u8]) -> Result<Vec<u8>, RemoteStoreError> {
    let mut base: Value = if existing.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(existing)?
    };
    let patch: Value = serde_json::from_slice(patch)?;
    let (Value::Object(target), Value::Object(changes)) = (&mut base, patch) else {
        return Err(RemoteStoreError::Codec(
            "merge patch requires JSON objects".to_string(),
        ));
    };
    for (key, value) in changes {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
    Ok(serde_json::to_vec(&base)?)
}

/// Operation kinds, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Patch,
    List,
    Delete,
}

impl StoreOp {
    pub fn name(self) -> &'static str {
        match self {
            StoreOp::Get => "get",
            StoreOp::Put => "put",
            StoreOp::Patch => "patch",
            StoreOp::List => "list",
            StoreOp::Delete => "delete",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone)]
struct FaultRule {
    op: StoreOp,
    name: Option<String>,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct MemoryObject {
    folder: String,
    name: String,
    bytes: Vec<u8>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: IndexMap<ObjectLocation, MemoryObject>,
    next_id: u64,
    faults: Vec<FaultRule>,
    calls: hashbrown::HashMap<&'static str, usize>,
}

impl MemoryState {
    fn check_fault(&mut self, op: StoreOp, name: Option<&str>) -> Result<(), RemoteStoreError> {
        let hit = self.faults.iter_mut().find(|rule| {
            rule.op == op
                && rule.remaining > 0
                && match (&rule.name, name) {
                    (None, _) => true,
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (Some(_), None) => false,
                }
        });
        if let Some(rule) = hit {
            rule.remaining -= 1;
            return Err(RemoteStoreError::Transient {
                operation: op.to_string(),
                message: "injected fault".to_string(),
            });
        }
        self.faults.retain(|rule| rule.remaining > 0);
        Ok(())
    }

    fn count(&mut self, op: StoreOp) {
        *self.calls.entry(op.name()).or_default() += 1;
    }
}

/// In-memory object store.
///
/// Faults can be injected per operation, optionally restricted to objects with
/// a given name, to exercise partial write-through failures.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        self.state.lock().faults.push(FaultRule {
            op,
            name: None,
            remaining: times,
        });
    }

    /// Fail the next `times` calls of `op` that touch an object named `name`.
    ///
    /// For `put` the name is the metadata name; for the other operations it is
    /// the name of the object at the target location.
    pub fn fail_named(&self, op: StoreOp, name: &str, times: usize) {
        self.state.lock().faults.push(FaultRule {
            op,
            name: Some(name.to_string()),
            remaining: times,
        });
    }

    /// Number of calls made for an operation.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(op.name()).copied().unwrap_or(0)
    }

    /// Number of objects stored in a folder.
    pub fn object_count(&self, folder: &str) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|object| object.folder == folder)
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, RemoteStoreError> {
        let mut state = self.state.lock();
        state.count(StoreOp::Get);
        let name = state.objects.get(location).map(|object| object.name.clone());
        state.check_fault(StoreOp::Get, name.as_deref())?;
        state
            .objects
            .get(location)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| RemoteStoreError::NotFound(location.clone()))
    }

    async fn put(
        &self,
        folder: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectLocation, RemoteStoreError> {
        let mut state = self.state.lock();
        state.count(StoreOp::Put);
        state.check_fault(StoreOp::Put, Some(&metadata.name))?;
        state.next_id += 1;
        let location = ObjectLocation::new(format!("mem-{:08}", state.next_id));
        state.objects.insert(
            location.clone(),
            MemoryObject {
                folder: folder.to_string(),
                name: metadata.name,
                bytes,
                created_at: Utc::now(),
            },
        );
        Ok(location)
    }

    async fn patch(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), RemoteStoreError> {
        let mut state = self.state.lock();
        state.count(StoreOp::Patch);
        let name = state.objects.get(location).map(|object| object.name.clone());
        state.check_fault(StoreOp::Patch, name.as_deref())?;
        let object = state
            .objects
            .get_mut(location)
            .ok_or_else(|| RemoteStoreError::NotFound(location.clone()))?;
        object.bytes = merge_patch(&object.bytes, &bytes)?;
        Ok(())
    }

    async fn list(&self, folder: &str) -> Result<Vec<ObjectListing>, RemoteStoreError> {
        let mut state = self.state.lock();
        state.count(StoreOp::List);
        state.check_fault(StoreOp::List, None)?;
        Ok(state
            .objects
            .iter()
            .filter(|(_, object)| object.folder == folder)
            .map(|(location, object)| ObjectListing {
                location: location.clone(),
                name: object.name.clone(),
                created_at: object.created_at,
            })
            .collect())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), RemoteStoreError> {
        let mut state = self.state.lock();
        state.count(StoreOp::Delete);
        let name = state.objects.get(location).map(|object| object.name.clone());
        state.check_fault(StoreOp::Delete, name.as_deref())?;
        state
            .objects
            .shift_remove(location)
            .map(|_| ())
            .ok_or_else(|| RemoteStoreError::NotFound(location.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FsObjectMeta {
    name: String,
    content_type: String,
    created_at: DateTime<Utc>,
}

/// Object store backed by a local directory.
///
/// Each object is `<root>/<folder>/<id>.json` with a sidecar
/// `<id>.meta.json`; the location is `<folder>/<id>`.
///
/// Patches to one location are serialized; the read-merge-write of one
/// patch never interleaves with another on the same object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    patch_locks: Arc<DashMap<ObjectLocation, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            patch_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, location: &ObjectLocation) -> PathBuf {
        self.root.join(format!("{}.json", location.as_str()))
    }

    fn meta_path(&self, location: &ObjectLocation) -> PathBuf {
        self.root.join(format!("{}.meta.json", location.as_str()))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RemoteStoreError> {
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_existing(&self, location: &ObjectLocation) -> Result<Vec<u8>, RemoteStoreError> {
        match tokio::fs::read(self.data_path(location)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteStoreError::NotFound(location.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, RemoteStoreError> {
        self.read_existing(location).await
    }

    async fn put(
        &self,
        folder: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<ObjectLocation, RemoteStoreError> {
        tokio::fs::create_dir_all(self.root.join(folder)).await?;
        let location = ObjectLocation::new(format!("{}/{}", folder, uuid::Uuid::new_v4()));
        let meta = FsObjectMeta {
            name: metadata.name,
            content_type: metadata.content_type,
            created_at: Utc::now(),
        };
        Self::write_atomic(&self.data_path(&location), &bytes).await?;
        Self::write_atomic(&self.meta_path(&location), &serde_json::to_vec(&meta)?).await?;
        Ok(location)
    }

    async fn patch(&self, location: &ObjectLocation, bytes: Vec<u8>) -> Result<(), RemoteStoreError> {
        let lock = self.patch_locks.entry(location.clone()).or_default().clone();
        let _guard = lock.lock().await;
        let existing = self.read_existing(location).await?;
        let merged = merge_patch(&existing, &bytes)?;
        Self::write_atomic(&self.data_path(location), &merged).await
    }

    async fn list(&self, folder: &str) -> Result<Vec<ObjectListing>, RemoteStoreError> {
        let dir = self.root.join(folder);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut listings = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = file_name.strip_suffix(".meta.json") else {
                continue;
            };
            let location = ObjectLocation::new(format!("{}/{}", folder, id));
            if tokio::fs::metadata(self.data_path(&location)).await.is_err() {
                continue;
            }
            let raw = tokio::fs::read(entry.path()).await?;
            let meta: FsObjectMeta = serde_json::from_slice(&raw)?;
            listings.push(ObjectListing {
                location,
                name: meta.name,
                created_at: meta.created_at,
            });
        }
        listings.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.location.cmp(&b.location))
        });
        Ok(listings)
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), RemoteStoreError> {
        match tokio::fs::remove_file(self.data_path(location)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteStoreError::NotFound(location.clone()))
            }
            Err(err) => return Err(err.into()),
        }
        let _ = tokio::fs::remove_file(self.meta_path(location)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_upserts_and_deletes() {
        let base = serde_json::to_vec(&json!({"A": 1, "B": 2})).unwrap();
        let patch = serde_json::to_vec(&json!({"B": null, "C": 3})).unwrap();
        let merged: Value = serde_json::from_slice(&merge_patch(&base, &patch).unwrap()).unwrap();
        assert_eq!(merged, json!({"A": 1, "C": 3}));
    }

    #[test]
    fn test_merge_patch_rejects_non_objects() {
        let base = serde_json::to_vec(&json!([1, 2])).unwrap();
        let patch = serde_json::to_vec(&json!({"A": 1})).unwrap();
        assert!(matches!(
            merge_patch(&base, &patch),
            Err(RemoteStoreError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_put_list_patch_delete() {
        let store = MemoryObjectStore::new();
        let loc = store
            .put("identities", b"{}".to_vec(), ObjectMetadata::json("JOHN SMITH.json"))
            .await
            .unwrap();
        store
            .patch(&loc, serde_json::to_vec(&json!({"x": 1})).unwrap())
            .await
            .unwrap();
        let bytes = store.get(&loc).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"x": 1}));

        let listing = store.list("identities").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "JOHN SMITH.json");
        assert!(store.list("other").await.unwrap().is_empty());

        store.delete(&loc).await.unwrap();
        assert!(matches!(
            store.get(&loc).await,
            Err(RemoteStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_named_fault_is_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_named(StoreOp::Put, "index.json", 1);
        store
            .put("views", b"{}".to_vec(), ObjectMetadata::json("snapshot.json"))
            .await
            .unwrap();
        assert!(store
            .put("views", b"{}".to_vec(), ObjectMetadata::json("index.json"))
            .await
            .is_err());
        store
            .put("views", b"{}".to_vec(), ObjectMetadata::json("index.json"))
            .await
            .unwrap();
        assert_eq!(store.calls(StoreOp::Put), 3);
        assert_eq!(store.object_count("views"), 2);
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let loc = store
            .put("identities", b"{\"a\":1}".to_vec(), ObjectMetadata::json("ACME.json"))
            .await
            .unwrap();
        store
            .patch(&loc, b"{\"b\":2}".to_vec())
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&store.get(&loc).await.unwrap()).unwrap();
        assert_eq!(value, json!({"a": 1, "b": 2}));

        let listing = store.list("identities").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].location, loc);
        assert_eq!(listing[0].name, "ACME.json");

        store.delete(&loc).await.unwrap();
        assert!(store.list("identities").await.unwrap().is_empty());
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fs_store_concurrent_patches_keep_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let loc = store
            .put("views", b"{}".to_vec(), ObjectMetadata::json("index.json"))
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..40 {
            let store = store.clone();
            let loc = loc.clone();
            tasks.spawn(async move {
                let body = serde_json::to_vec(&json!({ format!("KEY {i}"): i })).unwrap();
                store.patch(&loc, body).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let value: Value = serde_json::from_slice(&store.get(&loc).await.unwrap()).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 40);
        assert_eq!(store.list("views").await.unwrap().len(), 1);
    }
}
