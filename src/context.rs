//! # Registry Context
//!
//! Explicit handle passed to every workflow: the in-memory registry, per-key
//! locks, the remote views, and the set of identities whose remote copies are
//! behind the registry.

use crate::backfill::{BackfillJob, BackfillReport};
use crate::config::MatchingConfig;
use crate::consistency::{ReconcileReport, StoredIdentity, ThreeViewStore};
use crate::error::{BackfillError, RemoteStoreError, WorkflowError, WriteThroughError};
use crate::model::IdentityKey;
use crate::registry::Registry;
use crate::remote::ObjectLocation;
use crate::similarity::SimilarityPolicy;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

/// Remote work still owed for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSync {
    /// Write the registry's current content
    Write,
    /// Remove the identity from all views
    Remove(Option<ObjectLocation>),
}

type KeyLocks = DashMap<IdentityKey, Arc<tokio::sync::Mutex<()>>>;

/// Guards for a set of identity keys, released on drop.
///
/// A key's lock entry is dropped from the map once nobody holds or waits on it.
pub struct KeyGuards {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<IdentityKey>,
    locks: Arc<KeyLocks>,
}

impl Drop for KeyGuards {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

impl KeyGuards {
    pub fn keys(&self) -> &[IdentityKey] {
        &self.keys
    }
}

/// Reconciliation result plus identities the registry still has to push.
#[derive(Debug, Clone)]
pub struct ContextReconcile {
    pub report: ReconcileReport,
    pub unsynced: Vec<IdentityKey>,
}

/// Shared state for all workflows.
pub struct RegistryContext {
    registry: RwLock<Registry>,
    locks: Arc<KeyLocks>,
    views: Arc<ThreeViewStore>,
    unsynced: Mutex<BTreeMap<IdentityKey, PendingSync>>,
    policy: SimilarityPolicy,
    suggestion_limit: usize,
}

impl RegistryContext {
    pub fn new(views: Arc<ThreeViewStore>, registry: Registry) -> Self {
        let matching = MatchingConfig::default();
        Self {
            registry: RwLock::new(registry),
            locks: Arc::new(DashMap::new()),
            views,
            unsynced: Mutex::new(BTreeMap::new()),
            policy: matching.policy(),
            suggestion_limit: matching.suggestion_limit,
        }
    }

    pub fn with_matching(mut self, matching: &MatchingConfig) -> Self {
        self.policy = matching.policy();
        self.suggestion_limit = matching.suggestion_limit;
        self
    }

    /// Rebuild the registry from the snapshot, taking locations from the index.
    pub async fn load(views: Arc<ThreeViewStore>) -> Result<Self, WorkflowError> {
        let snapshot = views.load_snapshot().await?;
        let index = views.load_index().await?;
        let mut registry = Registry::new();
        for (key, stored) in snapshot {
            let derived = stored.key();
            if derived != key {
                warn!(key = %key, derived = %derived, "snapshot entry key does not match its primary");
            }
            let location = index.get(&derived).and_then(|entry| entry.location.clone());
            registry.restore(stored.identity, location, stored.created_at, stored.last_modified_at)?;
        }
        info!(identities = registry.len(), "registry loaded from snapshot");
        Ok(Self::new(views, registry))
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    pub(crate) fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write()
    }

    pub fn views(&self) -> &Arc<ThreeViewStore> {
        &self.views
    }

    pub fn policy(&self) -> &SimilarityPolicy {
        &self.policy
    }

    pub fn suggestion_limit(&self) -> usize {
        self.suggestion_limit
    }

    /// Lock a set of identity keys, in sorted order.
    pub async fn lock_keys(&self, keys: &[IdentityKey]) -> KeyGuards {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.locks.entry(key.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        KeyGuards {
            guards,
            keys,
            locks: self.locks.clone(),
        }
    }

    /// Identities whose remote copies are behind.
    pub fn unsynced_keys(&self) -> Vec<IdentityKey> {
        self.unsynced.lock().keys().cloned().collect()
    }

    fn mark(&self, key: &IdentityKey, pending: PendingSync) {
        self.unsynced.lock().insert(key.clone(), pending);
    }

    fn unmark(&self, key: &IdentityKey) {
        self.unsynced.lock().remove(key);
    }

    /// Write one identity through to the three views.
    ///
    /// On failure the identity is remembered as unsynced; if its object was
    /// created the location is kept so the retry updates instead of duplicating.
    pub async fn persist(&self, key: &IdentityKey) -> Result<ObjectLocation, WriteThroughError> {
        let (stored, location) = {
            let registry = self.registry.read();
            let Some(entry) = registry.lookup_by_key(key) else {
                return Err(WriteThroughError {
                    key: key.clone(),
                    stage: crate::error::WriteStage::Object,
                    location: None,
                    source: RemoteStoreError::NotFound(ObjectLocation::new(
                        crate::consistency::object_name(key),
                    )),
                });
            };
            (StoredIdentity::from_entry(entry), entry.location.clone())
        };
        match self.views.write_through(&stored, location.as_ref()).await {
            Ok(location) => {
                let _ = self.registry.write().set_location(key, Some(location.clone()));
                self.unmark(key);
                Ok(location)
            }
            Err(err) => {
                warn!(key = %key, stage = %err.stage, error = %err.source, "write-through failed; identity left unsynced");
                if let Some(created) = &err.location {
                    let _ = self.registry.write().set_location(key, Some(created.clone()));
                }
                self.mark(key, PendingSync::Write);
                Err(err)
            }
        }
    }

    /// Persist several identities; failures are collected into `Unsynced`.
    pub async fn persist_all(&self, keys: &[IdentityKey]) -> Result<(), WorkflowError> {
        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = self.persist(key).await {
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Unsynced {
                keys: failures.iter().map(|err| err.key.clone()).collect(),
                failures,
            })
        }
    }

    /// Remove an identity that left the registry from all three views.
    pub async fn retire(
        &self,
        key: &IdentityKey,
        location: Option<ObjectLocation>,
    ) -> Result<(), WriteThroughError> {
        match self.views.remove_identity(key, location.as_ref()).await {
            Ok(()) => {
                self.unmark(key);
                Ok(())
            }
            Err(err) => {
                warn!(key = %key, stage = %err.stage, error = %err.source, "remote removal failed; identity left unsynced");
                self.mark(key, PendingSync::Remove(location));
                Err(err)
            }
        }
    }

    /// Retry every pending write and removal.
    pub async fn flush_unsynced(&self) -> Result<usize, WorkflowError> {
        let pending: Vec<(IdentityKey, PendingSync)> = self
            .unsynced
            .lock()
            .iter()
            .map(|(key, pending)| (key.clone(), pending.clone()))
            .collect();
        let mut failures = Vec::new();
        let mut flushed = 0;
        for (key, pending) in pending {
            let present = self.registry.read().contains(&key);
            let result = match pending {
                PendingSync::Write if present => self.persist(&key).await.map(|_| ()),
                PendingSync::Write => {
                    self.unmark(&key);
                    continue;
                }
                PendingSync::Remove(location) => self.retire(&key, location).await,
            };
            match result {
                Ok(()) => flushed += 1,
                Err(err) => failures.push(err),
            }
        }
        debug!(flushed, failed = failures.len(), "flushed unsynced identities");
        if failures.is_empty() {
            Ok(flushed)
        } else {
            Err(WorkflowError::Unsynced {
                keys: failures.iter().map(|err| err.key.clone()).collect(),
                failures,
            })
        }
    }

    /// Reconcile the three views, then pick up index locations for the registry.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ContextReconcile, RemoteStoreError> {
        let report = self.views.reconcile().await?;
        if report.outcome != crate::consistency::ReconcileOutcome::Stopped {
            self.refresh_locations().await?;
        }
        let unsynced = self.unsynced_keys();
        if !unsynced.is_empty() {
            warn!(count = unsynced.len(), "registry holds changes not yet written through");
        }
        Ok(ContextReconcile { report, unsynced })
    }

    async fn refresh_locations(&self) -> Result<(), RemoteStoreError> {
        let index = self.views.load_index().await?;
        let mut registry = self.registry.write();
        for (key, entry) in index {
            if entry.location.is_some() && registry.contains(&key) {
                let _ = registry.set_location(&key, entry.location);
            }
        }
        Ok(())
    }

    /// Run one backfill chunk over the current registry content.
    pub async fn backfill_chunk(&self, job: &BackfillJob) -> Result<BackfillReport, BackfillError> {
        let identities: Vec<StoredIdentity> = self
            .registry
            .read()
            .iter()
            .map(|(_, entry)| StoredIdentity::from_entry(entry))
            .collect();
        let report = job.run_chunk(identities).await?;
        let mut registry = self.registry.write();
        for (key, location) in &report.written {
            let _ = registry.set_location(key, Some(location.clone()));
        }
        drop(registry);
        for (key, _) in &report.written {
            self.unmark(key);
        }
        Ok(report)
    }
}
