//! # Registry Module
//!
//! In-memory canonical identity registry keyed by normalized primary value,
//! with a derived variant cache mapping every alias to its owning identity.

use crate::error::{AliasError, RegistryError};
use crate::model::{AliasCategory, Aliases, AttributedTerm, Identity, IdentityKey};
use crate::normalize::normalize_key;
use crate::remote::ObjectLocation;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use indexmap::IndexMap;

/// One identity plus its remote bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub identity: Identity,
    /// Location of the per-identity object, once written
    pub location: Option<ObjectLocation>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl RegistryEntry {
    fn new(identity: Identity) -> Self {
        let now = Utc::now();
        Self {
            identity,
            location: None,
            created_at: now,
            last_modified_at: now,
        }
    }
}

/// Rebuildable map from normalized variant to owning identity keys.
///
/// Never authoritative. A variant owned by more than one identity is an
/// unresolved duplicate and is reported by [`VariantCache::shared_variants`].
#[derive(Debug, Clone, Default)]
pub struct VariantCache {
    owners: HashMap<String, Vec<IdentityKey>>,
    by_owner: HashMap<IdentityKey, Vec<String>>,
}

impl VariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache from scratch.
    pub fn build<'a>(entries: impl IntoIterator<Item = (&'a IdentityKey, &'a Aliases)>) -> Self {
        let mut cache = Self::new();
        for (key, aliases) in entries {
            cache.insert_identity(key, aliases);
        }
        cache
    }

    /// First owner of a variant.
    pub fn lookup(&self, value: &str) -> Option<&IdentityKey> {
        self.owners
            .get(normalize_key(value).as_str())
            .and_then(|owners| owners.first())
    }

    /// Every owner of a variant.
    pub fn owners(&self, value: &str) -> &[IdentityKey] {
        self.owners
            .get(normalize_key(value).as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn insert_identity(&mut self, key: &IdentityKey, aliases: &Aliases) {
        let values = aliases.normalized_values();
        for value in &values {
            let owners = self.owners.entry(value.clone()).or_default();
            if !owners.contains(key) {
                owners.push(key.clone());
            }
        }
        self.by_owner.insert(key.clone(), values);
    }

    fn remove_identity(&mut self, key: &IdentityKey) {
        let Some(values) = self.by_owner.remove(key) else {
            return;
        };
        for value in values {
            if let Some(owners) = self.owners.get_mut(value.as_str()) {
                owners.retain(|owner| owner != key);
                if owners.is_empty() {
                    self.owners.remove(value.as_str());
                }
            }
        }
    }

    fn refresh_identity(&mut self, key: &IdentityKey, aliases: &Aliases) {
        self.remove_identity(key);
        self.insert_identity(key, aliases);
    }

    /// Variants owned by more than one identity, sorted by variant.
    pub fn shared_variants(&self) -> Vec<(String, Vec<IdentityKey>)> {
        let mut shared: Vec<_> = self
            .owners
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(value, owners)| (value.clone(), owners.clone()))
            .collect();
        shared.sort_by(|a, b| a.0.cmp(&b.0));
        shared
    }

    /// Number of distinct variants.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// A broken registry invariant found by [`Registry::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Stored key differs from the normalized primary
    KeyMismatch {
        key: IdentityKey,
        derived: IdentityKey,
    },
    /// A variant repeats inside one identity
    DuplicateVariant { key: IdentityKey, error: AliasError },
}

/// Result of a primary change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryChange {
    pub old_key: IdentityKey,
    pub new_key: IdentityKey,
    /// Object written under the old key, if the key changed
    pub retired_location: Option<ObjectLocation>,
}

impl PrimaryChange {
    pub fn key_changed(&self) -> bool {
        self.old_key != self.new_key
    }
}

/// Canonical identity registry.
///
/// Iteration follows insertion order, which is also the tie-break order of
/// similarity searches.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: IndexMap<IdentityKey, RegistryEntry>,
    variants: VariantCache,
    pending: Option<IdentityKey>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &RegistryEntry)> + '_ {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> + '_ {
        self.entries.keys()
    }

    pub fn lookup_by_key(&self, key: &IdentityKey) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    /// Like [`Registry::lookup_by_key`] but as a `Result`.
    pub fn get(&self, key: &IdentityKey) -> Result<&RegistryEntry, RegistryError> {
        self.entries
            .get(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })
    }

    /// Key of the identity owning a variant.
    pub fn lookup_by_variant(&self, value: &str) -> Option<&IdentityKey> {
        self.variants.lookup(value)
    }

    pub fn variant_cache(&self) -> &VariantCache {
        &self.variants
    }

    /// Variants owned by more than one identity.
    pub fn shared_variants(&self) -> Vec<(String, Vec<IdentityKey>)> {
        self.variants.shared_variants()
    }

    /// Regenerate the variant cache from every identity.
    pub fn rebuild_variant_cache(&mut self) {
        self.variants = VariantCache::build(
            self.entries
                .iter()
                .map(|(key, entry)| (key, entry.identity.aliases())),
        );
    }

    /// Duplicate key awaiting resolution, if any.
    pub fn pending_conflict(&self) -> Option<&IdentityKey> {
        self.pending.as_ref()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }

    fn ensure_unblocked(&self) -> Result<(), RegistryError> {
        match &self.pending {
            Some(key) => Err(RegistryError::ConflictPending { key: key.clone() }),
            None => Ok(()),
        }
    }

    /// Add a new identity.
    ///
    /// A key collision is never merged: it fails with `DuplicateKey` and
    /// freezes the registry until the duplicate-key workflow resolves it.
    pub fn add(&mut self, identity: Identity) -> Result<IdentityKey, RegistryError> {
        self.ensure_unblocked()?;
        let key = identity.key();
        if self.entries.contains_key(&key) {
            self.pending = Some(key.clone());
            return Err(RegistryError::DuplicateKey { key });
        }
        identity.aliases().check_unique()?;
        self.variants.insert_identity(&key, identity.aliases());
        self.entries.insert(key.clone(), RegistryEntry::new(identity));
        Ok(key)
    }

    /// Re-insert a previously persisted identity with its bookkeeping.
    pub fn restore(
        &mut self,
        identity: Identity,
        location: Option<ObjectLocation>,
        created_at: DateTime<Utc>,
        last_modified_at: DateTime<Utc>,
    ) -> Result<IdentityKey, RegistryError> {
        let key = identity.key();
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateKey { key });
        }
        identity.aliases().check_unique()?;
        self.variants.insert_identity(&key, identity.aliases());
        self.entries.insert(
            key.clone(),
            RegistryEntry {
                identity,
                location,
                created_at,
                last_modified_at,
            },
        );
        Ok(key)
    }

    /// Replace the primary of an identity, re-keying it.
    ///
    /// `new_primary` may be an existing variant (it is promoted) or a new value.
    /// The old primary is appended to `demote_to`.
    pub fn change_primary(
        &mut self,
        key: &IdentityKey,
        new_primary: AttributedTerm,
        demote_to: AliasCategory,
    ) -> Result<PrimaryChange, RegistryError> {
        self.ensure_unblocked()?;
        let new_key = IdentityKey::new(&new_primary.display());
        let entry = self.get(key)?;
        if &new_key != key && self.entries.contains_key(&new_key) {
            return Err(RegistryError::KeyCollision {
                key: key.clone(),
                owner: new_key,
            });
        }

        let mut identity = entry.identity.clone();
        identity.aliases_mut().set_primary(new_primary, demote_to)?;
        identity.aliases().check_unique()?;

        let now = Utc::now();
        if &new_key == key {
            let entry = self
                .entries
                .get_mut(key)
                .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
            entry.identity = identity;
            entry.last_modified_at = now;
            self.variants.refresh_identity(key, entry.identity.aliases());
            return Ok(PrimaryChange {
                old_key: key.clone(),
                new_key,
                retired_location: None,
            });
        }

        let (position, _, mut entry) = self
            .entries
            .shift_remove_full(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        let retired_location = entry.location.take();
        entry.identity = identity;
        entry.last_modified_at = now;
        self.variants.remove_identity(key);
        self.variants
            .insert_identity(&new_key, entry.identity.aliases());
        // Keep the first-seen position used for tie-breaking.
        self.entries.shift_insert(position, new_key.clone(), entry);
        Ok(PrimaryChange {
            old_key: key.clone(),
            new_key,
            retired_location,
        })
    }

    /// Apply an alias mutation atomically.
    ///
    /// The closure works on a copy; the copy is committed only if it succeeds,
    /// keeps the key unchanged and keeps every variant unique.
    pub fn update_aliases<T>(
        &mut self,
        key: &IdentityKey,
        mutate: impl FnOnce(&mut Aliases) -> Result<T, AliasError>,
    ) -> Result<T, RegistryError> {
        self.ensure_unblocked()?;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        let mut aliases = entry.identity.aliases().clone();
        let out = mutate(&mut aliases)?;
        let derived = aliases.key();
        if &derived != key {
            return Err(RegistryError::KeyInvariant {
                key: key.clone(),
                derived,
            });
        }
        aliases.check_unique()?;
        entry.identity.body_mut().aliases = aliases;
        entry.last_modified_at = Utc::now();
        self.variants.refresh_identity(key, entry.identity.aliases());
        Ok(out)
    }

    /// Record where the per-identity object lives.
    pub fn set_location(
        &mut self,
        key: &IdentityKey,
        location: Option<ObjectLocation>,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        entry.location = location;
        Ok(())
    }

    /// Remove an identity. Only the explicit discard workflow calls this.
    pub(crate) fn discard(&mut self, key: &IdentityKey) -> Result<RegistryEntry, RegistryError> {
        self.ensure_unblocked()?;
        let entry = self
            .entries
            .shift_remove(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        self.variants.remove_identity(key);
        Ok(entry)
    }

    /// Check the key and alias-uniqueness invariants of every identity.
    pub fn verify(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (key, entry) in &self.entries {
            let derived = entry.identity.key();
            if &derived != key {
                violations.push(InvariantViolation::KeyMismatch {
                    key: key.clone(),
                    derived,
                });
            }
            if let Err(error) = entry.identity.aliases().check_unique() {
                violations.push(InvariantViolation::DuplicateVariant {
                    key: key.clone(),
                    error,
                });
            }
        }
        violations
    }

    /// Total number of alias terms across all identities.
    pub fn alias_count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.identity.aliases().len())
            .sum()
    }
}
