//! # Alias Mutation Workflows
//!
//! Operator-level changes to the registry: moving, splitting and promoting
//! aliases, resolving duplicate keys, applying review decisions, and the
//! explicit discard of an identity. Each workflow locks the keys it touches,
//! mutates the registry, then writes every touched identity through to the
//! remote views.
//!
//! Human decisions come through [`Disambiguator`]. A `None` answer means no
//! response, and the workflow stops with [`WorkflowError::NoResponse`].

use crate::context::RegistryContext;
use crate::error::{AliasError, RegistryError, WorkflowError, WriteThroughError};
use crate::model::{
    AliasCategory, AliasSlot, AttributedTerm, Identity, IdentityBody, IdentityKey, IdentityKind, Aliases,
    NameComponents,
};
use crate::registry::{PrimaryChange, Registry};
use crate::similarity::{suggest_homes, HomeSuggestion};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Field name recorded on values typed in by an operator.
const MANUAL_FIELD: &str = "operator_primary";

/// A new identity whose key is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateConflict {
    pub key: IdentityKey,
    pub existing: Identity,
    pub incoming: Identity,
}

/// Answer to a duplicate-key conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateResolution {
    /// Give the incoming identity an operator-typed primary
    ManualPrimary(String),
    /// Promote one of the incoming identity's own variants to primary
    PromoteVariant(String),
    /// Drop the incoming identity
    Abandon,
}

/// A near match waiting for a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub term: AttributedTerm,
    pub kind: IdentityKind,
    pub components: Option<NameComponents>,
    /// Best-scoring existing identity
    pub candidate: IdentityKey,
    pub matched_value: String,
    pub score: f64,
}

impl ReviewItem {
    /// The identity that would be created if the reviewer rejects the match.
    pub fn as_new_identity(&self) -> Identity {
        let mut body = IdentityBody::new(Aliases::new(self.term.clone()));
        body.components = self.components.clone();
        Identity::new(self.kind, body)
    }
}

/// Answer to a review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Attach the value to the candidate's `candidates`
    Accept,
    /// Create a separate identity
    CreateNew,
    Skip,
}

/// Human-in-the-loop decision source.
#[async_trait]
pub trait Disambiguator: Send + Sync {
    async fn resolve_duplicate(&self, conflict: &DuplicateConflict) -> Option<DuplicateResolution>;

    async fn review(&self, item: &ReviewItem) -> Option<ReviewDecision>;
}

/// Disambiguator answering from pre-loaded queues; an empty queue is no response.
#[derive(Debug, Default)]
pub struct ScriptedDisambiguator {
    duplicates: Mutex<VecDeque<DuplicateResolution>>,
    reviews: Mutex<VecDeque<ReviewDecision>>,
    conflicts_seen: Mutex<Vec<DuplicateConflict>>,
}

impl ScriptedDisambiguator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duplicate(self, resolution: DuplicateResolution) -> Self {
        self.duplicates.lock().push_back(resolution);
        self
    }

    pub fn with_review(self, decision: ReviewDecision) -> Self {
        self.reviews.lock().push_back(decision);
        self
    }

    /// Conflicts presented so far.
    pub fn conflicts_seen(&self) -> Vec<DuplicateConflict> {
        self.conflicts_seen.lock().clone()
    }
}

#[async_trait]
impl Disambiguator for ScriptedDisambiguator {
    async fn resolve_duplicate(&self, conflict: &DuplicateConflict) -> Option<DuplicateResolution> {
        self.conflicts_seen.lock().push(conflict.clone());
        self.duplicates.lock().pop_front()
    }

    async fn review(&self, _item: &ReviewItem) -> Option<ReviewDecision> {
        self.reviews.lock().pop_front()
    }
}

/// Result of adding an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(IdentityKey),
    /// The conflict was resolved by dropping the incoming identity
    Abandoned(IdentityKey),
}

fn unsynced(failures: Vec<WriteThroughError>) -> Result<(), WorkflowError> {
    if failures.is_empty() {
        return Ok(());
    }
    Err(WorkflowError::Unsynced {
        keys: failures.iter().map(|err| err.key.clone()).collect(),
        failures,
    })
}

/// Identities changed by a registration, new identity first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub outcome: AddOutcome,
    pub touched: Vec<IdentityKey>,
}

/// Add a new identity and write it through, running duplicate-key
/// resolution on a key collision.
pub async fn add_identity(
    ctx: &RegistryContext,
    identity: Identity,
    disambiguator: &dyn Disambiguator,
) -> Result<AddOutcome, WorkflowError> {
    let registration = register_identity(ctx, identity, disambiguator).await?;
    ctx.persist_all(&registration.touched).await?;
    Ok(registration.outcome)
}

/// Registry half of [`add_identity`]; the caller writes `touched` through.
pub async fn register_identity(
    ctx: &RegistryContext,
    identity: Identity,
    disambiguator: &dyn Disambiguator,
) -> Result<Registration, WorkflowError> {
    let key = identity.key();
    let guards = ctx.lock_keys(std::slice::from_ref(&key)).await;
    let added = ctx.registry_mut().add(identity.clone());
    match added {
        Ok(key) => Ok(Registration {
            outcome: AddOutcome::Added(key.clone()),
            touched: vec![key],
        }),
        Err(RegistryError::DuplicateKey { key }) => {
            drop(guards);
            warn!(key = %key, "duplicate identity key; registry frozen until resolved");
            resolve_in_registry(ctx, identity, disambiguator).await
        }
        Err(err) => Err(err.into()),
    }
}

/// Remove non-primary variants of `incoming` already owned by other identities.
///
/// Their sightings are returned with the owning key so they can be folded
/// into the owner instead of being lost.
fn detach_owned_variants(registry: &Registry, incoming: &mut Identity) -> Vec<(IdentityKey, AttributedTerm)> {
    let owned: Vec<(IdentityKey, String)> = incoming
        .aliases()
        .iter()
        .filter(|(slot, _)| *slot != AliasSlot::Primary)
        .filter_map(|(_, term)| {
            registry
                .lookup_by_variant(&term.display())
                .map(|owner| (owner.clone(), term.display()))
        })
        .collect();
    let mut detached = Vec::new();
    for (owner, value) in owned {
        if let Ok(term) = incoming.aliases_mut().remove(&value) {
            detached.push((owner, term));
        }
    }
    detached
}

enum ResolutionStep {
    Added(IdentityKey, Vec<IdentityKey>),
    StillDuplicate,
}

/// Identity already holding `incoming`'s primary, as a key or as a variant.
fn primary_holder(registry: &Registry, incoming: &Identity) -> Option<Identity> {
    let key = incoming.key();
    let holder = registry.lookup_by_key(&key).map(|entry| &entry.identity).or_else(|| {
        let primary = incoming.aliases().primary().display();
        registry
            .variant_cache()
            .owners(&primary)
            .first()
            .and_then(|owner| registry.lookup_by_key(owner))
            .map(|entry| &entry.identity)
    });
    holder.cloned()
}

fn try_add_resolved(registry: &mut Registry, mut incoming: Identity) -> Result<ResolutionStep, WorkflowError> {
    let primary = incoming.aliases().primary().display();
    if !registry.variant_cache().owners(&primary).is_empty() {
        return Ok(ResolutionStep::StillDuplicate);
    }
    let detached = detach_owned_variants(registry, &mut incoming);
    registry.clear_pending();
    let key = match registry.add(incoming) {
        Ok(key) => key,
        Err(RegistryError::DuplicateKey { .. }) => return Ok(ResolutionStep::StillDuplicate),
        Err(err) => return Err(err.into()),
    };
    let mut owners = Vec::new();
    for (owner, term) in detached {
        registry.update_aliases(&owner, |aliases| Ok(aliases.record_sighting(&term)))?;
        if !owners.contains(&owner) {
            owners.push(owner);
        }
    }
    Ok(ResolutionStep::Added(key, owners))
}

/// Resolve a duplicate key for `incoming` through the disambiguator and
/// write the result through.
///
/// Loops until the incoming identity is added under a free key or abandoned.
/// No response leaves the registry frozen and returns `NoResponse`.
pub async fn resolve_duplicate_key(
    ctx: &RegistryContext,
    incoming: Identity,
    disambiguator: &dyn Disambiguator,
) -> Result<AddOutcome, WorkflowError> {
    let registration = resolve_in_registry(ctx, incoming, disambiguator).await?;
    ctx.persist_all(&registration.touched).await?;
    Ok(registration.outcome)
}

async fn resolve_in_registry(
    ctx: &RegistryContext,
    mut incoming: Identity,
    disambiguator: &dyn Disambiguator,
) -> Result<Registration, WorkflowError> {
    loop {
        let key = incoming.key();
        let existing = primary_holder(&ctx.registry(), &incoming);
        let Some(existing) = existing else {
            let _guards = ctx.lock_keys(std::slice::from_ref(&key)).await;
            let step = try_add_resolved(&mut ctx.registry_mut(), incoming.clone())?;
            if let ResolutionStep::Added(added, owners) = step {
                return Ok(resolved(added, owners));
            }
            continue;
        };

        let conflict = DuplicateConflict {
            key: key.clone(),
            existing,
            incoming: incoming.clone(),
        };
        let Some(resolution) = disambiguator.resolve_duplicate(&conflict).await else {
            warn!(key = %key, "duplicate key left unresolved");
            return Err(WorkflowError::NoResponse { key });
        };

        match resolution {
            DuplicateResolution::Abandon => {
                ctx.registry_mut().clear_pending();
                warn!(key = %key, variants = incoming.aliases().len(), "incoming identity abandoned");
                return Ok(Registration {
                    outcome: AddOutcome::Abandoned(key),
                    touched: Vec::new(),
                });
            }
            DuplicateResolution::ManualPrimary(value) => {
                incoming
                    .aliases_mut()
                    .set_primary(AttributedTerm::manual(value.as_str(), MANUAL_FIELD), AliasCategory::Candidates)?;
            }
            DuplicateResolution::PromoteVariant(value) => {
                incoming
                    .aliases_mut()
                    .promote(&value, AliasSlot::Primary, AliasCategory::Candidates)?;
            }
        }

        let new_key = incoming.key();
        let _guards = ctx.lock_keys(&[key.clone(), new_key.clone()]).await;
        let step = try_add_resolved(&mut ctx.registry_mut(), incoming.clone())?;
        match step {
            ResolutionStep::Added(added, owners) => {
                info!(old = %key, new = %added, "duplicate key resolved");
                return Ok(resolved(added, owners));
            }
            ResolutionStep::StillDuplicate => {
                warn!(key = %new_key, "resolved primary is already held by another identity");
            }
        }
    }
}

fn resolved(added: IdentityKey, owners: Vec<IdentityKey>) -> Registration {
    let mut touched = vec![added.clone()];
    touched.extend(owners);
    Registration {
        outcome: AddOutcome::Added(added),
        touched,
    }
}

/// Where a moved alias goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveDestination {
    /// Append to an existing identity's `candidates`
    Existing(IdentityKey),
    /// Spin off a new identity with the alias as primary
    NewIdentity(IdentityKind),
}

/// Result of a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOutcome {
    pub source: IdentityKey,
    pub destination: IdentityKey,
    pub created: bool,
}

fn move_in_registry(
    registry: &mut Registry,
    source: &IdentityKey,
    value: &str,
    destination: &MoveDestination,
    destination_key: &IdentityKey,
) -> Result<MoveOutcome, WorkflowError> {
    let slot = registry
        .get(source)?
        .identity
        .aliases()
        .locate(value)
        .ok_or_else(|| AliasError::NotFound {
            value: value.to_string(),
        })?;
    let AliasSlot::Category(from) = slot else {
        return Err(AliasError::PrimaryRemoval {
            value: value.to_string(),
        }
        .into());
    };
    if destination_key == source {
        return Err(WorkflowError::AlreadyPresent {
            value: value.to_string(),
            identity: source.clone(),
        });
    }

    match destination {
        MoveDestination::Existing(target) => {
            if registry.get(target)?.identity.aliases().locate(value).is_some() {
                warn!(value, identity = %target, "destination already holds the variant; move refused");
                return Err(WorkflowError::AlreadyPresent {
                    value: value.to_string(),
                    identity: target.clone(),
                });
            }
            let term = registry.update_aliases(source, |aliases| aliases.remove(value))?;
            let added = registry.update_aliases(target, |aliases| aliases.add(term.clone(), AliasCategory::Candidates));
            if let Err(err) = added {
                registry.update_aliases(source, |aliases| aliases.add(term, from))?;
                return Err(err.into());
            }
            Ok(MoveOutcome {
                source: source.clone(),
                destination: target.clone(),
                created: false,
            })
        }
        MoveDestination::NewIdentity(kind) => {
            if registry.contains(destination_key) {
                return Err(WorkflowError::AlreadyPresent {
                    value: value.to_string(),
                    identity: destination_key.clone(),
                });
            }
            let term = registry.update_aliases(source, |aliases| aliases.remove(value))?;
            match registry.add(Identity::from_primary(*kind, term.clone())) {
                Ok(key) => Ok(MoveOutcome {
                    source: source.clone(),
                    destination: key,
                    created: true,
                }),
                Err(err) => {
                    registry.update_aliases(source, |aliases| aliases.add(term, from))?;
                    Err(err.into())
                }
            }
        }
    }
}

/// Move a variant out of `source` into another identity.
///
/// Both sides are written through; a write failure leaves the registry
/// changed and returns `Unsynced` for reconciliation to pick up.
pub async fn move_alias(
    ctx: &RegistryContext,
    source: &IdentityKey,
    value: &str,
    destination: MoveDestination,
) -> Result<MoveOutcome, WorkflowError> {
    let destination_key = match &destination {
        MoveDestination::Existing(key) => key.clone(),
        MoveDestination::NewIdentity(_) => IdentityKey::new(value),
    };
    let _guards = ctx
        .lock_keys(&[source.clone(), destination_key.clone()])
        .await;
    let outcome = move_in_registry(&mut ctx.registry_mut(), source, value, &destination, &destination_key)?;
    info!(
        value,
        source = %outcome.source,
        destination = %outcome.destination,
        created = outcome.created,
        "alias moved"
    );
    ctx.persist_all(&[outcome.source.clone(), outcome.destination.clone()])
        .await?;
    Ok(outcome)
}

/// Split a variant off into a brand-new identity.
pub async fn split_alias(
    ctx: &RegistryContext,
    source: &IdentityKey,
    value: &str,
    kind: IdentityKind,
) -> Result<MoveOutcome, WorkflowError> {
    move_alias(ctx, source, value, MoveDestination::NewIdentity(kind)).await
}

/// Promote a variant to primary, re-keying the identity across all views.
pub async fn promote_alias(
    ctx: &RegistryContext,
    key: &IdentityKey,
    value: &str,
    demote_to: AliasCategory,
) -> Result<PrimaryChange, WorkflowError> {
    let new_key = IdentityKey::new(value);
    let _guards = ctx.lock_keys(&[key.clone(), new_key]).await;
    let change = {
        let mut registry = ctx.registry_mut();
        let term = registry
            .get(key)?
            .identity
            .aliases()
            .get(value)
            .cloned()
            .ok_or_else(|| AliasError::NotFound {
                value: value.to_string(),
            })?;
        registry.change_primary(key, term, demote_to)?
    };

    let mut failures = Vec::new();
    if let Err(err) = ctx.persist(&change.new_key).await {
        failures.push(err);
    }
    if change.key_changed() {
        info!(old = %change.old_key, new = %change.new_key, "identity re-keyed");
        if let Err(err) = ctx
            .retire(&change.old_key, change.retired_location.clone())
            .await
        {
            failures.push(err);
        }
    }
    unsynced(failures)?;
    Ok(change)
}

/// Explicitly remove an identity from the registry and the remote views.
pub async fn discard_identity(
    ctx: &RegistryContext,
    key: &IdentityKey,
    reason: &str,
) -> Result<Identity, WorkflowError> {
    let _guards = ctx.lock_keys(std::slice::from_ref(key)).await;
    let entry = ctx.registry_mut().discard(key)?;
    warn!(
        key = %key,
        reason,
        variants = ?entry.identity.aliases().all_values(),
        "identity discarded"
    );
    let retired = ctx.retire(key, entry.location.clone()).await;
    unsynced(retired.err().into_iter().collect())?;
    Ok(entry.identity)
}

/// Best new homes for a variant of `source`, with the category that matched.
pub fn suggest_alias_homes(ctx: &RegistryContext, source: &IdentityKey, value: &str) -> Vec<HomeSuggestion> {
    suggest_homes(
        &ctx.registry(),
        value,
        std::slice::from_ref(source),
        ctx.suggestion_limit(),
    )
}

/// Result of a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Accepted(IdentityKey),
    Created(AddOutcome),
    Skipped,
}

/// Ask the disambiguator about a near match and apply the answer.
pub async fn apply_review(
    ctx: &RegistryContext,
    item: &ReviewItem,
    disambiguator: &dyn Disambiguator,
) -> Result<ReviewOutcome, WorkflowError> {
    let Some(decision) = disambiguator.review(item).await else {
        return Err(WorkflowError::NoResponse {
            key: item.candidate.clone(),
        });
    };
    match decision {
        ReviewDecision::Skip => {
            info!(candidate = %item.candidate, value = %item.term.display(), "review skipped");
            Ok(ReviewOutcome::Skipped)
        }
        ReviewDecision::CreateNew => {
            let outcome = add_identity(ctx, item.as_new_identity(), disambiguator).await?;
            Ok(ReviewOutcome::Created(outcome))
        }
        ReviewDecision::Accept => {
            let _guards = ctx.lock_keys(std::slice::from_ref(&item.candidate)).await;
            let accepted = accept_in_registry(&mut ctx.registry_mut(), item);
            accepted?;
            ctx.persist_all(std::slice::from_ref(&item.candidate)).await?;
            Ok(ReviewOutcome::Accepted(item.candidate.clone()))
        }
    }
}

fn accept_in_registry(registry: &mut Registry, item: &ReviewItem) -> Result<(), WorkflowError> {
    let value = item.term.display();
    if let Some(owner) = registry.lookup_by_variant(&value) {
        warn!(value = %value, identity = %owner, "reviewed variant is already owned");
        return Err(WorkflowError::AlreadyPresent {
            value,
            identity: owner.clone(),
        });
    }
    registry.update_aliases(&item.candidate, |aliases| {
        aliases.add(item.term.clone(), AliasCategory::Candidates)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_disambiguator_runs_dry() {
        let scripted = ScriptedDisambiguator::new()
            .with_duplicate(DuplicateResolution::Abandon)
            .with_review(ReviewDecision::Skip);
        let identity = Identity::from_primary(IdentityKind::Person, AttributedTerm::manual("A B", "name"));
        let conflict = DuplicateConflict {
            key: identity.key(),
            existing: identity.clone(),
            incoming: identity,
        };
        assert_eq!(
            scripted.resolve_duplicate(&conflict).await,
            Some(DuplicateResolution::Abandon)
        );
        assert_eq!(scripted.resolve_duplicate(&conflict).await, None);
        assert_eq!(scripted.conflicts_seen().len(), 2);
    }

    #[test]
    fn test_detach_owned_variants_keeps_primary() {
        let mut registry = Registry::new();
        let owner = registry
            .add(Identity::from_primary(
                IdentityKind::Person,
                AttributedTerm::manual("Jon Smith", "name"),
            ))
            .unwrap();
        let mut incoming = Identity::from_primary(IdentityKind::Person, AttributedTerm::manual("John Smith", "name"));
        incoming
            .aliases_mut()
            .add(AttributedTerm::manual("JON SMITH", "name"), AliasCategory::Homonyms)
            .unwrap();

        let detached = detach_owned_variants(&registry, &mut incoming);
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].0, owner);
        assert_eq!(incoming.aliases().len(), 1);
        assert_eq!(incoming.primary_value(), "John Smith");
    }

    #[test]
    fn test_move_in_registry_rejects_primary() {
        let mut registry = Registry::new();
        let key = registry
            .add(Identity::from_primary(
                IdentityKind::Person,
                AttributedTerm::manual("Ann Lee", "name"),
            ))
            .unwrap();
        let err = move_in_registry(
            &mut registry,
            &key,
            "ann lee",
            &MoveDestination::NewIdentity(IdentityKind::Person),
            &IdentityKey::new("ann lee"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Registry(RegistryError::Alias(AliasError::PrimaryRemoval { .. }))
        ));
    }
}
