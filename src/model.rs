//! # Data Model
//!
//! Provenance-tagged terms, the alias set attached to each canonical identity,
//! and the closed set of identity kinds.

use crate::error::AliasError;
use crate::normalize::normalize_key;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The data source a value was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceId {
    /// The property-records feed.
    SourceA,
    /// The tabular owner feed.
    SourceB,
    /// Entered by an operator while resolving a conflict.
    Manual,
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::SourceA => write!(f, "source-a"),
            SourceId::SourceB => write!(f, "source-b"),
            SourceId::Manual => write!(f, "manual"),
        }
    }
}

/// A term value: text or a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermValue {
    Text(String),
    Number(i64),
}

impl TermValue {
    /// Normalized form used for every equality decision.
    pub fn normalized(&self) -> String {
        match self {
            TermValue::Text(text) => normalize_key(text),
            TermValue::Number(number) => number.to_string(),
        }
    }
}

impl fmt::Display for TermValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermValue::Text(text) => write!(f, "{}", text),
            TermValue::Number(number) => write!(f, "{}", number),
        }
    }
}

impl From<&str> for TermValue {
    fn from(value: &str) -> Self {
        TermValue::Text(value.to_string())
    }
}

impl From<String> for TermValue {
    fn from(value: String) -> Self {
        TermValue::Text(value)
    }
}

impl From<i64> for TermValue {
    fn from(value: i64) -> Self {
        TermValue::Number(value)
    }
}

/// Where in a source a value was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Occurrence {
    /// Row or record number in the source
    pub record_index: u64,
    /// Natural key of the source record (e.g. an account number)
    pub record_key: String,
    /// Logical field the value came from
    pub field_name: String,
}

impl Occurrence {
    pub fn new(record_index: u64, record_key: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            record_index,
            record_key: record_key.into(),
            field_name: field_name.into(),
        }
    }
}

/// The first sighting of a term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceId,
    pub occurrence: Occurrence,
}

impl Provenance {
    pub fn new(source: SourceId, occurrence: Occurrence) -> Self {
        Self { source, occurrence }
    }

    /// Provenance for a value typed in by an operator.
    pub fn manual(field_name: &str) -> Self {
        Self::new(SourceId::Manual, Occurrence::new(0, "manual", field_name))
    }
}

/// Outcome of folding another sighting into a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingMerge {
    /// New occurrences were recorded.
    Added(usize),
    /// Every occurrence was already known.
    AlreadyKnown,
    /// The normalized values differ; nothing was merged.
    ValueMismatch,
}

/// An immutable value plus every source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedTerm {
    value: TermValue,
    origin: Provenance,
    sources: BTreeMap<SourceId, Vec<Occurrence>>,
}

impl AttributedTerm {
    /// Create a term from its first sighting.
    pub fn new(value: impl Into<TermValue>, origin: Provenance) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(origin.source, vec![origin.occurrence.clone()]);
        Self {
            value: value.into(),
            origin,
            sources,
        }
    }

    /// Create a term typed in by an operator.
    pub fn manual(value: impl Into<TermValue>, field_name: &str) -> Self {
        Self::new(value, Provenance::manual(field_name))
    }

    pub fn value(&self) -> &TermValue {
        &self.value
    }

    pub fn origin(&self) -> &Provenance {
        &self.origin
    }

    pub fn sources(&self) -> &BTreeMap<SourceId, Vec<Occurrence>> {
        &self.sources
    }

    /// Normalized value (see [`normalize_key`]).
    pub fn normalized(&self) -> String {
        self.value.normalized()
    }

    /// Display form of the value.
    pub fn display(&self) -> String {
        self.value.to_string()
    }

    /// Number of recorded sightings across all sources.
    pub fn sighting_count(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    /// Record one more sighting of this exact value.
    pub fn add_occurrence(&mut self, source: SourceId, occurrence: Occurrence) -> bool {
        let seen = self.sources.entry(source).or_default();
        if seen.contains(&occurrence) {
            return false;
        }
        seen.push(occurrence);
        true
    }

    /// Fold the sightings of `other` into this term when both normalize equally.
    pub fn merge_sighting(&mut self, other: &AttributedTerm) -> SightingMerge {
        if self.normalized() != other.normalized() {
            return SightingMerge::ValueMismatch;
        }
        let mut added = 0;
        for (source, occurrences) in &other.sources {
            for occurrence in occurrences {
                if self.add_occurrence(*source, occurrence.clone()) {
                    added += 1;
                }
            }
        }
        if added == 0 {
            SightingMerge::AlreadyKnown
        } else {
            SightingMerge::Added(added)
        }
    }
}

/// Non-primary alias categories, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasCategory {
    /// Same-meaning spelling variants
    Homonyms,
    /// Equivalent alternate forms
    Synonyms,
    /// Unverified or low-confidence variants
    Candidates,
}

impl AliasCategory {
    pub const ALL: [AliasCategory; 3] = [
        AliasCategory::Homonyms,
        AliasCategory::Synonyms,
        AliasCategory::Candidates,
    ];
}

impl fmt::Display for AliasCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasCategory::Homonyms => write!(f, "homonyms"),
            AliasCategory::Synonyms => write!(f, "synonyms"),
            AliasCategory::Candidates => write!(f, "candidates"),
        }
    }
}

/// Position of a term inside an alias set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasSlot {
    Primary,
    Category(AliasCategory),
}

impl fmt::Display for AliasSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasSlot::Primary => write!(f, "primary"),
            AliasSlot::Category(category) => write!(f, "{}", category),
        }
    }
}

/// Wire shape of [`Aliases`]; uniqueness is checked when converting back.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AliasesRepr {
    primary: AttributedTerm,
    #[serde(default)]
    homonyms: Vec<AttributedTerm>,
    #[serde(default)]
    synonyms: Vec<AttributedTerm>,
    #[serde(default)]
    candidates: Vec<AttributedTerm>,
}

/// One primary term plus three ordered, append-only variant lists.
///
/// No normalized value appears twice across the primary and the three lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AliasesRepr", into = "AliasesRepr")]
pub struct Aliases {
    primary: AttributedTerm,
    homonyms: Vec<AttributedTerm>,
    synonyms: Vec<AttributedTerm>,
    candidates: Vec<AttributedTerm>,
}

impl TryFrom<AliasesRepr> for Aliases {
    type Error = AliasError;

    fn try_from(repr: AliasesRepr) -> Result<Self, Self::Error> {
        let mut aliases = Aliases::new(repr.primary);
        for (category, terms) in [
            (AliasCategory::Homonyms, repr.homonyms),
            (AliasCategory::Synonyms, repr.synonyms),
            (AliasCategory::Candidates, repr.candidates),
        ] {
            for term in terms {
                aliases.add(term, category)?;
            }
        }
        Ok(aliases)
    }
}

impl From<Aliases> for AliasesRepr {
    fn from(aliases: Aliases) -> Self {
        Self {
            primary: aliases.primary,
            homonyms: aliases.homonyms,
            synonyms: aliases.synonyms,
            candidates: aliases.candidates,
        }
    }
}

impl Aliases {
    /// Create an alias set with only a primary term.
    pub fn new(primary: AttributedTerm) -> Self {
        Self {
            primary,
            homonyms: Vec::new(),
            synonyms: Vec::new(),
            candidates: Vec::new(),
        }
    }

    pub fn primary(&self) -> &AttributedTerm {
        &self.primary
    }

    /// Terms of one category, in insertion order.
    pub fn category(&self, category: AliasCategory) -> &[AttributedTerm] {
        match category {
            AliasCategory::Homonyms => &self.homonyms,
            AliasCategory::Synonyms => &self.synonyms,
            AliasCategory::Candidates => &self.candidates,
        }
    }

    fn category_mut(&mut self, category: AliasCategory) -> &mut Vec<AttributedTerm> {
        match category {
            AliasCategory::Homonyms => &mut self.homonyms,
            AliasCategory::Synonyms => &mut self.synonyms,
            AliasCategory::Candidates => &mut self.candidates,
        }
    }

    /// Identity key derived from the primary term.
    pub fn key(&self) -> IdentityKey {
        IdentityKey::from_normalized(self.primary.normalized())
    }

    /// Every term with its slot: primary, then homonyms, synonyms, candidates.
    pub fn iter(&self) -> impl Iterator<Item = (AliasSlot, &AttributedTerm)> + '_ {
        std::iter::once((AliasSlot::Primary, &self.primary)).chain(
            AliasCategory::ALL.into_iter().flat_map(move |category| {
                self.category(category)
                    .iter()
                    .map(move |term| (AliasSlot::Category(category), term))
            }),
        )
    }

    /// Display values in search order: primary, homonyms, synonyms, candidates.
    pub fn all_values(&self) -> Vec<String> {
        self.iter().map(|(_, term)| term.display()).collect()
    }

    /// Normalized values in search order.
    pub fn normalized_values(&self) -> Vec<String> {
        self.iter().map(|(_, term)| term.normalized()).collect()
    }

    /// Total number of terms including the primary.
    pub fn len(&self) -> usize {
        1 + self.homonyms.len() + self.synonyms.len() + self.candidates.len()
    }

    /// An alias set always holds a primary.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Find where a value lives (compared after normalization).
    pub fn locate(&self, value: &str) -> Option<AliasSlot> {
        let normalized = normalize_key(value);
        self.locate_normalized(&normalized)
    }

    fn locate_normalized(&self, normalized: &str) -> Option<AliasSlot> {
        self.iter()
            .find(|(_, term)| term.normalized() == normalized)
            .map(|(slot, _)| slot)
    }

    /// Look up a term by value.
    pub fn get(&self, value: &str) -> Option<&AttributedTerm> {
        let normalized = normalize_key(value);
        self.iter()
            .find(|(_, term)| term.normalized() == normalized)
            .map(|(_, term)| term)
    }

    /// Append a term to a category.
    pub fn add(&mut self, term: AttributedTerm, category: AliasCategory) -> Result<(), AliasError> {
        if let Some(existing) = self.locate_normalized(&term.normalized()) {
            return Err(AliasError::DuplicateAlias {
                value: term.display(),
                existing,
            });
        }
        self.category_mut(category).push(term);
        Ok(())
    }

    /// Fold a repeated sighting into the matching term, if there is one.
    pub fn record_sighting(&mut self, sighting: &AttributedTerm) -> Option<SightingMerge> {
        let normalized = sighting.normalized();
        if self.primary.normalized() == normalized {
            return Some(self.primary.merge_sighting(sighting));
        }
        for category in AliasCategory::ALL {
            if let Some(term) = self
                .category_mut(category)
                .iter_mut()
                .find(|term| term.normalized() == normalized)
            {
                return Some(term.merge_sighting(sighting));
            }
        }
        None
    }

    /// Remove a non-primary term.
    pub fn remove(&mut self, value: &str) -> Result<AttributedTerm, AliasError> {
        match self.locate(value) {
            None => Err(AliasError::NotFound {
                value: value.to_string(),
            }),
            Some(AliasSlot::Primary) => Err(AliasError::PrimaryRemoval {
                value: value.to_string(),
            }),
            Some(AliasSlot::Category(category)) => self.take_from(category, value),
        }
    }

    fn take_from(&mut self, category: AliasCategory, value: &str) -> Result<AttributedTerm, AliasError> {
        let normalized = normalize_key(value);
        let terms = self.category_mut(category);
        let position = terms
            .iter()
            .position(|term| term.normalized() == normalized)
            .ok_or_else(|| AliasError::NotFound {
                value: value.to_string(),
            })?;
        Ok(terms.remove(position))
    }

    /// Move a term to another slot.
    ///
    /// Moving to `Primary` demotes the old primary into `demote_to`. Moving the
    /// current primary into a category is refused, since that would leave the
    /// set without a primary.
    pub fn promote(
        &mut self,
        value: &str,
        destination: AliasSlot,
        demote_to: AliasCategory,
    ) -> Result<(), AliasError> {
        let current = self.locate(value).ok_or_else(|| AliasError::NotFound {
            value: value.to_string(),
        })?;
        match (current, destination) {
            (AliasSlot::Primary, AliasSlot::Primary) => Ok(()),
            (AliasSlot::Primary, AliasSlot::Category(_)) => Err(AliasError::PrimaryDemotion {
                value: value.to_string(),
            }),
            (AliasSlot::Category(from), AliasSlot::Primary) => {
                let term = self.take_from(from, value)?;
                let old_primary = std::mem::replace(&mut self.primary, term);
                self.category_mut(demote_to).push(old_primary);
                Ok(())
            }
            (AliasSlot::Category(from), AliasSlot::Category(to)) => {
                if from != to {
                    let term = self.take_from(from, value)?;
                    self.category_mut(to).push(term);
                }
                Ok(())
            }
        }
    }

    /// Make `term` the primary, demoting the old primary into `demote_to`.
    ///
    /// If the value is already a variant, that term is promoted and the new
    /// sightings are merged into it. Returns the previous primary's value.
    pub fn set_primary(
        &mut self,
        term: AttributedTerm,
        demote_to: AliasCategory,
    ) -> Result<TermValue, AliasError> {
        let previous = self.primary.value().clone();
        let display = term.display();
        match self.locate_normalized(&term.normalized()) {
            Some(AliasSlot::Primary) => {
                self.primary.merge_sighting(&term);
            }
            Some(AliasSlot::Category(_)) => {
                self.promote(&display, AliasSlot::Primary, demote_to)?;
                self.primary.merge_sighting(&term);
            }
            None => {
                let old_primary = std::mem::replace(&mut self.primary, term);
                self.category_mut(demote_to).push(old_primary);
            }
        }
        Ok(previous)
    }

    /// Check that no normalized value repeats.
    pub fn check_unique(&self) -> Result<(), AliasError> {
        let mut seen: Vec<(String, AliasSlot)> = Vec::with_capacity(self.len());
        for (slot, term) in self.iter() {
            let normalized = term.normalized();
            if let Some((_, existing)) = seen.iter().find(|(value, _)| *value == normalized) {
                return Err(AliasError::DuplicateAlias {
                    value: term.display(),
                    existing: *existing,
                });
            }
            seen.push((normalized, slot));
        }
        Ok(())
    }
}

/// Normalized identity key: the normalized primary value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Derive a key from any raw value.
    pub fn new(value: &str) -> Self {
        Self(normalize_key(value))
    }

    pub(crate) fn from_normalized(normalized: String) -> Self {
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name components extracted by the name-parsing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NameComponents {
    pub first: Option<String>,
    pub last: Option<String>,
    #[serde(default)]
    pub other: Vec<String>,
}

/// Kind of real-world entity an identity stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Person,
    HouseholdAggregate,
    Organization,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKind::Person => write!(f, "person"),
            IdentityKind::HouseholdAggregate => write!(f, "household"),
            IdentityKind::Organization => write!(f, "organization"),
        }
    }
}

/// Shared payload of every identity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityBody {
    pub aliases: Aliases,
    #[serde(default)]
    pub components: Option<NameComponents>,
}

impl IdentityBody {
    pub fn new(aliases: Aliases) -> Self {
        Self {
            aliases,
            components: None,
        }
    }

    pub fn with_components(mut self, components: NameComponents) -> Self {
        self.components = Some(components);
        self
    }
}

/// One real-world person, household or organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Person(IdentityBody),
    HouseholdAggregate(IdentityBody),
    Organization(IdentityBody),
}

impl Identity {
    pub fn new(kind: IdentityKind, body: IdentityBody) -> Self {
        match kind {
            IdentityKind::Person => Identity::Person(body),
            IdentityKind::HouseholdAggregate => Identity::HouseholdAggregate(body),
            IdentityKind::Organization => Identity::Organization(body),
        }
    }

    /// Identity whose only alias is `primary`.
    pub fn from_primary(kind: IdentityKind, primary: AttributedTerm) -> Self {
        Self::new(kind, IdentityBody::new(Aliases::new(primary)))
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Identity::Person(_) => IdentityKind::Person,
            Identity::HouseholdAggregate(_) => IdentityKind::HouseholdAggregate,
            Identity::Organization(_) => IdentityKind::Organization,
        }
    }

    pub fn body(&self) -> &IdentityBody {
        match self {
            Identity::Person(body)
            | Identity::HouseholdAggregate(body)
            | Identity::Organization(body) => body,
        }
    }

    pub(crate) fn body_mut(&mut self) -> &mut IdentityBody {
        match self {
            Identity::Person(body)
            | Identity::HouseholdAggregate(body)
            | Identity::Organization(body) => body,
        }
    }

    pub fn aliases(&self) -> &Aliases {
        &self.body().aliases
    }

    /// Mutable access for identities not yet owned by a registry.
    pub fn aliases_mut(&mut self) -> &mut Aliases {
        &mut self.body_mut().aliases
    }

    pub fn components(&self) -> Option<&NameComponents> {
        self.body().components.as_ref()
    }

    /// Key derived from the current primary.
    pub fn key(&self) -> IdentityKey {
        self.aliases().key()
    }

    /// Primary display value.
    pub fn primary_value(&self) -> String {
        self.aliases().primary().display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(value: &str, source: SourceId, row: u64) -> AttributedTerm {
        AttributedTerm::new(
            value,
            Provenance::new(source, Occurrence::new(row, format!("acct-{row}"), "owner_name")),
        )
    }

    fn sample_aliases() -> Aliases {
        let mut aliases = Aliases::new(term("John Smith", SourceId::SourceA, 1));
        aliases
            .add(term("Jon Smith", SourceId::SourceA, 2), AliasCategory::Homonyms)
            .unwrap();
        aliases
            .add(term("Smith, John", SourceId::SourceB, 3), AliasCategory::Synonyms)
            .unwrap();
        aliases
            .add(term("J Smith", SourceId::SourceB, 4), AliasCategory::Candidates)
            .unwrap();
        aliases
    }

    #[test]
    fn test_add_rejects_normalized_duplicate() {
        let mut aliases = sample_aliases();
        let err = aliases
            .add(term("  jon   SMITH ", SourceId::SourceB, 9), AliasCategory::Candidates)
            .unwrap_err();
        assert_eq!(
            err,
            AliasError::DuplicateAlias {
                value: "  jon   SMITH ".to_string(),
                existing: AliasSlot::Category(AliasCategory::Homonyms),
            }
        );

        let err = aliases
            .add(term("JOHN SMITH", SourceId::SourceB, 9), AliasCategory::Homonyms)
            .unwrap_err();
        assert!(matches!(
            err,
            AliasError::DuplicateAlias {
                existing: AliasSlot::Primary,
                ..
            }
        ));
        assert_eq!(aliases.len(), 4);
    }

    #[test]
    fn test_all_values_order() {
        let aliases = sample_aliases();
        assert_eq!(
            aliases.all_values(),
            vec!["John Smith", "Jon Smith", "Smith, John", "J Smith"]
        );
    }

    #[test]
    fn test_promote_to_primary_demotes_old_primary() {
        let mut aliases = sample_aliases();
        aliases
            .promote("jon smith", AliasSlot::Primary, AliasCategory::Synonyms)
            .unwrap();
        assert_eq!(aliases.primary().display(), "Jon Smith");
        assert_eq!(aliases.key(), IdentityKey::new("JON SMITH"));
        assert!(aliases.category(AliasCategory::Homonyms).is_empty());
        assert_eq!(
            aliases.locate("John Smith"),
            Some(AliasSlot::Category(AliasCategory::Synonyms))
        );
        aliases.check_unique().unwrap();
    }

    #[test]
    fn test_promote_between_categories_and_errors() {
        let mut aliases = sample_aliases();
        aliases
            .promote(
                "J Smith",
                AliasSlot::Category(AliasCategory::Homonyms),
                AliasCategory::Candidates,
            )
            .unwrap();
        assert_eq!(aliases.category(AliasCategory::Homonyms).len(), 2);
        assert!(aliases.category(AliasCategory::Candidates).is_empty());

        let err = aliases
            .promote("Nobody", AliasSlot::Primary, AliasCategory::Candidates)
            .unwrap_err();
        assert!(matches!(err, AliasError::NotFound { .. }));

        let err = aliases
            .promote(
                "John Smith",
                AliasSlot::Category(AliasCategory::Candidates),
                AliasCategory::Candidates,
            )
            .unwrap_err();
        assert!(matches!(err, AliasError::PrimaryDemotion { .. }));
    }

    #[test]
    fn test_remove_refuses_primary() {
        let mut aliases = sample_aliases();
        let removed = aliases.remove("j smith").unwrap();
        assert_eq!(removed.display(), "J Smith");
        assert!(matches!(
            aliases.remove("John Smith"),
            Err(AliasError::PrimaryRemoval { .. })
        ));
        assert!(matches!(
            aliases.remove("J Smith"),
            Err(AliasError::NotFound { .. })
        ));
    }

    #[test]
    fn test_take_from_wrong_category_leaves_terms_alone() {
        let mut aliases = sample_aliases();
        assert!(matches!(
            aliases.take_from(AliasCategory::Homonyms, "J Smith"),
            Err(AliasError::NotFound { .. })
        ));
        aliases.remove("J Smith").unwrap();
        assert!(matches!(
            aliases.take_from(AliasCategory::Candidates, "J Smith"),
            Err(AliasError::NotFound { .. })
        ));
        assert_eq!(aliases.all_values(), vec!["John Smith", "Jon Smith", "Smith, John"]);
    }

    #[test]
    fn test_sighting_merges_provenance_without_duplicating() {
        let mut aliases = sample_aliases();
        let merge = aliases
            .record_sighting(&term("JON SMITH", SourceId::SourceB, 42))
            .unwrap();
        assert_eq!(merge, SightingMerge::Added(1));
        assert_eq!(aliases.len(), 4);

        let term = aliases.get("Jon Smith").unwrap();
        assert_eq!(term.display(), "Jon Smith");
        assert_eq!(term.sighting_count(), 2);
        assert!(term.sources().contains_key(&SourceId::SourceB));

        let again = aliases
            .record_sighting(&self::term("Jon Smith", SourceId::SourceB, 42))
            .unwrap();
        assert_eq!(again, SightingMerge::AlreadyKnown);
        assert!(aliases
            .record_sighting(&self::term("Mary Jones", SourceId::SourceB, 1))
            .is_none());
    }

    #[test]
    fn test_merge_sighting_value_mismatch() {
        let mut left = term("Acme", SourceId::SourceA, 1);
        let right = term("Acme Inc", SourceId::SourceB, 1);
        assert_eq!(left.merge_sighting(&right), SightingMerge::ValueMismatch);
        assert_eq!(left.sighting_count(), 1);
    }

    #[test]
    fn test_set_primary_with_manual_value() {
        let mut aliases = sample_aliases();
        let previous = aliases
            .set_primary(AttributedTerm::manual("John Q Smith", "owner_name"), AliasCategory::Candidates)
            .unwrap();
        assert_eq!(previous, TermValue::from("John Smith"));
        assert_eq!(aliases.primary().origin().source, SourceId::Manual);
        assert_eq!(
            aliases.locate("John Smith"),
            Some(AliasSlot::Category(AliasCategory::Candidates))
        );
        aliases.check_unique().unwrap();
    }

    #[test]
    fn test_identity_serde_roundtrip_preserves_order() {
        let identity = Identity::new(
            IdentityKind::HouseholdAggregate,
            IdentityBody::new(sample_aliases()).with_components(NameComponents {
                first: Some("John".to_string()),
                last: Some("Smith".to_string()),
                other: vec![],
            }),
        );
        let json = serde_json::to_string(&identity).unwrap();
        assert!(json.contains("\"kind\":\"household_aggregate\""));
        let decoded: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, identity);
        assert_eq!(decoded.key(), identity.key());
        assert_eq!(decoded.aliases().all_values(), identity.aliases().all_values());
    }

    #[test]
    fn test_deserialize_rejects_duplicate_variants() {
        let primary = term("Acme", SourceId::SourceA, 1);
        let dup = term("ACME", SourceId::SourceB, 2);
        let json = serde_json::json!({
            "primary": primary,
            "homonyms": [dup],
        });
        assert!(serde_json::from_value::<Aliases>(json).is_err());
    }

    #[test]
    fn test_numeric_term_value() {
        let value = TermValue::from(42);
        assert_eq!(value.normalized(), "42");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "42");
        let text: TermValue = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(text, TermValue::Text("42".to_string()));
        assert_eq!(text.normalized(), value.normalized());
    }
}
