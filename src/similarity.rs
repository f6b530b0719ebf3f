//! # Similarity Module
//!
//! Token-overlap name scoring with clear/near/no-viable tiers, a full-scan
//! best-match search, and edit-distance suggestions for relocating an alias.

use crate::model::{AliasCategory, AliasSlot, IdentityKey};
use crate::normalize::{normalize_for_similarity, significant_tokens};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};

/// Score at or above which a name pair is a clear match.
pub const CLEAR_MATCH_THRESHOLD: f64 = 0.85;
/// Score at or above which a name pair needs human review.
pub const NEAR_MATCH_THRESHOLD: f64 = 0.5;
/// Tokens shorter than this are ignored.
pub const MIN_TOKEN_LEN: usize = 3;

/// Classification of a similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Auto-acceptable
    Clear,
    /// Needs review; never auto-applied
    Near,
    NoViable,
}

/// Score plus tier for one name pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NameScore {
    pub score: f64,
    pub tier: MatchTier,
}

/// Thresholds and tokenization used by the similarity stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityPolicy {
    pub clear_threshold: f64,
    pub near_threshold: f64,
    pub min_token_len: usize,
}

impl Default for SimilarityPolicy {
    fn default() -> Self {
        Self {
            clear_threshold: CLEAR_MATCH_THRESHOLD,
            near_threshold: NEAR_MATCH_THRESHOLD,
            min_token_len: MIN_TOKEN_LEN,
        }
    }
}

impl SimilarityPolicy {
    /// Map a score onto a tier. Both boundaries are inclusive.
    pub fn classify(&self, score: f64) -> MatchTier {
        if score >= self.clear_threshold {
            MatchTier::Clear
        } else if score >= self.near_threshold {
            MatchTier::Near
        } else {
            MatchTier::NoViable
        }
    }

    pub fn compare(&self, source: &str, target: &str) -> NameScore {
        let score = token_overlap(source, target, self.min_token_len);
        NameScore {
            score,
            tier: self.classify(score),
        }
    }

    /// Best-scoring candidate over the whole set.
    ///
    /// Every candidate is scored; a later candidate only wins with a strictly
    /// higher score, so ties go to the first one seen.
    pub fn best_match<'a, T>(
        &self,
        name: &str,
        candidates: impl IntoIterator<Item = (T, &'a str)>,
    ) -> Option<ScoredCandidate<T>> {
        let mut best: Option<ScoredCandidate<T>> = None;
        for (candidate, value) in candidates {
            let score = token_overlap(name, value, self.min_token_len);
            let better = match &best {
                Some(current) => score > current.score.score,
                None => true,
            };
            if better {
                best = Some(ScoredCandidate {
                    candidate,
                    matched_value: value.to_string(),
                    score: NameScore {
                        score,
                        tier: self.classify(score),
                    },
                });
            }
        }
        best
    }

    /// Best identity for a name, comparing against every variant of every identity.
    pub fn best_identity(&self, registry: &Registry, name: &str) -> Option<ScoredCandidate<IdentityKey>> {
        let values: Vec<(IdentityKey, String)> = registry
            .iter()
            .flat_map(|(key, entry)| {
                entry
                    .identity
                    .aliases()
                    .all_values()
                    .into_iter()
                    .map(move |value| (key.clone(), value))
            })
            .collect();
        self.best_match(
            name,
            values.iter().map(|(key, value)| (key.clone(), value.as_str())),
        )
    }
}

/// Winner of a best-match search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate<T> {
    pub candidate: T,
    pub matched_value: String,
    pub score: NameScore,
}

/// Fraction of significant tokens shared by two names.
///
/// `|shared| / max(|source|, |target|)`; zero when either side has no
/// significant tokens.
pub fn token_overlap(source: &str, target: &str, min_token_len: usize) -> f64 {
    let source_tokens = significant_tokens(source, min_token_len);
    let target_tokens = significant_tokens(target, min_token_len);
    let denominator = source_tokens.len().max(target_tokens.len());
    if source_tokens.is_empty() || target_tokens.is_empty() {
        return 0.0;
    }
    let shared = source_tokens
        .iter()
        .filter(|token| target_tokens.contains(token))
        .count();
    shared as f64 / denominator as f64
}

/// Compare two names with the default thresholds.
pub fn compare_names(source: &str, target: &str) -> NameScore {
    SimilarityPolicy::default().compare(source, target)
}

/// Character-level similarity in `[0, 1]` after similarity normalization.
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize_for_similarity(a), &normalize_for_similarity(b))
}

/// Candidate destination for an alias being moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeSuggestion {
    pub key: IdentityKey,
    /// Category whose best variant produced the score
    pub slot: AliasSlot,
    pub matched_value: String,
    pub score: f64,
}

const SUGGESTION_SLOTS: [AliasSlot; 3] = [
    AliasSlot::Primary,
    AliasSlot::Category(AliasCategory::Homonyms),
    AliasSlot::Category(AliasCategory::Candidates),
];

/// Rank identities as new homes for `value`, best first.
///
/// Each identity is scored per category (primary, homonyms, candidates) and
/// keeps its best category. Identities listed in `exclude` are skipped.
pub fn suggest_homes(
    registry: &Registry,
    value: &str,
    exclude: &[IdentityKey],
    limit: usize,
) -> Vec<HomeSuggestion> {
    let mut suggestions = Vec::new();
    for (key, entry) in registry.iter() {
        if exclude.contains(key) {
            continue;
        }
        let aliases = entry.identity.aliases();
        let mut best: Option<HomeSuggestion> = None;
        for slot in SUGGESTION_SLOTS {
            let terms: Vec<_> = match slot {
                AliasSlot::Primary => vec![aliases.primary()],
                AliasSlot::Category(category) => aliases.category(category).iter().collect(),
            };
            for term in terms {
                let candidate = term.display();
                let score = edit_similarity(value, &candidate);
                if best.as_ref().map_or(true, |current| score > current.score) {
                    best = Some(HomeSuggestion {
                        key: key.clone(),
                        slot,
                        matched_value: candidate,
                        score,
                    });
                }
            }
        }
        suggestions.extend(best);
    }
    suggestions.sort_by(|a, b| b.score.total_cmp(&a.score));
    suggestions.truncate(limit);
    suggestions
}
