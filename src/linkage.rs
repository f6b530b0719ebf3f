//! # Linkage Module
//!
//! Record linkage between two source feeds, in three stages:
//!
//! - **Exact**: natural-key index over the target records
//! - **Similarity**: token-overlap name scoring for records with no natural-key hit
//! - **Address**: placeholder stage; everything reaching it is reported as not handled
//!
//! Outcomes are merged into auto-apply, needs-review and unhandled buckets,
//! each decision keeping the stage and rule that produced it.

use crate::error::ParseError;
use crate::normalize::normalize_key;
use crate::similarity::{MatchTier, SimilarityPolicy};
use crate::source::{NameExtractor, SourceRecord};
use hashbrown::HashMap;
use serde::Serialize;
use tracing::{debug, info, instrument};

/// Reference to a target record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetRef {
    pub index: usize,
    pub record_key: String,
}

impl TargetRef {
    fn of(targets: &[SourceRecord], index: usize) -> Self {
        Self {
            index,
            record_key: targets[index].record_key.clone(),
        }
    }
}

/// Outcome of the exact stage for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExactOutcome {
    NoMatch,
    Direct { target: usize },
    /// Two or more targets share the key; owner clustering is required.
    Ambiguous {
        targets: Vec<usize>,
        requires_clustering: bool,
    },
}

/// Natural key to target-record index.
#[derive(Debug, Clone, Default)]
pub struct ExactKeyIndex {
    by_key: HashMap<String, Vec<usize>>,
}

impl ExactKeyIndex {
    pub fn build(targets: &[SourceRecord]) -> Self {
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, record) in targets.iter().enumerate() {
            if let Some(key) = record.natural_key.as_deref().map(normalize_key) {
                if !key.is_empty() {
                    by_key.entry(key).or_default().push(index);
                }
            }
        }
        Self { by_key }
    }

    pub fn lookup(&self, natural_key: Option<&str>) -> ExactOutcome {
        let Some(key) = natural_key.map(normalize_key) else {
            return ExactOutcome::NoMatch;
        };
        match self.by_key.get(key.as_str()).map(Vec::as_slice) {
            None | Some([]) => ExactOutcome::NoMatch,
            Some([target]) => ExactOutcome::Direct { target: *target },
            Some(targets) => ExactOutcome::Ambiguous {
                targets: targets.to_vec(),
                requires_clustering: true,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Pipeline stage that classified a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Exact,
    Similarity,
    Address,
}

/// Rule inside a stage that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NaturalKeyUnique,
    NaturalKeyShared,
    TokenOverlapClear,
    TokenOverlapNear,
    AddressNotImplemented,
    UnparseableName,
}

/// Final classification of one source record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    DirectMatch {
        target: TargetRef,
    },
    AmbiguousMatch {
        targets: Vec<TargetRef>,
        requires_clustering: bool,
    },
    ClearMatch {
        target: TargetRef,
        score: f64,
    },
    NearMatch {
        target: TargetRef,
        score: f64,
    },
    AddressMatchingNotImplemented,
    Skipped {
        reason: crate::error::ParseReason,
    },
}

/// One audited decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkDecision {
    pub source_index: usize,
    pub record_key: String,
    pub stage: Stage,
    pub rule: Rule,
    pub classification: Classification,
}

/// Bucketed result of a linkage run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkageReport {
    pub auto_apply: Vec<LinkDecision>,
    pub needs_review: Vec<LinkDecision>,
    /// Records that reached the address stage or could not be parsed
    pub unhandled: Vec<LinkDecision>,
}

impl LinkageReport {
    pub fn total(&self) -> usize {
        self.auto_apply.len() + self.needs_review.len() + self.unhandled.len()
    }

    /// Every decision, ordered by source index.
    pub fn decisions(&self) -> Vec<&LinkDecision> {
        let mut all: Vec<&LinkDecision> = self
            .auto_apply
            .iter()
            .chain(&self.needs_review)
            .chain(&self.unhandled)
            .collect();
        all.sort_by_key(|decision| decision.source_index);
        all
    }

    pub fn decision_for(&self, source_index: usize) -> Option<&LinkDecision> {
        self.auto_apply
            .iter()
            .chain(&self.needs_review)
            .chain(&self.unhandled)
            .find(|decision| decision.source_index == source_index)
    }
}

/// Address stage. Not implemented: every record is reported as such.
pub fn match_address(_record: &SourceRecord) -> (Rule, Classification) {
    (
        Rule::AddressNotImplemented,
        Classification::AddressMatchingNotImplemented,
    )
}

/// Three-stage linkage of source records against target records.
pub struct LinkagePipeline<'a> {
    extractor: &'a dyn NameExtractor,
    policy: SimilarityPolicy,
}

impl<'a> LinkagePipeline<'a> {
    pub fn new(extractor: &'a dyn NameExtractor, policy: SimilarityPolicy) -> Self {
        Self { extractor, policy }
    }

    #[instrument(skip_all, fields(sources = sources.len(), targets = targets.len()))]
    pub fn run(&self, sources: &[SourceRecord], targets: &[SourceRecord]) -> LinkageReport {
        let mut report = LinkageReport::default();
        let index = ExactKeyIndex::build(targets);

        let mut no_match = Vec::new();
        for (source_index, record) in sources.iter().enumerate() {
            match index.lookup(record.natural_key.as_deref()) {
                ExactOutcome::NoMatch => no_match.push(source_index),
                ExactOutcome::Direct { target } => report.auto_apply.push(LinkDecision {
                    source_index,
                    record_key: record.record_key.clone(),
                    stage: Stage::Exact,
                    rule: Rule::NaturalKeyUnique,
                    classification: Classification::DirectMatch {
                        target: TargetRef::of(targets, target),
                    },
                }),
                ExactOutcome::Ambiguous {
                    targets: shared,
                    requires_clustering,
                } => report.needs_review.push(LinkDecision {
                    source_index,
                    record_key: record.record_key.clone(),
                    stage: Stage::Exact,
                    rule: Rule::NaturalKeyShared,
                    classification: Classification::AmbiguousMatch {
                        targets: shared
                            .into_iter()
                            .map(|target| TargetRef::of(targets, target))
                            .collect(),
                        requires_clustering,
                    },
                }),
            }
        }

        let target_names: Vec<(usize, String)> = targets
            .iter()
            .enumerate()
            .filter_map(|(index, record)| match self.extractor.extract(record) {
                Ok(name) => Some((index, name.display())),
                Err(err) => {
                    debug!(record_key = %err.record_key, reason = ?err.reason, "target record has no usable name");
                    None
                }
            })
            .collect();

        let mut no_viable = Vec::new();
        for source_index in no_match {
            let record = &sources[source_index];
            let name = match self.extractor.extract(record) {
                Ok(name) => name.display(),
                Err(err) => {
                    report.unhandled.push(skipped(source_index, err));
                    continue;
                }
            };
            let best = self.policy.best_match(
                &name,
                target_names
                    .iter()
                    .map(|(index, value)| (*index, value.as_str())),
            );
            let decision = |rule, classification| LinkDecision {
                source_index,
                record_key: record.record_key.clone(),
                stage: Stage::Similarity,
                rule,
                classification,
            };
            match best {
                Some(best) if best.score.tier == MatchTier::Clear => {
                    report.auto_apply.push(decision(
                        Rule::TokenOverlapClear,
                        Classification::ClearMatch {
                            target: TargetRef::of(targets, best.candidate),
                            score: best.score.score,
                        },
                    ))
                }
                Some(best) if best.score.tier == MatchTier::Near => {
                    report.needs_review.push(decision(
                        Rule::TokenOverlapNear,
                        Classification::NearMatch {
                            target: TargetRef::of(targets, best.candidate),
                            score: best.score.score,
                        },
                    ))
                }
                _ => no_viable.push(source_index),
            }
        }

        for source_index in no_viable {
            let record = &sources[source_index];
            let (rule, classification) = match_address(record);
            report.unhandled.push(LinkDecision {
                source_index,
                record_key: record.record_key.clone(),
                stage: Stage::Address,
                rule,
                classification,
            });
        }

        info!(
            auto_apply = report.auto_apply.len(),
            needs_review = report.needs_review.len(),
            unhandled = report.unhandled.len(),
            "linkage complete"
        );
        report
    }
}

fn skipped(source_index: usize, err: ParseError) -> LinkDecision {
    debug!(record_key = %err.record_key, row = err.row_index, reason = ?err.reason, "source record skipped");
    LinkDecision {
        source_index,
        record_key: err.record_key,
        stage: Stage::Similarity,
        rule: Rule::UnparseableName,
        classification: Classification::Skipped { reason: err.reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceId;
    use crate::source::FieldNameExtractor;

    fn target(row: u64, key: Option<&str>, name: &str) -> SourceRecord {
        let record = SourceRecord::new(SourceId::SourceB, row, format!("T{row}")).with_field("name", name);
        match key {
            Some(key) => record.with_natural_key(key),
            None => record,
        }
    }

    #[test]
    fn test_exact_index_outcomes() {
        let targets = vec![
            target(0, Some("101"), "A"),
            target(1, Some("202"), "B"),
            target(2, Some(" 202 "), "C"),
        ];
        let index = ExactKeyIndex::build(&targets);
        assert_eq!(index.lookup(Some("999")), ExactOutcome::NoMatch);
        assert_eq!(index.lookup(None), ExactOutcome::NoMatch);
        assert_eq!(index.lookup(Some("101")), ExactOutcome::Direct { target: 0 });
        assert_eq!(
            index.lookup(Some("202")),
            ExactOutcome::Ambiguous {
                targets: vec![1, 2],
                requires_clustering: true
            }
        );
    }

    #[test]
    fn test_address_stage_is_explicit() {
        let record = target(0, None, "Nobody");
        let (rule, classification) = match_address(&record);
        assert_eq!(rule, Rule::AddressNotImplemented);
        assert_eq!(classification, Classification::AddressMatchingNotImplemented);
    }

    #[test]
    fn test_pipeline_keeps_stage_and_rule() {
        let extractor = FieldNameExtractor::default();
        let pipeline = LinkagePipeline::new(&extractor, SimilarityPolicy::default());
        let targets = vec![
            target(0, Some("101"), "John Smith"),
            target(1, None, "Mary Jones"),
        ];
        let sources = vec![
            target(10, Some("101"), "J. Smith"),
            target(11, None, "Mary Jones"),
            target(12, None, "Peter Brown"),
        ];
        let report = pipeline.run(&sources, &targets);
        assert_eq!(report.total(), 3);

        let first = report.decision_for(0).unwrap();
        assert_eq!((first.stage, first.rule), (Stage::Exact, Rule::NaturalKeyUnique));

        let second = report.decision_for(1).unwrap();
        assert_eq!(second.stage, Stage::Similarity);
        assert!(matches!(
            second.classification,
            Classification::ClearMatch { ref target, .. } if target.index == 1
        ));

        let third = report.decision_for(2).unwrap();
        assert_eq!(third.stage, Stage::Address);
        assert_eq!(report.unhandled.len(), 1);
    }
}
