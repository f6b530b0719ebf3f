//! # Ingest Module
//!
//! Feeds source records into the registry. For each record the name is
//! extracted, then:
//!
//! 1. a known variant records another sighting on its owner
//! 2. otherwise a clear similarity match becomes a homonym of the best identity
//! 3. a near match is queued for review
//! 4. anything else creates a new identity
//!
//! Every touched identity is written through at the end of the batch.

use crate::context::RegistryContext;
use crate::error::{ParseError, ParseReason, WorkflowError, WriteThroughError};
use crate::model::{AliasCategory, Identity, IdentityBody, IdentityKey, Aliases};
use crate::similarity::MatchTier;
use crate::source::{ExtractedName, NameExtractor, SourceRecord};
use crate::workflows::{register_identity, AddOutcome, Disambiguator, ReviewItem};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Step of the ingestion flow that decided a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Parse,
    ExactVariant,
    Similarity,
    Create,
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IngestAction {
    Sighting { key: IdentityKey },
    AddedHomonym { key: IdentityKey, score: f64 },
    QueuedForReview { candidate: IdentityKey, score: f64 },
    Created { key: IdentityKey },
    Abandoned { key: IdentityKey },
    Skipped { reason: ParseReason },
}

/// Audit line for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestDecision {
    pub row_index: u64,
    pub record_key: String,
    pub stage: IngestStage,
    pub action: IngestAction,
}

/// Result of a batch.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub decisions: Vec<IngestDecision>,
    pub review: Vec<ReviewItem>,
    pub skipped: Vec<ParseError>,
    /// Identities changed by the batch, in first-touched order
    pub touched: Vec<IdentityKey>,
    pub write_failures: Vec<WriteThroughError>,
}

impl IngestReport {
    fn touch(&mut self, key: &IdentityKey) {
        if !self.touched.contains(key) {
            self.touched.push(key.clone());
        }
    }

    pub fn count(&self, stage: IngestStage) -> usize {
        self.decisions
            .iter()
            .filter(|decision| decision.stage == stage)
            .count()
    }
}

fn new_identity(name: &ExtractedName, record: &SourceRecord) -> Identity {
    let mut body = IdentityBody::new(Aliases::new(name.term(record)));
    body.components = name.components.clone();
    Identity::new(name.kind, body)
}

async fn ingest_record(
    ctx: &RegistryContext,
    record: &SourceRecord,
    extractor: &dyn NameExtractor,
    disambiguator: &dyn Disambiguator,
    report: &mut IngestReport,
) -> Result<(), WorkflowError> {
    let decide = |stage, action| IngestDecision {
        row_index: record.row_index,
        record_key: record.record_key.clone(),
        stage,
        action,
    };

    let name = match extractor.extract(record) {
        Ok(name) => name,
        Err(err) => {
            warn!(row = err.row_index, record_key = %err.record_key, reason = ?err.reason, "skipping source record");
            report
                .decisions
                .push(decide(IngestStage::Parse, IngestAction::Skipped { reason: err.reason }));
            report.skipped.push(err);
            return Ok(());
        }
    };
    let term = name.term(record);
    let display_value = term.display();

    let owner = ctx.registry().lookup_by_variant(&display_value).cloned();
    if let Some(key) = owner {
        let _guards = ctx.lock_keys(std::slice::from_ref(&key)).await;
        let merged = ctx
            .registry_mut()
            .update_aliases(&key, |aliases| Ok(aliases.record_sighting(&term)))?;
        debug!(key = %key, value = %display_value, merged = ?merged, "sighting recorded");
        report.touch(&key);
        report
            .decisions
            .push(decide(IngestStage::ExactVariant, IngestAction::Sighting { key }));
        return Ok(());
    }

    let best = ctx.policy().best_identity(&ctx.registry(), &display_value);
    match best {
        Some(best) if best.score.tier == MatchTier::Clear => {
            let key = best.candidate;
            let _guards = ctx.lock_keys(std::slice::from_ref(&key)).await;
            ctx.registry_mut()
                .update_aliases(&key, |aliases| aliases.add(term.clone(), AliasCategory::Homonyms))?;
            debug!(key = %key, value = %display_value, score = best.score.score, "homonym added");
            report.touch(&key);
            report.decisions.push(decide(
                IngestStage::Similarity,
                IngestAction::AddedHomonym {
                    key,
                    score: best.score.score,
                },
            ));
        }
        Some(best) if best.score.tier == MatchTier::Near => {
            debug!(candidate = %best.candidate, value = %display_value, score = best.score.score, "queued for review");
            report.decisions.push(decide(
                IngestStage::Similarity,
                IngestAction::QueuedForReview {
                    candidate: best.candidate.clone(),
                    score: best.score.score,
                },
            ));
            report.review.push(ReviewItem {
                term,
                kind: name.kind,
                components: name.components.clone(),
                candidate: best.candidate,
                matched_value: best.matched_value,
                score: best.score.score,
            });
        }
        _ => {
            let registration = register_identity(ctx, new_identity(&name, record), disambiguator).await?;
            for key in &registration.touched {
                report.touch(key);
            }
            let action = match registration.outcome {
                AddOutcome::Added(key) => IngestAction::Created { key },
                AddOutcome::Abandoned(key) => IngestAction::Abandoned { key },
            };
            report.decisions.push(decide(IngestStage::Create, action));
        }
    }
    Ok(())
}

/// Ingest a batch of source records.
///
/// Malformed records are skipped with a reason code. A duplicate key with no
/// disambiguation response halts the batch after writing what was touched.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn ingest_batch(
    ctx: &RegistryContext,
    records: &[SourceRecord],
    extractor: &dyn NameExtractor,
    disambiguator: &dyn Disambiguator,
) -> Result<IngestReport, WorkflowError> {
    let mut report = IngestReport::default();
    let mut halted = None;
    for record in records {
        if let Err(err) = ingest_record(ctx, record, extractor, disambiguator, &mut report).await {
            warn!(record_key = %record.record_key, error = %err, "ingest halted");
            halted = Some(err);
            break;
        }
    }

    for key in report.touched.clone() {
        if let Err(err) = ctx.persist(&key).await {
            report.write_failures.push(err);
        }
    }

    if let Some(err) = halted {
        return Err(err);
    }
    info!(
        decisions = report.decisions.len(),
        review = report.review.len(),
        skipped = report.skipped.len(),
        touched = report.touched.len(),
        write_failures = report.write_failures.len(),
        "ingest batch finished"
    );
    Ok(report)
}
