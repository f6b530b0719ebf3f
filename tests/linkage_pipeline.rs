//! Linkage between two record feeds: exact natural key, then name
//! similarity, then the address stage.

use canondir::linkage::{Classification, LinkagePipeline, Rule, Stage};
use canondir::model::SourceId;
use canondir::similarity::SimilarityPolicy;
use canondir::source::{FieldNameExtractor, SourceRecord};
use canondir::test_support::generate_records;

fn record(source: SourceId, row: u64, fire: Option<&str>, name: Option<&str>) -> SourceRecord {
    let mut record = SourceRecord::new(source, row, format!("{source}-{row}"));
    if let Some(fire) = fire {
        record = record.with_natural_key(fire);
    }
    if let Some(name) = name {
        record = record.with_field("owner_name", name);
    }
    record
}

fn targets() -> Vec<SourceRecord> {
    vec![
        record(SourceId::SourceB, 0, Some("101"), Some("John Smith")),
        record(SourceId::SourceB, 1, Some("202"), Some("Mary Jones")),
        record(SourceId::SourceB, 2, Some("202"), Some("Mary Jones Trust")),
        record(SourceId::SourceB, 3, None, Some("Acme Holdings Ltd")),
        record(SourceId::SourceB, 4, None, Some("Peter Parker")),
    ]
}

#[test]
fn every_source_record_lands_in_one_bucket() -> anyhow::Result<()> {
    let sources = vec![
        record(SourceId::SourceA, 0, Some("101"), Some("J. Smith")),
        record(SourceId::SourceA, 1, Some(" 202 "), Some("Mary Jones")),
        record(SourceId::SourceA, 2, Some("999"), Some("ACME HOLDINGS, LTD.")),
        record(SourceId::SourceA, 3, None, Some("P Parker")),
        record(SourceId::SourceA, 4, None, Some("Bruce Wayne")),
        record(SourceId::SourceA, 5, None, None),
    ];
    let extractor = FieldNameExtractor::default();
    let report = LinkagePipeline::new(&extractor, SimilarityPolicy::default()).run(&sources, &targets());

    assert_eq!(report.total(), sources.len());
    let decisions = report.decisions();
    let indexes: Vec<usize> = decisions.iter().map(|d| d.source_index).collect();
    assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5]);

    // Stage A decides on the natural key alone, whatever the names say.
    let direct = report.decision_for(0).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    assert_eq!((direct.stage, direct.rule), (Stage::Exact, Rule::NaturalKeyUnique));
    assert!(matches!(&direct.classification, Classification::DirectMatch { target } if target.index == 0));

    let shared = report.decision_for(1).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    match &shared.classification {
        Classification::AmbiguousMatch {
            targets,
            requires_clustering,
        } => {
            assert!(*requires_clustering);
            assert_eq!(targets.iter().map(|t| t.index).collect::<Vec<_>>(), vec![1, 2]);
        }
        other => anyhow::bail!("expected ambiguous match, got {other:?}"),
    }

    // Unknown key falls through to names.
    let clear = report.decision_for(2).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    assert_eq!((clear.stage, clear.rule), (Stage::Similarity, Rule::TokenOverlapClear));
    assert!(matches!(&clear.classification, Classification::ClearMatch { target, score } if target.index == 3 && *score == 1.0));

    let near = report.decision_for(3).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    assert!(matches!(&near.classification, Classification::NearMatch { target, score } if target.index == 4 && *score == 0.5));

    let address = report.decision_for(4).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    assert_eq!(address.stage, Stage::Address);
    assert_eq!(address.classification, Classification::AddressMatchingNotImplemented);

    let skipped = report.decision_for(5).ok_or_else(|| anyhow::anyhow!("no decision"))?;
    assert_eq!(skipped.rule, Rule::UnparseableName);

    assert_eq!(report.auto_apply.len(), 2);
    assert_eq!(report.needs_review.len(), 2);
    assert_eq!(report.unhandled.len(), 2);
    Ok(())
}

#[test]
fn generated_feeds_are_fully_classified() -> anyhow::Result<()> {
    let sources = generate_records(120, 0.2, 3);
    let targets = generate_records(80, 0.2, 4);
    let extractor = FieldNameExtractor::default();
    let report = LinkagePipeline::new(&extractor, SimilarityPolicy::default()).run(&sources, &targets);

    assert_eq!(report.total(), sources.len());
    for decision in &report.auto_apply {
        assert!(matches!(
            decision.classification,
            Classification::DirectMatch { .. } | Classification::ClearMatch { .. }
        ));
    }
    for decision in &report.needs_review {
        assert!(matches!(
            decision.classification,
            Classification::AmbiguousMatch { requires_clustering: true, .. } | Classification::NearMatch { .. }
        ));
    }
    let json = serde_json::to_value(&report)?;
    assert!(json["auto_apply"].is_array());
    Ok(())
}
