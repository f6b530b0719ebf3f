//! Batch ingestion of source records into a registry.

use std::sync::Arc;

use canondir::consistency::{ThreeViewStore, ViewLayout};
use canondir::context::RegistryContext;
use canondir::error::ParseReason;
use canondir::ingest::{ingest_batch, IngestAction, IngestStage};
use canondir::model::{AliasCategory, AttributedTerm, Identity, IdentityKey, IdentityKind, SourceId};
use canondir::registry::Registry;
use canondir::remote::{MemoryObjectStore, StoreOp};
use canondir::source::{FieldNameExtractor, SourceRecord};
use canondir::test_support::generate_records;
use canondir::workflows::ScriptedDisambiguator;

async fn seeded_context() -> anyhow::Result<(Arc<MemoryObjectStore>, RegistryContext)> {
    let memory = Arc::new(MemoryObjectStore::new());
    let views = ThreeViewStore::open(memory.clone(), ViewLayout::default()).await?;
    let mut registry = Registry::new();
    let mut john = Identity::from_primary(IdentityKind::Person, AttributedTerm::manual("John Smith", "name"));
    john.aliases_mut()
        .add(AttributedTerm::manual("Jon Smith", "name"), AliasCategory::Homonyms)?;
    registry.add(john)?;
    registry.add(Identity::from_primary(
        IdentityKind::Organization,
        AttributedTerm::manual("Acme Holdings Ltd", "name"),
    ))?;
    let ctx = RegistryContext::new(Arc::new(views), registry);
    let keys: Vec<IdentityKey> = ctx.registry().keys().cloned().collect();
    ctx.persist_all(&keys).await?;
    Ok((memory, ctx))
}

fn named(source: SourceId, row: u64, name: &str) -> SourceRecord {
    SourceRecord::new(source, row, format!("acct-{row}")).with_field("name", name)
}

#[tokio::test]
async fn batch_routes_each_record_to_one_stage() -> anyhow::Result<()> {
    let (memory, ctx) = seeded_context().await?;
    let records = vec![
        named(SourceId::SourceB, 1, "JOHN SMITH"),
        named(SourceId::SourceB, 2, "Jon  Smith"),
        named(SourceId::SourceB, 3, "Acme Holdings Ltd."),
        named(SourceId::SourceA, 4, "John Smith Senior"),
        named(SourceId::SourceA, 5, "Mary Jones"),
        SourceRecord::new(SourceId::SourceA, 6, "acct-6"),
        named(SourceId::SourceB, 7, "   "),
        named(SourceId::SourceB, 8, "MARY JONES"),
    ];
    let puts_before = memory.calls(StoreOp::Put);

    let report = ingest_batch(
        &ctx,
        &records,
        &FieldNameExtractor::default(),
        &ScriptedDisambiguator::new(),
    )
    .await?;

    assert_eq!(report.decisions.len(), records.len());
    assert_eq!(report.count(IngestStage::ExactVariant), 3);
    assert_eq!(report.count(IngestStage::Similarity), 2);
    assert_eq!(report.count(IngestStage::Create), 1);
    assert_eq!(report.count(IngestStage::Parse), 2);
    assert!(report.write_failures.is_empty());

    let john = IdentityKey::new("John Smith");
    let acme = IdentityKey::new("Acme Holdings Ltd");
    let mary = IdentityKey::new("Mary Jones");
    assert_eq!(report.decisions[0].action, IngestAction::Sighting { key: john.clone() });
    assert!(matches!(report.decisions[2].action, IngestAction::AddedHomonym { ref key, .. } if *key == acme));
    assert!(matches!(
        report.decisions[3].action,
        IngestAction::QueuedForReview { ref candidate, .. } if *candidate == john
    ));
    assert_eq!(report.decisions[4].action, IngestAction::Created { key: mary.clone() });
    assert_eq!(
        report.decisions[5].action,
        IngestAction::Skipped { reason: ParseReason::MissingName }
    );
    assert_eq!(
        report.decisions[6].action,
        IngestAction::Skipped { reason: ParseReason::EmptyName }
    );
    assert_eq!(report.decisions[7].action, IngestAction::Sighting { key: mary.clone() });

    assert_eq!(report.review.len(), 1);
    assert_eq!(report.review[0].term.display(), "John Smith Senior");
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.touched, vec![john.clone(), acme.clone(), mary.clone()]);

    // One new identity object, written once.
    assert_eq!(memory.calls(StoreOp::Put), puts_before + 1);

    {
        let registry = ctx.registry();
        let primary = registry.get(&john)?.identity.aliases().primary().clone();
        assert_eq!(primary.sources()[&SourceId::SourceB].len(), 1);
        assert_eq!(registry.get(&acme)?.identity.aliases().category(AliasCategory::Homonyms).len(), 1);
        assert_eq!(registry.get(&mary)?.identity.aliases().primary().sighting_count(), 2);
        assert!(registry.verify().is_empty());
        assert!(registry.shared_variants().is_empty());
    }

    let snapshot = ctx.views().load_snapshot().await?;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[&mary].identity.aliases().primary().sighting_count(), 2);
    assert!(ctx.reconcile().await?.report.is_consistent());
    Ok(())
}

#[tokio::test]
async fn generated_batch_keeps_invariants() -> anyhow::Result<()> {
    let memory = Arc::new(MemoryObjectStore::new());
    let views = ThreeViewStore::open(memory.clone(), ViewLayout::default()).await?;
    let ctx = RegistryContext::new(Arc::new(views), Registry::new());
    let records = generate_records(150, 0.3, 21);

    let report = ingest_batch(
        &ctx,
        &records,
        &FieldNameExtractor::default(),
        &ScriptedDisambiguator::new(),
    )
    .await?;

    assert_eq!(report.decisions.len(), 150);
    assert!(report.skipped.is_empty());
    assert!(report.count(IngestStage::Create) > 0);
    assert!(report.count(IngestStage::ExactVariant) > 0);

    let registry_len = ctx.registry().len();
    assert_eq!(registry_len, report.count(IngestStage::Create));
    assert_eq!(memory.object_count("identities"), registry_len);
    assert!(ctx.registry().verify().is_empty());
    assert!(ctx.registry().shared_variants().is_empty());
    assert!(ctx.reconcile().await?.report.is_consistent());
    Ok(())
}
