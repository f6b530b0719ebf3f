use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use canondir::backfill::{BackfillJob, ProgressStore};
use canondir::config::{BackfillOverrides, CanonConfig, ConfigOverrides, StorageOverrides};
use canondir::consistency::ThreeViewStore;
use canondir::context::RegistryContext;
use canondir::ingest::ingest_batch;
use canondir::linkage::LinkagePipeline;
use canondir::remote::FsObjectStore;
use canondir::source::{FieldNameExtractor, SourceRecord};
use canondir::workflows::ScriptedDisambiguator;
use tracing_subscriber::EnvFilter;

/// Flags that take a value, skipped when collecting positional arguments.
const VALUE_FLAGS: [&str; 6] = ["-c", "--config", "--root", "--chunk-size", "--concurrency", "--progress"];

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn positional_args() -> Vec<String> {
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            args.next();
        } else if !arg.starts_with('-') {
            positional.push(arg);
        }
    }
    positional
}

fn print_help() {
    eprintln!(
        r#"canondir - canonical identity directory

USAGE:
    canondir [OPTIONS] <COMMAND>

COMMANDS:
    reconcile                     Check and repair the three remote views
    build                         Write the next backfill chunk
    ingest <RECORDS>              Ingest a JSON array of source records
    link <SOURCE> <TARGET>        Link two JSON record files and print the report
    verify                        Check registry invariants

OPTIONS:
    -c, --config <FILE>           Path to config file (TOML)
        --root <DIR>              Override the object store root
        --chunk-size <N>          Override the backfill chunk size
        --concurrency <N>         Override the backfill write concurrency
        --progress <FILE>         Override the backfill progress file
    -h, --help                    Print help

ENVIRONMENT:
    RUST_LOG                      Log filter [default: info]
    CANONDIR_STORAGE__ROOT        Object store root
    CANONDIR_BACKFILL__CHUNK_SIZE Backfill chunk size
"#
    );
}

fn load_records(path: &str) -> anyhow::Result<Vec<SourceRecord>> {
    let raw = fs::read_to_string(path)?;
    let records = serde_json::from_str(&raw)?;
    Ok(records)
}

async fn open_context(config: &CanonConfig) -> anyhow::Result<RegistryContext> {
    let store = Arc::new(FsObjectStore::new(&config.storage.root));
    let views = ThreeViewStore::open(store, config.storage.layout()).await?;
    let ctx = RegistryContext::load(Arc::new(views)).await?;
    Ok(ctx.with_matching(&config.matching))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut overrides = ConfigOverrides::default();
    if let Some(root) = parse_arg("--root") {
        overrides.storage = Some(StorageOverrides {
            root: Some(PathBuf::from(root)),
        });
    }
    let backfill = BackfillOverrides {
        chunk_size: parse_arg("--chunk-size").map(|v| v.parse()).transpose()?,
        concurrency: parse_arg("--concurrency").map(|v| v.parse()).transpose()?,
        progress_path: parse_arg("--progress").map(PathBuf::from),
    };
    if backfill.chunk_size.is_some() || backfill.concurrency.is_some() || backfill.progress_path.is_some() {
        overrides.backfill = Some(backfill);
    }

    let config_path = parse_arg("--config").or_else(|| parse_arg("-c"));
    let config = CanonConfig::load(config_path.as_deref(), overrides)?;

    let args = positional_args();
    let Some(command) = args.first() else {
        print_help();
        anyhow::bail!("a command is required");
    };

    match command.as_str() {
        "reconcile" => {
            let ctx = open_context(&config).await?;
            let result = ctx.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&result.report)?);
            if !result.unsynced.is_empty() {
                eprintln!("unsynced identities: {:?}", result.unsynced);
            }
            result.report.into_result()?;
        }
        "build" => {
            let ctx = open_context(&config).await?;
            let job = BackfillJob::new(
                ctx.views().clone(),
                ProgressStore::new(&config.backfill.progress_path),
                config.backfill.chunk_size,
                config.backfill.concurrency,
            );
            let report = ctx.backfill_chunk(&job).await?;
            println!(
                "written={} failed={} remaining={} already_done={} stale_progress={}",
                report.written.len(),
                report.failed.len(),
                report.remaining,
                report.already_done,
                report.stale_progress.len()
            );
        }
        "ingest" => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("ingest needs a records file"))?;
            let records = load_records(path)?;
            let ctx = open_context(&config).await?;
            // Non-interactive: duplicate keys halt the batch, near matches stay queued.
            let disambiguator = ScriptedDisambiguator::new();
            let report = ingest_batch(&ctx, &records, &FieldNameExtractor::default(), &disambiguator).await?;
            println!("{}", serde_json::to_string_pretty(&report.decisions)?);
            for item in &report.review {
                eprintln!(
                    "review: {:?} ~ {} (score {:.2})",
                    item.term.display(),
                    item.candidate,
                    item.score
                );
            }
            if !report.write_failures.is_empty() {
                anyhow::bail!("{} identities left unsynced", report.write_failures.len());
            }
        }
        "link" => {
            let (Some(source), Some(target)) = (args.get(1), args.get(2)) else {
                anyhow::bail!("link needs a source and a target records file");
            };
            let sources = load_records(source)?;
            let targets = load_records(target)?;
            let extractor = FieldNameExtractor::default();
            let report = LinkagePipeline::new(&extractor, config.matching.policy()).run(&sources, &targets);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "verify" => {
            let ctx = open_context(&config).await?;
            let registry = ctx.registry();
            let violations = registry.verify();
            let shared = registry.shared_variants();
            println!(
                "identities={} aliases={} violations={} shared_variants={}",
                registry.len(),
                registry.alias_count(),
                violations.len(),
                shared.len()
            );
            for violation in &violations {
                eprintln!("violation: {:?}", violation);
            }
            for (value, owners) in &shared {
                eprintln!("shared variant {:?}: {:?}", value, owners);
            }
            if !violations.is_empty() || !shared.is_empty() {
                anyhow::bail!("registry invariants violated");
            }
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}");
        }
    }
    Ok(())
}
