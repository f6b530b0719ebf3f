//! # Backfill Module
//!
//! Chunked, rate-bounded rewrite of identities into the three remote views,
//! resumable through a local progress file. Local progress is advisory: every
//! run re-derives the completed set from the snapshot and the identity folder
//! before choosing what to write.

use crate::consistency::{StoredIdentity, ThreeViewStore};
use crate::error::{BackfillError, WriteThroughError};
use crate::model::IdentityKey;
use crate::remote::ObjectLocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Keys a backfill has finished, plus when the file was last written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: BTreeSet<IdentityKey>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Local JSON progress file.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the progress file; a missing file is empty progress.
    pub async fn load(&self) -> Result<Progress, BackfillError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Progress::default()),
            Err(source) => {
                return Err(BackfillError::Progress {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| BackfillError::ProgressFormat {
            path: self.path.clone(),
            source,
        })
    }

    /// Write the progress file atomically.
    pub async fn save(&self, progress: &Progress) -> Result<(), BackfillError> {
        let io_error = |source| BackfillError::Progress {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(progress).map_err(|source| BackfillError::ProgressFormat {
            path: self.path.clone(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)
    }
}

/// Result of one backfill chunk.
#[derive(Debug, Default)]
pub struct BackfillReport {
    /// Identities already present in snapshot and folder before this run
    pub already_done: usize,
    /// Progress entries dropped because the remote views did not confirm them
    pub stale_progress: Vec<IdentityKey>,
    pub written: Vec<(IdentityKey, ObjectLocation)>,
    pub failed: Vec<WriteThroughError>,
    /// Identities still to do after this chunk
    pub remaining: usize,
}

impl BackfillReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0 && self.failed.is_empty()
    }
}

/// Chunked backfill of identities into the remote views.
#[derive(Debug, Clone)]
pub struct BackfillJob {
    views: Arc<ThreeViewStore>,
    progress: ProgressStore,
    chunk_size: usize,
    concurrency: usize,
}

impl BackfillJob {
    pub fn new(views: Arc<ThreeViewStore>, progress: ProgressStore, chunk_size: usize, concurrency: usize) -> Self {
        Self {
            views,
            progress,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    /// Write the next chunk of `identities` that the remote views do not hold yet.
    ///
    /// Identities with an object in the folder but no snapshot entry are
    /// updated in place; the rest are created. Each write-through is
    /// sequential; up to `concurrency` of them run at once.
    #[instrument(skip(self, identities), fields(total = identities.len()))]
    pub async fn run_chunk(&self, identities: Vec<StoredIdentity>) -> Result<BackfillReport, BackfillError> {
        let mut progress = self.progress.load().await?;
        let snapshot = self.views.load_snapshot().await?;
        let (folder, _) = self.views.folder_objects().await?;

        let confirmed: BTreeSet<IdentityKey> = snapshot
            .keys()
            .filter(|key| folder.contains_key(*key))
            .cloned()
            .collect();

        let mut report = BackfillReport::default();
        report.stale_progress = progress.completed.difference(&confirmed).cloned().collect();
        if !report.stale_progress.is_empty() {
            warn!(
                count = report.stale_progress.len(),
                "local progress lists keys the remote views do not hold"
            );
        }
        progress.completed = confirmed;

        let pending: Vec<StoredIdentity> = identities
            .into_iter()
            .filter(|stored| !progress.completed.contains(&stored.key()))
            .collect();
        let total_pending = pending.len();
        report.already_done = progress.completed.len();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for stored in pending.into_iter().take(self.chunk_size) {
            let key = stored.key();
            let location = folder
                .get(&key)
                .and_then(|objects| objects.last())
                .map(|listing| listing.location.clone());
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let views = self.views.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = views.write_through(&stored, location.as_ref()).await;
                (key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(location))) => {
                    debug!(key = %key, location = %location, "backfilled identity");
                    progress.completed.insert(key.clone());
                    report.written.push((key, location));
                }
                Ok((key, Err(err))) => {
                    warn!(key = %key, stage = %err.stage, error = %err.source, "backfill write-through failed");
                    report.failed.push(err);
                }
                Err(err) => warn!(error = %err, "backfill task aborted"),
            }
        }

        report.remaining = total_pending - report.written.len();
        progress.updated_at = Some(Utc::now());
        self.progress.save(&progress).await?;
        info!(
            written = report.written.len(),
            failed = report.failed.len(),
            remaining = report.remaining,
            "backfill chunk finished"
        );
        Ok(report)
    }
}
