//! Reconciliation between the database and the uploads directory.
//!
//! Drift happens: crashes between a write and its commit, bytes deleted out
//! of band, interrupted dedup. The sweep runs at startup (and optionally on
//! an interval) and repairs what it finds, never aborting on a single bad
//! item.

use crate::metrics;
use crate::store::{FileStore, UploadBatch};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// All database rows were dropped because the uploads directory is empty.
    pub purged_database: bool,
    pub orphan_files_deleted: usize,
    pub alias_bytes_deleted: usize,
    pub batch_counts_repaired: usize,
    pub empty_batches_deleted: usize,
    pub unparseable_skipped: usize,
}

pub struct ReconciliationSweep {
    store: Arc<dyn FileStore>,
    uploads_root: PathBuf,
}

impl ReconciliationSweep {
    pub fn new(store: Arc<dyn FileStore>, uploads_root: PathBuf) -> Self {
        Self {
            store,
            uploads_root,
        }
    }

    pub async fn run(&self) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport::default();

        let disk_files = self.collect_disk_files()?;
        let records = self.store.list_all_files()?;

        if disk_files.is_empty() && !records.is_empty() {
            // An empty uploads directory with a populated database means the
            // storage volume was wiped or replaced; the rows describe
            // nothing. The reverse (files without rows) is handled per file.
            warn!(
                records = records.len(),
                "Uploads directory is empty, dropping all database rows"
            );
            self.store.purge_all()?;
            metrics::record_sweep_repair("purge_database");
            report.purged_database = true;
            return Ok(report);
        }

        let by_path: HashMap<&str, _> = records
            .iter()
            .filter_map(|r| r.disk_path.as_deref().map(|p| (p, r)))
            .collect();

        for (relative, absolute) in &disk_files {
            if let Err(e) = self
                .reconcile_file(relative, absolute, &by_path, &mut report)
                .await
            {
                warn!(path = relative, "Failed to reconcile file: {e:#}");
            }
        }

        for batch in self.store.list_uploads()? {
            if let Err(e) = self.reconcile_batch(&batch, &mut report) {
                warn!(batch = %batch.id, "Failed to reconcile batch: {e:#}");
            }
        }

        info!(?report, "Reconciliation sweep finished");
        Ok(report)
    }

    /// Runs the sweep on an interval until cancelled.
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run().await {
                        warn!("Periodic reconciliation sweep failed: {e:#}");
                    }
                }
            }
        }
    }

    /// All regular files under the uploads root as (relative, absolute)
    /// path pairs.
    fn collect_disk_files(&self) -> anyhow::Result<Vec<(String, PathBuf)>> {
        if !self.uploads_root.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.uploads_root) {
            let entry = entry.context("Failed to walk uploads directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.uploads_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            files.push((relative, entry.path().to_path_buf()));
        }
        Ok(files)
    }

    async fn reconcile_file(
        &self,
        relative: &str,
        absolute: &Path,
        by_path: &HashMap<&str, &crate::store::FileRecord>,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let id = match file_id_from_path(absolute) {
            Some(id) => id,
            None => {
                warn!(path = relative, "Unrecognized file name in uploads directory");
                report.unparseable_skipped += 1;
                return Ok(());
            }
        };

        match self.store.get_file(id)? {
            None => {
                // No record by id. Some other record may still point at the
                // same path; only delete bytes nothing references.
                if by_path.contains_key(relative) || self.store.any_file_at_path(relative)? {
                    return Ok(());
                }
                info!(path = relative, "Removing orphaned file");
                tokio::fs::remove_file(absolute).await?;
                metrics::record_sweep_repair("orphan_file");
                report.orphan_files_deleted += 1;
            }
            Some(record) if record.is_alias => {
                // Aliases must not own bytes; the canonical record does.
                warn!(file = %record.id, path = relative, "Alias owns bytes, removing them");
                tokio::fs::remove_file(absolute).await?;
                metrics::record_sweep_repair("alias_bytes");
                report.alias_bytes_deleted += 1;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn reconcile_batch(
        &self,
        batch: &UploadBatch,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let actual = self.store.count_files_for_upload(batch.id)?;
        if actual == 0 {
            info!(batch = %batch.id, "Removing empty upload batch");
            self.store.delete_upload(batch.id)?;
            metrics::record_sweep_repair("empty_batch");
            report.empty_batches_deleted += 1;
        } else if actual != batch.files_count {
            warn!(
                batch = %batch.id,
                stored = batch.files_count,
                actual,
                "Repairing upload batch file count"
            );
            self.store.set_files_count(batch.id, actual)?;
            metrics::record_sweep_repair("batch_count");
            report.batch_counts_repaired += 1;
        }
        Ok(())
    }
}

/// Uploaded files are named `<uuid>.<ext>`; anything else was not put there
/// by this service.
fn file_id_from_path(path: &Path) -> Option<Uuid> {
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()
}
