use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use course_restore_core::{
    load_bundle_file, Destination, IdRemapCache, LedgerEntry, Phase, RestoreError, RestoreLedger,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::persist::{BundlePersister, FileOutcome};
use crate::schedule::{RunCheckpoint, Shard, ShardScheduler};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Every phase persisted without diagnostics.
    Committed,
    /// Every phase was attempted but some batches or records failed.
    Partial,
    /// The file could not be processed at all.
    Failed,
    /// A file with this name was already persisted in this run.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileReport {
    pub shard: String,
    pub file_name: String,
    pub status: FileStatus,
    pub failed_phases: Vec<Phase>,
    pub error: Option<String>,
    pub outcome: Option<FileOutcome>,
}

/// A shard whose file list could not be read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTotals {
    pub committed: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub backup_root: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub shards: Vec<String>,
    pub resumed_files: usize,
    pub files: Vec<FileReport>,
    pub failed_shards: Vec<ShardFailure>,
}

impl RunReport {
    #[must_use]
    pub fn totals(&self) -> RunTotals {
        let mut totals = RunTotals::default();
        for file in &self.files {
            match file.status {
                FileStatus::Committed => totals.committed += 1,
                FileStatus::Partial => totals.partial += 1,
                FileStatus::Failed => totals.failed += 1,
                FileStatus::Skipped => totals.skipped += 1,
            }
        }
        totals
    }

    /// True when a shard could not be listed, or any file failed outright or
    /// committed with failures.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed_shards.is_empty()
            || self
                .files
                .iter()
                .any(|file| matches!(file.status, FileStatus::Failed | FileStatus::Partial))
    }
}

/// Sweeps every shard into one destination, one file at a time.
pub struct RestoreDriver<'a, D: ?Sized> {
    destination: &'a mut D,
    checkpoint: RunCheckpoint,
    cache: IdRemapCache,
    resumed_files: usize,
}

impl<'a, D: Destination + RestoreLedger + ?Sized> RestoreDriver<'a, D> {
    pub fn new(destination: &'a mut D) -> Self {
        Self {
            destination,
            checkpoint: RunCheckpoint::new(),
            cache: IdRemapCache::new(),
            resumed_files: 0,
        }
    }

    /// Mark every file in the durable ledger as already done.
    ///
    /// # Errors
    /// Returns the ledger's error when it cannot be read.
    pub fn resume_from_ledger(&mut self) -> Result<usize, RestoreError> {
        let entries = self.destination.committed_files()?;
        self.resumed_files = entries.len();
        self.checkpoint.seed(entries.into_iter().map(|entry| entry.file_name));
        tracing::info!("resuming with {} files already committed", self.resumed_files);
        Ok(self.resumed_files)
    }

    #[must_use]
    pub fn checkpoint(&self) -> &RunCheckpoint {
        &self.checkpoint
    }

    /// Process every shard the scheduler yields.
    ///
    /// # Errors
    /// Returns an error only when the backup root cannot be listed. Shards
    /// and files that fail are reported in the [`RunReport`].
    pub fn run(&mut self, scheduler: &ShardScheduler) -> Result<RunReport> {
        let started_at = OffsetDateTime::now_utc();
        let shards = scheduler.shards()?;
        Ok(self.sweep(scheduler.root(), started_at, &shards))
    }

    fn sweep(&mut self, root: &Path, started_at: OffsetDateTime, shards: &[Shard]) -> RunReport {
        let mut files = Vec::new();
        let mut failed_shards = Vec::new();

        for shard in shards {
            tracing::info!("processing shard {}", shard.name);
            let paths = match ShardScheduler::files(shard) {
                Ok(paths) => paths,
                Err(err) => {
                    tracing::error!("Error in uploading shard {}: {:#}", shard.name, err);
                    failed_shards
                        .push(ShardFailure { shard: shard.name.clone(), error: format!("{err:#}") });
                    continue;
                }
            };
            for path in paths {
                files.push(self.process_file(shard, &path));
            }
        }

        RunReport {
            backup_root: root.display().to_string(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            shards: shards.iter().map(|shard| shard.name.clone()).collect(),
            resumed_files: self.resumed_files,
            files,
            failed_shards,
        }
    }

    fn process_file(&mut self, shard: &Shard, path: &Path) -> FileReport {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut report = FileReport {
            shard: shard.name.clone(),
            file_name: file_name.clone(),
            status: FileStatus::Skipped,
            failed_phases: Vec::new(),
            error: None,
            outcome: None,
        };

        if self.checkpoint.is_done(&file_name) {
            tracing::info!("{} already persisted.", file_name);
            return report;
        }

        let bundle = match load_bundle_file(path) {
            Ok(bundle) => bundle,
            Err(err) => {
                tracing::error!("Error in uploading file: {}", err);
                report.status = FileStatus::Failed;
                report.error = Some(err.to_string());
                return report;
            }
        };

        self.cache.reset();
        let outcome = BundlePersister::new(&mut *self.destination).persist(&bundle, &mut self.cache);
        self.checkpoint.mark_done(&file_name);

        report.status = if outcome.is_clean() { FileStatus::Committed } else { FileStatus::Partial };
        report.failed_phases = outcome.failed_phases();
        report.outcome = Some(outcome);

        if let Err(err) = self.record_in_ledger(&shard.name, &file_name, path) {
            tracing::error!("failed to record {} in restore ledger: {:#}", file_name, err);
            report.status = FileStatus::Partial;
            report.error = Some(format!("{err:#}"));
        }

        report
    }

    fn record_in_ledger(&mut self, shard: &str, file_name: &str, path: &Path) -> Result<()> {
        let entry = LedgerEntry {
            file_name: file_name.to_string(),
            shard: shard.to_string(),
            sha256: file_digest(path)?,
            committed_at: OffsetDateTime::now_utc(),
        };
        self.destination.record_committed(&entry)?;
        Ok(())
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {} for digest", path.display()))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}
