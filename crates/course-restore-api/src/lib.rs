use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use course_restore_core::{LedgerEntry, RestoreLedger};
use course_restore_store_sqlite::{EntityCounts, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

mod config;
mod driver;
mod persist;
mod schedule;

pub use config::{RestoreConfig, DEFAULT_BACKUP_ROOT, DEFAULT_DB_PATH};
pub use driver::{FileReport, FileStatus, RestoreDriver, RunReport, RunTotals, ShardFailure};
pub use persist::{
    BatchFailure, BundlePersister, FileOutcome, PhaseOutcome, PhaseStatus, RecordDiagnostic,
};
pub use schedule::{parse_shard_timestamp, RunCheckpoint, Shard, ShardScheduler};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// A finished sweep plus what the destination holds afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub report: RunReport,
    pub totals: RunTotals,
    pub entity_counts: EntityCounts,
}

#[derive(Debug, Clone)]
pub struct CourseRestoreApi {
    db_path: PathBuf,
}

impl CourseRestoreApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when migration or the backup itself fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// Files recorded as committed by earlier runs.
    ///
    /// # Errors
    /// Returns an error when the store cannot be migrated or the ledger read.
    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.committed_files().map_err(|err| anyhow!(err))
    }

    /// Sweep `config.backup_root` into this store.
    ///
    /// # Errors
    /// Returns an error when the store cannot be prepared or the backup root
    /// cannot be listed. Individual file failures land in the report.
    pub fn restore(&self, config: &RestoreConfig) -> Result<RestoreSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let report = {
            let mut driver = RestoreDriver::new(&mut store);
            if config.resume {
                driver.resume_from_ledger()?;
            }
            driver.run(&ShardScheduler::new(&config.backup_root))?
        };

        let totals = report.totals();
        tracing::info!(
            "restore finished: {} committed, {} partial, {} failed, {} skipped",
            totals.committed,
            totals.partial,
            totals.failed,
            totals.skipped
        );
        Ok(RestoreSummary { report, totals, entity_counts: store.entity_counts()? })
    }
}
