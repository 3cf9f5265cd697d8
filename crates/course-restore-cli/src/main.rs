use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use course_restore_api::{CourseRestoreApi, RestoreConfig, DEFAULT_DB_PATH};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "crestore")]
#[command(about = "Restore course backup shards into a SQLite store")]
struct Cli {
    /// Destination database. Falls back to the config file, then the default path.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Restore(RestoreArgs),
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    backup_root: Option<PathBuf>,
    /// Skip files recorded as committed by earlier runs.
    #[arg(long, default_value_t = false)]
    resume: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    List,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    // Logs go to stderr so stdout stays machine-readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn db_or_default(db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Restore(args) => run_restore(cli.db, args),
        Command::Db { command } => {
            run_db(*command, &CourseRestoreApi::new(db_or_default(cli.db)))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ledger { command: LedgerCommand::List } => {
            let entries = CourseRestoreApi::new(db_or_default(cli.db)).ledger_entries()?;
            emit_json(serde_json::json!({
                "count": entries.len(),
                "entries": entries,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_restore(db: Option<PathBuf>, args: RestoreArgs) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => RestoreConfig::load(path)?,
        None => RestoreConfig::default(),
    };
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(root) = args.backup_root {
        config.backup_root = root;
    }
    config.resume |= args.resume;

    let api = CourseRestoreApi::new(config.db_path.clone());
    let summary = api.restore(&config)?;
    let failed = summary.report.has_failures();
    emit_json(serde_json::json!({
        "db_path": config.db_path.display().to_string(),
        "backup_root": summary.report.backup_root,
        "resume": config.resume,
        "totals": summary.totals,
        "entity_counts": summary.entity_counts,
        "report": summary.report,
    }))?;

    if failed {
        tracing::error!("restore finished with failed shards or files");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_db(command: DbCommand, api: &CourseRestoreApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy,
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            if result.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": result.current_version,
                    "target_version": result.target_version,
                    "would_apply_versions": result.would_apply_versions,
                    "inferred_from_legacy": result.inferred_from_legacy,
                }));
            }
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": result.current_version,
                "applied_versions": result.would_apply_versions,
                "after_version": result.after_version,
                "target_version": result.target_version,
                "up_to_date": result.up_to_date,
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out.display().to_string(),
                "status": "ok",
            }))
        }
    }
}
