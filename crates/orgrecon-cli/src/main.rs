use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use orgrecon_api::{
    ConflictResolution, InputTables, MergeRequest, OrgReconApi, OrgReconConfig,
    API_CONTRACT_VERSION,
};
use orgrecon_core::{ApplyOptions, ChangePlan, RecordKind, StructuredCommand};
use orgrecon_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "orgrecon")]
#[command(about = "HR master-data reconciliation CLI")]
struct Cli {
    #[arg(long, default_value = "./orgrecon.sqlite3")]
    db: PathBuf,

    /// YAML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `snapshots_dir` from the settings file.
    #[arg(long)]
    snapshots_dir: Option<PathBuf>,

    /// Raise log verbosity on stderr (`-v` info, `-vv` debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Validate an input file without touching the store.
    Validate(InputArgs),
    /// Replace the stored dataset with a validated input file.
    Import(ImportArgs),
    /// Diff an input file against the stored dataset.
    PreviewImport(InputArgs),
    /// Diff two input files.
    Diff(DiffArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Merge {
        #[command(subcommand)]
        command: MergeCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Changes {
        #[command(subcommand)]
        command: ChangesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
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

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct DiffArgs {
    #[arg(long)]
    old: PathBuf,
    #[arg(long)]
    new: PathBuf,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Imports,
    Audit(AuditArgs),
    Merges,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Person,
    Structure,
}

impl From<KindArg> for RecordKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Person => Self::Person,
            KindArg::Structure => Self::Structure,
        }
    }
}

#[derive(Debug, Subcommand)]
enum MergeCommand {
    Preview(MergeArgs),
    Apply(MergeApplyArgs),
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long)]
    kind: KindArg,
    /// JSON array of `{record_id, field, value}` decisions for pending conflicts.
    #[arg(long)]
    resolutions: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MergeApplyArgs {
    #[command(flatten)]
    merge: MergeArgs,
    /// Restrict the apply to these record ids.
    #[arg(long = "select")]
    select: Vec<String>,
    #[arg(long, default_value_t = false)]
    insert_new: bool,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    List,
    Create(NoteArgs),
    Checkpoint(NoteArgs),
    Milestone(MilestoneArgs),
    Restore(RestoreArgs),
    Delete(IdArgs),
    Cleanup(CleanupArgs),
    Compare(CompareArgs),
}

#[derive(Debug, Args)]
struct NoteArgs {
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct MilestoneArgs {
    #[arg(long)]
    note: String,
    #[arg(long)]
    description: String,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    id: u64,
    #[arg(long, default_value_t = false)]
    no_safety_backup: bool,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[arg(long)]
    keep: Option<usize>,
}

#[derive(Debug, Args)]
struct CompareArgs {
    #[arg(long)]
    old: u64,
    #[arg(long)]
    new: u64,
}

#[derive(Debug, Subcommand)]
enum ChangesCommand {
    /// Plan proposals from a structured command file.
    Plan(ChangesPlanArgs),
    /// Apply proposals from a plan file.
    Apply(ChangesApplyArgs),
}

#[derive(Debug, Args)]
struct ChangesPlanArgs {
    #[arg(long)]
    command: PathBuf,
}

#[derive(Debug, Args)]
struct ChangesApplyArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long = "select")]
    select: Vec<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => OrgReconConfig::load(path)?,
        None => OrgReconConfig::default(),
    };
    if let Some(dir) = cli.snapshots_dir {
        config.snapshots_dir = dir;
    }

    tracing::debug!(db = %cli.db.display(), snapshots = %config.snapshots_dir.display(), "starting");

    let api = OrgReconApi::new(cli.db.clone(), config);
    match cli.command {
        Command::Db { command } => run_db(command, &cli.db, &api),
        Command::Validate(args) => {
            let input = InputTables::load(&args.input)?;
            let result = api.validate(&input);
            emit_json(serde_json::json!({
                "valid": result.is_valid(),
                "summary": result.summary(),
                "errors": result.errors,
                "warnings": result.warnings
            }))
        }
        Command::Import(args) => {
            let input = InputTables::load(&args.input)?;
            let report = api.import(&input, &file_label(&args.input), args.note.as_deref())?;
            emit(&report, "import report")
        }
        Command::PreviewImport(args) => {
            let input = InputTables::load(&args.input)?;
            emit(&api.preview_import(&input)?, "import preview")
        }
        Command::Diff(args) => {
            let old = InputTables::load(&args.old)?;
            let new = InputTables::load(&args.new)?;
            let diff = api.diff(&old, &new)?;
            emit_json(serde_json::json!({
                "summary": [diff.persons.summary(), diff.structures.summary()],
                "severity": diff.severity_summary(),
                "diff": diff
            }))
        }
        Command::History { command } => match command {
            HistoryCommand::Imports => emit(&api.import_history()?, "import history"),
            HistoryCommand::Audit(args) => emit(&api.audit_history(args.limit)?, "audit log"),
            HistoryCommand::Merges => emit(&api.merge_history()?, "merge history"),
        },
        Command::Merge { command } => run_merge(command, &api),
        Command::Snapshot { command } => run_snapshot(command, &api),
        Command::Changes { command } => run_changes(command, &api),
    }
}

fn run_db(command: DbCommand, db: &Path, api: &OrgReconApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?, "migrate result"),
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?, "integrity report"),
    }
}

fn run_merge(command: MergeCommand, api: &OrgReconApi) -> Result<()> {
    match command {
        MergeCommand::Preview(args) => {
            let request = merge_request(&args)?;
            emit(&api.merge_preview(&request)?, "merge plan")
        }
        MergeCommand::Apply(args) => {
            let request = merge_request(&args.merge)?;
            let options = ApplyOptions {
                selected: selection(args.select),
                insert_new: args.insert_new,
            };
            emit(&api.merge_apply(&request, &options)?, "merge report")
        }
    }
}

fn merge_request(args: &MergeArgs) -> Result<MergeRequest> {
    let kind = RecordKind::from(args.kind);
    let input = InputTables::load(&args.input)?;
    let resolutions = match &args.resolutions {
        Some(path) => read_json::<Vec<ConflictResolution>>(path)?,
        None => Vec::new(),
    };
    Ok(MergeRequest {
        record_kind: kind,
        source: input.table(kind).clone(),
        source_filename: file_label(&args.input),
        resolutions,
    })
}

fn run_snapshot(command: SnapshotCommand, api: &OrgReconApi) -> Result<()> {
    match command {
        SnapshotCommand::List => {
            let snapshots = api.snapshot_list()?;
            emit_json(serde_json::json!({
                "count": snapshots.len(),
                "snapshots": snapshots
            }))
        }
        SnapshotCommand::Create(args) => emit(&api.snapshot_create(args.note.as_deref())?, "snapshot"),
        SnapshotCommand::Checkpoint(args) => {
            emit(&api.snapshot_checkpoint(args.note.as_deref())?, "snapshot")
        }
        SnapshotCommand::Milestone(args) => {
            emit(&api.snapshot_milestone(&args.note, &args.description)?, "snapshot")
        }
        SnapshotCommand::Restore(args) => {
            emit(&api.snapshot_restore(args.id, !args.no_safety_backup)?, "restore report")
        }
        SnapshotCommand::Delete(args) => {
            api.snapshot_delete(args.id)?;
            emit_json(serde_json::json!({ "deleted": args.id }))
        }
        SnapshotCommand::Cleanup(args) => {
            let deleted = api.snapshot_cleanup(args.keep)?;
            emit_json(serde_json::json!({
                "deleted": deleted,
                "keep_last": args.keep.unwrap_or(api.config().keep_last_snapshots)
            }))
        }
        SnapshotCommand::Compare(args) => {
            let diff = api.snapshot_compare(args.old, args.new)?;
            emit_json(serde_json::json!({
                "old_id": args.old,
                "new_id": args.new,
                "summary": [diff.persons.summary(), diff.structures.summary()],
                "diff": diff
            }))
        }
    }
}

fn run_changes(command: ChangesCommand, api: &OrgReconApi) -> Result<()> {
    match command {
        ChangesCommand::Plan(args) => {
            let text = fs::read_to_string(&args.command).with_context(|| {
                format!("failed to read command file {}", args.command.display())
            })?;
            let command = StructuredCommand::from_llm_json(&text).map_err(|err| anyhow!("{err}"))?;
            let plan = api.changes_plan(&command)?;
            emit_json(serde_json::json!({
                "message": command.message,
                "operation": plan.operation,
                "matched": plan.matched,
                "truncated": plan.truncated,
                "proposals": plan.proposals
            }))
        }
        ChangesCommand::Apply(args) => {
            let plan = read_json::<ChangePlan>(&args.plan)?;
            let selected = selection(args.select);
            emit(&api.changes_apply(&plan.proposals, selected.as_ref())?, "change report")
        }
    }
}

fn selection(ids: Vec<String>) -> Option<BTreeSet<String>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.into_iter().collect())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| path.display().to_string(), str::to_string)
}
