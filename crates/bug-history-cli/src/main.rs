use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bug_history_core::{
    replay_events, sort_for_delivery, BugDocument, ChangeEvent, Diagnostic, EmittedVersion,
    ReplayConfig, ReplaySettings, ReplayStats, DEFAULT_LOOK_BACK_MS,
};
use bug_history_store_sqlite::{
    read_events_file, retain_bugs_touched_since, write_ndjson_file, ReplayRunRecord, SqliteStore,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "bzh")]
#[command(about = "Bug history reconstruction CLI")]
struct Cli {
    #[arg(long, default_value = "./bug_history.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Replay(Box<ReplayArgs>),
    Versions {
        #[command(subcommand)]
        command: Box<VersionsCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum EventsCommand {
    Import(EventsImportArgs),
}

#[derive(Debug, Args)]
struct EventsImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// Replay this NDJSON file instead of the stored change log.
    #[arg(long = "in")]
    input: Option<PathBuf>,
    /// YAML or JSON replay settings.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    start_time: Option<i64>,
    #[arg(long)]
    end_time: Option<i64>,
    /// `A=B` identity alias; repeatable.
    #[arg(long = "alias")]
    aliases: Vec<String>,
    /// Start from the last recorded run's high-water mark and replay only
    /// the bugs touched since then, from `--in` or the stored log.
    #[arg(long, default_value_t = false, conflicts_with = "start_time")]
    incremental: bool,
    #[arg(long)]
    look_back_ms: Option<i64>,
    /// Also write the emitted documents as NDJSON.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum VersionsCommand {
    List(VersionsListArgs),
    Export(VersionsExportArgs),
}

#[derive(Debug, Args)]
struct VersionsListArgs {
    #[arg(long)]
    bug_id: i64,
}

#[derive(Debug, Args)]
struct VersionsExportArgs {
    #[arg(long)]
    out: PathBuf,
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

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Events { command } => run_events(*command, &mut store),
        Command::Replay(args) => run_replay(&args, &mut store),
        Command::Versions { command } => run_versions(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_events(command: EventsCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        EventsCommand::Import(args) => {
            store.migrate()?;
            let events = read_events_file(&args.input)?;
            let imported = store.import_events(&events)?;
            tracing::info!(imported, input = %args.input.display(), "change events imported");
            emit_json(serde_json::json!({
                "input": args.input.display().to_string(),
                "imported_events": imported
            }))
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<ReplaySettings> {
    let Some(path) = path else {
        return Ok(ReplaySettings::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read replay settings {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse replay settings {}", path.display()))
}

/// Command line flags win over the settings file; aliases are appended.
fn apply_overrides(settings: &mut ReplaySettings, args: &ReplayArgs) {
    if let Some(start_time) = args.start_time {
        settings.start_time = start_time;
    }
    if args.end_time.is_some() {
        settings.end_time = args.end_time;
    }
    if args.look_back_ms.is_some() {
        settings.look_back_ms = args.look_back_ms;
    }
    for alias in &args.aliases {
        if !settings.alias_list.trim().is_empty() {
            settings.alias_list.push(',');
        }
        settings.alias_list.push_str(alias);
    }
}

fn run_replay(args: &ReplayArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let mut settings = load_settings(args.config.as_deref())?;
    apply_overrides(&mut settings, args);

    let mut since = None;
    let mut resumed_from = None;
    if args.incremental {
        if let Some(last) = store.last_run()? {
            resumed_from = Some(last.run_id.clone());
            if let Some(high_water_ts) = last.stats.high_water_ts {
                let look_back_ms = settings.look_back_ms.unwrap_or(DEFAULT_LOOK_BACK_MS);
                let resume_at = high_water_ts.saturating_sub(look_back_ms);
                if settings.start_time != 0 && settings.start_time != resume_at {
                    tracing::warn!(
                        configured = settings.start_time,
                        resume_at,
                        "incremental replay ignores the configured start_time"
                    );
                }
                settings.start_time = resume_at;
                since = Some(settings.start_time);
            }
        }
    }

    let config = ReplayConfig::from_settings(&settings)
        .map_err(|err| anyhow!("invalid replay settings: {err}"))?;

    let (source, events) = match &args.input {
        Some(input) => {
            let mut events = read_events_file(input)?;
            if let Some(since) = since {
                retain_bugs_touched_since(&mut events, since);
            }
            sort_for_delivery(&mut events);
            ("file", events)
        }
        None => ("store", store.read_events(since)?),
    };
    tracing::info!(source, events = events.len(), start_time = config.start_time(), "replaying");

    let (versions, diagnostics, stats) = replay(config, &events);
    let versions_written = store.write_versions(&versions)?;

    let out = match &args.out {
        Some(out) => {
            let documents: Vec<&BugDocument> =
                versions.iter().map(|version| &version.document).collect();
            let (sha256, records) = write_ndjson_file(out, &documents)?;
            serde_json::json!({
                "path": out.display().to_string(),
                "sha256": sha256,
                "records": records
            })
        }
        None => Value::Null,
    };

    let run = ReplayRunRecord::new(settings.start_time, settings.end_time, stats)?;
    store.record_run(&run)?;

    emit_json(serde_json::json!({
        "run_id": run.run_id,
        "source": source,
        "incremental": args.incremental,
        "resumed_from": resumed_from,
        "start_time": settings.start_time,
        "end_time": settings.end_time,
        "stats": stats,
        "versions_written": versions_written,
        "out": out,
        "diagnostics": diagnostics
    }))
}

fn replay(
    config: ReplayConfig,
    events: &[ChangeEvent],
) -> (Vec<EmittedVersion>, Vec<Diagnostic>, ReplayStats) {
    let (histories, stats) = replay_events(config, events);
    let mut versions = Vec::new();
    let mut diagnostics = Vec::new();
    for history in histories {
        versions.extend(history.versions);
        diagnostics.extend(history.diagnostics);
    }
    (versions, diagnostics, stats)
}

fn run_versions(command: VersionsCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        VersionsCommand::List(args) => {
            let versions = store.list_versions(args.bug_id)?;
            emit_json(serde_json::json!({
                "bug_id": args.bug_id,
                "versions": versions
            }))
        }
        VersionsCommand::Export(args) => {
            let manifest = store.export_versions(&args.out)?;
            emit_json(serde_json::to_value(manifest)?)
        }
    }
}
