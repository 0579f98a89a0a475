use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bug_history_core::{ChangeEvent, EmittedVersion, ReplayStats};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS change_events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  bug_id INTEGER NOT NULL,
  modified_ts INTEGER NOT NULL,
  modified_by TEXT NOT NULL,
  field_name TEXT NOT NULL,
  field_value TEXT NOT NULL,
  field_value_removed TEXT NOT NULL,
  attach_id TEXT NOT NULL,
  event_class INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bug_versions (
  version_id TEXT PRIMARY KEY,
  bug_id INTEGER NOT NULL,
  modified_ts INTEGER NOT NULL,
  expires_on INTEGER,
  bug_version_num INTEGER NOT NULL CHECK (bug_version_num >= 1),
  document_json TEXT NOT NULL,
  written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_events_delivery ON change_events(bug_id, event_class, modified_ts);
CREATE INDEX IF NOT EXISTS idx_change_events_modified_ts ON change_events(modified_ts);
CREATE INDEX IF NOT EXISTS idx_bug_versions_bug ON bug_versions(bug_id, modified_ts);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS replay_runs (
  run_id TEXT PRIMARY KEY,
  recorded_at TEXT NOT NULL,
  start_time INTEGER NOT NULL,
  end_time INTEGER,
  events_processed INTEGER NOT NULL,
  events_after_end_time INTEGER NOT NULL,
  sentinel_events INTEGER NOT NULL,
  entities INTEGER NOT NULL,
  versions_emitted INTEGER NOT NULL,
  diagnostics INTEGER NOT NULL,
  high_water_ts INTEGER
);
";

/// Historical diffs go newest first; everything else keeps arrival order.
const READ_EVENTS_SQL: &str = r"
SELECT bug_id, modified_ts, modified_by, field_name, field_value, field_value_removed,
       attach_id, event_class
FROM change_events
WHERE ?1 IS NULL
   OR bug_id IN (SELECT DISTINCT bug_id FROM change_events WHERE modified_ts >= ?1)
ORDER BY bug_id ASC,
         event_class ASC,
         CASE WHEN event_class = 9 THEN -modified_ts ELSE 0 END ASC,
         seq ASC
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// One persisted document. The document itself is kept as parsed JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredVersion {
    pub version_id: String,
    pub bug_id: i64,
    pub modified_ts: i64,
    pub expires_on: Option<i64>,
    pub bug_version_num: u32,
    pub document: serde_json::Value,
}

/// Row shape of a version export, one per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRow {
    #[serde(rename = "_id")]
    pub id: String,
    pub bug_id: i64,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

/// Ledger entry for one replay run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayRunRecord {
    pub run_id: String,
    pub recorded_at: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub stats: ReplayStats,
}

impl ReplayRunRecord {
    /// # Errors
    /// Returns an error when the current time cannot be formatted.
    pub fn new(start_time: i64, end_time: Option<i64>, stats: ReplayStats) -> Result<Self> {
        Ok(Self {
            run_id: Ulid::new().to_string(),
            recorded_at: now_rfc3339()?,
            start_time,
            end_time,
            stats,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed history store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            apply_migration(&mut self.conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }
        if version < 2 {
            apply_migration(&mut self.conn, 2, MIGRATION_002_SQL)?;
        }

        Ok(())
    }

    /// Append change events in arrival order.
    ///
    /// # Errors
    /// Returns an error when any insert in the transaction fails.
    pub fn import_events(&mut self, events: &[ChangeEvent]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO change_events(
                    bug_id, modified_ts, modified_by, field_name, field_value,
                    field_value_removed, attach_id, event_class
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.bug_id,
                    event.modified_ts,
                    event.modified_by,
                    event.field_name,
                    event.field_value,
                    event.field_value_removed,
                    event.attach_id,
                    event.event_class,
                ])
                .with_context(|| format!("failed to insert change event for bug {}", event.bug_id))?;
            }
        }
        tx.commit().context("failed to commit change events")?;
        Ok(events.len())
    }

    /// Every event of every bug touched at or after `since`, in replay
    /// delivery order. `None` reads the whole log.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn read_events(&self, since: Option<i64>) -> Result<Vec<ChangeEvent>> {
        let mut stmt = self.conn.prepare(READ_EVENTS_SQL)?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(ChangeEvent {
                bug_id: row.get(0)?,
                modified_ts: row.get(1)?,
                modified_by: row.get(2)?,
                field_name: row.get(3)?,
                field_value: row.get(4)?,
                field_value_removed: row.get(5)?,
                attach_id: row.get(6)?,
                event_class: row.get(7)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("failed to decode change event row")?);
        }
        Ok(events)
    }

    /// Upsert emitted documents by version id. A version written again
    /// replaces the earlier copy, which is how a reopened version gets its
    /// `expires_on` closed.
    ///
    /// # Errors
    /// Returns an error when a document cannot be serialized or written.
    pub fn write_versions(&mut self, versions: &[EmittedVersion]) -> Result<usize> {
        let written_at = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bug_versions(
                    version_id, bug_id, modified_ts, expires_on, bug_version_num,
                    document_json, written_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(version_id) DO UPDATE SET
                    bug_id = excluded.bug_id,
                    modified_ts = excluded.modified_ts,
                    expires_on = excluded.expires_on,
                    bug_version_num = excluded.bug_version_num,
                    document_json = excluded.document_json,
                    written_at = excluded.written_at",
            )?;
            for version in versions {
                let document_json = version
                    .document_json()
                    .with_context(|| format!("failed to serialize version {}", version.version_id))?;
                stmt.execute(params![
                    version.version_id,
                    version.bug_id,
                    version.document.modified_ts,
                    version.document.expires_on,
                    version.document.bug_version_num,
                    document_json,
                    written_at,
                ])
                .with_context(|| format!("failed to write version {}", version.version_id))?;
            }
        }
        tx.commit().context("failed to commit versions")?;
        Ok(versions.len())
    }

    /// Stored documents of one bug, oldest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored document is not JSON.
    pub fn list_versions(&self, bug_id: i64) -> Result<Vec<StoredVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT version_id, bug_id, modified_ts, expires_on, bug_version_num, document_json
             FROM bug_versions
             WHERE bug_id = ?1
             ORDER BY modified_ts ASC, version_id ASC",
        )?;
        let rows = stmt.query_map(params![bug_id], stored_version_row)?;
        collect_stored_versions(rows)
    }

    /// Write every stored document as NDJSON `{"_id", "bug_id", "json"}`
    /// rows plus a `<file>.manifest.json` digest next to it.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_versions(&self, out_file: &Path) -> Result<ExportManifest> {
        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create export directory {}", parent.display())
            })?;
        }

        let mut stmt = self.conn.prepare(
            "SELECT version_id, bug_id, modified_ts, expires_on, bug_version_num, document_json
             FROM bug_versions
             ORDER BY bug_id ASC, modified_ts ASC, version_id ASC",
        )?;
        let rows = stmt.query_map([], stored_version_row)?;
        let export_rows = collect_stored_versions(rows)?
            .into_iter()
            .map(|version| ExportRow {
                id: version.version_id,
                bug_id: version.bug_id,
                json: version.document,
            })
            .collect::<Vec<_>>();

        let (sha256, records) = write_ndjson_file(out_file, &export_rows)?;
        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest { path: file_label(out_file), sha256, records }],
        };

        let manifest_path = manifest_path(out_file);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Append one run to the replay ledger.
    ///
    /// # Errors
    /// Returns an error when a counter does not fit in SQLite or the insert fails.
    pub fn record_run(&mut self, run: &ReplayRunRecord) -> Result<()> {
        let stats = &run.stats;
        self.conn
            .execute(
                "INSERT INTO replay_runs(
                    run_id, recorded_at, start_time, end_time, events_processed,
                    events_after_end_time, sentinel_events, entities, versions_emitted,
                    diagnostics, high_water_ts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.run_id,
                    run.recorded_at,
                    run.start_time,
                    run.end_time,
                    count_to_sql(stats.events_processed)?,
                    count_to_sql(stats.events_after_end_time)?,
                    count_to_sql(stats.sentinel_events)?,
                    count_to_sql(stats.entities)?,
                    count_to_sql(stats.versions_emitted)?,
                    count_to_sql(stats.diagnostics)?,
                    stats.high_water_ts,
                ],
            )
            .with_context(|| format!("failed to record replay run {}", run.run_id))?;
        Ok(())
    }

    /// The most recently recorded run, if any.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn last_run(&self) -> Result<Option<ReplayRunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, recorded_at, start_time, end_time, events_processed,
                        events_after_end_time, sentinel_events, entities, versions_emitted,
                        diagnostics, high_water_ts
                 FROM replay_runs
                 ORDER BY rowid DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        [
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                        ],
                        row.get::<_, Option<i64>>(10)?,
                    ))
                },
            )
            .optional()
            .context("failed to read replay ledger")?;

        let Some((run_id, recorded_at, start_time, end_time, counts, high_water_ts)) = row else {
            return Ok(None);
        };
        let [
            events_processed,
            events_after_end_time,
            sentinel_events,
            entities,
            versions_emitted,
            diagnostics,
        ] = counts;
        Ok(Some(ReplayRunRecord {
            run_id,
            recorded_at,
            start_time,
            end_time,
            stats: ReplayStats {
                events_processed: count_from_sql(events_processed)?,
                events_after_end_time: count_from_sql(events_after_end_time)?,
                sentinel_events: count_from_sql(sentinel_events)?,
                entities: count_from_sql(entities)?,
                versions_emitted: count_from_sql(versions_emitted)?,
                diagnostics: count_from_sql(diagnostics)?,
                high_water_ts,
            },
        }))
    }
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration v{version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    record_schema_version(&tx, version)?;
    tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    Ok(())
}

fn stored_version_row(row: &Row<'_>) -> rusqlite::Result<(StoredVersion, String)> {
    Ok((
        StoredVersion {
            version_id: row.get(0)?,
            bug_id: row.get(1)?,
            modified_ts: row.get(2)?,
            expires_on: row.get(3)?,
            bug_version_num: row.get(4)?,
            document: serde_json::Value::Null,
        },
        row.get(5)?,
    ))
}

fn collect_stored_versions<I>(rows: I) -> Result<Vec<StoredVersion>>
where
    I: Iterator<Item = rusqlite::Result<(StoredVersion, String)>>,
{
    let mut versions = Vec::new();
    for row in rows {
        let (mut version, raw) = row.context("failed to decode bug version row")?;
        version.document = serde_json::from_str(&raw).with_context(|| {
            format!("failed to deserialize stored document {}", version.version_id)
        })?;
        versions.push(version);
    }
    Ok(versions)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn count_to_sql(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter {value} does not fit in sqlite"))
}

fn count_from_sql(value: i64) -> Result<usize> {
    usize::try_from(value).with_context(|| format!("stored counter {value} is negative"))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
}

/// `versions.ndjson` is described by `versions.ndjson.manifest.json`.
#[must_use]
pub fn manifest_path(out_file: &Path) -> PathBuf {
    let mut name = out_file.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

/// Write rows as NDJSON and return the SHA-256 of the bytes written plus the
/// row count.
///
/// # Errors
/// Returns an error when the file cannot be created or a row cannot be serialized.
pub fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

/// Read change events from an NDJSON file, skipping blank lines.
///
/// # Errors
/// Returns an error when the file cannot be read or a line is not a change event.
pub fn read_events_file(path: &Path) -> Result<Vec<ChangeEvent>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse change event on line {} of {}", index + 1, path.display())
        })?;
        events.push(event);
    }

    Ok(events)
}

/// Keep every event of the bugs touched at or after `since`, the selection
/// [`SqliteStore::read_events`] makes for stored events.
pub fn retain_bugs_touched_since(events: &mut Vec<ChangeEvent>, since: i64) {
    let touched: BTreeSet<i64> = events
        .iter()
        .filter(|event| event.modified_ts >= since)
        .map(|event| event.bug_id)
        .collect();
    events.retain(|event| touched.contains(&event.bug_id));
}
