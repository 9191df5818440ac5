use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use orgrecon_core::{
    record_key, OrgDataset, PersonRecord, RecordKind, Row, Severity, StructureRecord,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod snapshot;
mod target;

pub use snapshot::{
    SnapshotInfo, SnapshotManager, SnapshotMetadata, SnapshotRequest, SnapshotRestore,
    DEFAULT_KEEP_LAST, SOURCE_AUTO_BACKUP, SOURCE_CHECKPOINT, SOURCE_MANUAL, SOURCE_MILESTONE,
    SOURCE_PRE_MERGE,
};
pub use target::StoreMergeTarget;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS persons (
  tax_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  code TEXT NOT NULL,
  org_unit TEXT NOT NULL,
  record_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS structures (
  code TEXT PRIMARY KEY,
  description TEXT NOT NULL,
  parent_code TEXT,
  record_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS import_versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_filename TEXT NOT NULL,
  user_note TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  persons_count INTEGER NOT NULL DEFAULT 0,
  structures_count INTEGER NOT NULL DEFAULT 0,
  snapshot_path TEXT,
  failure TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  import_version_id INTEGER,
  recorded_at TEXT NOT NULL,
  record_kind TEXT NOT NULL CHECK (record_kind IN ('person','structure')),
  record_key TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('insert','update','delete')),
  field_name TEXT,
  old_value TEXT,
  new_value TEXT,
  severity TEXT CHECK (severity IN ('CRITICAL','HIGH','MEDIUM','LOW')),
  FOREIGN KEY (import_version_id) REFERENCES import_versions(id)
);

CREATE INDEX IF NOT EXISTS idx_persons_org_unit ON persons(org_unit);
CREATE INDEX IF NOT EXISTS idx_structures_parent ON structures(parent_code);
CREATE INDEX IF NOT EXISTS idx_audit_log_record ON audit_log(record_kind, record_key);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS merge_audit (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  recorded_at TEXT NOT NULL,
  record_kind TEXT NOT NULL CHECK (record_kind IN ('person','structure')),
  key_field TEXT NOT NULL,
  source_filename TEXT NOT NULL,
  matched INTEGER NOT NULL,
  new_count INTEGER NOT NULL,
  gap_count INTEGER NOT NULL,
  critical_gaps INTEGER NOT NULL,
  coverage_pct REAL,
  applied INTEGER NOT NULL,
  inserted INTEGER NOT NULL,
  skipped INTEGER NOT NULL,
  error_count INTEGER NOT NULL,
  strategies_json TEXT NOT NULL,
  conflict_resolutions_json TEXT NOT NULL,
  snapshot_path TEXT,
  notes TEXT
);
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Running,
    Completed,
    Failed,
}

impl ImportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportVersion {
    pub id: i64,
    pub source_filename: String,
    pub user_note: Option<String>,
    pub status: ImportStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub persons_count: i64,
    pub structures_count: i64,
    pub snapshot_path: Option<String>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One field-level entry of the change history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub record_kind: RecordKind,
    pub record_key: String,
    pub action: AuditAction,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRow {
    pub id: i64,
    pub import_version_id: Option<i64>,
    pub recorded_at: String,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// Outcome of one merge run, as kept in `merge_audit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeAudit {
    pub record_kind: RecordKind,
    pub key_field: String,
    pub source_filename: String,
    pub matched: usize,
    pub new_count: usize,
    pub gap_count: usize,
    pub critical_gaps: usize,
    pub coverage_pct: Option<f64>,
    pub applied: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub error_count: usize,
    pub strategies: serde_json::Value,
    pub conflict_resolutions: serde_json::Value,
    pub snapshot_path: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeAuditRow {
    pub id: i64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub audit: MergeAudit,
}

impl SqliteStore {
    /// Open a `SQLite` master-data store and configure required runtime pragmas.
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

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            tracing::info!(version = target, "applied schema migration");
        }

        Ok(())
    }

    /// Load both record collections in key order.
    ///
    /// # Errors
    /// Returns an error when a query fails or a stored record cannot be decoded.
    pub fn load_dataset(&self) -> Result<OrgDataset> {
        let persons = self.load_json_rows::<PersonRecord>("SELECT record_json FROM persons ORDER BY tax_id")?;
        let structures =
            self.load_json_rows::<StructureRecord>("SELECT record_json FROM structures ORDER BY code")?;
        Ok(OrgDataset { persons, structures })
    }

    fn load_json_rows<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).with_context(|| format!("failed to prepare {sql}"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            out.push(serde_json::from_str(&json).context("failed to decode stored record json")?);
        }
        Ok(out)
    }

    /// Replace every stored record with `dataset` in one transaction.
    ///
    /// # Errors
    /// Returns an error when any write fails; nothing is changed in that case.
    pub fn replace_dataset(&mut self, dataset: &OrgDataset) -> Result<()> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start replace transaction")?;
        replace_dataset_in(&tx, dataset, &now)?;
        tx.commit().context("failed to commit replace transaction")?;
        Ok(())
    }

    /// Replace the dataset, write its audit entries and complete import
    /// version `id` in one transaction.
    ///
    /// # Errors
    /// Returns an error when the version does not exist or any write fails;
    /// nothing is changed in that case.
    pub fn commit_import(
        &mut self,
        id: i64,
        dataset: &OrgDataset,
        entries: &[AuditEntry],
        snapshot_path: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start import transaction")?;
        replace_dataset_in(&tx, dataset, &now)?;
        insert_audit_in(&tx, Some(id), entries, &now)?;
        complete_import_in(
            &tx,
            id,
            dataset.persons.len(),
            dataset.structures.len(),
            snapshot_path,
            &now,
        )?;
        tx.commit().with_context(|| format!("failed to commit import version {id}"))?;
        Ok(())
    }

    /// Delete `deleted_keys`, upsert `rows` and append `entries` in one
    /// transaction.
    ///
    /// # Errors
    /// Returns an error when a row has no key or any write fails; nothing is
    /// changed in that case.
    pub fn apply_record_changes(
        &mut self,
        kind: RecordKind,
        deleted_keys: &[String],
        rows: &[Row],
        entries: &[AuditEntry],
    ) -> Result<()> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start change transaction")?;
        for key in deleted_keys {
            delete_record_in(&tx, kind, key)?;
        }
        for row in rows {
            upsert_row_in(&tx, kind, row, &now)?;
        }
        insert_audit_in(&tx, None, entries, &now)?;
        tx.commit().context("failed to commit change transaction")?;
        Ok(())
    }

    /// Insert or update one person by tax id.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_person(&mut self, person: &PersonRecord) -> Result<()> {
        upsert_person_in(&self.conn, person, &now_rfc3339()?)
    }

    /// Insert or update one structure by code.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn upsert_structure(&mut self, structure: &StructureRecord) -> Result<()> {
        upsert_structure_in(&self.conn, structure, &now_rfc3339()?)
    }

    /// Insert or update one loosely typed row as a record of `kind`.
    ///
    /// # Errors
    /// Returns an error when the row has no key or the write fails.
    pub fn upsert_row(&mut self, kind: RecordKind, row: &Row) -> Result<()> {
        upsert_row_in(&self.conn, kind, row, &now_rfc3339()?)
    }

    /// Delete one record by key. Returns whether a row was removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&mut self, kind: RecordKind, key: &str) -> Result<bool> {
        delete_record_in(&self.conn, kind, key)
    }

    /// Count stored persons and structures.
    ///
    /// # Errors
    /// Returns an error when the count queries fail.
    pub fn counts(&self) -> Result<(i64, i64)> {
        let persons = self
            .conn
            .query_row("SELECT COUNT(*) FROM persons", [], |row| row.get::<_, i64>(0))
            .context("failed to count persons")?;
        let structures = self
            .conn
            .query_row("SELECT COUNT(*) FROM structures", [], |row| row.get::<_, i64>(0))
            .context("failed to count structures")?;
        Ok((persons, structures))
    }

    /// Open an import version in `running` state and return its id.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn begin_import(&mut self, source_filename: &str, user_note: Option<&str>) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO import_versions(source_filename, user_note, status, started_at)
                 VALUES (?1, ?2, 'running', ?3)",
                params![source_filename, user_note, now_rfc3339()?],
            )
            .context("failed to insert import version")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Mark an import version completed with its record counts.
    ///
    /// # Errors
    /// Returns an error when the version does not exist or the update fails.
    pub fn complete_import(
        &mut self,
        id: i64,
        persons_count: usize,
        structures_count: usize,
        snapshot_path: Option<&str>,
    ) -> Result<()> {
        complete_import_in(&self.conn, id, persons_count, structures_count, snapshot_path, &now_rfc3339()?)
    }

    /// Mark an import version failed.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn fail_import(&mut self, id: i64, failure: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE import_versions SET status = 'failed', completed_at = ?2, failure = ?3
                 WHERE id = ?1",
                params![id, now_rfc3339()?, failure],
            )
            .with_context(|| format!("failed to mark import version {id} as failed"))?;
        Ok(())
    }

    /// List import versions, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored status is unknown.
    pub fn list_imports(&self) -> Result<Vec<ImportVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_filename, user_note, status, started_at, completed_at,
                    persons_count, structures_count, snapshot_path, failure
             FROM import_versions
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, source_filename, user_note, status, started_at, completed_at, persons, structures, snapshot_path, failure) =
                row?;
            let status = ImportStatus::parse(&status)
                .ok_or_else(|| anyhow!("invalid import status in database: {status}"))?;
            out.push(ImportVersion {
                id,
                source_filename,
                user_note,
                status,
                started_at,
                completed_at,
                persons_count: persons,
                structures_count: structures,
                snapshot_path,
                failure,
            });
        }
        Ok(out)
    }

    /// Append audit entries, optionally tied to an import version.
    ///
    /// # Errors
    /// Returns an error when any insert fails; no entry is kept in that case.
    pub fn record_audit(&mut self, import_version_id: Option<i64>, entries: &[AuditEntry]) -> Result<()> {
        let now = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start audit transaction")?;
        insert_audit_in(&tx, import_version_id, entries, &now)?;
        tx.commit().context("failed to commit audit entries")?;
        Ok(())
    }

    /// Most recent audit entries first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored enum value is unknown.
    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, import_version_id, recorded_at, record_kind, record_key, action,
                    field_name, old_value, new_value, severity
             FROM audit_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, import_version_id, recorded_at, kind, record_key, action, field_name, old_value, new_value, severity) =
                row?;
            let record_kind = RecordKind::parse(&kind)
                .ok_or_else(|| anyhow!("invalid record kind in database: {kind}"))?;
            let action = AuditAction::parse(&action)
                .ok_or_else(|| anyhow!("invalid audit action in database: {action}"))?;
            let severity = match severity {
                Some(raw) => Some(
                    Severity::parse(&raw)
                        .ok_or_else(|| anyhow!("invalid severity in database: {raw}"))?,
                ),
                None => None,
            };
            out.push(AuditRow {
                id,
                import_version_id,
                recorded_at,
                entry: AuditEntry {
                    record_kind,
                    record_key,
                    action,
                    field_name,
                    old_value,
                    new_value,
                    severity,
                },
            });
        }
        Ok(out)
    }

    /// Persist one merge run and return its id.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn record_merge_audit(&mut self, audit: &MergeAudit) -> Result<i64> {
        let count = |value: usize| i64::try_from(value).unwrap_or(i64::MAX);
        self.conn
            .execute(
                "INSERT INTO merge_audit(
                    recorded_at, record_kind, key_field, source_filename, matched, new_count,
                    gap_count, critical_gaps, coverage_pct, applied, inserted, skipped,
                    error_count, strategies_json, conflict_resolutions_json, snapshot_path, notes
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    now_rfc3339()?,
                    audit.record_kind.as_str(),
                    audit.key_field,
                    audit.source_filename,
                    count(audit.matched),
                    count(audit.new_count),
                    count(audit.gap_count),
                    count(audit.critical_gaps),
                    audit.coverage_pct,
                    count(audit.applied),
                    count(audit.inserted),
                    count(audit.skipped),
                    count(audit.error_count),
                    serde_json::to_string(&audit.strategies).context("failed to encode strategies")?,
                    serde_json::to_string(&audit.conflict_resolutions)
                        .context("failed to encode conflict resolutions")?,
                    audit.snapshot_path,
                    audit.notes,
                ],
            )
            .context("failed to insert merge audit")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Merge runs, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored value cannot be decoded.
    pub fn list_merge_audits(&self) -> Result<Vec<MergeAuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recorded_at, record_kind, key_field, source_filename, matched, new_count,
                    gap_count, critical_gaps, coverage_pct, applied, inserted, skipped,
                    error_count, strategies_json, conflict_resolutions_json, snapshot_path, notes
             FROM merge_audit
             ORDER BY id DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let count = |index: usize| -> Result<usize> {
                let raw = row.get::<_, i64>(index)?;
                usize::try_from(raw).with_context(|| format!("negative count in merge_audit: {raw}"))
            };
            let kind: String = row.get(2)?;
            let strategies: String = row.get(14)?;
            let resolutions: String = row.get(15)?;
            out.push(MergeAuditRow {
                id: row.get(0)?,
                recorded_at: row.get(1)?,
                audit: MergeAudit {
                    record_kind: RecordKind::parse(&kind)
                        .ok_or_else(|| anyhow!("invalid record kind in database: {kind}"))?,
                    key_field: row.get(3)?,
                    source_filename: row.get(4)?,
                    matched: count(5)?,
                    new_count: count(6)?,
                    gap_count: count(7)?,
                    critical_gaps: count(8)?,
                    coverage_pct: row.get(9)?,
                    applied: count(10)?,
                    inserted: count(11)?,
                    skipped: count(12)?,
                    error_count: count(13)?,
                    strategies: serde_json::from_str(&strategies)
                        .context("failed to decode strategies_json")?,
                    conflict_resolutions: serde_json::from_str(&resolutions)
                        .context("failed to decode conflict_resolutions_json")?,
                    snapshot_path: row.get(16)?,
                    notes: row.get(17)?,
                },
            });
        }
        Ok(out)
    }

    /// Look up one stored record as JSON, `None` when absent.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_record_json(&self, kind: RecordKind, key: &str) -> Result<Option<String>> {
        let sql = match kind {
            RecordKind::Person => "SELECT record_json FROM persons WHERE tax_id = ?1",
            RecordKind::Structure => "SELECT record_json FROM structures WHERE code = ?1",
        };
        self.conn
            .query_row(sql, params![key], |row| row.get::<_, String>(0))
            .optional()
            .with_context(|| format!("failed to read {} {key}", kind.as_str()))
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn replace_dataset_in(conn: &Connection, dataset: &OrgDataset, now: &str) -> Result<()> {
    conn.execute("DELETE FROM persons", []).context("failed to clear persons")?;
    conn.execute("DELETE FROM structures", []).context("failed to clear structures")?;
    for person in &dataset.persons {
        upsert_person_in(conn, person, now)?;
    }
    for structure in &dataset.structures {
        upsert_structure_in(conn, structure, now)?;
    }
    Ok(())
}

fn upsert_row_in(conn: &Connection, kind: RecordKind, row: &Row, now: &str) -> Result<()> {
    if record_key(row, kind.key_field()).is_none() {
        return Err(anyhow!("{} row has no {}", kind.as_str(), kind.key_field()));
    }
    match kind {
        RecordKind::Person => upsert_person_in(conn, &PersonRecord::from_row(row), now),
        RecordKind::Structure => upsert_structure_in(conn, &StructureRecord::from_row(row), now),
    }
}

fn delete_record_in(conn: &Connection, kind: RecordKind, key: &str) -> Result<bool> {
    let sql = match kind {
        RecordKind::Person => "DELETE FROM persons WHERE tax_id = ?1",
        RecordKind::Structure => "DELETE FROM structures WHERE code = ?1",
    };
    let removed = conn
        .execute(sql, params![key])
        .with_context(|| format!("failed to delete {} {key}", kind.as_str()))?;
    Ok(removed > 0)
}

fn complete_import_in(
    conn: &Connection,
    id: i64,
    persons_count: usize,
    structures_count: usize,
    snapshot_path: Option<&str>,
    now: &str,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE import_versions
             SET status = 'completed', completed_at = ?2, persons_count = ?3,
                 structures_count = ?4, snapshot_path = ?5
             WHERE id = ?1",
            params![
                id,
                now,
                i64::try_from(persons_count).unwrap_or(i64::MAX),
                i64::try_from(structures_count).unwrap_or(i64::MAX),
                snapshot_path,
            ],
        )
        .with_context(|| format!("failed to complete import version {id}"))?;
    if updated == 0 {
        return Err(anyhow!("import version {id} does not exist"));
    }
    Ok(())
}

fn insert_audit_in(
    conn: &Connection,
    import_version_id: Option<i64>,
    entries: &[AuditEntry],
    now: &str,
) -> Result<()> {
    for entry in entries {
        conn.execute(
            "INSERT INTO audit_log(
                import_version_id, recorded_at, record_kind, record_key, action,
                field_name, old_value, new_value, severity
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                import_version_id,
                now,
                entry.record_kind.as_str(),
                entry.record_key,
                entry.action.as_str(),
                entry.field_name,
                entry.old_value,
                entry.new_value,
                entry.severity.map(Severity::as_str),
            ],
        )
        .context("failed to insert audit entry")?;
    }
    Ok(())
}

fn upsert_person_in(conn: &Connection, person: &PersonRecord, now: &str) -> Result<()> {
    let json = serde_json::to_string(person).context("failed to encode person record")?;
    conn.execute(
        "INSERT INTO persons(tax_id, display_name, code, org_unit, record_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(tax_id) DO UPDATE SET
           display_name = excluded.display_name,
           code = excluded.code,
           org_unit = excluded.org_unit,
           record_json = excluded.record_json,
           updated_at = excluded.updated_at",
        params![person.tax_id, person.display_name, person.code, person.org_unit, json, now],
    )
    .with_context(|| format!("failed to write person {}", person.tax_id))?;
    Ok(())
}

fn upsert_structure_in(conn: &Connection, structure: &StructureRecord, now: &str) -> Result<()> {
    let json = serde_json::to_string(structure).context("failed to encode structure record")?;
    conn.execute(
        "INSERT INTO structures(code, description, parent_code, record_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(code) DO UPDATE SET
           description = excluded.description,
           parent_code = excluded.parent_code,
           record_json = excluded.record_json,
           updated_at = excluded.updated_at",
        params![structure.code, structure.description, structure.parent_code, json, now],
    )
    .with_context(|| format!("failed to write structure {}", structure.code))?;
    Ok(())
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

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn sample_dataset() -> OrgDataset {
        let mut person = PersonRecord {
            tax_id: "RSSMRA80A01H501Z".to_string(),
            display_name: "Mario Rossi".to_string(),
            code: "1001".to_string(),
            org_unit: "S1".to_string(),
            site: Some("Rome".to_string()),
            ..PersonRecord::default()
        };
        person.roles.approver = Some("SI".to_string());
        person.extra.insert("badge".to_string(), serde_json::json!(77));
        OrgDataset {
            persons: vec![person],
            structures: vec![
                StructureRecord::new("ROOT", "Company", None),
                StructureRecord::new("S1", "Sales", Some("ROOT")),
            ],
        }
    }

    #[test]
    fn migrate_reaches_latest_and_is_idempotent() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn replace_and_load_dataset_round_trip() -> Result<()> {
        let mut store = migrated_store()?;
        let dataset = sample_dataset();
        store.replace_dataset(&dataset)?;
        assert_eq!(store.load_dataset()?, dataset);
        assert_eq!(store.counts()?, (1, 2));

        store.replace_dataset(&OrgDataset::default())?;
        assert_eq!(store.counts()?, (0, 0));
        Ok(())
    }

    #[test]
    fn upsert_and_delete_single_records() -> Result<()> {
        let mut store = migrated_store()?;
        store.replace_dataset(&sample_dataset())?;

        let mut renamed = StructureRecord::new("S1", "Sales EU", Some("ROOT"));
        renamed.site = Some("Milan".to_string());
        store.upsert_structure(&renamed)?;
        let loaded = store.load_dataset()?;
        assert_eq!(loaded.structures[1], renamed);

        assert!(store.delete_record(RecordKind::Person, "RSSMRA80A01H501Z")?);
        assert!(!store.delete_record(RecordKind::Person, "RSSMRA80A01H501Z")?);
        assert!(store.get_record_json(RecordKind::Person, "RSSMRA80A01H501Z")?.is_none());
        Ok(())
    }

    #[test]
    fn import_versions_track_status() -> Result<()> {
        let mut store = migrated_store()?;
        let first = store.begin_import("org_2026.xlsx", Some("quarterly"))?;
        store.complete_import(first, 10, 3, Some("snapshots/snapshot_1.json"))?;
        let second = store.begin_import("org_bad.xlsx", None)?;
        store.fail_import(second, "validation failed")?;

        let imports = store.list_imports()?;
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].id, second);
        assert_eq!(imports[0].status, ImportStatus::Failed);
        assert_eq!(imports[1].status, ImportStatus::Completed);
        assert_eq!(imports[1].persons_count, 10);
        assert!(store.complete_import(999, 0, 0, None).is_err());
        Ok(())
    }

    #[test]
    fn commit_import_is_all_or_nothing() -> Result<()> {
        let mut store = migrated_store()?;
        let entry = AuditEntry {
            record_kind: RecordKind::Structure,
            record_key: "S1".to_string(),
            action: AuditAction::Insert,
            field_name: None,
            old_value: None,
            new_value: None,
            severity: None,
        };
        assert!(store.commit_import(404, &sample_dataset(), std::slice::from_ref(&entry), None).is_err());
        assert_eq!(store.counts()?, (0, 0));
        assert!(store.list_audit(10)?.is_empty());

        let id = store.begin_import("org.json", None)?;
        store.commit_import(id, &sample_dataset(), std::slice::from_ref(&entry), Some("snap.json"))?;
        assert_eq!(store.counts()?, (1, 2));
        let imports = store.list_imports()?;
        assert_eq!(imports[0].status, ImportStatus::Completed);
        assert_eq!(imports[0].structures_count, 2);
        assert_eq!(store.list_audit(10)?[0].import_version_id, Some(id));
        Ok(())
    }

    #[test]
    fn record_changes_roll_back_on_keyless_row() -> Result<()> {
        let mut store = migrated_store()?;
        store.replace_dataset(&sample_dataset())?;
        let keyless = StructureRecord::new("", "No code", None).to_row();
        let result =
            store.apply_record_changes(RecordKind::Structure, &["S1".to_string()], &[keyless], &[]);
        assert!(result.is_err());
        assert_eq!(store.counts()?, (1, 2));

        let renamed = StructureRecord::new("S2", "Support", Some("ROOT")).to_row();
        store.apply_record_changes(RecordKind::Structure, &["S1".to_string()], &[renamed], &[])?;
        let codes: Vec<_> =
            store.load_dataset()?.structures.into_iter().map(|structure| structure.code).collect();
        assert!(codes.contains(&"S2".to_string()));
        assert!(!codes.contains(&"S1".to_string()));
        Ok(())
    }

    #[test]
    fn audit_entries_keep_severity() -> Result<()> {
        let mut store = migrated_store()?;
        let entry = AuditEntry {
            record_kind: RecordKind::Structure,
            record_key: "S1".to_string(),
            action: AuditAction::Update,
            field_name: Some("parent_code".to_string()),
            old_value: Some("ROOT".to_string()),
            new_value: Some("S2".to_string()),
            severity: Some(Severity::High),
        };
        store.record_audit(None, std::slice::from_ref(&entry))?;
        let rows = store.list_audit(10)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entry, entry);
        Ok(())
    }

    #[test]
    fn merge_audit_round_trip() -> Result<()> {
        let mut store = migrated_store()?;
        let audit = MergeAudit {
            record_kind: RecordKind::Person,
            key_field: "tax_id".to_string(),
            source_filename: "update.json".to_string(),
            matched: 3,
            new_count: 1,
            gap_count: 0,
            critical_gaps: 0,
            coverage_pct: None,
            applied: 2,
            inserted: 1,
            skipped: 1,
            error_count: 0,
            strategies: serde_json::json!({"overwrite": 2}),
            conflict_resolutions: serde_json::json!([]),
            snapshot_path: Some("snapshots/snapshot_4.json".to_string()),
            notes: None,
        };
        let id = store.record_merge_audit(&audit)?;
        let rows = store.list_merge_audits()?;
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].audit, audit);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_ok_for_fresh_store() -> Result<()> {
        let store = migrated_store()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }
}
