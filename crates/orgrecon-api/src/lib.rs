use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use orgrecon_core::{
    apply_proposals, classify_row, compare_datasets, compare_tables, plan_changes,
    validate_dataset, validate_hierarchy, ApplyOptions, ChangeKind, ChangePlan, ChangeProposal,
    CommandInterpreter, DatasetDiff, DiffResult, GapAnalysis, HierarchyReport, MatchStats,
    MergeEngine, MergePreview, MergeResult, OperationType, OrgDataset, ProposalFailure, RecordKind,
    ReportRow, Row, SeveritySummary, StructuredCommand, Table, ValidationResult,
};
use orgrecon_store_sqlite::{
    AuditAction, AuditEntry, AuditRow, ImportVersion, IntegrityReport, MergeAudit, MergeAuditRow,
    SchemaStatus, SnapshotInfo, SnapshotManager, SnapshotRequest, SqliteStore, StoreMergeTarget,
    SOURCE_MANUAL,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod config;

pub use config::{MergeConfig, OrgReconConfig};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Person and structure tables read from one input document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputTables {
    pub persons: Table,
    pub structures: Table,
}

impl InputTables {
    /// Parse `{"persons": [...], "structures": [...]}` or a mixed `{"rows": [...]}`.
    ///
    /// Mixed rows are split by whether they carry a tax id.
    ///
    /// # Errors
    /// Returns an error when the text is not JSON of either shape.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).context("input is not valid JSON")?;
        let Value::Object(object) = value else {
            return Err(anyhow!("input must be a JSON object"));
        };

        if let Some(rows) = object.get("rows") {
            let mut out = Self::default();
            for row in rows_of(rows, "rows")? {
                match classify_row(&row) {
                    RecordKind::Person => out.persons.push(row),
                    RecordKind::Structure => out.structures.push(row),
                }
            }
            return Ok(out);
        }

        if !object.contains_key("persons") && !object.contains_key("structures") {
            return Err(anyhow!("input needs `persons`, `structures` or `rows`"));
        }
        let table = |key: &str| -> Result<Table> {
            match object.get(key) {
                Some(rows) => Ok(Table::from_rows(rows_of(rows, key)?)),
                None => Ok(Table::default()),
            }
        };
        Ok(Self { persons: table("persons")?, structures: table("structures")? })
    }

    /// Read and parse an input file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("invalid input file {}", path.display()))
    }

    #[must_use]
    pub fn table(&self, kind: RecordKind) -> &Table {
        match kind {
            RecordKind::Person => &self.persons,
            RecordKind::Structure => &self.structures,
        }
    }
}

fn rows_of(value: &Value, key: &str) -> Result<Vec<Row>> {
    let Value::Array(items) = value else {
        return Err(anyhow!("`{key}` must be an array"));
    };
    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(row) => Ok(row.clone()),
            _ => Err(anyhow!("`{key}[{index}]` must be an object")),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportReport {
    pub imported: bool,
    pub import_version_id: i64,
    pub summary: String,
    pub validation: ValidationResult,
    pub hierarchy: HierarchyReport,
    pub diff: Option<DatasetDiff>,
    pub snapshot: Option<SnapshotInfo>,
    pub snapshots_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportPreview {
    pub validation_summary: String,
    pub valid: bool,
    pub diff: DatasetDiff,
    pub severity: SeveritySummary,
    pub report: Vec<ReportRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictResolution {
    pub record_id: String,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeRequest {
    pub record_kind: RecordKind,
    pub source: Table,
    pub source_filename: String,
    #[serde(default)]
    pub resolutions: Vec<ConflictResolution>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergePlan {
    pub record_kind: RecordKind,
    pub stats: MatchStats,
    pub gaps: GapAnalysis,
    pub preview: MergePreview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeApplyReport {
    pub plan: MergePlan,
    pub result: MergeResult,
    pub audit_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreReport {
    pub restored: SnapshotInfo,
    pub safety_backup: Option<SnapshotInfo>,
    pub import_version_id: i64,
    pub persons: usize,
    pub structures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeApplyReport {
    pub record_kind: RecordKind,
    pub applied: Vec<String>,
    pub failed: Vec<ProposalFailure>,
    pub snapshot: Option<SnapshotInfo>,
    pub diff: DiffResult,
}

#[derive(Debug, Clone)]
pub struct OrgReconApi {
    db_path: PathBuf,
    config: OrgReconConfig,
}

impl OrgReconApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: OrgReconConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &OrgReconConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(&self.config.snapshots_dir)
    }

    fn engine(&self) -> MergeEngine {
        MergeEngine::new(self.config.merge.strategy_map()).with_gap_policy(self.config.gaps.clone())
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
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
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run database health checks.
    ///
    /// # Errors
    /// Returns an error when any check fails to execute.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        SqliteStore::open(&self.db_path)?.integrity_check()
    }

    /// Validate input tables without touching the store.
    #[must_use]
    pub fn validate(&self, input: &InputTables) -> ValidationResult {
        validate_dataset(&input.persons, &input.structures)
    }

    /// Replace the stored dataset with `input` when it validates cleanly.
    ///
    /// The current dataset is snapshotted first. The replacement, its audit
    /// entries and the completed import version are committed together.
    /// Inputs with validation errors, and any later failure, leave the
    /// version marked failed and the stored records unchanged.
    ///
    /// # Errors
    /// Returns an error when the store, snapshot directory or diff fails.
    pub fn import(
        &self,
        input: &InputTables,
        source_filename: &str,
        user_note: Option<&str>,
    ) -> Result<ImportReport> {
        let mut store = self.open_store()?;
        let version_id = store.begin_import(source_filename, user_note)?;
        let outcome = self.run_import(&mut store, version_id, input, source_filename);
        let mut report = settle_import(&mut store, version_id, outcome)?;
        if report.imported {
            report.snapshots_removed = match self.snapshots().cleanup(self.config.keep_last_snapshots) {
                Ok(removed) => removed,
                Err(err) => {
                    tracing::warn!(version_id, error = %err, "snapshot cleanup after import failed");
                    0
                }
            };
        }
        Ok(report)
    }

    fn run_import(
        &self,
        store: &mut SqliteStore,
        version_id: i64,
        input: &InputTables,
        source_filename: &str,
    ) -> Result<ImportReport> {
        let validation = self.validate(input);
        let hierarchy =
            validate_hierarchy(&OrgDataset::from_tables(&input.persons, &input.structures).structures);

        if !validation.is_valid() {
            let summary = validation.summary();
            store.fail_import(version_id, &summary)?;
            tracing::warn!(source = source_filename, %summary, "import rejected");
            return Ok(ImportReport {
                imported: false,
                import_version_id: version_id,
                summary,
                validation,
                hierarchy,
                diff: None,
                snapshot: None,
                snapshots_removed: 0,
            });
        }

        let incoming =
            OrgDataset { persons: validation.persons.clone(), structures: validation.structures.clone() };
        let current = store.load_dataset()?;
        let snapshot = if current.record_count() > 0 {
            let request = SnapshotRequest::new(source_filename)
                .with_note(&format!("before import version {version_id}"));
            Some(self.snapshots().create(&current, &request)?)
        } else {
            None
        };

        let diff = compare_datasets(&current, &incoming)
            .map_err(|err| anyhow!("failed to diff import against stored data: {err}"))?;
        store.commit_import(
            version_id,
            &incoming,
            &dataset_audit_entries(&diff),
            snapshot.as_ref().map(|info| info.path.as_str()),
        )?;

        let summary = format!("{}; {}", diff.persons.summary(), diff.structures.summary());
        tracing::info!(source = source_filename, version_id, %summary, "import completed");
        Ok(ImportReport {
            imported: true,
            import_version_id: version_id,
            summary,
            validation,
            hierarchy,
            diff: Some(diff),
            snapshot,
            snapshots_removed: 0,
        })
    }

    /// Diff `input` against the stored dataset without writing anything.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the diff fails.
    pub fn preview_import(&self, input: &InputTables) -> Result<ImportPreview> {
        let store = self.open_store()?;
        let validation = self.validate(input);
        let current = store.load_dataset()?;
        let incoming = OrgDataset::from_tables(&input.persons, &input.structures);
        let diff = compare_datasets(&current, &incoming)
            .map_err(|err| anyhow!("failed to diff import against stored data: {err}"))?;
        let mut report = diff.persons.report_rows();
        report.extend(diff.structures.report_rows());
        Ok(ImportPreview {
            validation_summary: validation.summary(),
            valid: validation.is_valid(),
            severity: diff.severity_summary(),
            diff,
            report,
        })
    }

    /// Diff two input documents record by record.
    ///
    /// # Errors
    /// Returns an error when the diff cannot be computed.
    pub fn diff(&self, old: &InputTables, new: &InputTables) -> Result<DatasetDiff> {
        let old = OrgDataset::from_tables(&old.persons, &old.structures);
        let new = OrgDataset::from_tables(&new.persons, &new.structures);
        compare_datasets(&old, &new).map_err(|err| anyhow!("{err}"))
    }

    /// Match, gap-analyse and preview merging `request.source` into the store.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read, a key column is missing
    /// or a resolution names no pending conflict.
    pub fn merge_preview(&self, request: &MergeRequest) -> Result<MergePlan> {
        let store = self.open_store()?;
        let target = store.load_dataset()?.table(request.record_kind);
        self.plan_merge(request, &target)
    }

    fn plan_merge(&self, request: &MergeRequest, target: &Table) -> Result<MergePlan> {
        let engine = self.engine();
        let matches = engine
            .match_records(&request.source, target, request.record_kind.key_field())
            .map_err(|err| anyhow!("{err}"))?;
        let gaps = engine.analyze_gaps(&matches);
        let mut preview = engine.preview(&matches);
        for resolution in &request.resolutions {
            preview = preview
                .with_resolution(&resolution.record_id, &resolution.field, resolution.value.clone())
                .map_err(|err| anyhow!("{err}"))?;
        }
        Ok(MergePlan { record_kind: request.record_kind, stats: matches.stats, gaps, preview })
    }

    /// Apply a merge into the store and record it in the merge audit.
    ///
    /// # Errors
    /// Returns an error when planning fails or the pre-merge snapshot cannot be written.
    pub fn merge_apply(&self, request: &MergeRequest, options: &ApplyOptions) -> Result<MergeApplyReport> {
        let mut store = self.open_store()?;
        let target_table = store.load_dataset()?.table(request.record_kind);
        let plan = self.plan_merge(request, &target_table)?;

        let snapshots = self.snapshots();
        let note = format!("before merging {}", request.source_filename);
        let result = {
            let mut target = StoreMergeTarget::new(&mut store, &snapshots, request.record_kind)
                .with_note(&note);
            self.engine()
                .apply(&plan.preview, options, &mut target)
                .map_err(|err| anyhow!("{err}"))?
        };

        let audit = MergeAudit {
            record_kind: request.record_kind,
            key_field: request.record_kind.key_field().to_string(),
            source_filename: request.source_filename.clone(),
            matched: plan.stats.matched,
            new_count: plan.stats.new,
            gap_count: plan.stats.gap,
            critical_gaps: plan.gaps.critical_count,
            coverage_pct: plan.gaps.coverage_pct,
            applied: result.applied,
            inserted: result.inserted,
            skipped: result.skipped,
            error_count: result.error_count,
            strategies: serde_json::to_value(&plan.preview.strategy_stats)
                .context("failed to encode strategy stats")?,
            conflict_resolutions: serde_json::to_value(&request.resolutions)
                .context("failed to encode conflict resolutions")?,
            snapshot_path: result.snapshot_path.clone(),
            notes: (!result.blocked.is_empty())
                .then(|| format!("blocked by unresolved conflicts: {}", result.blocked.join(", "))),
        };
        let audit_id = store.record_merge_audit(&audit)?;
        tracing::info!(
            audit_id,
            applied = result.applied,
            inserted = result.inserted,
            errors = result.error_count,
            "merge applied"
        );
        Ok(MergeApplyReport { plan, result, audit_id })
    }

    /// Past merge runs, newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn merge_history(&self) -> Result<Vec<MergeAuditRow>> {
        self.open_store()?.list_merge_audits()
    }

    /// Past imports, newest first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn import_history(&self) -> Result<Vec<ImportVersion>> {
        self.open_store()?.list_imports()
    }

    /// Most recent audit log entries first.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn audit_history(&self, limit: usize) -> Result<Vec<AuditRow>> {
        self.open_store()?.list_audit(limit)
    }

    /// # Errors
    /// Returns an error when the snapshot directory cannot be read.
    pub fn snapshot_list(&self) -> Result<Vec<SnapshotInfo>> {
        self.snapshots().list()
    }

    /// Snapshot the stored dataset on demand.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the snapshot cannot be written.
    pub fn snapshot_create(&self, note: Option<&str>) -> Result<SnapshotInfo> {
        let dataset = self.open_store()?.load_dataset()?;
        let mut request = SnapshotRequest::new(SOURCE_MANUAL);
        request.user_note = note.map(str::to_string);
        self.snapshots().create(&dataset, &request)
    }

    /// # Errors
    /// Returns an error when the store cannot be read or the snapshot cannot be written.
    pub fn snapshot_checkpoint(&self, note: Option<&str>) -> Result<SnapshotInfo> {
        let dataset = self.open_store()?.load_dataset()?;
        self.snapshots().checkpoint(&dataset, note)
    }

    /// # Errors
    /// Returns an error when a label is blank or the snapshot cannot be written.
    pub fn snapshot_milestone(&self, note: &str, description: &str) -> Result<SnapshotInfo> {
        let dataset = self.open_store()?.load_dataset()?;
        self.snapshots().milestone(&dataset, note, description)
    }

    /// Replace the stored dataset with snapshot `id`.
    ///
    /// The rollback is recorded as a `RESTORE_<source>` import version with
    /// one audit entry per field it changes.
    ///
    /// # Errors
    /// Returns an error when the snapshot is missing or corrupted, or the store write fails.
    pub fn snapshot_restore(&self, id: u64, safety_backup: bool) -> Result<RestoreReport> {
        let mut store = self.open_store()?;
        let current = store.load_dataset()?;
        let outcome = self.snapshots().restore(id, safety_backup.then_some(&current))?;

        let source = format!("RESTORE_{}", outcome.restored.metadata.source);
        let note = format!("restore snapshot {id}");
        let version_id = store.begin_import(&source, Some(&note))?;
        let committed = compare_datasets(&current, &outcome.dataset)
            .map_err(|err| anyhow!("failed to diff restored snapshot against stored data: {err}"))
            .and_then(|diff| {
                store.commit_import(
                    version_id,
                    &outcome.dataset,
                    &dataset_audit_entries(&diff),
                    outcome.safety_backup.as_ref().map(|info| info.path.as_str()),
                )
            });
        settle_import(&mut store, version_id, committed)?;

        tracing::info!(snapshot_id = id, version_id, "snapshot restored");
        Ok(RestoreReport {
            persons: outcome.dataset.persons.len(),
            structures: outcome.dataset.structures.len(),
            import_version_id: version_id,
            restored: outcome.restored,
            safety_backup: outcome.safety_backup,
        })
    }

    /// # Errors
    /// Returns an error when the snapshot is unknown or cannot be removed.
    pub fn snapshot_delete(&self, id: u64) -> Result<()> {
        self.snapshots().delete(id)
    }

    /// Keep the newest `keep_last` snapshots, defaulting to the configured count.
    ///
    /// # Errors
    /// Returns an error when listing or deleting fails.
    pub fn snapshot_cleanup(&self, keep_last: Option<usize>) -> Result<usize> {
        self.snapshots().cleanup(keep_last.unwrap_or(self.config.keep_last_snapshots))
    }

    /// # Errors
    /// Returns an error when either snapshot cannot be loaded.
    pub fn snapshot_compare(&self, old_id: u64, new_id: u64) -> Result<DatasetDiff> {
        self.snapshots().compare(old_id, new_id)
    }

    /// Resolve a structured command against the stored records into proposals.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the command is incomplete.
    pub fn changes_plan(&self, command: &StructuredCommand) -> Result<ChangePlan> {
        let table = self.open_store()?.load_dataset()?.table(command.record_kind);
        plan_changes(command, &table, command.record_kind.key_field()).map_err(|err| anyhow!("{err}"))
    }

    /// Translate free text with `interpreter`, then plan it.
    ///
    /// # Errors
    /// Returns an error when translation or planning fails.
    pub fn changes_plan_text(
        &self,
        text: &str,
        interpreter: &impl CommandInterpreter,
    ) -> Result<(StructuredCommand, ChangePlan)> {
        let store = self.open_store()?;
        let (persons, structures) = store.counts()?;
        let context = format!("{persons} person(s), {structures} structure(s) stored");
        let command = interpreter.interpret(text, &context).map_err(|err| anyhow!("{err}"))?;
        let table = store.load_dataset()?.table(command.record_kind);
        let plan = plan_changes(&command, &table, command.record_kind.key_field())
            .map_err(|err| anyhow!("{err}"))?;
        Ok((command, plan))
    }

    /// Apply the selected proposals, snapshotting first and auditing each field change.
    ///
    /// `selected` limits which `change_id`s are applied; `None` applies all.
    /// Record writes and audit entries are committed in one transaction.
    /// Structure changes that add a cycle, orphan, self reference or
    /// duplicate code are refused before anything is written.
    ///
    /// # Errors
    /// Returns an error when the proposals mix record kinds, break the
    /// hierarchy, or the store or snapshot fails.
    pub fn changes_apply(
        &self,
        proposals: &[ChangeProposal],
        selected: Option<&BTreeSet<String>>,
    ) -> Result<ChangeApplyReport> {
        let chosen = proposals
            .iter()
            .filter(|proposal| selected.map_or(true, |ids| ids.contains(&proposal.change_id)))
            .filter(|proposal| proposal.operation != OperationType::Query)
            .cloned()
            .collect::<Vec<_>>();
        let kinds = chosen.iter().map(|proposal| proposal.record_kind).collect::<BTreeSet<_>>();
        if kinds.len() > 1 {
            return Err(anyhow!("proposals for persons and structures must be applied separately"));
        }
        let kind = kinds.into_iter().next().unwrap_or(RecordKind::Person);
        let key_field = kind.key_field();

        let mut store = self.open_store()?;
        let dataset = store.load_dataset()?;
        let before = dataset.table(kind);
        let outcome = apply_proposals(&before, &chosen, key_field);
        let diff = compare_tables(&before, &outcome.table, key_field, kind.as_str())
            .map_err(|err| anyhow!("{err}"))?;
        if kind == RecordKind::Structure && diff.has_changes() {
            let after = OrgDataset::from_tables(&Table::default(), &outcome.table);
            let problems = new_hierarchy_problems(
                &validate_hierarchy(&dataset.structures),
                &validate_hierarchy(&after.structures),
            );
            if !problems.is_empty() {
                return Err(anyhow!(
                    "changes would break the structure hierarchy: {}",
                    problems.join("; ")
                ));
            }
        }

        let snapshot = if diff.has_changes() {
            let request = SnapshotRequest::new(SOURCE_MANUAL)
                .with_note(&format!("before applying {} change(s)", outcome.applied.len()));
            Some(self.snapshots().create(&dataset, &request)?)
        } else {
            None
        };

        let deleted_keys = diff.deleted.iter().filter_map(|entry| entry.key.clone()).collect::<Vec<_>>();
        let rows = diff
            .added
            .iter()
            .map(|entry| entry.data.clone())
            .chain(diff.modified.iter().map(|record| record.new.clone()))
            .collect::<Vec<_>>();
        store.apply_record_changes(kind, &deleted_keys, &rows, &audit_entries(kind, &diff))?;

        tracing::info!(
            kind = kind.as_str(),
            applied = outcome.applied.len(),
            failed = outcome.failed.len(),
            "change proposals applied"
        );
        Ok(ChangeApplyReport {
            record_kind: kind,
            applied: outcome.applied,
            failed: outcome.failed,
            snapshot,
            diff,
        })
    }
}

/// Mark `version_id` failed when `outcome` is an error, then hand the outcome back.
fn settle_import<T>(store: &mut SqliteStore, version_id: i64, outcome: Result<T>) -> Result<T> {
    if let Err(err) = &outcome {
        if let Err(mark_err) = store.fail_import(version_id, &format!("{err:#}")) {
            tracing::error!(version_id, error = %mark_err, "failed to mark import version failed");
        }
    }
    outcome
}

/// Hierarchy findings in `after` that `before` did not already have.
fn new_hierarchy_problems(before: &HierarchyReport, after: &HierarchyReport) -> Vec<String> {
    let mut problems = Vec::new();
    for cycle in &after.cycles {
        if !before.cycles.contains(cycle) {
            problems.push(format!("parent cycle {cycle}"));
        }
    }
    for code in &after.self_references {
        if !before.self_references.contains(code) {
            problems.push(format!("{code} is its own parent"));
        }
    }
    for orphan in &after.orphans {
        if !before.orphans.contains(orphan) {
            problems.push(format!("{} points at missing parent {}", orphan.code, orphan.missing_parent));
        }
    }
    for code in &after.duplicate_codes {
        if !before.duplicate_codes.contains(code) {
            problems.push(format!("duplicate code {code}"));
        }
    }
    problems
}

fn dataset_audit_entries(diff: &DatasetDiff) -> Vec<AuditEntry> {
    let mut out = audit_entries(RecordKind::Person, &diff.persons);
    out.extend(audit_entries(RecordKind::Structure, &diff.structures));
    out
}

/// One audit entry per row of the flattened diff report.
fn audit_entries(kind: RecordKind, diff: &DiffResult) -> Vec<AuditEntry> {
    diff.report_rows()
        .into_iter()
        .filter_map(|row| {
            let action = match row.kind {
                ChangeKind::Added => AuditAction::Insert,
                ChangeKind::Deleted => AuditAction::Delete,
                ChangeKind::Modified => AuditAction::Update,
                ChangeKind::Unchanged => return None,
            };
            Some(AuditEntry {
                record_kind: kind,
                record_key: row.key?,
                action,
                field_name: row.field,
                old_value: row.old_value,
                new_value: row.new_value,
                severity: row.severity,
            })
        })
        .collect()
}
