use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::match_key;
use crate::severity::{classify_field, Severity};
use crate::value::{cell_text, cells_equivalent, is_blank, normalize_cell, Row, Table};
use crate::ReconError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Source always wins.
    Overwrite,
    /// Source wins only where the target cell is blank.
    FillEmpty,
    /// Delegates to the engine's [`SmartMerge`] combiner.
    SmartMerge,
    /// Leaves the target value and raises a conflict that blocks auto-apply.
    AskUser,
    /// Target always wins.
    KeepTarget,
}

impl MergeStrategy {
    pub const ALL: [Self; 5] =
        [Self::Overwrite, Self::FillEmpty, Self::SmartMerge, Self::AskUser, Self::KeepTarget];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::FillEmpty => "fill_empty",
            Self::SmartMerge => "smart_merge",
            Self::AskUser => "ask_user",
            Self::KeepTarget => "keep_target",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|strategy| strategy.as_str() == value)
    }
}

/// Pluggable combination used by [`MergeStrategy::SmartMerge`].
pub trait SmartMerge: Debug + Send + Sync {
    /// Combined value for `field`. Must be idempotent: combining the result
    /// with the same source again yields the result unchanged.
    fn combine(&self, field: &str, source: &Value, target: &Value) -> Value;
}

/// Unions delimited lists: target items first, then source items not yet present.
#[derive(Debug, Clone, Copy)]
pub struct ListUnion {
    pub separator: char,
}

impl Default for ListUnion {
    fn default() -> Self {
        Self { separator: ',' }
    }
}

impl SmartMerge for ListUnion {
    fn combine(&self, _field: &str, source: &Value, target: &Value) -> Value {
        let Some(target_text) = normalize_cell(target) else {
            return source.clone();
        };
        let Some(source_text) = normalize_cell(source) else {
            return target.clone();
        };
        let split = |text: &str| {
            text.split(self.separator)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        let present = split(&target_text);
        let missing = split(&source_text)
            .into_iter()
            .filter(|item| !present.contains(item))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return target.clone();
        }
        let mut combined = target_text;
        for item in missing {
            combined.push(self.separator);
            combined.push(' ');
            combined.push_str(&item);
        }
        Value::String(combined)
    }
}

/// Strategy per severity tier, used when a field has no explicit override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SeverityPolicy {
    pub critical: MergeStrategy,
    pub high: MergeStrategy,
    pub medium: MergeStrategy,
    pub low: MergeStrategy,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            critical: MergeStrategy::AskUser,
            high: MergeStrategy::AskUser,
            medium: MergeStrategy::Overwrite,
            low: MergeStrategy::FillEmpty,
        }
    }
}

impl SeverityPolicy {
    #[must_use]
    pub fn for_severity(&self, severity: Severity) -> MergeStrategy {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FallbackStrategy {
    Fixed { strategy: MergeStrategy },
    BySeverity { policy: SeverityPolicy },
}

impl Default for FallbackStrategy {
    fn default() -> Self {
        Self::BySeverity { policy: SeverityPolicy::default() }
    }
}

/// Per-field strategy overrides over a fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StrategyMap {
    #[serde(default)]
    pub per_field: BTreeMap<String, MergeStrategy>,
    #[serde(default)]
    pub fallback: FallbackStrategy,
}

impl StrategyMap {
    /// Same strategy for every field.
    #[must_use]
    pub fn fixed(strategy: MergeStrategy) -> Self {
        Self { per_field: BTreeMap::new(), fallback: FallbackStrategy::Fixed { strategy } }
    }

    #[must_use]
    pub fn with_field(mut self, field: &str, strategy: MergeStrategy) -> Self {
        self.per_field.insert(field.to_string(), strategy);
        self
    }

    #[must_use]
    pub fn strategy_for(&self, field: &str) -> MergeStrategy {
        if let Some(strategy) = self.per_field.get(field) {
            return *strategy;
        }
        match &self.fallback {
            FallbackStrategy::Fixed { strategy } => *strategy,
            FallbackStrategy::BySeverity { policy } => policy.for_severity(classify_field(field)),
        }
    }
}

/// Record-level criticality rules for gaps.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct GapPolicy {
    /// Role columns whose active marker makes a missing record critical.
    pub critical_fields: Vec<String>,
    /// Columns through which other target records point at a record's key.
    pub reference_fields: Vec<String>,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self {
            critical_fields: vec![
                "approver".to_string(),
                "controller".to_string(),
                "cashier".to_string(),
            ],
            reference_fields: vec!["parent_code".to_string(), "org_unit".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedPair {
    pub key: String,
    pub source: Row,
    pub target: Row,
    pub confidence: f64,
}

/// A record present on one side only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnmatchedRecord {
    pub key: String,
    pub data: Row,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchStats {
    pub matched: usize,
    pub new: usize,
    pub gap: usize,
    pub total_source: usize,
    pub total_target: usize,
    /// Source rows skipped because their key cell was blank.
    pub unkeyed_source: usize,
    /// Source rows skipped because their key repeated an earlier row.
    pub duplicate_source: usize,
}

impl MatchStats {
    /// `matched / (matched + gap) * 100`, `None` when both are zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage_pct(&self) -> Option<f64> {
        let denominator = self.matched + self.gap;
        if denominator == 0 {
            return None;
        }
        Some(self.matched as f64 / denominator as f64 * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub key_field: String,
    pub matched: Vec<MatchedPair>,
    pub new_records: Vec<UnmatchedRecord>,
    pub gaps: Vec<UnmatchedRecord>,
    pub stats: MatchStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapDetail {
    pub record_id: String,
    pub data: Row,
    pub is_critical: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapAnalysis {
    pub gaps: Vec<GapDetail>,
    pub critical_count: usize,
    pub coverage_pct: Option<f64>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldConflict {
    pub record_id: String,
    pub field: String,
    pub source_value: Value,
    pub target_value: Value,
    pub strategy: MergeStrategy,
    /// Value chosen for the field; `None` while the conflict waits for a decision.
    pub resolution: Option<Value>,
}

impl FieldConflict {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeRecord {
    pub record_id: String,
    pub before: Row,
    pub after: Row,
    /// Fields whose resolved value differs from the target's current value.
    pub changed_fields: Vec<String>,
    pub conflicts: Vec<FieldConflict>,
    pub strategies_used: BTreeMap<String, MergeStrategy>,
}

impl MergeRecord {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    #[must_use]
    pub fn unresolved_conflicts(&self) -> usize {
        self.conflicts.iter().filter(|conflict| !conflict.is_resolved()).count()
    }

    fn refresh_changed_fields(&mut self) {
        self.changed_fields = self
            .after
            .iter()
            .filter(|(field, value)| !cells_equivalent(self.before.get(*field), Some(value)))
            .map(|(field, _)| field.clone())
            .collect();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergePreview {
    pub key_field: String,
    pub records: Vec<MergeRecord>,
    pub new_records: Vec<UnmatchedRecord>,
    pub total_records: usize,
    pub records_with_changes: usize,
    pub total_conflicts: usize,
    pub unresolved_conflicts: usize,
    pub strategy_stats: BTreeMap<String, usize>,
}

impl MergePreview {
    /// Resolves a pending conflict with `value` and returns the updated preview.
    ///
    /// # Errors
    /// Returns [`ReconError::UnknownRecord`] for an unknown record id and
    /// [`ReconError::UnknownConflict`] when the field has no pending conflict.
    pub fn with_resolution(
        mut self,
        record_id: &str,
        field: &str,
        value: Value,
    ) -> Result<Self, ReconError> {
        let record = self
            .records
            .iter_mut()
            .find(|record| record.record_id == record_id)
            .ok_or_else(|| ReconError::UnknownRecord(record_id.to_string()))?;
        let conflict = record
            .conflicts
            .iter_mut()
            .find(|conflict| conflict.field == field && !conflict.is_resolved())
            .ok_or_else(|| ReconError::UnknownConflict {
                record_id: record_id.to_string(),
                field: field.to_string(),
            })?;
        conflict.resolution = Some(value.clone());
        record.after.insert(field.to_string(), value);
        record.refresh_changed_fields();
        self.refresh_totals();
        Ok(self)
    }

    fn refresh_totals(&mut self) {
        self.total_records = self.records.len();
        self.records_with_changes = self.records.iter().filter(|record| record.has_changes()).count();
        self.total_conflicts = self.records.iter().map(|record| record.conflicts.len()).sum();
        self.unresolved_conflicts =
            self.records.iter().map(MergeRecord::unresolved_conflicts).sum();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApplyOptions {
    /// Restricts the apply to these record ids; `None` selects every record.
    #[serde(default)]
    pub selected: Option<BTreeSet<String>>,
    /// Also insert source-only records.
    #[serde(default)]
    pub insert_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApplyError {
    pub record_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeResult {
    pub success: bool,
    pub applied: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub error_count: usize,
    pub errors: Vec<ApplyError>,
    /// Records held back by unresolved conflicts.
    pub blocked: Vec<String>,
    pub snapshot_path: Option<String>,
}

/// Store that a merge writes into.
pub trait MergeTarget {
    type Error: Display;

    /// Captures the full current state and returns where it was saved.
    ///
    /// # Errors
    /// Returns the store error; the merge aborts before any write.
    fn capture_snapshot(&mut self) -> Result<String, Self::Error>;

    /// Writes `record` under `key`, inserting when absent.
    ///
    /// # Errors
    /// Returns the store error for this record only.
    fn write_record(&mut self, key_field: &str, key: &str, record: &Row) -> Result<(), Self::Error>;
}

/// In-memory [`MergeTarget`] over a [`Table`].
#[derive(Debug, Clone, Default)]
pub struct TableTarget {
    pub table: Table,
    pub snapshots: Vec<Table>,
}

impl TableTarget {
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self { table, snapshots: Vec::new() }
    }
}

impl MergeTarget for TableTarget {
    type Error = ReconError;

    fn capture_snapshot(&mut self) -> Result<String, Self::Error> {
        self.snapshots.push(self.table.clone());
        Ok(format!("memory://snapshot/{}", self.snapshots.len()))
    }

    fn write_record(&mut self, key_field: &str, key: &str, record: &Row) -> Result<(), Self::Error> {
        for column in record.keys() {
            if !self.table.has_column(column) {
                self.table.columns.push(column.clone());
            }
        }
        let position = self.table.rows.iter().position(|row| match_key(row, key_field).as_deref() == Some(key));
        match position {
            Some(index) => self.table.rows[index] = record.clone(),
            None => self.table.rows.push(record.clone()),
        }
        Ok(())
    }
}

/// Stateless merge pipeline: match, gap analysis, preview, apply.
#[derive(Debug)]
pub struct MergeEngine {
    strategies: StrategyMap,
    gap_policy: GapPolicy,
    smart: Box<dyn SmartMerge>,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(StrategyMap::default())
    }
}

impl MergeEngine {
    #[must_use]
    pub fn new(strategies: StrategyMap) -> Self {
        Self { strategies, gap_policy: GapPolicy::default(), smart: Box::new(ListUnion::default()) }
    }

    #[must_use]
    pub fn with_gap_policy(mut self, gap_policy: GapPolicy) -> Self {
        self.gap_policy = gap_policy;
        self
    }

    #[must_use]
    pub fn with_smart_merge(mut self, smart: impl SmartMerge + 'static) -> Self {
        self.smart = Box::new(smart);
        self
    }

    #[must_use]
    pub fn strategies(&self) -> &StrategyMap {
        &self.strategies
    }

    /// Partitions source and target rows by trimmed, uppercased key.
    ///
    /// # Errors
    /// Returns [`ReconError::MissingKeyField`] when either schema lacks `key_field`.
    pub fn match_records(
        &self,
        source: &Table,
        target: &Table,
        key_field: &str,
    ) -> Result<MatchResult, ReconError> {
        for (side, table) in [("source", source), ("target", target)] {
            if !table.has_column(key_field) {
                return Err(ReconError::MissingKeyField { field: key_field.to_string(), side });
            }
        }

        let mut target_index: HashMap<String, &Row> = HashMap::new();
        let mut target_order = Vec::new();
        for row in &target.rows {
            let Some(key) = match_key(row, key_field) else {
                continue;
            };
            if !target_index.contains_key(&key) {
                target_index.insert(key.clone(), row);
                target_order.push(key);
            }
        }

        let mut stats = MatchStats {
            total_source: source.len(),
            total_target: target.len(),
            ..MatchStats::default()
        };
        let mut seen_source = BTreeSet::new();
        let mut matched = Vec::new();
        let mut new_records = Vec::new();
        for row in &source.rows {
            let Some(key) = match_key(row, key_field) else {
                stats.unkeyed_source += 1;
                continue;
            };
            if !seen_source.insert(key.clone()) {
                stats.duplicate_source += 1;
                continue;
            }
            match target_index.get(&key) {
                Some(target_row) => matched.push(MatchedPair {
                    key,
                    source: row.clone(),
                    target: (*target_row).clone(),
                    confidence: 1.0,
                }),
                None => new_records.push(UnmatchedRecord { key, data: row.clone() }),
            }
        }

        let gaps = target_order
            .into_iter()
            .filter(|key| !seen_source.contains(key))
            .filter_map(|key| {
                target_index.get(&key).map(|row| UnmatchedRecord { data: (*row).clone(), key })
            })
            .collect::<Vec<_>>();

        stats.matched = matched.len();
        stats.new = new_records.len();
        stats.gap = gaps.len();
        tracing::info!(
            matched = stats.matched,
            new = stats.new,
            gap = stats.gap,
            "merge match completed"
        );
        Ok(MatchResult { key_field: key_field.to_string(), matched, new_records, gaps, stats })
    }

    /// Flags gaps that hold a critical role or are still referenced by other
    /// target records.
    #[must_use]
    pub fn analyze_gaps(&self, matches: &MatchResult) -> GapAnalysis {
        let mut referenced: HashMap<String, Vec<String>> = HashMap::new();
        let target_rows = matches
            .matched
            .iter()
            .map(|pair| &pair.target)
            .chain(matches.gaps.iter().map(|gap| &gap.data));
        for row in target_rows {
            for field in &self.gap_policy.reference_fields {
                if let Some(reference) = cell_text(row, field) {
                    referenced.entry(reference.to_uppercase()).or_default().push(field.clone());
                }
            }
        }

        let gaps = matches
            .gaps
            .iter()
            .map(|gap| {
                let mut reasons = self
                    .gap_policy
                    .critical_fields
                    .iter()
                    .filter(|field| !is_blank(gap.data.get(field.as_str())))
                    .map(|field| format!("holds active role `{field}`"))
                    .collect::<Vec<_>>();
                if let Some(fields) = referenced.get(&gap.key) {
                    let mut names = fields.clone();
                    names.sort();
                    names.dedup();
                    reasons.push(format!(
                        "referenced by {} record(s) via {}",
                        fields.len(),
                        names.join(", ")
                    ));
                }
                GapDetail {
                    record_id: gap.key.clone(),
                    data: gap.data.clone(),
                    is_critical: !reasons.is_empty(),
                    reasons,
                }
            })
            .collect::<Vec<_>>();

        let critical_count = gaps.iter().filter(|gap| gap.is_critical).count();
        let coverage_pct = matches.stats.coverage_pct();
        let recommendations = recommendations(&matches.stats, critical_count, coverage_pct);
        GapAnalysis { gaps, critical_count, coverage_pct, recommendations }
    }

    /// Resolves every matched pair field by field.
    #[must_use]
    pub fn preview(&self, matches: &MatchResult) -> MergePreview {
        let records = matches
            .matched
            .iter()
            .map(|pair| self.merge_pair(pair, &matches.key_field))
            .collect::<Vec<_>>();

        let mut strategy_stats = MergeStrategy::ALL
            .iter()
            .map(|strategy| (strategy.as_str().to_string(), 0_usize))
            .collect::<BTreeMap<_, _>>();
        for record in &records {
            for strategy in record.strategies_used.values() {
                *strategy_stats.entry(strategy.as_str().to_string()).or_default() += 1;
            }
        }

        let mut preview = MergePreview {
            key_field: matches.key_field.clone(),
            records,
            new_records: matches.new_records.clone(),
            total_records: 0,
            records_with_changes: 0,
            total_conflicts: 0,
            unresolved_conflicts: 0,
            strategy_stats,
        };
        preview.refresh_totals();
        preview
    }

    fn merge_pair(&self, pair: &MatchedPair, key_field: &str) -> MergeRecord {
        let mut record = MergeRecord {
            record_id: pair.key.clone(),
            before: pair.target.clone(),
            after: pair.target.clone(),
            changed_fields: Vec::new(),
            conflicts: Vec::new(),
            strategies_used: BTreeMap::new(),
        };

        for (field, source_value) in &pair.source {
            if field == key_field {
                continue;
            }
            let target_value = pair.target.get(field).cloned().unwrap_or(Value::Null);
            if cells_equivalent(Some(source_value), Some(&target_value)) {
                continue;
            }
            if !pair.target.contains_key(field) {
                // Column unknown to the target: take the source value as is.
                record.after.insert(field.clone(), source_value.clone());
                record.strategies_used.insert(field.clone(), MergeStrategy::Overwrite);
                continue;
            }

            let strategy = self.strategies.strategy_for(field);
            record.strategies_used.insert(field.clone(), strategy);
            let (merged, needs_decision) = match strategy {
                MergeStrategy::Overwrite => (source_value.clone(), false),
                MergeStrategy::FillEmpty => {
                    if is_blank(Some(&target_value)) {
                        (source_value.clone(), false)
                    } else {
                        (target_value.clone(), false)
                    }
                }
                MergeStrategy::SmartMerge => {
                    (self.smart.combine(field, source_value, &target_value), false)
                }
                MergeStrategy::AskUser => (target_value.clone(), true),
                MergeStrategy::KeepTarget => (target_value.clone(), false),
            };

            let both_populated = !is_blank(Some(source_value)) && !is_blank(Some(&target_value));
            if needs_decision || both_populated {
                record.conflicts.push(FieldConflict {
                    record_id: pair.key.clone(),
                    field: field.clone(),
                    source_value: source_value.clone(),
                    target_value: target_value.clone(),
                    strategy,
                    resolution: if needs_decision { None } else { Some(merged.clone()) },
                });
            }
            record.after.insert(field.clone(), merged);
        }

        record.refresh_changed_fields();
        record
    }

    /// Writes the selected, changed and unblocked records of `preview` into `target`.
    ///
    /// A snapshot is captured before the first write. Write failures are
    /// collected per record and never stop the batch.
    ///
    /// # Errors
    /// Returns [`ReconError::SnapshotCapture`] when the pre-merge snapshot fails;
    /// nothing has been written in that case.
    pub fn apply<T: MergeTarget>(
        &self,
        preview: &MergePreview,
        options: &ApplyOptions,
        target: &mut T,
    ) -> Result<MergeResult, ReconError> {
        let is_selected = |record_id: &str| {
            options.selected.as_ref().map_or(true, |selected| selected.contains(record_id))
        };

        let mut result = MergeResult::default();
        let mut pending: Vec<(&str, &Row, bool)> = Vec::new();
        for record in &preview.records {
            if !is_selected(record.record_id.as_str()) || !record.has_changes() {
                result.skipped += 1;
                continue;
            }
            if record.unresolved_conflicts() > 0 {
                result.skipped += 1;
                result.blocked.push(record.record_id.clone());
                continue;
            }
            pending.push((record.record_id.as_str(), &record.after, false));
        }
        for record in &preview.new_records {
            if options.insert_new && is_selected(record.key.as_str()) {
                pending.push((record.key.as_str(), &record.data, true));
            } else {
                result.skipped += 1;
            }
        }

        if pending.is_empty() {
            result.success = true;
            return Ok(result);
        }

        let snapshot = target
            .capture_snapshot()
            .map_err(|err| ReconError::SnapshotCapture(err.to_string()))?;
        tracing::info!(snapshot = %snapshot, records = pending.len(), "pre-merge snapshot captured");
        result.snapshot_path = Some(snapshot);

        for (record_id, row, is_insert) in pending {
            match target.write_record(&preview.key_field, record_id, row) {
                Ok(()) if is_insert => result.inserted += 1,
                Ok(()) => result.applied += 1,
                Err(err) => {
                    tracing::warn!(record_id, error = %err, "merge write failed");
                    result.errors.push(ApplyError {
                        record_id: record_id.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        result.error_count = result.errors.len();
        result.success = result.errors.is_empty();
        Ok(result)
    }
}

fn recommendations(stats: &MatchStats, critical_count: usize, coverage: Option<f64>) -> Vec<String> {
    let mut out = Vec::new();
    if critical_count > 0 {
        out.push(format!(
            "{critical_count} critical gap(s): reassign their roles or references before removing them"
        ));
    }
    let routine = stats.gap.saturating_sub(critical_count);
    if routine > 0 {
        out.push(format!(
            "{routine} record(s) exist only in the target and are left unchanged; remove them explicitly if obsolete"
        ));
    }
    if stats.new > 0 {
        out.push(format!("{} new record(s) can be inserted with insert_new", stats.new));
    }
    if coverage.is_some_and(|pct| pct < 50.0) {
        out.push("coverage below 50%: check that the key field is the right join column".to_string());
    }
    if stats.unkeyed_source > 0 || stats.duplicate_source > 0 {
        out.push(format!(
            "{} source row(s) without key and {} duplicate(s) were ignored",
            stats.unkeyed_source, stats.duplicate_source
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn table(rows: Vec<Value>) -> Table {
        Table::from_rows(rows.into_iter().map(row).collect())
    }

    fn must<T>(result: Result<T, ReconError>) -> T {
        result.unwrap_or_else(|err| panic!("unexpected error: {err}"))
    }

    fn run(engine: &MergeEngine, source: &Table, target: &Table) -> MergePreview {
        let matches = must(engine.match_records(source, target, "cf"));
        engine.preview(&matches)
    }

    #[test]
    fn fill_empty_keeps_populated_target() {
        let source = table(vec![json!({"cf": "AAA", "ral": 50000})]);
        let target = table(vec![json!({"cf": "AAA", "ral": 45000})]);
        let engine = MergeEngine::new(StrategyMap::default().with_field("ral", MergeStrategy::FillEmpty));
        let preview = run(&engine, &source, &target);
        assert_eq!(preview.records[0].after.get("ral"), Some(&json!(45000)));
        assert_eq!(preview.records_with_changes, 0);
        assert_eq!(preview.unresolved_conflicts, 0);
    }

    #[test]
    fn overwrite_takes_source_value() {
        let source = table(vec![json!({"cf": "AAA", "ral": 50000})]);
        let target = table(vec![json!({"cf": "AAA", "ral": 45000})]);
        let engine = MergeEngine::new(StrategyMap::default().with_field("ral", MergeStrategy::Overwrite));
        let preview = run(&engine, &source, &target);
        let record = &preview.records[0];
        assert_eq!(record.after.get("ral"), Some(&json!(50000)));
        assert_eq!(record.changed_fields, vec!["ral"]);
        assert_eq!(preview.total_conflicts, 1);
        assert_eq!(preview.unresolved_conflicts, 0);
        assert_eq!(preview.strategy_stats.get("overwrite"), Some(&1));
    }

    #[test]
    fn fill_empty_fills_blank_target() {
        let source = table(vec![json!({"cf": "AAA", "site": "Rome"})]);
        let target = table(vec![json!({"cf": "AAA", "site": ""})]);
        let engine = MergeEngine::new(StrategyMap::fixed(MergeStrategy::FillEmpty));
        let preview = run(&engine, &source, &target);
        assert_eq!(preview.records[0].after.get("site"), Some(&json!("Rome")));
        assert_eq!(preview.total_conflicts, 0);
    }

    #[test]
    fn keep_target_and_smart_merge() {
        let source = table(vec![json!({"cf": "AAA", "note": "x", "other_roles": "B, C"})]);
        let target = table(vec![json!({"cf": "AAA", "note": "y", "other_roles": "A, B"})]);
        let strategies = StrategyMap::fixed(MergeStrategy::KeepTarget)
            .with_field("other_roles", MergeStrategy::SmartMerge);
        let preview = run(&MergeEngine::new(strategies), &source, &target);
        let record = &preview.records[0];
        assert_eq!(record.after.get("note"), Some(&json!("y")));
        assert_eq!(record.after.get("other_roles"), Some(&json!("A, B, C")));
        assert_eq!(record.changed_fields, vec!["other_roles"]);
    }

    #[test]
    fn list_union_is_idempotent() {
        let union = ListUnion::default();
        let once = union.combine("roles", &json!("b,c"), &json!("a,b"));
        assert_eq!(once, json!("a,b, c"));
        assert_eq!(union.combine("roles", &json!("b,c"), &once), once);
        assert_eq!(union.combine("roles", &json!("x"), &Value::Null), json!("x"));
    }

    #[test]
    fn ask_user_blocks_until_resolved() {
        let source = table(vec![json!({"cf": "AAA", "approver": "SI", "site": "Rome"})]);
        let target = table(vec![json!({"cf": "AAA", "approver": "", "site": "Milan"})]);
        let engine = MergeEngine::default();
        let preview = run(&engine, &source, &target);
        assert_eq!(preview.unresolved_conflicts, 1);
        assert_eq!(preview.records[0].changed_fields, vec!["site"]);

        let mut blocked_target = TableTarget::new(target.clone());
        let result = must(engine.apply(&preview, &ApplyOptions::default(), &mut blocked_target));
        assert_eq!(result.blocked, vec!["AAA"]);
        assert_eq!(result.applied, 0);
        assert!(result.snapshot_path.is_none());

        let resolved = must(preview.with_resolution("AAA", "approver", json!("SI")));
        assert_eq!(resolved.unresolved_conflicts, 0);
        assert_eq!(resolved.records[0].changed_fields, vec!["approver", "site"]);

        let mut store = TableTarget::new(target);
        let result = must(engine.apply(&resolved, &ApplyOptions::default(), &mut store));
        assert!(result.success);
        assert_eq!(result.applied, 1);
        assert_eq!(result.snapshot_path.as_deref(), Some("memory://snapshot/1"));
        assert_eq!(store.table.rows[0].get("approver"), Some(&json!("SI")));
        assert_eq!(store.snapshots.len(), 1);
    }

    #[test]
    fn resolving_unknown_conflict_fails() {
        let preview = run(
            &MergeEngine::default(),
            &table(vec![json!({"cf": "AAA"})]),
            &table(vec![json!({"cf": "AAA"})]),
        );
        assert_eq!(
            preview.clone().with_resolution("ZZZ", "x", json!(1)),
            Err(ReconError::UnknownRecord("ZZZ".to_string()))
        );
        assert!(matches!(
            preview.with_resolution("AAA", "x", json!(1)),
            Err(ReconError::UnknownConflict { .. })
        ));
    }

    #[test]
    fn match_partitions_by_normalized_key() {
        let source = table(vec![
            json!({"cf": " aaa "}),
            json!({"cf": "BBB"}),
            json!({"cf": ""}),
            json!({"cf": "bbb"}),
        ]);
        let target = table(vec![json!({"cf": "AAA"}), json!({"cf": "CCC"})]);
        let matches = must(MergeEngine::default().match_records(&source, &target, "cf"));
        assert_eq!(matches.matched.len(), 1);
        assert!((matches.matched[0].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(matches.new_records[0].key, "BBB");
        assert_eq!(matches.gaps[0].key, "CCC");
        assert_eq!(matches.stats.unkeyed_source, 1);
        assert_eq!(matches.stats.duplicate_source, 1);
        assert_eq!(matches.stats.coverage_pct(), Some(50.0));
    }

    #[test]
    fn missing_join_key_is_fatal() {
        let source = table(vec![json!({"id": "A"})]);
        let target = table(vec![json!({"cf": "A"})]);
        assert!(matches!(
            MergeEngine::default().match_records(&source, &target, "cf"),
            Err(ReconError::MissingKeyField { side: "source", .. })
        ));
    }

    #[test]
    fn coverage_is_undefined_without_matches_or_gaps() {
        assert_eq!(MatchStats::default().coverage_pct(), None);
        let empty = Table::new(vec!["cf".to_string()]);
        let matches = must(MergeEngine::default().match_records(&empty, &empty, "cf"));
        let analysis = MergeEngine::default().analyze_gaps(&matches);
        assert_eq!(analysis.coverage_pct, None);
        assert!(analysis.gaps.is_empty());
    }

    #[test]
    fn critical_gaps_hold_roles_or_references() {
        let source = table(vec![json!({"cf": "E1", "org_unit": "S1"})]);
        let target = table(vec![
            json!({"cf": "E1", "org_unit": "S1", "approver": ""}),
            json!({"cf": "E2", "org_unit": "S1", "approver": "SI"}),
            json!({"cf": "E3", "org_unit": "S1", "approver": ""}),
            json!({"cf": "S1", "org_unit": null, "approver": ""}),
        ]);
        let engine = MergeEngine::default();
        let matches = must(engine.match_records(&source, &target, "cf"));
        let analysis = engine.analyze_gaps(&matches);
        assert_eq!(analysis.gaps.len(), 3);
        assert_eq!(analysis.critical_count, 2);
        assert_eq!(analysis.gaps[0].reasons, vec!["holds active role `approver`"]);
        assert!(!analysis.gaps[1].is_critical);
        assert_eq!(analysis.gaps[2].reasons, vec!["referenced by 3 record(s) via org_unit"]);
        assert_eq!(analysis.coverage_pct, Some(25.0));
        assert!(analysis.recommendations.iter().any(|line| line.contains("2 critical gap(s)")));
    }

    #[derive(Debug, Default)]
    struct FlakyTarget {
        writes: Vec<String>,
        fail_snapshot: bool,
    }

    impl MergeTarget for FlakyTarget {
        type Error = String;

        fn capture_snapshot(&mut self) -> Result<String, Self::Error> {
            if self.fail_snapshot {
                Err("disk full".to_string())
            } else {
                Ok("snapshots/pre_merge.json".to_string())
            }
        }

        fn write_record(&mut self, _key_field: &str, key: &str, _record: &Row) -> Result<(), Self::Error> {
            if key == "BBB" {
                return Err("constraint violated".to_string());
            }
            self.writes.push(key.to_string());
            Ok(())
        }
    }

    #[test]
    fn write_failures_are_isolated_per_record() {
        let source = table(vec![
            json!({"cf": "AAA", "site": "x"}),
            json!({"cf": "BBB", "site": "x"}),
            json!({"cf": "CCC", "site": "x"}),
            json!({"cf": "DDD", "site": "x"}),
        ]);
        let target = table(vec![
            json!({"cf": "AAA", "site": "y"}),
            json!({"cf": "BBB", "site": "y"}),
            json!({"cf": "CCC", "site": "y"}),
        ]);
        let engine = MergeEngine::new(StrategyMap::fixed(MergeStrategy::Overwrite));
        let preview = run(&engine, &source, &target);
        let mut store = FlakyTarget::default();
        let options = ApplyOptions { selected: None, insert_new: true };
        let result = must(engine.apply(&preview, &options, &mut store));
        assert!(!result.success);
        assert_eq!(result.applied, 2);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.errors[0].record_id, "BBB");
        assert_eq!(store.writes, vec!["AAA", "CCC", "DDD"]);
        assert_eq!(result.snapshot_path.as_deref(), Some("snapshots/pre_merge.json"));
    }

    #[test]
    fn snapshot_failure_aborts_before_writes() {
        let source = table(vec![json!({"cf": "AAA", "site": "x"})]);
        let target = table(vec![json!({"cf": "AAA", "site": "y"})]);
        let engine = MergeEngine::new(StrategyMap::fixed(MergeStrategy::Overwrite));
        let preview = run(&engine, &source, &target);
        let mut store = FlakyTarget { writes: Vec::new(), fail_snapshot: true };
        let result = engine.apply(&preview, &ApplyOptions::default(), &mut store);
        assert_eq!(result, Err(ReconError::SnapshotCapture("disk full".to_string())));
        assert!(store.writes.is_empty());
    }

    #[test]
    fn selection_limits_applied_records() {
        let source = table(vec![json!({"cf": "AAA", "site": "x"}), json!({"cf": "BBB", "site": "x"})]);
        let target = table(vec![json!({"cf": "AAA", "site": "y"}), json!({"cf": "BBB", "site": "y"})]);
        let engine = MergeEngine::new(StrategyMap::fixed(MergeStrategy::Overwrite));
        let preview = run(&engine, &source, &target);
        let options = ApplyOptions {
            selected: Some(BTreeSet::from(["BBB".to_string()])),
            insert_new: false,
        };
        let mut store = TableTarget::new(target);
        let result = must(engine.apply(&preview, &options, &mut store));
        assert_eq!(result.applied, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(store.table.rows[0].get("site"), Some(&json!("y")));
        assert_eq!(store.table.rows[1].get("site"), Some(&json!("x")));
    }

    fn arb_rows() -> impl Strategy<Value = Vec<(String, Option<String>, Option<u8>)>> {
        proptest::collection::btree_map(
            "[A-D]{2}",
            (proptest::option::of("[a-c]{1,2}"), proptest::option::of(0_u8..4)),
            0..8,
        )
        .prop_map(|entries| {
            entries.into_iter().map(|(key, (site, level))| (key, site, level)).collect()
        })
    }

    fn build(rows: &[(String, Option<String>, Option<u8>)]) -> Table {
        let mut table =
            Table::new(vec!["cf".to_string(), "site".to_string(), "level".to_string()]);
        for (key, site, level) in rows {
            table.push(row(json!({"cf": key, "site": site, "level": level})));
        }
        table
    }

    fn arb_strategy() -> impl Strategy<Value = MergeStrategy> {
        prop_oneof![
            Just(MergeStrategy::Overwrite),
            Just(MergeStrategy::FillEmpty),
            Just(MergeStrategy::SmartMerge),
            Just(MergeStrategy::KeepTarget),
        ]
    }

    proptest! {
        #[test]
        fn property_reapplying_merge_is_a_no_op(
            source_rows in arb_rows(),
            target_rows in arb_rows(),
            site in arb_strategy(),
            level in arb_strategy(),
        ) {
            let engine = MergeEngine::new(
                StrategyMap::fixed(MergeStrategy::Overwrite)
                    .with_field("site", site)
                    .with_field("level", level),
            );
            let source = build(&source_rows);
            let mut store = TableTarget::new(build(&target_rows));
            let first = run(&engine, &source, &store.table);
            let options = ApplyOptions { selected: None, insert_new: true };
            let result = must(engine.apply(&first, &options, &mut store));
            prop_assert!(result.success);

            let second = run(&engine, &source, &store.table);
            prop_assert_eq!(second.records_with_changes, 0);
            prop_assert!(second.new_records.is_empty());
        }
    }
}
