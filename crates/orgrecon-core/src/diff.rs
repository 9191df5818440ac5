use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{record_key, OrgDataset, RecordKind};
use crate::severity::{classify_field, Severity, SeveritySummary};
use crate::value::{cells_equivalent, normalize_cell, Row, Table};
use crate::ReconError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Unchanged,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub severity: Severity,
}

/// A record present on one side only. `key` is `None` for keyless rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffEntry {
    pub key: Option<String>,
    pub record_type: String,
    pub data: Row,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifiedRecord {
    pub key: String,
    pub record_type: String,
    pub changes: Vec<FieldChange>,
    pub old: Row,
    pub new: Row,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiffCounts {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DiffSide {
    Old,
    New,
}

/// A key that appears more than once on one side; only its first row is compared.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateKey {
    pub side: DiffSide,
    pub key: String,
    pub occurrences: usize,
}

/// One flattened line of a diff report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportRow {
    pub kind: ChangeKind,
    pub record_type: String,
    pub key: Option<String>,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffResult {
    pub record_type: String,
    pub key_field: String,
    pub added: Vec<DiffEntry>,
    pub deleted: Vec<DiffEntry>,
    pub modified: Vec<ModifiedRecord>,
    pub counts: DiffCounts,
    #[serde(default)]
    pub duplicate_keys: Vec<DuplicateKey>,
}

impl DiffResult {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.counts.added + self.counts.deleted + self.counts.modified > 0
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}: {} added, {} deleted, {} modified, {} unchanged",
            self.record_type,
            self.counts.added,
            self.counts.deleted,
            self.counts.modified,
            self.counts.unchanged
        )
    }

    /// Field-change counts per severity tier with critical and high details.
    #[must_use]
    pub fn severity_summary(&self) -> SeveritySummary {
        let mut summary = SeveritySummary::default();
        for record in &self.modified {
            for change in &record.changes {
                summary.record(change.severity, || {
                    format!(
                        "{}: {} ({} -> {})",
                        record.key,
                        change.field,
                        display_cell(&change.old_value),
                        display_cell(&change.new_value)
                    )
                });
            }
        }
        summary
    }

    /// Flattened rows: one per added or deleted record, one per changed field.
    #[must_use]
    pub fn report_rows(&self) -> Vec<ReportRow> {
        let mut rows = Vec::new();
        for (kind, entries) in [(ChangeKind::Added, &self.added), (ChangeKind::Deleted, &self.deleted)]
        {
            rows.extend(entries.iter().map(|entry| ReportRow {
                kind,
                record_type: entry.record_type.clone(),
                key: entry.key.clone(),
                field: None,
                old_value: None,
                new_value: None,
                severity: None,
            }));
        }
        for record in &self.modified {
            rows.extend(record.changes.iter().map(|change| ReportRow {
                kind: ChangeKind::Modified,
                record_type: record.record_type.clone(),
                key: Some(record.key.clone()),
                field: Some(change.field.clone()),
                old_value: normalize_cell(&change.old_value),
                new_value: normalize_cell(&change.new_value),
                severity: Some(change.severity),
            }));
        }
        rows
    }
}

/// Diff of both collections of an [`OrgDataset`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetDiff {
    pub persons: DiffResult,
    pub structures: DiffResult,
}

impl DatasetDiff {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.persons.has_changes() || self.structures.has_changes()
    }

    #[must_use]
    pub fn severity_summary(&self) -> SeveritySummary {
        let mut summary = self.persons.severity_summary();
        let structures = self.structures.severity_summary();
        summary.critical += structures.critical;
        summary.high += structures.high;
        summary.medium += structures.medium;
        summary.low += structures.low;
        summary.critical_changes.extend(structures.critical_changes);
        summary.high_changes.extend(structures.high_changes);
        summary
    }
}

/// Compares two tables record by record on `key_field`.
///
/// # Errors
/// Returns [`ReconError::MissingKeyField`] when either schema lacks `key_field`.
pub fn compare_tables(
    old: &Table,
    new: &Table,
    key_field: &str,
    record_type: &str,
) -> Result<DiffResult, ReconError> {
    for (side, table) in [("old", old), ("new", new)] {
        if !table.has_column(key_field) {
            return Err(ReconError::MissingKeyField { field: key_field.to_string(), side });
        }
    }

    let old_index = KeyIndex::build(old, key_field);
    let new_index = KeyIndex::build(new, key_field);
    let shared_fields = old
        .columns
        .iter()
        .filter(|column| column.as_str() != key_field && new.has_column(column))
        .collect::<Vec<_>>();

    let mut result = DiffResult {
        record_type: record_type.to_string(),
        key_field: key_field.to_string(),
        added: Vec::new(),
        deleted: Vec::new(),
        modified: Vec::new(),
        counts: DiffCounts::default(),
        duplicate_keys: old_index.duplicates(DiffSide::Old),
    };
    result.duplicate_keys.extend(new_index.duplicates(DiffSide::New));

    for (key, row) in new_index.entries(new) {
        if key.as_ref().is_some_and(|key| old_index.contains(key)) {
            continue;
        }
        result.added.push(DiffEntry { key, record_type: record_type.to_string(), data: row.clone() });
    }

    for (key, old_row) in old_index.entries(old) {
        let Some(present) = key else {
            result.deleted.push(DiffEntry {
                key: None,
                record_type: record_type.to_string(),
                data: old_row.clone(),
            });
            continue;
        };
        let Some(new_row) = new_index.row(new, &present) else {
            result.deleted.push(DiffEntry {
                key: Some(present),
                record_type: record_type.to_string(),
                data: old_row.clone(),
            });
            continue;
        };

        let changes = shared_fields
            .iter()
            .filter(|field| !cells_equivalent(old_row.get(field.as_str()), new_row.get(field.as_str())))
            .map(|field| FieldChange {
                field: (*field).clone(),
                old_value: old_row.get(field.as_str()).cloned().unwrap_or(Value::Null),
                new_value: new_row.get(field.as_str()).cloned().unwrap_or(Value::Null),
                severity: classify_field(field),
            })
            .collect::<Vec<_>>();

        if changes.is_empty() {
            result.counts.unchanged += 1;
        } else {
            result.modified.push(ModifiedRecord {
                key: present,
                record_type: record_type.to_string(),
                changes,
                old: old_row.clone(),
                new: new_row.clone(),
            });
        }
    }

    result.counts.added = result.added.len();
    result.counts.deleted = result.deleted.len();
    result.counts.modified = result.modified.len();
    tracing::debug!(summary = %result.summary(), "diff computed");
    Ok(result)
}

/// Compares persons and structures of two datasets on their natural keys.
///
/// # Errors
/// Propagates [`compare_tables`] errors.
pub fn compare_datasets(old: &OrgDataset, new: &OrgDataset) -> Result<DatasetDiff, ReconError> {
    let persons = compare_tables(
        &old.persons_table(),
        &new.persons_table(),
        RecordKind::Person.key_field(),
        RecordKind::Person.as_str(),
    )?;
    let structures = compare_tables(
        &old.structures_table(),
        &new.structures_table(),
        RecordKind::Structure.key_field(),
        RecordKind::Structure.as_str(),
    )?;
    Ok(DatasetDiff { persons, structures })
}

/// First-occurrence row index per key, plus keyless rows in input order.
struct KeyIndex {
    first: HashMap<String, usize>,
    order: Vec<Option<String>>,
    positions: Vec<usize>,
    seen_twice: Vec<(String, usize)>,
}

impl KeyIndex {
    fn build(table: &Table, key_field: &str) -> Self {
        let mut first = HashMap::new();
        let mut order = Vec::new();
        let mut positions = Vec::new();
        let mut repeats: HashMap<String, usize> = HashMap::new();
        let mut repeat_order = Vec::new();
        for (index, row) in table.rows.iter().enumerate() {
            match record_key(row, key_field) {
                Some(key) => {
                    if first.contains_key(&key) {
                        let count = repeats.entry(key.clone()).or_insert(1);
                        if *count == 1 {
                            repeat_order.push(key.clone());
                        }
                        *count += 1;
                        continue;
                    }
                    first.insert(key.clone(), index);
                    order.push(Some(key));
                    positions.push(index);
                }
                None => {
                    order.push(None);
                    positions.push(index);
                }
            }
        }
        let seen_twice = repeat_order
            .into_iter()
            .map(|key| {
                let occurrences = repeats.get(&key).copied().unwrap_or(2);
                (key, occurrences)
            })
            .collect();
        Self { first, order, positions, seen_twice }
    }

    fn contains(&self, key: &str) -> bool {
        self.first.contains_key(key)
    }

    fn row<'t>(&self, table: &'t Table, key: &str) -> Option<&'t Row> {
        self.first.get(key).and_then(|index| table.rows.get(*index))
    }

    fn entries<'t>(&self, table: &'t Table) -> Vec<(Option<String>, &'t Row)> {
        self.order
            .iter()
            .zip(&self.positions)
            .filter_map(|(key, index)| table.rows.get(*index).map(|row| (key.clone(), row)))
            .collect()
    }

    fn duplicates(&self, side: DiffSide) -> Vec<DuplicateKey> {
        self.seen_twice
            .iter()
            .map(|(key, occurrences)| DuplicateKey { side, key: key.clone(), occurrences: *occurrences })
            .collect()
    }
}

fn display_cell(value: &Value) -> String {
    normalize_cell(value).unwrap_or_else(|| "(empty)".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::record::StructureRecord;

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

    #[test]
    fn classifies_added_deleted_modified_and_unchanged() {
        let old = table(vec![
            json!({"code": "A", "description": "Root", "site": "Rome"}),
            json!({"code": "B", "description": "Sales", "site": "Milan"}),
            json!({"code": "C", "description": "Legal", "site": null}),
        ]);
        let new = table(vec![
            json!({"code": "A", "description": "Root", "site": "Rome"}),
            json!({"code": "B", "description": "Sales EU", "site": "Milan"}),
            json!({"code": "D", "description": "Ops", "site": "Turin"}),
        ]);
        let diff = must(compare_tables(&old, &new, "code", "structure"));
        assert_eq!(
            diff.counts,
            DiffCounts { added: 1, deleted: 1, modified: 1, unchanged: 1 }
        );
        assert_eq!(diff.added[0].key.as_deref(), Some("D"));
        assert_eq!(diff.deleted[0].key.as_deref(), Some("C"));
        let modified = &diff.modified[0];
        assert_eq!(modified.key, "B");
        assert_eq!(modified.changes.len(), 1);
        assert_eq!(modified.changes[0].field, "description");
        assert_eq!(modified.changes[0].old_value, json!("Sales"));
        assert_eq!(modified.changes[0].new_value, json!("Sales EU"));
        assert_eq!(modified.changes[0].severity, Severity::High);
        assert_eq!(diff.summary(), "structure: 1 added, 1 deleted, 1 modified, 1 unchanged");
    }

    #[test]
    fn null_versus_empty_string_is_not_a_change() {
        let old = table(vec![json!({"code": "A", "site": null})]);
        let new = table(vec![json!({"code": "A", "site": ""})]);
        let diff = must(compare_tables(&old, &new, "code", "structure"));
        assert_eq!(diff.counts.unchanged, 1);
        assert!(!diff.has_changes());
    }

    #[test]
    fn missing_key_column_is_fatal() {
        let old = table(vec![json!({"code": "A"})]);
        let new = table(vec![json!({"id": "A"})]);
        let err = compare_tables(&old, &new, "code", "structure");
        assert_eq!(
            err,
            Err(ReconError::MissingKeyField { field: "code".to_string(), side: "new" })
        );
    }

    #[test]
    fn keyless_rows_are_unmatched() {
        let old = table(vec![json!({"code": "", "description": "ghost"}), json!({"code": "A"})]);
        let new = table(vec![json!({"code": null, "description": "new ghost"}), json!({"code": "A"})]);
        let diff = must(compare_tables(&old, &new, "code", "structure"));
        assert_eq!(diff.counts.added, 1);
        assert_eq!(diff.counts.deleted, 1);
        assert_eq!(diff.added[0].key, None);
        assert_eq!(diff.deleted[0].key, None);
        assert_eq!(diff.counts.unchanged, 1);
    }

    #[test]
    fn duplicate_keys_compare_first_occurrence_and_are_reported() {
        let old = table(vec![
            json!({"code": "A", "description": "first"}),
            json!({"code": "A", "description": "second"}),
        ]);
        let new = table(vec![json!({"code": "A", "description": "first"})]);
        let diff = must(compare_tables(&old, &new, "code", "structure"));
        assert_eq!(diff.counts.unchanged, 1);
        assert_eq!(
            diff.duplicate_keys,
            vec![DuplicateKey { side: DiffSide::Old, key: "A".to_string(), occurrences: 2 }]
        );
    }

    #[test]
    fn self_diff_with_duplicate_and_blank_keys() {
        let messy = table(vec![
            json!({"code": "A", "description": "first"}),
            json!({"code": "", "description": "ghost"}),
            json!({"code": "A", "description": "second"}),
            json!({"code": "B", "description": "other"}),
            json!({"code": null, "description": "ghost"}),
            json!({"code": "A", "description": "third"}),
        ]);
        let diff = must(compare_tables(&messy, &messy, "code", "structure"));
        assert_eq!(diff.counts, DiffCounts { added: 2, deleted: 2, modified: 0, unchanged: 2 });
        assert!(diff.added.iter().chain(&diff.deleted).all(|entry| entry.key.is_none()));
        assert_eq!(
            diff.duplicate_keys,
            vec![
                DuplicateKey { side: DiffSide::Old, key: "A".to_string(), occurrences: 3 },
                DuplicateKey { side: DiffSide::New, key: "A".to_string(), occurrences: 3 },
            ]
        );
        assert!(diff.report_rows().iter().all(|row| row.kind != ChangeKind::Modified));
    }

    #[test]
    fn severity_summary_and_report_rows() {
        let old = table(vec![json!({"code": "A", "approver": "", "cost_center": "1"})]);
        let new = table(vec![
            json!({"code": "A", "approver": "SI", "cost_center": "2"}),
            json!({"code": "B", "approver": "", "cost_center": "3"}),
        ]);
        let diff = must(compare_tables(&old, &new, "code", "structure"));
        let summary = diff.severity_summary();
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.low, 1);
        assert_eq!(summary.critical_changes, vec!["A: approver ((empty) -> SI)"]);

        let rows = diff.report_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, ChangeKind::Added);
        assert_eq!(rows[1].field.as_deref(), Some("approver"));
        assert_eq!(rows[2].new_value.as_deref(), Some("2"));
    }

    #[test]
    fn dataset_diff_covers_both_collections() {
        let old = OrgDataset {
            persons: Vec::new(),
            structures: vec![StructureRecord::new("A", "Root", None)],
        };
        let mut new = old.clone();
        new.structures.push(StructureRecord::new("B", "Child", Some("A")));
        let diff = must(compare_datasets(&old, &new));
        assert_eq!(diff.structures.counts.added, 1);
        assert!(!diff.persons.has_changes());
        assert!(diff.has_changes());
    }

    fn arb_table() -> impl Strategy<Value = Table> {
        proptest::collection::btree_map(
            "[A-E]{1,2}",
            (proptest::option::of("[a-c]{0,2}"), proptest::option::of(0_u8..3)),
            0..12,
        )
        .prop_map(|entries: BTreeMap<String, (Option<String>, Option<u8>)>| {
            let mut table = Table::new(vec![
                "code".to_string(),
                "description".to_string(),
                "level".to_string(),
            ]);
            for (code, (description, level)) in entries {
                table.push(row(json!({"code": code, "description": description, "level": level})));
            }
            table
        })
    }

    fn arb_messy_table() -> impl Strategy<Value = Table> {
        let key = prop_oneof![
            Just(Value::Null),
            Just(json!("")),
            Just(json!("  ")),
            "[A-C]".prop_map(Value::String),
        ];
        proptest::collection::vec((key, proptest::option::of("[a-b]{0,1}")), 0..10).prop_map(
            |rows: Vec<(Value, Option<String>)>| {
                let mut table = Table::new(vec!["code".to_string(), "description".to_string()]);
                for (code, description) in rows {
                    table.push(row(json!({"code": code, "description": description})));
                }
                table
            },
        )
    }

    fn change_set(diff: &DiffResult, reversed: bool) -> Vec<(String, String, Value, Value)> {
        let mut changes = diff
            .modified
            .iter()
            .flat_map(|record| {
                record.changes.iter().map(move |change| {
                    let (old, new) = if reversed {
                        (change.new_value.clone(), change.old_value.clone())
                    } else {
                        (change.old_value.clone(), change.new_value.clone())
                    };
                    (record.key.clone(), change.field.clone(), old, new)
                })
            })
            .collect::<Vec<_>>();
        changes.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        changes
    }

    fn keys(entries: &[DiffEntry]) -> Vec<Option<String>> {
        let mut keys = entries.iter().map(|entry| entry.key.clone()).collect::<Vec<_>>();
        keys.sort();
        keys
    }

    proptest! {
        #[test]
        fn property_identical_tables_have_no_changes(table in arb_table()) {
            let diff = must(compare_tables(&table, &table, "code", "structure"));
            prop_assert_eq!(diff.counts.added, 0);
            prop_assert_eq!(diff.counts.deleted, 0);
            prop_assert_eq!(diff.counts.modified, 0);
            prop_assert_eq!(diff.counts.unchanged, table.len());
        }

        #[test]
        fn property_self_diff_never_modifies(table in arb_messy_table()) {
            let diff = must(compare_tables(&table, &table, "code", "structure"));
            let keyless = table.rows.iter().filter(|row| record_key(row, "code").is_none()).count();
            let distinct = table
                .rows
                .iter()
                .filter_map(|row| record_key(row, "code"))
                .collect::<std::collections::BTreeSet<_>>();
            prop_assert_eq!(diff.counts.modified, 0);
            prop_assert_eq!(diff.counts.unchanged, distinct.len());
            prop_assert_eq!(diff.counts.added, keyless);
            prop_assert_eq!(diff.counts.deleted, keyless);
            let side = |wanted: DiffSide| {
                diff.duplicate_keys
                    .iter()
                    .filter(|dup| dup.side == wanted)
                    .map(|dup| (dup.key.clone(), dup.occurrences))
                    .collect::<Vec<_>>()
            };
            let old_dups = side(DiffSide::Old);
            prop_assert_eq!(&old_dups, &side(DiffSide::New));
            let repeated = old_dups.iter().map(|(_, occurrences)| occurrences - 1).sum::<usize>();
            prop_assert_eq!(table.len() - keyless, distinct.len() + repeated);
        }

        #[test]
        fn property_reversed_diff_swaps_added_and_deleted(a in arb_table(), b in arb_table()) {
            let forward = must(compare_tables(&a, &b, "code", "structure"));
            let backward = must(compare_tables(&b, &a, "code", "structure"));
            prop_assert_eq!(keys(&forward.added), keys(&backward.deleted));
            prop_assert_eq!(keys(&forward.deleted), keys(&backward.added));
            prop_assert_eq!(forward.counts.unchanged, backward.counts.unchanged);
            prop_assert_eq!(change_set(&forward, false), change_set(&backward, true));
        }
    }
}
