use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::hierarchy::Hierarchy;
use crate::record::{
    is_valid_tax_id, PersonRecord, RecordKind, Role, StructureRecord, CODE_FIELD, TAX_ID_FIELD,
};
use crate::value::{cell_text, is_blank, Row, Table};

const PERSON_REQUIRED: [&str; 4] = [TAX_ID_FIELD, "display_name", CODE_FIELD, "org_unit"];
const STRUCTURE_REQUIRED: [&str; 2] = [CODE_FIELD, "description"];
const PERSON_RECOMMENDED: [&str; 3] = ["cost_center", "site", "level"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub record_kind: RecordKind,
    /// Zero-based position of the row in its input table.
    pub row: usize,
    pub field: Option<String>,
    pub identifier: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(kind: RecordKind, row: usize, field: Option<&str>, identifier: Option<&str>, message: String) -> Self {
        Self {
            level: IssueLevel::Error,
            record_kind: kind,
            row,
            field: field.map(str::to_string),
            identifier: identifier.map(str::to_string),
            message,
        }
    }

    fn warning(kind: RecordKind, row: usize, field: Option<&str>, identifier: Option<&str>, message: String) -> Self {
        Self { level: IssueLevel::Warning, ..Self::error(kind, row, field, identifier, message) }
    }
}

/// Accepted records with the errors and warnings found on the way.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationResult {
    pub persons: Vec<PersonRecord>,
    pub structures: Vec<StructureRecord>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} person(s) and {} structure(s) accepted, {} error(s), {} warning(s)",
            self.persons.len(),
            self.structures.len(),
            self.errors.len(),
            self.warnings.len()
        )
    }
}

/// Schema checks for one person row.
///
/// # Errors
/// Returns every blocking issue found on the row.
pub fn check_person_row(row_index: usize, row: &Row) -> Result<PersonRecord, Vec<ValidationIssue>> {
    let kind = RecordKind::Person;
    let identifier = cell_text(row, TAX_ID_FIELD).map(|tax_id| tax_id.to_uppercase());
    let mut issues = missing_required(kind, row_index, row, &PERSON_REQUIRED, identifier.as_deref());
    if let Some(tax_id) = identifier.as_deref() {
        if !is_valid_tax_id(tax_id) {
            issues.push(ValidationIssue::error(
                kind,
                row_index,
                Some(TAX_ID_FIELD),
                Some(tax_id),
                format!("tax id `{tax_id}` must be 16 alphanumeric characters"),
            ));
        }
    }
    if issues.is_empty() {
        Ok(PersonRecord::from_row(row))
    } else {
        Err(issues)
    }
}

/// Schema checks for one structure row.
///
/// # Errors
/// Returns every blocking issue found on the row.
pub fn check_structure_row(
    row_index: usize,
    row: &Row,
) -> Result<StructureRecord, Vec<ValidationIssue>> {
    let kind = RecordKind::Structure;
    let identifier = cell_text(row, CODE_FIELD);
    let code = identifier.as_deref();
    let mut issues = missing_required(kind, row_index, row, &STRUCTURE_REQUIRED, code);
    if let Some(tax_id) = cell_text(row, TAX_ID_FIELD) {
        issues.push(ValidationIssue::error(
            kind,
            row_index,
            Some(TAX_ID_FIELD),
            code,
            format!("structure must not carry a tax id, found `{tax_id}`"),
        ));
    }
    for role in Role::ALL {
        if !is_blank(row.get(role.as_str())) {
            issues.push(ValidationIssue::error(
                kind,
                row_index,
                Some(role.as_str()),
                code,
                format!("structure must not hold role `{}`", role.as_str()),
            ));
        }
    }
    if let (Some(code), Some(parent)) = (code, cell_text(row, "parent_code")) {
        if code == parent {
            issues.push(ValidationIssue::error(
                kind,
                row_index,
                Some("parent_code"),
                Some(code),
                format!("structure {code} references itself as parent"),
            ));
        }
    }
    if issues.is_empty() {
        Ok(StructureRecord::from_row(row))
    } else {
        Err(issues)
    }
}

/// Validates both collections: a per-row schema pass, then cross-record rules
/// over the rows that passed it.
#[must_use]
pub fn validate_dataset(persons: &Table, structures: &Table) -> ValidationResult {
    let mut result = ValidationResult::default();

    let mut structure_rows = Vec::new();
    for (index, row) in structures.rows.iter().enumerate() {
        match check_structure_row(index, row) {
            Ok(record) => structure_rows.push((index, record)),
            Err(issues) => result.errors.extend(issues),
        }
    }
    let mut person_rows = Vec::new();
    for (index, row) in persons.rows.iter().enumerate() {
        match check_person_row(index, row) {
            Ok(record) => person_rows.push((index, record)),
            Err(issues) => result.errors.extend(issues),
        }
    }

    let structure_rows = drop_duplicates(RecordKind::Structure, structure_rows, |record| &record.code, &mut result);
    let person_rows = drop_duplicates(RecordKind::Person, person_rows, |record| &record.tax_id, &mut result);

    // Reference checks run against every structure that passed the schema pass,
    // so one broken unit does not cascade onto its members.
    let known_codes = structure_rows.iter().map(|(_, record)| record.code.clone()).collect::<HashSet<_>>();
    let records = structure_rows.iter().map(|(_, record)| record.clone()).collect::<Vec<_>>();
    let hierarchy = Hierarchy::new(&records);
    let report = hierarchy.report();

    let row_of = structure_rows
        .iter()
        .map(|(index, record)| (record.code.clone(), *index))
        .collect::<HashMap<_, _>>();
    for cycle in &report.cycles {
        let first = cycle.split(" -> ").next().unwrap_or_default();
        result.errors.push(ValidationIssue::error(
            RecordKind::Structure,
            row_of.get(first).copied().unwrap_or_default(),
            Some("parent_code"),
            Some(first),
            format!("parent cycle detected: {cycle}"),
        ));
    }

    let mut rejected = report.cycle_members.clone();
    for orphan in &report.orphans {
        result.errors.push(ValidationIssue::error(
            RecordKind::Structure,
            row_of.get(&orphan.code).copied().unwrap_or_default(),
            Some("parent_code"),
            Some(&orphan.code),
            format!(
                "structure {} references missing parent {}",
                orphan.code, orphan.missing_parent
            ),
        ));
        rejected.insert(orphan.code.clone());
    }

    let mut pending = rejected.iter().cloned().collect::<Vec<_>>();
    while let Some(code) = pending.pop() {
        for &child in hierarchy.children(&code) {
            if rejected.insert(child.to_string()) {
                result.warnings.push(ValidationIssue::warning(
                    RecordKind::Structure,
                    row_of.get(child).copied().unwrap_or_default(),
                    Some("parent_code"),
                    Some(child),
                    format!("structure {child} dropped because its parent {code} was rejected"),
                ));
                pending.push(child.to_string());
            }
        }
    }

    for (index, person) in person_rows {
        if !known_codes.contains(&person.org_unit) {
            result.errors.push(ValidationIssue::error(
                RecordKind::Person,
                index,
                Some("org_unit"),
                Some(&person.tax_id),
                format!("org unit {} does not match any structure", person.org_unit),
            ));
            continue;
        }
        let missing = PERSON_RECOMMENDED
            .iter()
            .filter(|field| is_blank(persons.rows[index].get(**field)))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            result.warnings.push(ValidationIssue::warning(
                RecordKind::Person,
                index,
                None,
                Some(&person.tax_id),
                format!("incomplete record, missing {}", missing.join(", ")),
            ));
        }
        result.persons.push(person);
    }
    let staffed = result.persons.iter().map(|person| person.org_unit.as_str()).collect::<HashSet<_>>();

    let mut empty = Vec::new();
    for (index, record) in &structure_rows {
        if rejected.contains(&record.code) {
            continue;
        }
        if hierarchy.children(&record.code).is_empty() && !staffed.contains(record.code.as_str()) {
            empty.push((*index, record.code.clone()));
        }
    }
    for (index, code) in empty {
        result.warnings.push(ValidationIssue::warning(
            RecordKind::Structure,
            index,
            None,
            Some(&code),
            format!("structure {code} has no members and no child units"),
        ));
    }

    result.structures = structure_rows
        .into_iter()
        .filter(|(_, record)| !rejected.contains(&record.code))
        .map(|(_, record)| record)
        .collect();

    tracing::debug!(summary = %result.summary(), "dataset validated");
    result
}

fn missing_required(
    kind: RecordKind,
    row_index: usize,
    row: &Row,
    required: &[&str],
    identifier: Option<&str>,
) -> Vec<ValidationIssue> {
    required
        .iter()
        .filter(|field| is_blank(row.get(**field)))
        .map(|field| {
            ValidationIssue::error(
                kind,
                row_index,
                Some(*field),
                identifier,
                format!("required field `{field}` is empty"),
            )
        })
        .collect()
}

fn drop_duplicates<T>(
    kind: RecordKind,
    rows: Vec<(usize, T)>,
    key: impl Fn(&T) -> &String,
    result: &mut ValidationResult,
) -> Vec<(usize, T)> {
    let mut seen = BTreeSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    for (index, record) in rows {
        let id = key(&record).clone();
        if seen.insert(id.clone()) {
            kept.push((index, record));
        } else {
            result.errors.push(ValidationIssue::error(
                kind,
                index,
                Some(kind.key_field()),
                Some(&id),
                format!("duplicate {} key {id}", kind.as_str()),
            ));
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn table(rows: Vec<Value>) -> Table {
        Table::from_rows(
            rows.into_iter()
                .map(|value| match value {
                    Value::Object(map) => map,
                    other => panic!("fixture must be an object, got {other}"),
                })
                .collect(),
        )
    }

    fn person(tax_id: &str, org_unit: &str) -> Value {
        json!({
            "tax_id": tax_id,
            "display_name": "Mario Rossi",
            "code": 1001.0,
            "org_unit": org_unit,
            "cost_center": "CC1",
            "site": "Rome",
            "level": 3
        })
    }

    #[test]
    fn valid_dataset_passes_with_no_errors() {
        let structures = table(vec![
            json!({"tax_id": "", "code": "ROOT", "description": "Company", "parent_code": null}),
            json!({"tax_id": null, "code": "S1", "description": "Sales", "parent_code": "ROOT"}),
        ]);
        let persons = table(vec![person("RSSMRA80A01H501Z", "S1")]);
        let result = validate_dataset(&persons, &structures);
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.persons.len(), 1);
        assert_eq!(result.persons[0].code, "1001");
        assert_eq!(result.persons[0].level.as_deref(), Some("3"));
        assert_eq!(result.structures.len(), 2);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn dangling_org_unit_is_reported() {
        let structures = table(vec![json!({"code": "ROOT", "description": "Company"})]);
        let persons = table(vec![person("RSSMRA80A01H501Z", "X")]);
        let result = validate_dataset(&persons, &structures);
        assert!(!result.is_valid());
        let issue = &result.errors[0];
        assert_eq!(issue.field.as_deref(), Some("org_unit"));
        assert_eq!(issue.identifier.as_deref(), Some("RSSMRA80A01H501Z"));
        assert!(issue.message.contains('X'));
        assert!(result.persons.is_empty());
    }

    #[test]
    fn schema_errors_name_row_field_and_identifier() {
        let persons = table(vec![
            json!({"tax_id": "SHORT", "display_name": "", "code": "1", "org_unit": "S1"}),
        ]);
        let result = validate_dataset(&persons, &Table::default());
        let fields = result.errors.iter().filter_map(|issue| issue.field.clone()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["display_name", "tax_id"]);
        assert!(result.errors.iter().all(|issue| issue.row == 0));
        assert!(result.errors.iter().all(|issue| issue.identifier.as_deref() == Some("SHORT")));
    }

    #[test]
    fn structure_rules_reject_tax_id_roles_and_self_parent() {
        let structures = table(vec![
            json!({"tax_id": "RSSMRA80A01H501Z", "code": "A", "description": "x"}),
            json!({"code": "B", "description": "x", "approver": "SI"}),
            json!({"code": "C", "description": "x", "parent_code": "C"}),
        ]);
        let result = validate_dataset(&Table::default(), &structures);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.errors[0].field.as_deref(), Some("tax_id"));
        assert_eq!(result.errors[1].field.as_deref(), Some("approver"));
        assert!(result.errors[2].message.contains("itself"));
        assert!(result.structures.is_empty());
    }

    #[test]
    fn structures_with_role_lists_are_rejected() {
        let structures = table(vec![
            json!({"code": "P", "description": "x", "portal_roles": "editor"}),
            json!({"code": "R", "description": "x", "roles": "HR", "assistant_controller": "SI"}),
        ]);
        let result = validate_dataset(&Table::default(), &structures);
        let fields = result.errors.iter().filter_map(|issue| issue.field.as_deref()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["portal_roles", "assistant_controller", "roles"]);
        assert!(result.structures.is_empty());
    }

    #[test]
    fn duplicates_cycles_and_orphans_are_blocking() {
        let structures = table(vec![
            json!({"code": "ROOT", "description": "Company"}),
            json!({"code": "ROOT", "description": "Again"}),
            json!({"code": "A", "description": "a", "parent_code": "B"}),
            json!({"code": "B", "description": "b", "parent_code": "A"}),
            json!({"code": "O", "description": "o", "parent_code": "MISSING"}),
        ]);
        let persons = table(vec![person("RSSMRA80A01H501Z", "ROOT")]);
        let result = validate_dataset(&persons, &structures);
        let messages = result.errors.iter().map(|issue| issue.message.as_str()).collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "duplicate structure key ROOT",
                "parent cycle detected: A -> B -> A",
                "structure O references missing parent MISSING",
            ]
        );
        assert_eq!(result.errors[0].row, 1);
        let accepted = result.structures.iter().map(|record| record.code.as_str()).collect::<Vec<_>>();
        assert_eq!(accepted, vec!["ROOT"]);
    }

    #[test]
    fn descendants_of_rejected_structures_are_dropped() {
        let structures = table(vec![
            json!({"code": "ROOT", "description": "Company"}),
            json!({"code": "O", "description": "o", "parent_code": "MISSING"}),
            json!({"code": "O1", "description": "o1", "parent_code": "O"}),
            json!({"code": "O2", "description": "o2", "parent_code": "O1"}),
        ]);
        let result = validate_dataset(&Table::default(), &structures);
        assert_eq!(result.errors.len(), 1);
        let dropped = result
            .warnings
            .iter()
            .filter(|issue| issue.message.contains("was rejected"))
            .filter_map(|issue| issue.identifier.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(dropped, vec!["O1", "O2"]);
        assert_eq!(result.warnings[0].row, 2);
        let accepted = result.structures.iter().map(|record| record.code.as_str()).collect::<Vec<_>>();
        assert_eq!(accepted, vec!["ROOT"]);
    }

    #[test]
    fn incomplete_persons_and_empty_structures_warn() {
        let structures = table(vec![
            json!({"code": "ROOT", "description": "Company"}),
            json!({"code": "IDLE", "description": "Unused", "parent_code": "ROOT"}),
            json!({"code": "S1", "description": "Sales", "parent_code": "ROOT"}),
        ]);
        let persons = table(vec![json!({
            "tax_id": "RSSMRA80A01H501Z",
            "display_name": "Mario Rossi",
            "code": "1",
            "org_unit": "S1"
        })]);
        let result = validate_dataset(&persons, &structures);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].message.contains("cost_center, site, level"));
        assert_eq!(result.warnings[1].identifier.as_deref(), Some("IDLE"));
        assert_eq!(result.persons.len(), 1);
        assert_eq!(
            result.summary(),
            "1 person(s) and 3 structure(s) accepted, 0 error(s), 2 warning(s)"
        );
    }
}
