use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::record::{record_key, RecordKind};
use crate::value::{cells_equivalent, is_blank, Row, Table};
use crate::ReconError;

/// Matches above this count collapse into one aggregated batch proposal.
pub const BATCH_AGGREGATE_THRESHOLD: usize = 10;
pub const MAX_PROPOSALS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    AddRecord,
    UpdateRecord,
    DeleteRecord,
    BatchUpdate,
    Query,
    ValidateFix,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddRecord => "add_record",
            Self::UpdateRecord => "update_record",
            Self::DeleteRecord => "delete_record",
            Self::BatchUpdate => "batch_update",
            Self::Query => "query",
            Self::ValidateFix => "validate_fix",
        }
    }

    /// Unknown operations read as [`OperationType::Query`], which never writes.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "add_record" => Self::AddRecord,
            "update_record" => Self::UpdateRecord,
            "delete_record" => Self::DeleteRecord,
            "batch_update" => Self::BatchUpdate,
            "validate_fix" => Self::ValidateFix,
            _ => Self::Query,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A translated edit request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredCommand {
    pub operation: OperationType,
    pub record_kind: RecordKind,
    #[serde(default)]
    pub filters: Row,
    #[serde(default)]
    pub values: Row,
    pub message: String,
}

impl StructuredCommand {
    /// Parses a translator reply, tolerating a fenced code block around the JSON.
    ///
    /// `operation` and `message` are required. Unknown operations become
    /// queries and unknown record types default to persons.
    ///
    /// # Errors
    /// Returns [`ReconError::Command`] when the reply is not a JSON object or
    /// lacks a required key.
    pub fn from_llm_json(reply: &str) -> Result<Self, ReconError> {
        let body = strip_code_fence(reply);
        let value: Value = serde_json::from_str(body)
            .map_err(|err| ReconError::Command(format!("reply is not valid JSON: {err}")))?;
        let Value::Object(object) = value else {
            return Err(ReconError::Command("reply must be a JSON object".to_string()));
        };

        let required_text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ReconError::Command(format!("reply is missing `{key}`")))
        };
        let operation = OperationType::parse_lenient(&required_text("operation")?);
        let message = required_text("message")?;
        let record_kind = match object.get("record_type").and_then(Value::as_str) {
            Some("structure" | "structures" | "strutture") => RecordKind::Structure,
            _ => RecordKind::Person,
        };
        let object_field = |key: &str| match object.get(key) {
            Some(Value::Object(map)) => map.clone(),
            _ => Row::new(),
        };

        Ok(Self {
            operation,
            record_kind,
            filters: object_field("filters"),
            values: object_field("values"),
            message,
        })
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Translates free text into a [`StructuredCommand`].
///
/// Implementations talk to an external service; nothing in this crate requires one.
pub trait CommandInterpreter {
    /// # Errors
    /// Returns [`ReconError::Command`] when the text cannot be translated.
    fn interpret(&self, text: &str, context_summary: &str) -> Result<StructuredCommand, ReconError>;
}

impl<F> CommandInterpreter for F
where
    F: Fn(&str, &str) -> Result<StructuredCommand, ReconError>,
{
    fn interpret(&self, text: &str, context_summary: &str) -> Result<StructuredCommand, ReconError> {
        self(text, context_summary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeProposal {
    pub change_id: String,
    pub operation: OperationType,
    pub record_kind: RecordKind,
    pub record_ids: Vec<String>,
    pub before: Option<Row>,
    pub after: Option<Row>,
    pub risk: RiskLevel,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePlan {
    pub operation: OperationType,
    pub matched: usize,
    pub proposals: Vec<ChangeProposal>,
    /// Set when more records matched than proposals were emitted.
    pub truncated: bool,
}

/// Rows of `table` matching every filter.
///
/// A scalar filter is an equality test, an array is membership and `null`
/// matches blank cells. Filters on columns the table lacks are ignored.
#[must_use]
pub fn filter_rows<'t>(table: &'t Table, filters: &Row) -> Vec<&'t Row> {
    let active = filters
        .iter()
        .filter(|(column, _)| table.has_column(column))
        .collect::<Vec<_>>();
    table
        .rows
        .iter()
        .filter(|row| {
            active.iter().all(|(column, expected)| {
                let cell = row.get(column.as_str());
                match expected {
                    Value::Null => is_blank(cell),
                    Value::Array(options) => {
                        options.iter().any(|option| cells_equivalent(cell, Some(option)))
                    }
                    scalar => cells_equivalent(cell, Some(scalar)),
                }
            })
        })
        .collect()
}

/// Turns a command into reviewable proposals against `table`. Nothing is written.
///
/// # Errors
/// Returns [`ReconError::Command`] for writes without values or filters, an
/// add without a key, or an add whose key already exists.
pub fn plan_changes(
    command: &StructuredCommand,
    table: &Table,
    key_field: &str,
) -> Result<ChangePlan, ReconError> {
    let kind = command.record_kind;
    match command.operation {
        OperationType::Query | OperationType::ValidateFix => {
            let matched = filter_rows(table, &command.filters).len();
            Ok(ChangePlan { operation: command.operation, matched, proposals: Vec::new(), truncated: false })
        }
        OperationType::AddRecord => {
            let key = record_key(&command.values, key_field).ok_or_else(|| {
                ReconError::Command(format!("add_record requires `{key_field}` in values"))
            })?;
            if table.position_by_key(key_field, &key).is_some() {
                return Err(ReconError::Command(format!("record {key} already exists")));
            }
            let proposal = ChangeProposal {
                change_id: Ulid::new().to_string(),
                operation: OperationType::AddRecord,
                record_kind: kind,
                record_ids: vec![key.clone()],
                before: None,
                after: Some(command.values.clone()),
                risk: RiskLevel::Low,
                description: format!("add {} {key}", kind.as_str()),
            };
            Ok(ChangePlan { operation: command.operation, matched: 0, proposals: vec![proposal], truncated: false })
        }
        OperationType::UpdateRecord | OperationType::BatchUpdate | OperationType::DeleteRecord => {
            if command.filters.is_empty() {
                return Err(ReconError::Command(format!(
                    "{} requires at least one filter",
                    command.operation.as_str()
                )));
            }
            let is_delete = command.operation == OperationType::DeleteRecord;
            if !is_delete && command.values.is_empty() {
                return Err(ReconError::Command(format!(
                    "{} requires values to set",
                    command.operation.as_str()
                )));
            }
            let rows = filter_rows(table, &command.filters);
            Ok(plan_writes(command, &rows, key_field, is_delete))
        }
    }
}

fn plan_writes(command: &StructuredCommand, rows: &[&Row], key_field: &str, is_delete: bool) -> ChangePlan {
    let kind = command.record_kind;
    let matched = rows.len();
    let risk = if is_delete || matched >= BATCH_AGGREGATE_THRESHOLD {
        RiskLevel::High
    } else if matched > 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    let keys = rows.iter().filter_map(|row| record_key(row, key_field)).collect::<Vec<_>>();

    if command.operation == OperationType::BatchUpdate && matched > BATCH_AGGREGATE_THRESHOLD {
        let proposal = ChangeProposal {
            change_id: Ulid::new().to_string(),
            operation: OperationType::BatchUpdate,
            record_kind: kind,
            record_ids: keys,
            before: None,
            after: Some(command.values.clone()),
            risk: RiskLevel::High,
            description: format!("set {} on {matched} {} record(s)", field_list(&command.values), kind.as_str()),
        };
        return ChangePlan { operation: command.operation, matched, proposals: vec![proposal], truncated: false };
    }

    let proposals = rows
        .iter()
        .filter_map(|row| record_key(row, key_field).map(|key| (key, *row)))
        .take(MAX_PROPOSALS)
        .map(|(key, row)| {
            let (after, description) = if is_delete {
                (None, format!("delete {} {key}", kind.as_str()))
            } else {
                let mut merged = row.clone();
                for (column, value) in &command.values {
                    merged.insert(column.clone(), value.clone());
                }
                (Some(merged), format!("set {} on {key}", field_list(&command.values)))
            };
            ChangeProposal {
                change_id: Ulid::new().to_string(),
                operation: command.operation,
                record_kind: kind,
                record_ids: vec![key],
                before: Some(row.clone()),
                after,
                risk,
                description,
            }
        })
        .collect::<Vec<_>>();
    ChangePlan { operation: command.operation, matched, truncated: keys.len() > proposals.len(), proposals }
}

fn field_list(values: &Row) -> String {
    values.keys().cloned().collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProposalFailure {
    pub change_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalOutcome {
    pub table: Table,
    pub applied: Vec<String>,
    pub failed: Vec<ProposalFailure>,
}

/// Applies proposals to a copy of `table`; a failing proposal leaves the
/// others untouched.
#[must_use]
pub fn apply_proposals(table: &Table, proposals: &[ChangeProposal], key_field: &str) -> ProposalOutcome {
    let mut outcome = ProposalOutcome { table: table.clone(), applied: Vec::new(), failed: Vec::new() };
    for proposal in proposals {
        match apply_one(&mut outcome.table, proposal, key_field) {
            Ok(()) => outcome.applied.push(proposal.change_id.clone()),
            Err(message) => {
                tracing::warn!(change_id = %proposal.change_id, %message, "change proposal rejected");
                outcome.failed.push(ProposalFailure { change_id: proposal.change_id.clone(), message });
            }
        }
    }
    outcome
}

fn apply_one(table: &mut Table, proposal: &ChangeProposal, key_field: &str) -> Result<(), String> {
    match proposal.operation {
        OperationType::AddRecord => {
            let row = proposal.after.as_ref().ok_or("add proposal has no values")?;
            let key = record_key(row, key_field).ok_or("add proposal has no key")?;
            if table.position_by_key(key_field, &key).is_some() {
                return Err(format!("record {key} already exists"));
            }
            table.push(row.clone());
            Ok(())
        }
        OperationType::DeleteRecord => {
            let positions = locate(table, &proposal.record_ids, key_field)?;
            for index in positions.into_iter().rev() {
                table.rows.remove(index);
            }
            Ok(())
        }
        OperationType::UpdateRecord | OperationType::BatchUpdate => {
            let values = proposal.after.as_ref().ok_or("update proposal has no values")?;
            let positions = locate(table, &proposal.record_ids, key_field)?;
            for column in values.keys() {
                if !table.has_column(column) {
                    table.columns.push(column.clone());
                }
            }
            for index in positions {
                for (column, value) in values {
                    if column != key_field {
                        table.rows[index].insert(column.clone(), value.clone());
                    }
                }
            }
            Ok(())
        }
        OperationType::Query | OperationType::ValidateFix => {
            Err(format!("{} proposals cannot be applied", proposal.operation.as_str()))
        }
    }
}

/// Row positions for `record_ids`, ascending and without repeats.
fn locate(table: &Table, record_ids: &[String], key_field: &str) -> Result<BTreeSet<usize>, String> {
    record_ids
        .iter()
        .map(|id| table.position_by_key(key_field, id).ok_or_else(|| format!("record {id} not found")))
        .collect()
}
