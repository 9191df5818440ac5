//! Reconciliation core for HR master data: record keying, hierarchy checks,
//! diff, severity, merge, validation and change planning. No I/O.

pub mod command;
pub mod diff;
pub mod hierarchy;
pub mod merge;
pub mod record;
pub mod severity;
pub mod validate;
pub mod value;

pub use command::{
    apply_proposals, filter_rows, plan_changes, ChangePlan, ChangeProposal, CommandInterpreter,
    OperationType, ProposalFailure, ProposalOutcome, RiskLevel, StructuredCommand,
};
pub use diff::{
    compare_datasets, compare_tables, ChangeKind, DatasetDiff, DiffCounts, DiffEntry, DiffResult,
    DiffSide, DuplicateKey, FieldChange, ModifiedRecord, ReportRow,
};
pub use hierarchy::{
    detect_cycles, validate_hierarchy, Hierarchy, HierarchyReport, OrphanReference, MAX_WALK_DEPTH,
};
pub use merge::{
    ApplyError, ApplyOptions, FallbackStrategy, FieldConflict, GapAnalysis, GapDetail, GapPolicy,
    ListUnion, MatchResult, MatchStats, MatchedPair, MergeEngine, MergePreview, MergeRecord,
    MergeResult, MergeStrategy, MergeTarget, SeverityPolicy, SmartMerge, StrategyMap, TableTarget,
    UnmatchedRecord,
};
pub use record::{
    classify_row, is_valid_tax_id, match_key, record_key, OrgDataset, OrgRecord, PersonRecord,
    RecordKind, Role, RoleFlags, StructureRecord,
};
pub use severity::{classify_field, Severity, SeveritySummary};
pub use validate::{
    check_person_row, check_structure_row, validate_dataset, IssueLevel, ValidationIssue,
    ValidationResult,
};
pub use value::{cell_text, cells_equivalent, is_blank, normalize_cell, Row, Table};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconError {
    #[error("key field `{field}` is missing from the {side} schema")]
    MissingKeyField { field: String, side: &'static str },
    #[error("unknown record: {0}")]
    UnknownRecord(String),
    #[error("record {record_id} has no pending conflict on `{field}`")]
    UnknownConflict { record_id: String, field: String },
    #[error("pre-merge snapshot failed: {0}")]
    SnapshotCapture(String),
    #[error("command error: {0}")]
    Command(String),
}
