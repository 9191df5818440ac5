use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One spreadsheet row: column name to cell, in column order.
pub type Row = Map<String, Value>;

/// Returns true for absent, null, or whitespace-only string cells.
#[must_use]
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(_) => false,
    }
}

/// Canonical text form of a cell.
///
/// Blank cells become `None`, strings are trimmed and integral floats are
/// rendered without a fractional part (`16100.0` becomes `"16100"`).
#[must_use]
pub fn normalize_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(number) => Some(render_number(number)),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn render_number(number: &serde_json::Number) -> String {
    if number.is_i64() || number.is_u64() {
        return number.to_string();
    }
    match number.as_f64() {
        Some(float) if is_integral(float) => format!("{float:.0}"),
        _ => number.to_string(),
    }
}

fn is_integral(float: f64) -> bool {
    float.is_finite() && float.fract().abs() < f64::EPSILON && float.abs() < 1e15
}

/// Normalized text of `row[field]`.
#[must_use]
pub fn cell_text(row: &Row, field: &str) -> Option<String> {
    row.get(field).and_then(normalize_cell)
}

/// Cell equality used by diff and merge.
///
/// Two blank cells are equal, so null and empty string never count as a change.
/// Numbers compare by their normalized rendering (`45000` equals `45000.0`).
#[must_use]
pub fn cells_equivalent(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (is_blank(left), is_blank(right)) {
        (true, true) => return true,
        (true, false) | (false, true) => return false,
        (false, false) => {}
    }
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => render_number(a) == render_number(b),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A homogeneous record collection with an explicit column schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Builds a table whose schema is the union of row columns in first-seen order.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.push(row);
        }
        table
    }

    /// Appends a row, extending the schema with any column it introduces.
    pub fn push(&mut self, row: Row) {
        for column in row.keys() {
            if !self.has_column(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|existing| existing == column)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the first row whose normalized `key_field` equals `key`.
    #[must_use]
    pub fn position_by_key(&self, key_field: &str, key: &str) -> Option<usize> {
        self.rows.iter().position(|row| cell_text(row, key_field).as_deref() == Some(key))
    }
}
