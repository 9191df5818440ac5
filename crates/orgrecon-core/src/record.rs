use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{cell_text, is_blank, Row, Table};

pub const TAX_ID_FIELD: &str = "tax_id";
pub const CODE_FIELD: &str = "code";
pub const TAX_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Person,
    Structure,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Structure => "structure",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "person" => Some(Self::Person),
            "structure" => Some(Self::Structure),
            _ => None,
        }
    }

    /// Column that uniquely identifies a record of this kind.
    #[must_use]
    pub fn key_field(self) -> &'static str {
        match self {
            Self::Person => TAX_ID_FIELD,
            Self::Structure => CODE_FIELD,
        }
    }
}

/// A row with a populated tax id is a person, anything else is a structure.
#[must_use]
pub fn classify_row(row: &Row) -> RecordKind {
    if is_blank(row.get(TAX_ID_FIELD)) {
        RecordKind::Structure
    } else {
        RecordKind::Person
    }
}

/// Normalized key of a row, `None` when the key cell is blank.
#[must_use]
pub fn record_key(row: &Row, key_field: &str) -> Option<String> {
    cell_text(row, key_field)
}

/// Key used for source/target matching: trimmed and uppercased.
#[must_use]
pub fn match_key(row: &Row, key_field: &str) -> Option<String> {
    record_key(row, key_field).map(|key| key.to_uppercase())
}

/// Checks the 16-character alphanumeric national identifier format.
#[must_use]
pub fn is_valid_tax_id(value: &str) -> bool {
    let candidate = value.trim();
    candidate.len() == TAX_ID_LEN && candidate.chars().all(|ch| ch.is_ascii_alphanumeric())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Traveler,
    EditorialSecretary,
    Approver,
    Cashier,
    Viewer,
    Secretary,
    Controller,
    Administration,
    AssistantEditorialSecretary,
    AssistantSecretary,
    AssistantController,
    FinanceRoles,
    HrRoles,
    OtherRoles,
    PortalRoles,
    Roles,
}

impl Role {
    pub const ALL: [Self; 16] = [
        Self::Traveler,
        Self::EditorialSecretary,
        Self::Approver,
        Self::Cashier,
        Self::Viewer,
        Self::Secretary,
        Self::Controller,
        Self::Administration,
        Self::AssistantEditorialSecretary,
        Self::AssistantSecretary,
        Self::AssistantController,
        Self::FinanceRoles,
        Self::HrRoles,
        Self::OtherRoles,
        Self::PortalRoles,
        Self::Roles,
    ];

    /// Column name of the role flag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Traveler => "traveler",
            Self::EditorialSecretary => "editorial_secretary",
            Self::Approver => "approver",
            Self::Cashier => "cashier",
            Self::Viewer => "viewer",
            Self::Secretary => "secretary",
            Self::Controller => "controller",
            Self::Administration => "administration",
            Self::AssistantEditorialSecretary => "assistant_editorial_secretary",
            Self::AssistantSecretary => "assistant_secretary",
            Self::AssistantController => "assistant_controller",
            Self::FinanceRoles => "finance_roles",
            Self::HrRoles => "hr_roles",
            Self::OtherRoles => "other_roles",
            Self::PortalRoles => "portal_roles",
            Self::Roles => "roles",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == value)
    }
}

/// Role flag markers. A role is active when its marker is present and non-blank.
///
/// `portal_roles` and `roles` hold free-text role lists rather than yes markers;
/// any non-blank text counts as active.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traveler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editorial_secretary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub administration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_editorial_secretary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_secretary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finance_roles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hr_roles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_roles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_roles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<String>,
}

impl RoleFlags {
    #[must_use]
    pub fn get(&self, role: Role) -> Option<&str> {
        let slot = match role {
            Role::Traveler => &self.traveler,
            Role::EditorialSecretary => &self.editorial_secretary,
            Role::Approver => &self.approver,
            Role::Cashier => &self.cashier,
            Role::Viewer => &self.viewer,
            Role::Secretary => &self.secretary,
            Role::Controller => &self.controller,
            Role::Administration => &self.administration,
            Role::AssistantEditorialSecretary => &self.assistant_editorial_secretary,
            Role::AssistantSecretary => &self.assistant_secretary,
            Role::AssistantController => &self.assistant_controller,
            Role::FinanceRoles => &self.finance_roles,
            Role::HrRoles => &self.hr_roles,
            Role::OtherRoles => &self.other_roles,
            Role::PortalRoles => &self.portal_roles,
            Role::Roles => &self.roles,
        };
        slot.as_deref()
    }

    pub fn set(&mut self, role: Role, marker: Option<String>) {
        let slot = match role {
            Role::Traveler => &mut self.traveler,
            Role::EditorialSecretary => &mut self.editorial_secretary,
            Role::Approver => &mut self.approver,
            Role::Cashier => &mut self.cashier,
            Role::Viewer => &mut self.viewer,
            Role::Secretary => &mut self.secretary,
            Role::Controller => &mut self.controller,
            Role::Administration => &mut self.administration,
            Role::AssistantEditorialSecretary => &mut self.assistant_editorial_secretary,
            Role::AssistantSecretary => &mut self.assistant_secretary,
            Role::AssistantController => &mut self.assistant_controller,
            Role::FinanceRoles => &mut self.finance_roles,
            Role::HrRoles => &mut self.hr_roles,
            Role::OtherRoles => &mut self.other_roles,
            Role::PortalRoles => &mut self.portal_roles,
            Role::Roles => &mut self.roles,
        };
        *slot = marker;
    }

    #[must_use]
    pub fn is_active(&self, role: Role) -> bool {
        self.get(role).is_some_and(|marker| !marker.trim().is_empty())
    }

    #[must_use]
    pub fn active(&self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|role| self.is_active(*role)).collect()
    }

    fn from_row(row: &Row) -> Self {
        let mut flags = Self::default();
        for role in Role::ALL {
            flags.set(role, cell_text(row, role.as_str()));
        }
        flags
    }

    fn write_into(&self, row: &mut Row) {
        for role in Role::ALL {
            row.insert(role.as_str().to_string(), opt_cell(self.get(role)));
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersonRecord {
    pub tax_id: String,
    pub display_name: String,
    pub code: String,
    pub org_unit: String,
    #[serde(default)]
    pub cost_center: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub union_group: Option<String>,
    #[serde(default)]
    pub roles: RoleFlags,
    /// Columns outside the fixed schema, kept verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: Row,
}

impl PersonRecord {
    pub const COLUMNS: [&'static str; 8] = [
        TAX_ID_FIELD,
        "display_name",
        CODE_FIELD,
        "org_unit",
        "cost_center",
        "level",
        "site",
        "union_group",
    ];

    /// Builds a record from a row, normalizing known columns.
    ///
    /// Missing required cells become empty strings; validation reports them.
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        Self {
            tax_id: cell_text(row, TAX_ID_FIELD).unwrap_or_default().to_uppercase(),
            display_name: cell_text(row, "display_name").unwrap_or_default(),
            code: cell_text(row, CODE_FIELD).unwrap_or_default(),
            org_unit: cell_text(row, "org_unit").unwrap_or_default(),
            cost_center: cell_text(row, "cost_center"),
            level: cell_text(row, "level"),
            site: cell_text(row, "site"),
            union_group: cell_text(row, "union_group"),
            roles: RoleFlags::from_row(row),
            extra: extra_columns(row, &Self::COLUMNS),
        }
    }

    #[must_use]
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(TAX_ID_FIELD.to_string(), Value::String(self.tax_id.clone()));
        row.insert("display_name".to_string(), Value::String(self.display_name.clone()));
        row.insert(CODE_FIELD.to_string(), Value::String(self.code.clone()));
        row.insert("org_unit".to_string(), Value::String(self.org_unit.clone()));
        row.insert("cost_center".to_string(), opt_cell(self.cost_center.as_deref()));
        row.insert("level".to_string(), opt_cell(self.level.as_deref()));
        row.insert("site".to_string(), opt_cell(self.site.as_deref()));
        row.insert("union_group".to_string(), opt_cell(self.union_group.as_deref()));
        self.roles.write_into(&mut row);
        for (column, value) in &self.extra {
            row.insert(column.clone(), value.clone());
        }
        row
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StructureRecord {
    pub code: String,
    pub description: String,
    /// Absent for roots.
    #[serde(default)]
    pub parent_code: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub cost_center: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub union_group: Option<String>,
    #[serde(default)]
    pub roles: RoleFlags,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: Row,
}

impl StructureRecord {
    pub const COLUMNS: [&'static str; 8] = [
        TAX_ID_FIELD,
        CODE_FIELD,
        "description",
        "parent_code",
        "level",
        "cost_center",
        "site",
        "union_group",
    ];

    #[must_use]
    pub fn new(code: &str, description: &str, parent_code: Option<&str>) -> Self {
        Self {
            code: code.to_string(),
            description: description.to_string(),
            parent_code: parent_code.map(str::to_string),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        Self {
            code: cell_text(row, CODE_FIELD).unwrap_or_default(),
            description: cell_text(row, "description").unwrap_or_default(),
            parent_code: cell_text(row, "parent_code"),
            level: cell_text(row, "level"),
            cost_center: cell_text(row, "cost_center"),
            site: cell_text(row, "site"),
            union_group: cell_text(row, "union_group"),
            roles: RoleFlags::from_row(row),
            extra: extra_columns(row, &Self::COLUMNS),
        }
    }

    /// Row form; the tax id column is always written empty.
    #[must_use]
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(TAX_ID_FIELD.to_string(), Value::Null);
        row.insert(CODE_FIELD.to_string(), Value::String(self.code.clone()));
        row.insert("description".to_string(), Value::String(self.description.clone()));
        row.insert("parent_code".to_string(), opt_cell(self.parent_code.as_deref()));
        row.insert("level".to_string(), opt_cell(self.level.as_deref()));
        row.insert("cost_center".to_string(), opt_cell(self.cost_center.as_deref()));
        row.insert("site".to_string(), opt_cell(self.site.as_deref()));
        row.insert("union_group".to_string(), opt_cell(self.union_group.as_deref()));
        self.roles.write_into(&mut row);
        for (column, value) in &self.extra {
            row.insert(column.clone(), value.clone());
        }
        row
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrgRecord {
    Person(PersonRecord),
    Structure(StructureRecord),
}

impl OrgRecord {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Person(_) => RecordKind::Person,
            Self::Structure(_) => RecordKind::Structure,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Person(person) => &person.tax_id,
            Self::Structure(structure) => &structure.code,
        }
    }

    /// Dispatches on [`classify_row`].
    #[must_use]
    pub fn from_row(row: &Row) -> Self {
        match classify_row(row) {
            RecordKind::Person => Self::Person(PersonRecord::from_row(row)),
            RecordKind::Structure => Self::Structure(StructureRecord::from_row(row)),
        }
    }
}

/// Both record collections of one organization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrgDataset {
    #[serde(default)]
    pub persons: Vec<PersonRecord>,
    #[serde(default)]
    pub structures: Vec<StructureRecord>,
}

impl OrgDataset {
    /// Splits a mixed sheet by [`classify_row`].
    #[must_use]
    pub fn from_mixed_rows(rows: &[Row]) -> Self {
        let mut dataset = Self::default();
        for row in rows {
            match OrgRecord::from_row(row) {
                OrgRecord::Person(person) => dataset.persons.push(person),
                OrgRecord::Structure(structure) => dataset.structures.push(structure),
            }
        }
        dataset
    }

    #[must_use]
    pub fn persons_table(&self) -> Table {
        build_table(&PersonRecord::COLUMNS, self.persons.iter().map(PersonRecord::to_row))
    }

    #[must_use]
    pub fn structures_table(&self) -> Table {
        build_table(&StructureRecord::COLUMNS, self.structures.iter().map(StructureRecord::to_row))
    }

    #[must_use]
    pub fn table(&self, kind: RecordKind) -> Table {
        match kind {
            RecordKind::Person => self.persons_table(),
            RecordKind::Structure => self.structures_table(),
        }
    }

    #[must_use]
    pub fn from_tables(persons: &Table, structures: &Table) -> Self {
        Self {
            persons: persons.rows.iter().map(PersonRecord::from_row).collect(),
            structures: structures.rows.iter().map(StructureRecord::from_row).collect(),
        }
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.persons.len() + self.structures.len()
    }
}

fn build_table(fixed: &[&str], rows: impl Iterator<Item = Row>) -> Table {
    let mut columns = fixed.iter().map(|column| (*column).to_string()).collect::<Vec<_>>();
    columns.extend(Role::ALL.iter().map(|role| role.as_str().to_string()));
    let mut table = Table::new(columns);
    for row in rows {
        table.push(row);
    }
    table
}

fn extra_columns(row: &Row, fixed: &[&str]) -> Row {
    row.iter()
        .filter(|(column, _)| {
            !fixed.contains(&column.as_str()) && Role::parse(column.as_str()).is_none()
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn opt_cell(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::String(text.to_string()))
}
