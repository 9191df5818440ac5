use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CRITICAL" => Some(Self::Critical),
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

// Checked in order; the first group with a matching keyword wins.
const CRITICAL_KEYWORDS: &[&str] = &[
    "approver",
    "controller",
    "cashier",
    "traveler",
    "approvatore",
    "controllore",
    "cassiere",
    "viaggiatore",
];
const HIGH_KEYWORDS: &[&str] =
    &["parent", "code", "description", "unita operativa padre", "codice", "descrizione"];
const MEDIUM_KEYWORDS: &[&str] = &[
    "display name",
    "org unit",
    "organizational unit",
    "site",
    "secretary",
    "titolare",
    "unità organizzativa",
    "sede",
    "segretario",
];

/// Severity tier of a changed field, by case-insensitive keyword match.
///
/// Underscores count as spaces, so `parent_code` matches `parent`.
#[must_use]
pub fn classify_field(field: &str) -> Severity {
    let normalized = field.to_lowercase().replace('_', " ");
    let matches = |keywords: &[&str]| keywords.iter().any(|keyword| normalized.contains(keyword));
    if matches(CRITICAL_KEYWORDS) {
        Severity::Critical
    } else if matches(HIGH_KEYWORDS) {
        Severity::High
    } else if matches(MEDIUM_KEYWORDS) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Per-tier change counts plus the details of critical and high changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeveritySummary {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub critical_changes: Vec<String>,
    pub high_changes: Vec<String>,
}

impl SeveritySummary {
    pub fn record(&mut self, severity: Severity, detail: impl FnOnce() -> String) {
        match severity {
            Severity::Critical => {
                self.critical += 1;
                self.critical_changes.push(detail());
            }
            Severity::High => {
                self.high += 1;
                self.high_changes.push(detail());
            }
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}
