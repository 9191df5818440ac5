use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use orgrecon_core::{FallbackStrategy, GapPolicy, MergeStrategy, SeverityPolicy, StrategyMap};
use orgrecon_store_sqlite::DEFAULT_KEEP_LAST;
use serde::{Deserialize, Serialize};

/// Runtime settings, read from YAML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrgReconConfig {
    pub snapshots_dir: PathBuf,
    pub keep_last_snapshots: usize,
    pub merge: MergeConfig,
    pub gaps: GapPolicy,
}

impl Default for OrgReconConfig {
    fn default() -> Self {
        Self {
            snapshots_dir: PathBuf::from("snapshots"),
            keep_last_snapshots: DEFAULT_KEEP_LAST,
            merge: MergeConfig::default(),
            gaps: GapPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Same strategy for every field without an override; unset means by severity.
    pub default_strategy: Option<MergeStrategy>,
    pub severity_policy: SeverityPolicy,
    pub field_strategies: BTreeMap<String, MergeStrategy>,
}

impl MergeConfig {
    #[must_use]
    pub fn strategy_map(&self) -> StrategyMap {
        let fallback = match self.default_strategy {
            Some(strategy) => FallbackStrategy::Fixed { strategy },
            None => FallbackStrategy::BySeverity { policy: self.severity_policy },
        };
        StrategyMap { per_field: self.field_strategies.clone(), fallback }
    }
}

impl OrgReconConfig {
    /// Parse YAML settings.
    ///
    /// # Errors
    /// Returns an error when the text is not valid YAML for this shape.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).context("failed to parse orgrecon config")
    }

    /// Read settings from `path`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }
}
