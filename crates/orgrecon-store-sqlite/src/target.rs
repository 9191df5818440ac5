use anyhow::{anyhow, Result};
use orgrecon_core::{MergeTarget, PersonRecord, RecordKind, Row, StructureRecord};

use crate::snapshot::{SnapshotManager, SnapshotRequest, SOURCE_PRE_MERGE};
use crate::SqliteStore;

/// Merge destination over one record kind of a [`SqliteStore`].
///
/// The pre-merge snapshot is a full dataset file in `snapshots`.
pub struct StoreMergeTarget<'a> {
    store: &'a mut SqliteStore,
    snapshots: &'a SnapshotManager,
    kind: RecordKind,
    note: Option<String>,
}

impl<'a> StoreMergeTarget<'a> {
    #[must_use]
    pub fn new(store: &'a mut SqliteStore, snapshots: &'a SnapshotManager, kind: RecordKind) -> Self {
        Self { store, snapshots, kind, note: None }
    }

    #[must_use]
    pub fn with_note(mut self, note: &str) -> Self {
        self.note = Some(note.to_string());
        self
    }
}

impl MergeTarget for StoreMergeTarget<'_> {
    type Error = anyhow::Error;

    fn capture_snapshot(&mut self) -> Result<String> {
        let dataset = self.store.load_dataset()?;
        let mut request = SnapshotRequest::new(SOURCE_PRE_MERGE);
        request.user_note.clone_from(&self.note);
        Ok(self.snapshots.create(&dataset, &request)?.path)
    }

    fn write_record(&mut self, key_field: &str, key: &str, record: &Row) -> Result<()> {
        if key_field != self.kind.key_field() {
            return Err(anyhow!(
                "{} records are keyed by {}, not {key_field}",
                self.kind.as_str(),
                self.kind.key_field()
            ));
        }
        match self.kind {
            RecordKind::Person => {
                let mut person = PersonRecord::from_row(record);
                if person.tax_id.is_empty() {
                    person.tax_id = key.to_string();
                }
                if person.display_name.trim().is_empty() {
                    return Err(anyhow!("person {key} has no display_name"));
                }
                self.store.upsert_person(&person)
            }
            RecordKind::Structure => {
                let mut structure = StructureRecord::from_row(record);
                if structure.code.is_empty() {
                    structure.code = key.to_string();
                }
                if structure.parent_code.as_deref() == Some(structure.code.as_str()) {
                    return Err(anyhow!("structure {key} cannot be its own parent"));
                }
                self.store.upsert_structure(&structure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgrecon_core::{ApplyOptions, MergeEngine, MergeStrategy, OrgDataset, StrategyMap, Table};
    use serde_json::json;
    use std::path::Path;
    use ulid::Ulid;

    #[test]
    fn merge_writes_through_and_captures_pre_merge_snapshot() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("orgrecon-target-{}", Ulid::new()));
        let snapshots = SnapshotManager::new(&dir);
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.replace_dataset(&OrgDataset {
            persons: Vec::new(),
            structures: vec![
                StructureRecord::new("ROOT", "Company", None),
                StructureRecord::new("S1", "Sales", Some("ROOT")),
            ],
        })?;

        let current = store.load_dataset()?.structures_table();
        let mut incoming = Row::new();
        incoming.insert("code".to_string(), json!("S1"));
        incoming.insert("description".to_string(), json!("Sales EU"));
        incoming.insert("parent_code".to_string(), json!("ROOT"));
        let source = Table::from_rows(vec![incoming]);

        let engine = MergeEngine::new(StrategyMap::fixed(MergeStrategy::Overwrite));
        let matches = engine.match_records(&source, &current, "code")?;
        let preview = engine.preview(&matches);
        let mut target =
            StoreMergeTarget::new(&mut store, &snapshots, RecordKind::Structure).with_note("test");
        let result = engine.apply(&preview, &ApplyOptions::default(), &mut target)?;

        assert!(result.success);
        assert_eq!(result.applied, 1);
        let loaded = store.load_dataset()?;
        assert_eq!(loaded.structures[1].description, "Sales EU");

        let listed = snapshots.list()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata.source, SOURCE_PRE_MERGE);
        assert_eq!(snapshots.load(1)?.1.structures[1].description, "Sales");
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[test]
    fn rejects_self_parent_write() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("orgrecon-target-{}", Ulid::new()));
        let snapshots = SnapshotManager::new(&dir);
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let mut target = StoreMergeTarget::new(&mut store, &snapshots, RecordKind::Structure);
        let row = StructureRecord::new("X", "Loop", Some("X")).to_row();
        assert!(target.write_record("code", "X", &row).is_err());
        assert!(target.write_record("tax_id", "X", &row).is_err());
        Ok(())
    }
}
