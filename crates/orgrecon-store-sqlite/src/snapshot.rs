use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use orgrecon_core::{compare_datasets, DatasetDiff, OrgDataset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{parse_rfc3339, rfc3339};

pub const DEFAULT_KEEP_LAST: usize = 50;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;
const FILE_PREFIX: &str = "snapshot_";
const FILE_SUFFIX: &str = ".json";

pub const SOURCE_MANUAL: &str = "MANUAL";
pub const SOURCE_CHECKPOINT: &str = "CHECKPOINT";
pub const SOURCE_MILESTONE: &str = "MILESTONE";
pub const SOURCE_AUTO_BACKUP: &str = "AUTO_BACKUP";
pub const SOURCE_PRE_MERGE: &str = "PRE_MERGE";

/// Caller-supplied labels for a new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub source: String,
    pub user_note: Option<String>,
    pub description: Option<String>,
    pub certified: bool,
}

impl SnapshotRequest {
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self { source: source.to_string(), user_note: None, description: None, certified: false }
    }

    #[must_use]
    pub fn with_note(mut self, note: &str) -> Self {
        self.user_note = Some(note.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub id: u64,
    pub timestamp: String,
    pub source: String,
    pub user_note: Option<String>,
    pub description: Option<String>,
    pub certified: bool,
    pub persons_count: usize,
    pub structures_count: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    #[serde(flatten)]
    pub metadata: SnapshotMetadata,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRestore {
    pub restored: SnapshotInfo,
    pub dataset: OrgDataset,
    pub safety_backup: Option<SnapshotInfo>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotArtifact {
    format_version: u32,
    metadata: SnapshotMetadata,
    dataset: OrgDataset,
}

#[derive(Deserialize)]
struct ArtifactHeader {
    format_version: u32,
    metadata: SnapshotMetadata,
}

/// File-backed history of full dataset copies.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a full copy of `dataset` under the next id.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created or the file cannot be written.
    pub fn create(&self, dataset: &OrgDataset, request: &SnapshotRequest) -> Result<SnapshotInfo> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create snapshot directory {}", self.dir.display())
        })?;

        let id = self.next_id()?;
        let now = OffsetDateTime::now_utc();
        let metadata = SnapshotMetadata {
            id,
            timestamp: rfc3339(now)?,
            source: request.source.clone(),
            user_note: request.user_note.clone(),
            description: request.description.clone(),
            certified: request.certified,
            persons_count: dataset.persons.len(),
            structures_count: dataset.structures.len(),
            sha256: dataset_digest(dataset)?,
        };

        let path = self.dir.join(format!(
            "{FILE_PREFIX}{id}_{:04}{:02}{:02}_{:02}{:02}{:02}{FILE_SUFFIX}",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
        ));
        let artifact = SnapshotArtifact {
            format_version: SNAPSHOT_FORMAT_VERSION,
            metadata: metadata.clone(),
            dataset: dataset.clone(),
        };
        let body = serde_json::to_vec_pretty(&artifact).context("failed to encode snapshot")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .with_context(|| format!("failed to write snapshot file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to finalize snapshot file {}", path.display()))?;

        tracing::info!(id, source = %metadata.source, path = %path.display(), "snapshot created");
        Ok(SnapshotInfo { metadata, path: path.display().to_string() })
    }

    /// Unlabelled working save point.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn checkpoint(&self, dataset: &OrgDataset, note: Option<&str>) -> Result<SnapshotInfo> {
        let mut request = SnapshotRequest::new(SOURCE_CHECKPOINT);
        request.user_note = Some(match note.map(str::trim).filter(|note| !note.is_empty()) {
            Some(note) => note.to_string(),
            None => format!("checkpoint {}", rfc3339(OffsetDateTime::now_utc())?),
        });
        self.create(dataset, &request)
    }

    /// Certified save point; both note and description are required.
    ///
    /// # Errors
    /// Returns an error when a label is blank or the snapshot cannot be written.
    pub fn milestone(&self, dataset: &OrgDataset, note: &str, description: &str) -> Result<SnapshotInfo> {
        if note.trim().is_empty() {
            return Err(anyhow!("milestone note is required"));
        }
        if description.trim().is_empty() {
            return Err(anyhow!("milestone description is required"));
        }
        let request = SnapshotRequest {
            source: SOURCE_MILESTONE.to_string(),
            user_note: Some(note.trim().to_string()),
            description: Some(description.trim().to_string()),
            certified: true,
        };
        self.create(dataset, &request)
    }

    /// All readable snapshots, newest first.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be read.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.scan()?.0)
    }

    /// Readable snapshots newest first, plus the paths of unreadable ones by descending id.
    fn scan(&self) -> Result<(Vec<SnapshotInfo>, Vec<PathBuf>)> {
        let mut out = Vec::new();
        let mut unreadable = Vec::new();
        for path in self.snapshot_files()? {
            match read_header(&path) {
                Ok(metadata) => out.push(SnapshotInfo { metadata, path: path.display().to_string() }),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "unreadable snapshot");
                    unreadable.push(path);
                }
            }
        }
        unreadable.sort_by_key(|path| std::cmp::Reverse(file_id(path)));

        let mut keyed = Vec::with_capacity(out.len());
        for info in out {
            let at = parse_rfc3339(&info.metadata.timestamp)?;
            keyed.push((at, info));
        }
        keyed.sort_by(|(a_at, a), (b_at, b)| {
            b_at.cmp(a_at).then_with(|| b.metadata.id.cmp(&a.metadata.id))
        });
        Ok((keyed.into_iter().map(|(_, info)| info).collect(), unreadable))
    }

    /// Read a snapshot and verify its digest.
    ///
    /// # Errors
    /// Returns an error when the id is unknown, the file is unreadable or the digest does not match.
    pub fn load(&self, id: u64) -> Result<(SnapshotInfo, OrgDataset)> {
        let path = self.path_for(id)?;
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read snapshot file {}", path.display()))?;
        let artifact: SnapshotArtifact = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to decode snapshot file {}", path.display()))?;
        check_format(artifact.format_version)?;

        let digest = dataset_digest(&artifact.dataset)?;
        if digest != artifact.metadata.sha256 {
            return Err(anyhow!(
                "snapshot {id} is corrupted: digest {digest} does not match {}",
                artifact.metadata.sha256
            ));
        }
        Ok((SnapshotInfo { metadata: artifact.metadata, path: path.display().to_string() }, artifact.dataset))
    }

    /// Load snapshot `id` for restore, first saving `safety_backup` when given.
    ///
    /// The caller writes the returned dataset back to its store.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be loaded or the backup cannot be written.
    pub fn restore(&self, id: u64, safety_backup: Option<&OrgDataset>) -> Result<SnapshotRestore> {
        let (restored, dataset) = self.load(id)?;
        let safety_backup = match safety_backup {
            Some(current) => Some(self.create(
                current,
                &SnapshotRequest::new(SOURCE_AUTO_BACKUP)
                    .with_note(&format!("before restoring snapshot {id}")),
            )?),
            None => None,
        };
        tracing::info!(id, "snapshot restored");
        Ok(SnapshotRestore { restored, dataset, safety_backup })
    }

    /// Remove one snapshot file.
    ///
    /// # Errors
    /// Returns an error when the id is unknown or the file cannot be removed.
    pub fn delete(&self, id: u64) -> Result<()> {
        let path = self.path_for(id)?;
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete snapshot file {}", path.display()))?;
        tracing::info!(id, "snapshot deleted");
        Ok(())
    }

    /// Keep the newest `keep_last` snapshots and delete the rest. Returns the number deleted.
    ///
    /// Unreadable snapshot files count toward `keep_last` and rank below every
    /// readable one.
    ///
    /// # Errors
    /// Returns an error when listing or deleting fails.
    pub fn cleanup(&self, keep_last: usize) -> Result<usize> {
        let (listed, unreadable) = self.scan()?;
        let ranked = listed
            .into_iter()
            .map(|info| (PathBuf::from(info.path), true))
            .chain(unreadable.into_iter().map(|path| (path, false)));
        let mut deleted = 0;
        for (path, readable) in ranked.skip(keep_last) {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete snapshot file {}", path.display()))?;
            if !readable {
                tracing::warn!(path = %path.display(), "unreadable snapshot removed");
            }
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(deleted, keep_last, "old snapshots removed");
        }
        Ok(deleted)
    }

    /// Diff snapshot `old_id` against `new_id`.
    ///
    /// # Errors
    /// Returns an error when either snapshot cannot be loaded.
    pub fn compare(&self, old_id: u64, new_id: u64) -> Result<DatasetDiff> {
        let (_, old) = self.load(old_id)?;
        let (_, new) = self.load(new_id)?;
        compare_datasets(&old, &new).map_err(|err| anyhow!("failed to compare snapshots: {err}"))
    }

    fn snapshot_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read snapshot directory {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if file_id(&path).is_some() {
                out.push(path);
            }
        }
        Ok(out)
    }

    fn next_id(&self) -> Result<u64> {
        let max = self.snapshot_files()?.iter().filter_map(|path| file_id(path)).max().unwrap_or(0);
        Ok(max + 1)
    }

    fn path_for(&self, id: u64) -> Result<PathBuf> {
        self.snapshot_files()?
            .into_iter()
            .find(|path| file_id(path) == Some(id))
            .ok_or_else(|| anyhow!("snapshot {id} not found in {}", self.dir.display()))
    }
}

fn file_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    rest.split('_').next()?.parse().ok()
}

fn read_header(path: &Path) -> Result<SnapshotMetadata> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let header: ArtifactHeader = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    check_format(header.format_version)?;
    Ok(header.metadata)
}

fn check_format(version: u32) -> Result<()> {
    if version == SNAPSHOT_FORMAT_VERSION {
        Ok(())
    } else {
        Err(anyhow!("unsupported snapshot format version {version}"))
    }
}

fn dataset_digest(dataset: &OrgDataset) -> Result<String> {
    let payload = serde_json::to_vec(dataset).context("failed to encode dataset for digest")?;
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    Ok(format!("{:x}", hasher.finalize()))
}
