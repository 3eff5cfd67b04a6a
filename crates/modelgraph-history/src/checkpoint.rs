//! Checkpoint files: one pretty-printed JSON document per snapshot, named
//! so that lexical order follows creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use modelgraph_core::{DocumentKey, EntityCapture, ModelGraphError, Result};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
pub const CHECKPOINT_EXTENSION: &str = "json";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";

fn default_schema_version() -> u32 {
    CHECKPOINT_SCHEMA_VERSION
}

/// Full point-in-time capture of a document. Unknown fields are ignored on
/// read so files written by other schema versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub document_key: DocumentKey,
    #[serde(default)]
    pub document_path: Option<String>,
    #[serde(default)]
    pub document_title: Option<String>,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub entities: Vec<EntityCapture>,
}

/// Listing metadata for a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub document_key: DocumentKey,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub entity_count: usize,
}

impl Checkpoint {
    pub fn new(
        document_key: DocumentKey,
        description: impl Into<String>,
        timestamp: DateTime<Utc>,
        entities: Vec<EntityCapture>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            document_key,
            document_path: None,
            document_title: None,
            description: description.into(),
            timestamp,
            entities,
        }
    }

    pub fn with_document(mut self, path: Option<String>, title: Option<String>) -> Self {
        self.document_path = path;
        self.document_title = title;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let checkpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }

    /// Write into `dir` under a fresh timestamped name.
    ///
    /// The body is written to a temporary file and renamed into place. A
    /// reader never observes a half-written checkpoint.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = unused_checkpoint_path(dir, self.timestamp)?;
        let body = serde_json::to_string_pretty(self)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(path = %path.display(), entities = self.entities.len(), "Checkpoint written");
        Ok(path)
    }

    pub fn info(&self, path: PathBuf) -> CheckpointInfo {
        CheckpointInfo {
            path,
            document_key: self.document_key.clone(),
            description: self.description.clone(),
            timestamp: self.timestamp,
            entity_count: self.entities.len(),
        }
    }
}

pub fn checkpoint_file_name(timestamp: DateTime<Utc>, attempt: u32) -> String {
    let stamp = timestamp.format(TIMESTAMP_FORMAT);
    if attempt == 0 {
        format!("{}{}.{}", CHECKPOINT_PREFIX, stamp, CHECKPOINT_EXTENSION)
    } else {
        format!(
            "{}{}_{}.{}",
            CHECKPOINT_PREFIX, stamp, attempt, CHECKPOINT_EXTENSION
        )
    }
}

fn unused_checkpoint_path(dir: &Path, timestamp: DateTime<Utc>) -> Result<PathBuf> {
    for attempt in 0..1000 {
        let candidate = dir.join(checkpoint_file_name(timestamp, attempt));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ModelGraphError::Persistence(format!(
        "no free checkpoint name in {} for {}",
        dir.display(),
        timestamp
    )))
}

pub fn is_checkpoint_file(path: &Path) -> bool {
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(CHECKPOINT_PREFIX))
        .unwrap_or(false);
    let ext_matches = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == CHECKPOINT_EXTENSION)
        .unwrap_or(false);
    name_matches && ext_matches && path.is_file()
}

pub fn checkpoint_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_checkpoint_file(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Metadata for every readable checkpoint in `dir`, newest first.
/// Unreadable files are skipped with a warning and left on disk.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<CheckpointInfo>> {
    let mut infos: Vec<CheckpointInfo> = checkpoint_files(dir)?
        .into_iter()
        .filter_map(|path| match Checkpoint::load(&path) {
            Ok(checkpoint) => Some(checkpoint.info(path)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                None
            }
        })
        .collect();

    infos.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(infos)
}

/// Directory name for a document: its sanitized title (or key) followed by a
/// short digest of the key, so two documents with the same title never
/// share storage.
pub fn document_dir_name(key: &DocumentKey, title: Option<&str>) -> String {
    let label = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| key.as_str());
    let digest = Sha256::digest(key.as_str().as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", sanitize_file_name(label), short)
}

pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use modelgraph_core::{AttributeValue, Classification, EntityId};

    fn sample(ts: DateTime<Utc>) -> Checkpoint {
        Checkpoint::new(
            DocumentKey::new("C:/a.rvt"),
            "Session Start",
            ts,
            vec![EntityCapture::new(EntityId(1))
                .with_classification(Classification::new("Walls", "Basic", "200"))
                .with_attribute("Count", AttributeValue::Integer(2))
                .with_attribute("Host", AttributeValue::Reference(EntityId(4)))],
        )
    }

    #[test]
    fn file_names_sort_by_time() {
        let a = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert!(checkpoint_file_name(a, 0) < checkpoint_file_name(b, 0));
        assert_eq!(
            checkpoint_file_name(b, 0),
            "checkpoint_2024-03-10_00-00-00-000.json"
        );
        assert!(checkpoint_file_name(b, 0) < checkpoint_file_name(b, 1));
    }

    #[test]
    fn same_timestamp_gets_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let ts = Utc::now();
        let first = sample(ts).write_to_dir(dir.path()).unwrap();
        let second = sample(ts).write_to_dir(dir.path()).unwrap();
        assert_ne!(first, second);
        assert_eq!(checkpoint_files(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn written_checkpoint_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = sample(Utc::now());
        let path = checkpoint.write_to_dir(dir.path()).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), checkpoint);
    }

    #[test]
    fn unknown_fields_and_missing_optionals_are_tolerated() {
        let json = r#"{
            "document_key": "k",
            "timestamp": "2024-01-01T00:00:00Z",
            "generator": "future-version",
            "entities": [{ "id": 5, "colour": "red" }]
        }"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert_eq!(checkpoint.entities[0].id, EntityId(5));
        assert!(checkpoint.description.is_empty());
    }

    #[test]
    fn listing_skips_corrupt_files_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        sample(older).write_to_dir(dir.path()).unwrap();
        sample(newer).write_to_dir(dir.path()).unwrap();

        let corrupt = dir.path().join("checkpoint_2024-01-01_10-00-00-000.json");
        fs::write(&corrupt, "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let infos = list_checkpoints(dir.path()).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].timestamp, newer);
        assert_eq!(infos[1].entity_count, 1);
        assert!(corrupt.exists());
    }

    #[test]
    fn captured_document_with_nan_reading_stays_readable() {
        use modelgraph_core::capture_document;
        use modelgraph_core::memory::{InMemoryDocument, InMemoryEntity};

        let doc = InMemoryDocument::new(Some("C:/a.rvt"), Some("A"));
        doc.insert(InMemoryEntity::new(
            EntityCapture::new(EntityId(1)).with_attribute("Width", AttributeValue::Double(0.2)),
        ));
        doc.insert(InMemoryEntity::new(
            EntityCapture::new(EntityId(2)).with_attribute("Width", AttributeValue::Double(f64::NAN)),
        ));

        let dir = tempfile::tempdir().unwrap();
        let entities = capture_document(&doc).unwrap();
        let path = Checkpoint::new(DocumentKey::new("C:/a.rvt"), "Session Start", Utc::now(), entities)
            .write_to_dir(dir.path())
            .unwrap();

        let infos = list_checkpoints(dir.path()).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].entity_count, 1);
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.entities[0].id, EntityId(1));
    }

    #[test]
    fn dir_names_are_safe_and_distinct() {
        let a = document_dir_name(&DocumentKey::new("C:/x/a.rvt"), Some("Tower: A/B"));
        let b = document_dir_name(&DocumentKey::new("C:/y/a.rvt"), Some("Tower: A/B"));
        assert!(a.starts_with("Tower_ A_B_"));
        assert_ne!(a, b);
        assert!(!a.contains('/'));
    }
}
