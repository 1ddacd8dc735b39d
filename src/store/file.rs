/// Filesystem fallback backend.
///
/// Layout under the tracking directory:
///
/// ```text
/// <trackingDir>/
/// ├── <sourceId>_<targetId>.json            # relationship record
/// ├── <sourceId>_<targetId>_deep_refs.json  # tree snapshot
/// └── backups/
///     └── <entryId>_<ISO-timestamp>.json    # target backup history
/// ```
///
/// Every write goes to a temporary file in the same directory and is
/// renamed into place, so readers never observe a partial record.
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::RelationshipStore;
use crate::error::{MirrorError, MirrorResult};
use crate::types::{BackupData, ReferenceTree, Relationship};
use async_trait::async_trait;

/// One JSON file per record in a local tracking directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

fn store_error(context: &str, e: impl std::fmt::Display) -> MirrorError {
    MirrorError::Store {
        message: format!("{}: {}", context, e),
    }
}

impl FileStore {
    /// Create a store rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The default tracking directory: `~/.content-mirror/tracking`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".content-mirror")
            .join("tracking")
    }

    fn relationship_path(&self, source_id: &str, target_id: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.json", source_id, target_id))
    }

    fn tree_path(&self, source_id: &str, target_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}_deep_refs.json", source_id, target_id))
    }

    fn backups_dir(&self) -> PathBuf {
        self.dir.join("backups")
    }

    /// Write a JSON document atomically: temp file, then rename.
    async fn write_atomic<T: serde::Serialize>(&self, path: &Path, record: &T) -> MirrorResult<()> {
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent)
            .await
            .map_err(|e| store_error("failed to create tracking dir", e))?;

        let json = serde_json::to_string_pretty(record)?;
        let tmp = parent.join(format!(
            ".{}.tmp-{}",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("record"),
            uuid::Uuid::new_v4().simple()
        ));

        fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| store_error("failed to write record", e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| store_error("failed to finalize record", e))?;
        Ok(())
    }

    /// Read and parse a JSON document; `Ok(None)` when the file is absent.
    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> MirrorResult<Option<T>> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("failed to read record", e)),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn read_relationship(&self, path: &Path) -> MirrorResult<Option<Relationship>> {
        let Some(raw) = self.read_json::<JsonValue>(path).await? else {
            return Ok(None);
        };
        // A tree snapshot must never be returned as a relationship, even
        // if a file lands under the wrong name.
        if raw.get("flattenedRefs").is_some() {
            return Err(MirrorError::Store {
                message: format!(
                    "{} holds a tree snapshot, not a relationship",
                    path.display()
                ),
            });
        }
        Ok(Some(serde_json::from_value(raw)?))
    }
}

#[async_trait]
impl RelationshipStore for FileStore {
    async fn store(&self, relationship: &Relationship) -> MirrorResult<()> {
        let path =
            self.relationship_path(&relationship.source_entry_id, &relationship.target_entry_id);

        let mut record = relationship.clone();
        if let Some(existing) = self.read_relationship(&path).await? {
            record.metadata.created_at = existing.metadata.created_at;
        }

        // The tree lives in its sibling file; keep the main record lean.
        if let Some(tree) = record.deep_reference_map.take() {
            let tree_path = self.tree_path(&tree.source_entry_id, &tree.target_entry_id);
            self.write_atomic(&tree_path, &tree).await?;
        }

        self.write_atomic(&path, &record).await
    }

    async fn get(&self, source_id: &str, target_id: &str) -> MirrorResult<Option<Relationship>> {
        let path = self.relationship_path(source_id, target_id);
        let Some(mut relationship) = self.read_relationship(&path).await? else {
            return Ok(None);
        };
        relationship.deep_reference_map = self.get_deep_map(source_id, target_id).await?;
        Ok(Some(relationship))
    }

    async fn store_deep_map(&self, tree: &ReferenceTree) -> MirrorResult<()> {
        let path = self.tree_path(&tree.source_entry_id, &tree.target_entry_id);
        self.write_atomic(&path, tree).await
    }

    async fn get_deep_map(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> MirrorResult<Option<ReferenceTree>> {
        self.read_json(&self.tree_path(source_id, target_id)).await
    }

    async fn store_backup(
        &self,
        source_id: &str,
        target_id: &str,
        backup: &BackupData,
    ) -> MirrorResult<()> {
        let timestamp = backup
            .created_at
            .format("%Y-%m-%dT%H-%M-%S%.3fZ")
            .to_string();
        let history_path = self
            .backups_dir()
            .join(format!("{}_{}.json", backup.entry_id, timestamp));
        self.write_atomic(&history_path, backup).await?;

        let path = self.relationship_path(source_id, target_id);
        if let Some(mut relationship) = self.read_relationship(&path).await? {
            relationship.backup_data = Some(backup.clone());
            self.write_atomic(&path, &relationship).await?;
        }
        Ok(())
    }

    async fn list_backups(&self, entry_id: &str) -> MirrorResult<Vec<BackupData>> {
        let mut dir = match fs::read_dir(self.backups_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error("failed to list backups", e)),
        };

        let mut backups = Vec::new();
        while let Some(dirent) = dir
            .next_entry()
            .await
            .map_err(|e| store_error("failed to list backups", e))?
        {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&format!("{}_", entry_id)) || !name.ends_with(".json") {
                continue;
            }
            match self.read_json::<BackupData>(&dirent.path()).await {
                Ok(Some(backup)) if backup.entry_id == entry_id => backups.push(backup),
                Ok(_) => {}
                Err(e) => tracing::warn!("skipping unreadable backup {}: {}", name, e),
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn delete(&self, source_id: &str, target_id: &str) -> MirrorResult<bool> {
        let path = self.relationship_path(source_id, target_id);
        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(store_error("failed to delete relationship", e)),
        };
        match fs::remove_file(self.tree_path(source_id, target_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(store_error("failed to delete tree snapshot", e)),
        }
        Ok(existed)
    }

    async fn list_by_source(&self, source_id: &str) -> MirrorResult<Vec<Relationship>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error("failed to list relationships", e)),
        };

        let mut relationships = Vec::new();
        while let Some(dirent) = dir
            .next_entry()
            .await
            .map_err(|e| store_error("failed to list relationships", e))?
        {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&format!("{}_", source_id))
                || !name.ends_with(".json")
                || name.ends_with("_deep_refs.json")
            {
                continue;
            }
            match self.read_relationship(&dirent.path()).await {
                Ok(Some(rel)) if rel.source_entry_id == source_id => relationships.push(rel),
                Ok(_) => {}
                Err(e) => tracing::warn!("skipping unreadable relationship {}: {}", name, e),
            }
        }

        relationships.sort_by(|a, b| a.target_entry_id.cmp(&b.target_entry_id));
        Ok(relationships)
    }
}
