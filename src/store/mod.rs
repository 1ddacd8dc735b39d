/// Relationship persistence.
///
/// The store keeps, per (source, target) pair: the translation context,
/// clone map, per-field content hashes, the deep reference tree snapshot,
/// and the latest target backup. Two backends implement the same trait:
///
/// - [`CmsStore`] - entries of a dedicated `translationMetadata` content
///   type in the CMS itself (primary)
/// - [`FileStore`] - one JSON file per record in a local tracking
///   directory (fallback)
///
/// [`CompositeStore`] tries the primary and falls back transparently; the
/// next successful primary write makes the primary authoritative again.
/// No backend takes locks: the POC relies on single-flight per
/// relationship at the engine layer.
use async_trait::async_trait;

use crate::error::MirrorResult;
use crate::types::{BackupData, ReferenceTree, Relationship};

mod cms;
mod file;

pub use cms::CmsStore;
pub use file::FileStore;

/// Which backend answered an operation, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The CMS-backed primary
    Cms,
    /// The filesystem fallback
    File,
}

impl BackendKind {
    fn name(&self) -> &'static str {
        match self {
            BackendKind::Cms => "cms",
            BackendKind::File => "file",
        }
    }
}

/// Storage operations for relationships, tree snapshots and backups.
///
/// Every operation is keyed by the (source, target) pair. `store` is an
/// upsert that preserves `createdAt`; `store_deep_map` and `store_backup`
/// merge into the relationship without touching its other fields.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Upsert a relationship. An existing record's `createdAt` survives.
    async fn store(&self, relationship: &Relationship) -> MirrorResult<()>;

    /// Fetch a relationship, or `None` when no backend has it.
    async fn get(&self, source_id: &str, target_id: &str) -> MirrorResult<Option<Relationship>>;

    /// Merge a tree snapshot into the relationship.
    async fn store_deep_map(&self, tree: &ReferenceTree) -> MirrorResult<()>;

    /// Fetch the stored tree snapshot, if any.
    async fn get_deep_map(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> MirrorResult<Option<ReferenceTree>>;

    /// Merge a target backup into the relationship.
    async fn store_backup(
        &self,
        source_id: &str,
        target_id: &str,
        backup: &BackupData,
    ) -> MirrorResult<()>;

    /// Backups recorded for an entry, newest first.
    async fn list_backups(&self, entry_id: &str) -> MirrorResult<Vec<BackupData>>;

    /// Delete a relationship. Returns whether one existed.
    async fn delete(&self, source_id: &str, target_id: &str) -> MirrorResult<bool>;

    /// All relationships whose source is the given entry.
    async fn list_by_source(&self, source_id: &str) -> MirrorResult<Vec<Relationship>>;
}

/// Primary-then-fallback composition of two stores.
pub struct CompositeStore {
    primary: CmsStore,
    fallback: FileStore,
}

impl CompositeStore {
    /// Compose a CMS primary with a filesystem fallback.
    pub fn new(primary: CmsStore, fallback: FileStore) -> Self {
        Self { primary, fallback }
    }

    fn note_fallback(op: &str, err: &crate::error::MirrorError) {
        tracing::warn!(
            backend = BackendKind::Cms.name(),
            "{} failed on primary store, using fallback: {}",
            op,
            err
        );
    }
}

#[async_trait]
impl RelationshipStore for CompositeStore {
    async fn store(&self, relationship: &Relationship) -> MirrorResult<()> {
        match self.primary.store(relationship).await {
            Ok(()) => {
                tracing::debug!(backend = BackendKind::Cms.name(), "relationship stored");
                Ok(())
            }
            Err(e) => {
                Self::note_fallback("store", &e);
                self.fallback.store(relationship).await
            }
        }
    }

    async fn get(&self, source_id: &str, target_id: &str) -> MirrorResult<Option<Relationship>> {
        match self.primary.get(source_id, target_id).await {
            Ok(Some(rel)) => Ok(Some(rel)),
            Ok(None) => self.fallback.get(source_id, target_id).await,
            Err(e) => {
                Self::note_fallback("get", &e);
                self.fallback.get(source_id, target_id).await
            }
        }
    }

    async fn store_deep_map(&self, tree: &ReferenceTree) -> MirrorResult<()> {
        match self.primary.store_deep_map(tree).await {
            Ok(()) => Ok(()),
            Err(e) => {
                Self::note_fallback("store_deep_map", &e);
                self.fallback.store_deep_map(tree).await
            }
        }
    }

    async fn get_deep_map(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> MirrorResult<Option<ReferenceTree>> {
        match self.primary.get_deep_map(source_id, target_id).await {
            Ok(Some(tree)) => Ok(Some(tree)),
            Ok(None) => self.fallback.get_deep_map(source_id, target_id).await,
            Err(e) => {
                Self::note_fallback("get_deep_map", &e);
                self.fallback.get_deep_map(source_id, target_id).await
            }
        }
    }

    async fn store_backup(
        &self,
        source_id: &str,
        target_id: &str,
        backup: &BackupData,
    ) -> MirrorResult<()> {
        // Backup history always accumulates on the filesystem; the
        // relationship merge goes to whichever backend is reachable.
        let history = self.fallback.store_backup(source_id, target_id, backup).await;

        match self.primary.store_backup(source_id, target_id, backup).await {
            Ok(()) => Ok(()),
            Err(e) => {
                Self::note_fallback("store_backup", &e);
                history
            }
        }
    }

    async fn list_backups(&self, entry_id: &str) -> MirrorResult<Vec<BackupData>> {
        // History lives on the filesystem; the primary only holds the
        // latest backup per relationship. Merge and dedupe by id.
        let mut backups = self.fallback.list_backups(entry_id).await.unwrap_or_default();
        if let Ok(primary) = self.primary.list_backups(entry_id).await {
            for backup in primary {
                if !backups.iter().any(|b| b.backup_id == backup.backup_id) {
                    backups.push(backup);
                }
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn delete(&self, source_id: &str, target_id: &str) -> MirrorResult<bool> {
        let primary = match self.primary.delete(source_id, target_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                Self::note_fallback("delete", &e);
                false
            }
        };
        let fallback = self.fallback.delete(source_id, target_id).await?;
        Ok(primary || fallback)
    }

    async fn list_by_source(&self, source_id: &str) -> MirrorResult<Vec<Relationship>> {
        let mut relationships = match self.primary.list_by_source(source_id).await {
            Ok(rels) => rels,
            Err(e) => {
                Self::note_fallback("list_by_source", &e);
                Vec::new()
            }
        };
        for rel in self.fallback.list_by_source(source_id).await? {
            let id = rel.relationship_id();
            if !relationships.iter().any(|r| r.relationship_id() == id) {
                relationships.push(rel);
            }
        }
        Ok(relationships)
    }
}
