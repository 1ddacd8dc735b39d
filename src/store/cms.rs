/// CMS-backed primary backend.
///
/// Each relationship is one entry of a dedicated content type
/// (`translationMetadata` in the reference deployment), all fields stored
/// under the single storage locale. Lookup goes through an indexed query
/// on the `relationshipId` field; uniqueness is enforced at application
/// level because the CMS has no unique constraint.
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::RelationshipStore;
use crate::cms::{EntryQuery, ManagementApi};
use crate::error::{MirrorError, MirrorResult};
use crate::types::{
    BackupData, Entry, FieldValue, LocalizedValue, ReferenceTree, Relationship, relationship_id,
};

/// Relationships stored as entries of a metadata content type.
pub struct CmsStore {
    api: Arc<dyn ManagementApi>,
    content_type: String,
    locale: String,
}

impl CmsStore {
    /// Default metadata content type id.
    pub const DEFAULT_CONTENT_TYPE: &'static str = "translationMetadata";

    /// Create a store on top of a management API client.
    pub fn new(api: Arc<dyn ManagementApi>, content_type: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            api,
            content_type: content_type.into(),
            locale: locale.into(),
        }
    }

    async fn find_entry(&self, relationship_id: &str) -> MirrorResult<Option<Entry>> {
        let query = EntryQuery::of_type(&self.content_type)
            .field_equals("relationshipId", &self.locale, relationship_id)
            .limit(1);
        Ok(self.api.entries(&query).await?.into_iter().next())
    }

    fn localized(&self, value: JsonValue) -> LocalizedValue {
        let mut locales = LocalizedValue::new();
        locales.insert(self.locale.clone(), FieldValue::from_json(&value));
        locales
    }

    /// Project a relationship into metadata entry fields.
    fn to_fields(&self, relationship: &Relationship) -> MirrorResult<BTreeMap<String, LocalizedValue>> {
        let mut fields = BTreeMap::new();
        fields.insert(
            "relationshipId".to_string(),
            self.localized(JsonValue::String(relationship.relationship_id())),
        );
        fields.insert(
            "sourceEntryId".to_string(),
            self.localized(JsonValue::String(relationship.source_entry_id.clone())),
        );
        fields.insert(
            "targetEntryId".to_string(),
            self.localized(JsonValue::String(relationship.target_entry_id.clone())),
        );
        fields.insert(
            "translationContext".to_string(),
            self.localized(serde_json::to_value(&relationship.translation_context)?),
        );
        fields.insert(
            "metadata".to_string(),
            self.localized(serde_json::to_value(&relationship.metadata)?),
        );
        fields.insert(
            "fieldHashes".to_string(),
            self.localized(serde_json::to_value(&relationship.field_hashes)?),
        );
        fields.insert(
            "cloneMapping".to_string(),
            self.localized(serde_json::to_value(&relationship.clone_mapping)?),
        );
        if let Some(tree) = &relationship.deep_reference_map {
            fields.insert(
                "deepReferenceMap".to_string(),
                self.localized(serde_json::to_value(tree)?),
            );
        }
        if let Some(backup) = &relationship.backup_data {
            fields.insert(
                "backupData".to_string(),
                self.localized(serde_json::to_value(backup)?),
            );
        }
        Ok(fields)
    }

    fn field_json(&self, entry: &Entry, field: &str) -> Option<JsonValue> {
        entry.field_value(field, &self.locale).map(FieldValue::to_json)
    }

    /// Parse a metadata entry back into a relationship.
    fn from_entry(&self, entry: &Entry) -> MirrorResult<Relationship> {
        let missing = |field: &str| MirrorError::Store {
            message: format!(
                "metadata entry '{}' is missing field '{}'",
                entry.id, field
            ),
        };

        let mut record = serde_json::Map::new();
        for field in ["sourceEntryId", "targetEntryId", "metadata", "translationContext"] {
            record.insert(
                field.to_string(),
                self.field_json(entry, field).ok_or_else(|| missing(field))?,
            );
        }
        record.insert(
            "fieldHashes".to_string(),
            self.field_json(entry, "fieldHashes").unwrap_or_else(|| JsonValue::Object(Default::default())),
        );
        record.insert(
            "cloneMapping".to_string(),
            self.field_json(entry, "cloneMapping").unwrap_or_else(|| JsonValue::Object(Default::default())),
        );
        if let Some(tree) = self.field_json(entry, "deepReferenceMap") {
            record.insert("deepReferenceMap".to_string(), tree);
        }
        if let Some(backup) = self.field_json(entry, "backupData") {
            record.insert("backupData".to_string(), backup);
        }

        Ok(serde_json::from_value(JsonValue::Object(record))?)
    }

    /// Update one field on an existing metadata entry, leaving the rest
    /// untouched.
    async fn merge_field(&self, mut entry: Entry, field: &str, value: JsonValue) -> MirrorResult<()> {
        entry.fields.insert(field.to_string(), self.localized(value));
        self.api.update_entry(&entry).await?;
        Ok(())
    }

    fn no_relationship(&self, relationship_id: &str) -> MirrorError {
        MirrorError::Store {
            message: format!(
                "no '{}' entry for relationship '{}'",
                self.content_type, relationship_id
            ),
        }
    }
}

#[async_trait]
impl RelationshipStore for CmsStore {
    async fn store(&self, relationship: &Relationship) -> MirrorResult<()> {
        let id = relationship.relationship_id();
        match self.find_entry(&id).await? {
            Some(mut existing) => {
                // Preserve the original creation time across upserts.
                let mut record = relationship.clone();
                if let Ok(previous) = self.from_entry(&existing) {
                    record.metadata.created_at = previous.metadata.created_at;
                    if record.deep_reference_map.is_none() {
                        record.deep_reference_map = previous.deep_reference_map;
                    }
                    if record.backup_data.is_none() {
                        record.backup_data = previous.backup_data;
                    }
                }
                existing.fields = self.to_fields(&record)?;
                self.api.update_entry(&existing).await?;
            }
            None => {
                let fields = self.to_fields(relationship)?;
                self.api.create_entry(&self.content_type, &fields).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, source_id: &str, target_id: &str) -> MirrorResult<Option<Relationship>> {
        let id = relationship_id(source_id, target_id);
        match self.find_entry(&id).await? {
            Some(entry) => Ok(Some(self.from_entry(&entry)?)),
            None => Ok(None),
        }
    }

    async fn store_deep_map(&self, tree: &ReferenceTree) -> MirrorResult<()> {
        let id = relationship_id(&tree.source_entry_id, &tree.target_entry_id);
        let entry = self
            .find_entry(&id)
            .await?
            .ok_or_else(|| self.no_relationship(&id))?;
        self.merge_field(entry, "deepReferenceMap", serde_json::to_value(tree)?)
            .await
    }

    async fn get_deep_map(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> MirrorResult<Option<ReferenceTree>> {
        let id = relationship_id(source_id, target_id);
        let Some(entry) = self.find_entry(&id).await? else {
            return Ok(None);
        };
        match self.field_json(&entry, "deepReferenceMap") {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    async fn store_backup(
        &self,
        source_id: &str,
        target_id: &str,
        backup: &BackupData,
    ) -> MirrorResult<()> {
        let id = relationship_id(source_id, target_id);
        let entry = self
            .find_entry(&id)
            .await?
            .ok_or_else(|| self.no_relationship(&id))?;
        self.merge_field(entry, "backupData", serde_json::to_value(backup)?)
            .await
    }

    async fn list_backups(&self, entry_id: &str) -> MirrorResult<Vec<BackupData>> {
        let query = EntryQuery::of_type(&self.content_type).field_equals(
            "targetEntryId",
            &self.locale,
            entry_id,
        );
        let mut backups = Vec::new();
        for entry in self.api.entries(&query).await? {
            if let Some(raw) = self.field_json(&entry, "backupData") {
                match serde_json::from_value::<BackupData>(raw) {
                    Ok(backup) => backups.push(backup),
                    Err(e) => tracing::warn!("unreadable backup on '{}': {}", entry.id, e),
                }
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    async fn delete(&self, source_id: &str, target_id: &str) -> MirrorResult<bool> {
        let id = relationship_id(source_id, target_id);
        match self.find_entry(&id).await? {
            Some(entry) => {
                self.api.delete_entry(&entry.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_source(&self, source_id: &str) -> MirrorResult<Vec<Relationship>> {
        let query = EntryQuery::of_type(&self.content_type).field_equals(
            "sourceEntryId",
            &self.locale,
            source_id,
        );
        let mut relationships = Vec::new();
        for entry in self.api.entries(&query).await? {
            match self.from_entry(&entry) {
                Ok(rel) => relationships.push(rel),
                Err(e) => tracing::warn!("unreadable relationship on '{}': {}", entry.id, e),
            }
        }
        Ok(relationships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::MemoryCms;
    use crate::types::{CloneMap, FieldHashes, RelationshipMetadata, TranslationContext};
    use chrono::Utc;

    fn store_with_memory() -> (CmsStore, Arc<MemoryCms>) {
        let cms = Arc::new(MemoryCms::new());
        let store = CmsStore::new(
            cms.clone(),
            CmsStore::DEFAULT_CONTENT_TYPE,
            "en-US-POSIX",
        );
        (store, cms)
    }

    fn sample_relationship(source: &str, target: &str) -> Relationship {
        let mut clone_mapping = CloneMap::new();
        clone_mapping.record_entry(source, target);
        Relationship {
            source_entry_id: source.into(),
            target_entry_id: target.into(),
            metadata: RelationshipMetadata {
                last_translated_version: 3,
                created_at: Utc::now(),
                last_updated: Utc::now(),
            },
            translation_context: TranslationContext::new("DE", "IT"),
            field_hashes: FieldHashes::from([("title".to_string(), "abc".to_string())]),
            clone_mapping,
            deep_reference_map: None,
            backup_data: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_metadata_entry() {
        let (store, cms) = store_with_memory();
        let rel = sample_relationship("X", "Xp");
        store.store(&rel).await.unwrap();
        assert_eq!(cms.entry_count(), 1);

        let loaded = store.get("X", "Xp").await.unwrap().unwrap();
        assert_eq!(loaded.relationship_id(), "X_Xp");
        assert_eq!(loaded.metadata.last_translated_version, 3);
        assert_eq!(loaded.field_hashes.get("title").unwrap(), "abc");
        assert_eq!(loaded.clone_mapping.target_entry("X"), Some("Xp"));
    }

    #[tokio::test]
    async fn test_upsert_reuses_entry_and_preserves_created_at() {
        let (store, cms) = store_with_memory();
        let rel = sample_relationship("X", "Xp");
        store.store(&rel).await.unwrap();
        let created_at = store.get("X", "Xp").await.unwrap().unwrap().metadata.created_at;

        let mut updated = sample_relationship("X", "Xp");
        updated.metadata.last_translated_version = 4;
        store.store(&updated).await.unwrap();

        assert_eq!(cms.entry_count(), 1);
        let loaded = store.get("X", "Xp").await.unwrap().unwrap();
        assert_eq!(loaded.metadata.created_at, created_at);
        assert_eq!(loaded.metadata.last_translated_version, 4);
    }

    #[tokio::test]
    async fn test_deep_map_requires_relationship() {
        let (store, _cms) = store_with_memory();
        let tree = ReferenceTree {
            source_entry_id: "X".into(),
            target_entry_id: "Xp".into(),
            max_depth: 3,
            last_scanned: Utc::now(),
            reference_tree: crate::types::ReferenceNode {
                id: "X".into(),
                version: 1,
                depth: 0,
                parent_id: None,
                parent_field: None,
                content_hash: "h".into(),
                field_hashes: FieldHashes::new(),
                last_updated: Utc::now(),
                children: Vec::new(),
            },
            flattened_refs: Default::default(),
        };

        assert!(store.store_deep_map(&tree).await.is_err());

        store.store(&sample_relationship("X", "Xp")).await.unwrap();
        store.store_deep_map(&tree).await.unwrap();

        let loaded = store.get_deep_map("X", "Xp").await.unwrap().unwrap();
        assert_eq!(loaded.source_entry_id, "X");
        // The merge kept the relationship readable
        assert!(store.get("X", "Xp").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_by_source_and_delete() {
        let (store, _cms) = store_with_memory();
        store.store(&sample_relationship("X", "T1")).await.unwrap();
        store.store(&sample_relationship("X", "T2")).await.unwrap();
        store.store(&sample_relationship("Y", "T3")).await.unwrap();

        let rels = store.list_by_source("X").await.unwrap();
        assert_eq!(rels.len(), 2);

        assert!(store.delete("X", "T1").await.unwrap());
        assert!(!store.delete("X", "T1").await.unwrap());
        assert_eq!(store.list_by_source("X").await.unwrap().len(), 1);
    }
}
