//! End-to-end tests for incremental updates and status checks.
mod common;

use common::*;
use content_mirror::{
    CancelToken, CloneEngine, CloneRequest, FieldChangeKind, ManagementApi, MemoryCms,
    NoopTranslator, Translator,
};
use std::sync::Arc;

async fn clone_page(
    cms: Arc<MemoryCms>,
    translator: Arc<dyn Translator>,
    dir: &std::path::Path,
) -> (CloneEngine, String) {
    let engine = build_engine(cms, translator, dir);
    let report = engine
        .clone_entry(
            &CloneRequest {
                source_entry_id: "X".to_string(),
                source_language: None,
                target_language: "IT".to_string(),
            },
            &CancelToken::new(),
        )
        .await
        .unwrap();
    (engine, report.cloned_entry_id)
}

async fn edit_text_field(cms: &MemoryCms, id: &str, field: &str, value: &str) {
    let mut entry = cms.entry(id).await.unwrap();
    entry.fields.insert(field.to_string(), localized(text(value)));
    cms.update_entry(&entry).await.unwrap();
}

async fn set_elements(cms: &MemoryCms, id: &str, children: &[&str]) {
    let mut entry = cms.entry(id).await.unwrap();
    entry
        .fields
        .insert("elements".to_string(), localized(entry_links(children)));
    cms.update_entry(&entry).await.unwrap();
}

#[tokio::test]
async fn test_text_change_in_reference_updates_only_the_child() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let translator = Arc::new(TaggingTranslator::default());
    let (engine, target_id) = clone_page(cms.clone(), translator.clone(), dir.path()).await;

    let root_clone_version = cms.entry(&target_id).await.unwrap().version;
    edit_text_field(&cms, "E1", "content", "Weiterlesen").await;

    // Status sees exactly one change on E1.content
    let status = engine.status("X", &target_id).await.unwrap();
    assert!(status.has_relationship);
    assert!(!status.up_to_date);
    assert!(status.root_changes.is_empty());
    assert_eq!(status.reference_diff.changed.len(), 1);
    let changed = &status.reference_diff.changed[0];
    assert_eq!(changed.id, "E1");
    assert_eq!(changed.field_changes.len(), 1);
    assert_eq!(changed.field_changes[0].field_name, "content");
    assert_eq!(changed.field_changes[0].change_type, FieldChangeKind::Modified);

    // Update patches the child clone and leaves the root untouched
    let report = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(report.success);
    assert_eq!(report.fields_updated, vec!["E1.content".to_string()]);
    assert!(report.backup_id.is_some());
    assert_eq!(report.new_version, None);

    let root_clone = cms.entry(&target_id).await.unwrap();
    assert_eq!(root_clone.version, root_clone_version);

    let e1_target = root_clone.field_value("elements", LOCALE).unwrap().links()[0]
        .id
        .clone();
    let child_clone = cms.entry(&e1_target).await.unwrap();
    assert_eq!(child_clone.any_string("content"), Some("[IT] Weiterlesen"));

    let status = engine.status("X", &target_id).await.unwrap();
    assert!(status.up_to_date);
}

#[tokio::test]
async fn test_update_is_idempotent_without_source_changes() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let (engine, target_id) = clone_page(cms.clone(), Arc::new(NoopTranslator), dir.path()).await;

    // Clone then immediate update: nothing to do
    let first = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(first.success);
    assert!(first.fields_updated.is_empty());
    assert_eq!(first.new_version, None);

    // Second run is equally quiet, and status reports up to date
    let second = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(second.success);
    assert!(second.fields_updated.is_empty());

    let status = engine.status("X", &target_id).await.unwrap();
    assert!(status.up_to_date);
}

#[tokio::test]
async fn test_new_reference_is_cloned_and_linked() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let translator = Arc::new(TaggingTranslator::default());
    let (engine, target_id) = clone_page(cms.clone(), translator.clone(), dir.path()).await;

    cms.put_entry(make_entry(
        "E2",
        "scText",
        1,
        vec![("content", text("Noch mehr"))],
    ));
    set_elements(&cms, "X", &["E1", "E2"]).await;

    let status = engine.status("X", &target_id).await.unwrap();
    assert_eq!(status.reference_diff.added.len(), 1);
    assert_eq!(status.reference_diff.added[0].id, "E2");

    let report = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(report.success);
    assert_eq!(report.new_references.len(), 1);
    assert!(report.new_references[0].success);
    let e2_target = report.new_references[0].target_id.clone().unwrap();

    // Root link list re-projected in source order
    let root_clone = cms.entry(&target_id).await.unwrap();
    let links = root_clone.field_value("elements", LOCALE).unwrap().links();
    assert_eq!(links.len(), 2);
    assert_eq!(links[1].id, e2_target);

    let e2_clone = cms.entry(&e2_target).await.unwrap();
    assert_eq!(e2_clone.any_string("content"), Some("[IT] Noch mehr"));
}

#[tokio::test]
async fn test_removed_reference_disappears_from_target_list() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let translator = Arc::new(TaggingTranslator::default());
    let (engine, target_id) = clone_page(cms.clone(), translator.clone(), dir.path()).await;

    cms.put_entry(make_entry(
        "E2",
        "scText",
        1,
        vec![("content", text("Noch mehr"))],
    ));
    set_elements(&cms, "X", &["E1", "E2"]).await;
    engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;

    let e1_target = {
        let root_clone = cms.entry(&target_id).await.unwrap();
        root_clone.field_value("elements", LOCALE).unwrap().links()[0]
            .id
            .clone()
    };

    // Drop E1 from the source
    set_elements(&cms, "X", &["E2"]).await;

    let status = engine.status("X", &target_id).await.unwrap();
    assert_eq!(status.reference_diff.removed.len(), 1);
    assert_eq!(status.reference_diff.removed[0].id, "E1");

    let calls_before = translator.call_count();
    let report = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(report.success);
    // Removal generates no translation work
    assert_eq!(translator.call_count(), calls_before);

    let root_clone = cms.entry(&target_id).await.unwrap();
    let links = root_clone.field_value("elements", LOCALE).unwrap().links();
    assert_eq!(links.len(), 1);
    assert_ne!(links[0].id, e1_target);

    // The orphaned clone is left in place, not deleted
    assert!(cms.entry(&e1_target).await.is_ok());

    // Snapshot refreshed: a second status run is clean
    let status = engine.status("X", &target_id).await.unwrap();
    assert!(status.up_to_date);
}

#[tokio::test]
async fn test_root_field_change_patched_in_one_write() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let translator = Arc::new(TaggingTranslator::default());
    let (engine, target_id) = clone_page(cms.clone(), translator.clone(), dir.path()).await;

    edit_text_field(&cms, "X", "title", "Hallo Welt").await;

    let status = engine.status("X", &target_id).await.unwrap();
    assert_eq!(status.root_changes.len(), 1);
    assert_eq!(status.root_changes[0].field_name, "title");

    let report = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    assert!(report.success);
    assert_eq!(report.fields_updated, vec!["title".to_string()]);
    assert!(report.new_version.is_some());

    // Prefix is reapplied on the retranslated value
    let root_clone = cms.entry(&target_id).await.unwrap();
    assert_eq!(root_clone.any_string("title"), Some("[Clone] [IT] Hallo Welt"));
}

#[tokio::test]
async fn test_update_without_relationship_reports_failure() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(cms, Arc::new(NoopTranslator), dir.path());

    let report = engine
        .incremental_update("X", "ghost", &CancelToken::new())
        .await;
    assert!(!report.success);
    assert!(report.fields_updated.is_empty());
    assert!(report.message.contains("no relationship"));
}

#[tokio::test]
async fn test_status_without_relationship() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(cms, Arc::new(NoopTranslator), dir.path());

    let status = engine.status("X", "ghost").await.unwrap();
    assert!(!status.has_relationship);
    assert!(!status.up_to_date);
    assert!(status.metadata.is_none());
}

#[tokio::test]
async fn test_backups_accumulate_per_update() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let translator = Arc::new(TaggingTranslator::default());
    let (engine, target_id) = clone_page(cms.clone(), translator, dir.path()).await;

    edit_text_field(&cms, "E1", "content", "Weiterlesen").await;
    let first = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;
    edit_text_field(&cms, "E1", "content", "Jetzt lesen").await;
    let second = engine
        .incremental_update("X", &target_id, &CancelToken::new())
        .await;

    assert_ne!(first.backup_id, second.backup_id);

    let store = content_mirror::FileStore::new(dir.path());
    let backups = content_mirror::RelationshipStore::list_backups(&store, &target_id)
        .await
        .unwrap();
    assert!(backups.len() >= 2);
    // Newest first
    assert!(backups[0].created_at >= backups[1].created_at);
}

#[tokio::test]
async fn test_deep_refs_rebuild() {
    let cms = Arc::new(MemoryCms::new());
    seed_german_page(&cms);
    let dir = tempfile::tempdir().unwrap();
    let (engine, target_id) = clone_page(cms.clone(), Arc::new(NoopTranslator), dir.path()).await;

    let tree = engine.rebuild_deep_refs("X", &target_id).await.unwrap();
    assert_eq!(tree.source_entry_id, "X");
    assert_eq!(tree.reference_tree.node_count(), 2); // X and E1
    assert_eq!(tree.reference_tree.max_depth(), 1);
}
