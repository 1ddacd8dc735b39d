/// Deep reference tracking.
///
/// The tracker walks the reference graph reachable from a source entry,
/// depth-first and bounded, and produces a [`ReferenceTree`] snapshot:
/// per-node content hashes over translatable fields, parent/field
/// provenance, and a flattened id→node index. Diffing a fresh scan
/// against the stored snapshot yields the three change sets driving
/// incremental updates: changed, new, removed.
///
/// The tracker never persists anything itself. The stored snapshot is
/// only replaced by the engine's post-processing hook, after the diff has
/// been fully acted on (removals included).
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cms::ManagementApi;
use crate::error::MirrorResult;
use crate::hash;
use crate::policy::FieldPolicy;
use crate::types::{
    ChangeKind, ChangedReference, ContentTypeSchema, Entry, FieldChange, FieldChangeKind,
    LinkType, NewReference, ReferenceDiff, ReferenceNode, ReferenceTree, RemovedReference,
};

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Depth cap for the scan; nodes at this depth get no children
    pub max_depth: u32,
    /// Whether the engine clones references discovered during an update
    pub auto_translate_new_refs: bool,
    /// The deployment's single storage locale
    pub storage_locale: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            auto_translate_new_refs: true,
            storage_locale: "en-US-POSIX".to_string(),
        }
    }
}

/// A fresh scan: the tree plus every entry fetched while building it.
///
/// The entry cache lets the diff re-hash child fields without refetching,
/// and lets the engine patch children without another round-trip.
pub struct TreeScan {
    /// The snapshot built from the live graph
    pub tree: ReferenceTree,
    /// Every entry touched during the scan, by id
    pub entries: HashMap<String, Entry>,
}

/// Builds reference trees and diffs them against stored snapshots.
pub struct ReferenceTracker {
    api: Arc<dyn ManagementApi>,
    policy: Arc<FieldPolicy>,
    config: TrackerConfig,
    /// Schema cache, per tracker instance (one instance per request)
    schemas: DashMap<String, ContentTypeSchema>,
}

impl ReferenceTracker {
    /// Create a tracker over a management API client.
    pub fn new(api: Arc<dyn ManagementApi>, policy: Arc<FieldPolicy>, config: TrackerConfig) -> Self {
        Self {
            api,
            policy,
            config,
            schemas: DashMap::new(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fetch a content type schema, cached for the tracker's lifetime.
    pub async fn schema(&self, content_type: &str) -> MirrorResult<ContentTypeSchema> {
        if let Some(schema) = self.schemas.get(content_type) {
            return Ok(schema.clone());
        }
        let schema = self.api.content_type(content_type).await?;
        self.schemas.insert(content_type.to_string(), schema.clone());
        Ok(schema)
    }

    /// Build a fresh snapshot rooted at the given source entry.
    pub async fn scan(&self, source: &Entry, target_entry_id: &str) -> MirrorResult<TreeScan> {
        let mut entries = HashMap::new();
        entries.insert(source.id.clone(), source.clone());
        let mut on_path = HashSet::new();

        let root = self
            .build_node(source.clone(), 0, None, None, &mut on_path, &mut entries)
            .await?;

        let mut flattened = BTreeMap::new();
        flatten(&root, &mut flattened);

        Ok(TreeScan {
            tree: ReferenceTree {
                source_entry_id: source.id.clone(),
                target_entry_id: target_entry_id.to_string(),
                max_depth: self.config.max_depth,
                last_scanned: Utc::now(),
                reference_tree: root,
                flattened_refs: flattened,
            },
            entries,
        })
    }

    /// DFS node construction.
    ///
    /// Fields are walked in schema order and links within a field in
    /// source order, so traversal is deterministic. A fetch failure on a
    /// referenced entry logs and skips that subtree; cycles are broken by
    /// the on-path guard plus the depth cap.
    fn build_node<'a>(
        &'a self,
        entry: Entry,
        depth: u32,
        parent_id: Option<String>,
        parent_field: Option<String>,
        on_path: &'a mut HashSet<String>,
        entries: &'a mut HashMap<String, Entry>,
    ) -> BoxFuture<'a, MirrorResult<ReferenceNode>> {
        Box::pin(async move {
            let schema = self.schema(&entry.content_type).await?;
            let mut node = ReferenceNode {
                id: entry.id.clone(),
                version: entry.version,
                depth,
                parent_id,
                parent_field,
                content_hash: hash::content_hash(&entry, &schema, &self.policy),
                field_hashes: hash::hash_translatable_fields(&entry, &schema, &self.policy),
                last_updated: entry.updated_at,
                children: Vec::new(),
            };

            if depth >= self.config.max_depth {
                return Ok(node);
            }

            on_path.insert(entry.id.clone());
            for def in &schema.fields {
                if !self.policy.is_trackable(&def.id) {
                    continue;
                }
                let Some(localized) = entry.fields.get(&def.id) else {
                    continue;
                };
                let links: Vec<_> = localized
                    .values()
                    .flat_map(|value| value.links())
                    .filter(|link| link.link_type == LinkType::Entry)
                    .cloned()
                    .collect();

                for link in links {
                    if on_path.contains(&link.id) {
                        continue;
                    }
                    let child = match entries.get(&link.id) {
                        Some(cached) => cached.clone(),
                        None => match self.api.entry(&link.id).await {
                            Ok(fetched) => {
                                entries.insert(fetched.id.clone(), fetched.clone());
                                fetched
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "skipping unreachable reference '{}' on '{}.{}': {}",
                                    link.id,
                                    entry.id,
                                    def.id,
                                    e
                                );
                                continue;
                            }
                        },
                    };
                    let child_node = self
                        .build_node(
                            child,
                            depth + 1,
                            Some(entry.id.clone()),
                            Some(def.id.clone()),
                            on_path,
                            entries,
                        )
                        .await?;
                    node.children.push(child_node);
                }
            }
            on_path.remove(&entry.id);
            Ok(node)
        })
    }

    /// Diff a fresh scan against the stored snapshot.
    ///
    /// The root entry is excluded: its changes are handled at field level
    /// by the engine's basic-change pass. Output order follows discovery
    /// order of the respective tree.
    pub async fn diff(&self, stored: &ReferenceTree, scan: &TreeScan) -> MirrorResult<ReferenceDiff> {
        let mut diff = ReferenceDiff::default();

        for node in discovery_order(&scan.tree.reference_tree) {
            match stored.flattened_refs.get(&node.id) {
                Some(previous) if previous.id != stored.source_entry_id => {
                    let version_bump = node.version > previous.version;
                    let content_moved = node.content_hash != previous.content_hash;
                    if !version_bump && !content_moved {
                        continue;
                    }
                    let change_kind = match (version_bump, content_moved) {
                        (true, true) => ChangeKind::VersionAndContent,
                        (true, false) => ChangeKind::Version,
                        _ => ChangeKind::Content,
                    };
                    // Field-level work only exists when content moved.
                    let field_changes = if content_moved {
                        match scan.entries.get(&node.id) {
                            Some(entry) => self.field_changes(entry, previous).await?,
                            None => Vec::new(),
                        }
                    } else {
                        Vec::new()
                    };
                    diff.changed.push(ChangedReference {
                        id: node.id.clone(),
                        old_version: previous.version,
                        new_version: node.version,
                        change_kind,
                        depth: node.depth,
                        field_changes,
                    });
                }
                Some(_) => {} // the root; handled by the engine directly
                None => diff.added.push(NewReference {
                    id: node.id.clone(),
                    depth: node.depth,
                    parent_id: node.parent_id.clone(),
                    parent_field: node.parent_field.clone(),
                }),
            }
        }

        let current_ids: HashSet<_> = scan.tree.flattened_refs.keys().cloned().collect();
        for node in discovery_order(&stored.reference_tree) {
            if node.id == stored.source_entry_id || current_ids.contains(&node.id) {
                continue;
            }
            diff.removed.push(RemovedReference {
                id: node.id.clone(),
                parent_field: node.parent_field.clone(),
                depth: node.depth,
            });
        }

        Ok(diff)
    }

    /// Per-field hash diff for one changed child.
    async fn field_changes(
        &self,
        entry: &Entry,
        previous: &ReferenceNode,
    ) -> MirrorResult<Vec<FieldChange>> {
        let schema = self.schema(&entry.content_type).await?;
        // Snapshots from older builds carry no per-field hashes; every
        // translatable field is then treated as modified.
        let legacy = previous.field_hashes.is_empty();
        let mut changes = Vec::new();

        for def in &schema.fields {
            let Some(localized) = entry.fields.get(&def.id) else {
                continue;
            };
            if !self.policy.is_translatable(entry, def) {
                continue;
            }
            let current_hash = hash::hash_field(localized);
            let change_type = if legacy {
                FieldChangeKind::Modified
            } else {
                match previous.field_hashes.get(&def.id) {
                    None => FieldChangeKind::Added,
                    Some(old) if *old != current_hash => FieldChangeKind::Modified,
                    Some(_) => continue,
                }
            };
            changes.push(FieldChange {
                field_name: def.id.clone(),
                change_type,
                new_value: entry
                    .field_value(&def.id, &self.config.storage_locale)
                    .cloned(),
                is_translatable: true,
                needs_translation: true,
            });
        }

        for field in previous.field_hashes.keys() {
            if !entry.fields.contains_key(field) {
                changes.push(FieldChange {
                    field_name: field.clone(),
                    change_type: FieldChangeKind::Deleted,
                    new_value: None,
                    is_translatable: true,
                    needs_translation: false,
                });
            }
        }

        Ok(changes)
    }
}

/// Flatten a tree into an id→node map; the first occurrence of a shared
/// reference wins.
fn flatten(node: &ReferenceNode, map: &mut BTreeMap<String, ReferenceNode>) {
    map.entry(node.id.clone())
        .or_insert_with(|| node.without_children());
    for child in &node.children {
        flatten(child, map);
    }
}

/// Nodes below the root in discovery order, deduplicated by id.
fn discovery_order(root: &ReferenceNode) -> Vec<&ReferenceNode> {
    fn walk<'a>(node: &'a ReferenceNode, seen: &mut HashSet<String>, out: &mut Vec<&'a ReferenceNode>) {
        for child in &node.children {
            if seen.insert(child.id.clone()) {
                out.push(child);
            }
            walk(child, seen, out);
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk(root, &mut seen, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::MemoryCms;
    use crate::types::{FieldDef, FieldType, FieldValue, ItemsDef, Link, LocalizedValue};
    use std::collections::BTreeMap;

    const LOCALE: &str = "en-US-POSIX";

    fn text_def(id: &str) -> FieldDef {
        FieldDef {
            id: id.into(),
            field_type: FieldType::Symbol,
            required: false,
            link_type: None,
            items: None,
            validations: Vec::new(),
        }
    }

    fn link_list_def(id: &str) -> FieldDef {
        FieldDef {
            id: id.into(),
            field_type: FieldType::Array,
            required: false,
            link_type: None,
            items: Some(ItemsDef {
                item_type: FieldType::Link,
                link_type: Some(LinkType::Entry),
            }),
            validations: Vec::new(),
        }
    }

    fn localized(value: FieldValue) -> LocalizedValue {
        let mut locales = LocalizedValue::new();
        locales.insert(LOCALE.to_string(), value);
        locales
    }

    fn page_schema() -> ContentTypeSchema {
        ContentTypeSchema {
            id: "cmsPage".into(),
            fields: vec![
                text_def("title"),
                link_list_def("elements"),
                link_list_def("authors"),
            ],
        }
    }

    fn text_schema() -> ContentTypeSchema {
        ContentTypeSchema {
            id: "scText".into(),
            fields: vec![text_def("content"), link_list_def("elements")],
        }
    }

    fn entry(id: &str, content_type: &str, fields: Vec<(&str, FieldValue)>) -> Entry {
        Entry {
            id: id.into(),
            content_type: content_type.into(),
            version: 1,
            published_version: None,
            updated_at: Utc::now(),
            fields: fields
                .into_iter()
                .map(|(field, value)| (field.to_string(), localized(value)))
                .collect(),
        }
    }

    fn links(ids: &[&str]) -> FieldValue {
        FieldValue::List(ids.iter().map(|id| FieldValue::Link(Link::entry(*id))).collect())
    }

    fn tracker(cms: Arc<MemoryCms>) -> ReferenceTracker {
        ReferenceTracker::new(cms, Arc::new(FieldPolicy::default()), TrackerConfig::default())
    }

    async fn seed_page_with_children(cms: &MemoryCms, children: &[&str]) -> Entry {
        cms.put_content_type(page_schema());
        cms.put_content_type(text_schema());
        for child in children {
            cms.put_entry(entry(
                child,
                "scText",
                vec![("content", FieldValue::Text(format!("Text {}", child)))],
            ));
        }
        let root = entry(
            "X",
            "cmsPage",
            vec![
                ("title", FieldValue::Text("Willkommen".into())),
                ("elements", links(children)),
            ],
        );
        cms.put_entry(root.clone());
        root
    }

    #[tokio::test]
    async fn test_scan_builds_tree_with_provenance() {
        let cms = Arc::new(MemoryCms::new());
        let root = seed_page_with_children(&cms, &["E1", "E2"]).await;

        let scan = tracker(cms).scan(&root, "Xp").await.unwrap();
        let tree = &scan.tree;
        assert_eq!(tree.source_entry_id, "X");
        assert_eq!(tree.reference_tree.depth, 0);
        assert_eq!(tree.reference_tree.children.len(), 2);

        let first = &tree.reference_tree.children[0];
        assert_eq!(first.id, "E1");
        assert_eq!(first.depth, 1);
        assert_eq!(first.parent_id.as_deref(), Some("X"));
        assert_eq!(first.parent_field.as_deref(), Some("elements"));

        assert_eq!(tree.flattened_refs.len(), 3); // root + 2 children
        assert!(scan.entries.contains_key("E2"));
    }

    #[tokio::test]
    async fn test_scan_skips_denylisted_fields_and_assets() {
        let cms = Arc::new(MemoryCms::new());
        cms.put_content_type(page_schema());
        cms.put_content_type(text_schema());
        cms.put_entry(entry(
            "A1",
            "author",
            vec![("name", FieldValue::Text("Anna".into()))],
        ));
        let root = entry(
            "X",
            "cmsPage",
            vec![
                ("authors", links(&["A1"])),
                (
                    "elements",
                    FieldValue::List(vec![FieldValue::Link(Link::asset("img1"))]),
                ),
            ],
        );
        cms.put_entry(root.clone());

        let scan = tracker(cms).scan(&root, "Xp").await.unwrap();
        // authors is denylisted, asset links are never descended
        assert!(scan.tree.reference_tree.children.is_empty());
    }

    #[tokio::test]
    async fn test_depth_cap_stops_recursion() {
        let cms = Arc::new(MemoryCms::new());
        cms.put_content_type(page_schema());
        cms.put_content_type(text_schema());
        // Chain X -> C1 -> C2 -> C3 -> C4
        for i in (1..=4).rev() {
            let mut fields = vec![("content", FieldValue::Text(format!("T{}", i)))];
            let next = format!("C{}", i + 1);
            if i < 4 {
                fields.push(("elements", links(&[next.as_str()])));
            }
            cms.put_entry(entry(&format!("C{}", i), "scText", fields));
        }
        let root = entry("X", "cmsPage", vec![("elements", links(&["C1"]))]);
        cms.put_entry(root.clone());

        let scan = tracker(cms).scan(&root, "Xp").await.unwrap();
        // Depth cap 3: X(0) -> C1(1) -> C2(2) -> C3(3), C4 not scanned
        assert!(scan.tree.flattened_refs.contains_key("C3"));
        assert!(!scan.tree.flattened_refs.contains_key("C4"));
        let c3 = &scan.tree.flattened_refs["C3"];
        assert_eq!(c3.depth, 3);
    }

    #[tokio::test]
    async fn test_cycle_guard() {
        let cms = Arc::new(MemoryCms::new());
        cms.put_content_type(text_schema());
        cms.put_entry(entry(
            "A",
            "scText",
            vec![
                ("content", FieldValue::Text("a".into())),
                ("elements", links(&["B"])),
            ],
        ));
        cms.put_entry(entry(
            "B",
            "scText",
            vec![
                ("content", FieldValue::Text("b".into())),
                ("elements", links(&["A"])),
            ],
        ));

        let root = cms.entry("A").await.unwrap();
        let scan = tracker(cms).scan(&root, "Ap").await.unwrap();
        // A -> B, and B's link back to A is not followed
        assert_eq!(scan.tree.reference_tree.children.len(), 1);
        let b = &scan.tree.reference_tree.children[0];
        assert_eq!(b.id, "B");
        assert!(b.children.is_empty());
    }

    #[tokio::test]
    async fn test_diff_detects_changed_new_removed() {
        let cms = Arc::new(MemoryCms::new());
        let root = seed_page_with_children(&cms, &["E1", "E2"]).await;
        let t = tracker(cms.clone());

        let stored = t.scan(&root, "Xp").await.unwrap().tree;

        // E1 edited, E2 removed, E3 added
        let mut e1 = cms.entry("E1").await.unwrap();
        e1.fields
            .insert("content".into(), localized(FieldValue::Text("Weiterlesen".into())));
        cms.update_entry(&e1).await.unwrap();
        cms.put_entry(entry(
            "E3",
            "scText",
            vec![("content", FieldValue::Text("Neu".into()))],
        ));
        let mut root_now = cms.entry("X").await.unwrap();
        root_now
            .fields
            .insert("elements".into(), localized(links(&["E1", "E3"])));
        cms.update_entry(&root_now).await.unwrap();
        let root_now = cms.entry("X").await.unwrap();

        let scan = t.scan(&root_now, "Xp").await.unwrap();
        let diff = t.diff(&stored, &scan).await.unwrap();

        assert_eq!(diff.changed.len(), 1);
        let changed = &diff.changed[0];
        assert_eq!(changed.id, "E1");
        assert_eq!(changed.change_kind, ChangeKind::VersionAndContent);
        assert_eq!(changed.field_changes.len(), 1);
        assert_eq!(changed.field_changes[0].field_name, "content");
        assert_eq!(changed.field_changes[0].change_type, FieldChangeKind::Modified);
        assert!(changed.field_changes[0].needs_translation);

        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "E3");
        assert_eq!(diff.added[0].parent_field.as_deref(), Some("elements"));

        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].id, "E2");
        assert_eq!(diff.removed[0].parent_field.as_deref(), Some("elements"));
    }

    #[tokio::test]
    async fn test_diff_is_empty_without_changes() {
        let cms = Arc::new(MemoryCms::new());
        let root = seed_page_with_children(&cms, &["E1"]).await;
        let t = tracker(cms);

        let stored = t.scan(&root, "Xp").await.unwrap().tree;
        let scan = t.scan(&root, "Xp").await.unwrap();
        let diff = t.diff(&stored, &scan).await.unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_version_only_bump_reports_no_field_changes() {
        let cms = Arc::new(MemoryCms::new());
        let root = seed_page_with_children(&cms, &["E1"]).await;
        let t = tracker(cms.clone());

        let stored = t.scan(&root, "Xp").await.unwrap().tree;

        // Touch E1 without changing translatable content
        let e1 = cms.entry("E1").await.unwrap();
        cms.update_entry(&e1).await.unwrap();

        let scan = t.scan(&root, "Xp").await.unwrap();
        let diff = t.diff(&stored, &scan).await.unwrap();
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].change_kind, ChangeKind::Version);
        assert!(diff.changed[0].field_changes.is_empty());
    }
}
