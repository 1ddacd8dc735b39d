/// Common types used throughout content-mirror.
///
/// This module defines the data model shared by every layer: the dynamic
/// field-value union mirroring CMS entry payloads, the entry and schema
/// shapes fetched from the management API, and the persisted relationship
/// record that ties a source entry to its translated clone.
///
/// Persisted structures serialize with camelCase keys so that files written
/// by the store and entries of the `translationMetadata` content type stay
/// readable next to the CMS's own JSON.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MirrorError, MirrorResult};

/// A map from locale tag to the value stored under that locale.
///
/// The deployments this crate targets keep a single storage locale, so the
/// map usually has exactly one key; the type still models the general CMS
/// shape.
pub type LocalizedValue = BTreeMap<String, FieldValue>;

/// Per-field content hashes, keyed by field id.
pub type FieldHashes = BTreeMap<String, String>;

/// What a link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Another entry (cloned recursively)
    Entry,
    /// A binary asset (always shared by reference, never cloned)
    Asset,
}

impl LinkType {
    /// Canonical wire name ("Entry" / "Asset").
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Entry => "Entry",
            LinkType::Asset => "Asset",
        }
    }
}

/// A reference to another entry or asset by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    /// Whether the target is an entry or an asset
    pub link_type: LinkType,
    /// The id of the referenced object
    pub id: String,
}

impl Link {
    /// Create an entry link.
    pub fn entry(id: impl Into<String>) -> Self {
        Self {
            link_type: LinkType::Entry,
            id: id.into(),
        }
    }

    /// Create an asset link.
    pub fn asset(id: impl Into<String>) -> Self {
        Self {
            link_type: LinkType::Asset,
            id: id.into(),
        }
    }
}

/// A single field value beneath a locale key.
///
/// This is the tagged union every field transformation (translate, empty,
/// copy, link rewrite) is total over. JSON null is preserved as `Null` so
/// that round-tripping an entry through the engine never invents or drops
/// keys.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// JSON null
    Null,
    /// A string scalar (plain text, markdown, dates on the wire)
    Text(String),
    /// A numeric scalar
    Number(f64),
    /// A boolean scalar
    Bool(bool),
    /// An ordered sequence of values
    List(Vec<FieldValue>),
    /// A nested mapping
    Object(BTreeMap<String, FieldValue>),
    /// A reference to an entry or asset
    Link(Link),
}

impl FieldValue {
    /// Build a field value from raw CMS JSON.
    ///
    /// Link objects are recognized by their `sys` envelope
    /// (`{"sys": {"type": "Link", "linkType": "Entry"|"Asset", "id": ...}}`);
    /// everything else maps structurally.
    pub fn from_json(value: &JsonValue) -> FieldValue {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(*b),
            JsonValue::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => FieldValue::Text(s.clone()),
            JsonValue::Array(items) => {
                FieldValue::List(items.iter().map(FieldValue::from_json).collect())
            }
            JsonValue::Object(map) => {
                if let Some(link) = parse_link(map) {
                    return FieldValue::Link(link);
                }
                FieldValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Serialize back to the raw CMS JSON shape.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            // Whole numbers go back as integers so that versions and
            // counters survive a round-trip through the union.
            FieldValue::Number(n) if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 => {
                JsonValue::Number((*n as i64).into())
            }
            FieldValue::Number(n) => serde_json::json!(n),
            FieldValue::Bool(b) => JsonValue::Bool(*b),
            FieldValue::List(items) => {
                JsonValue::Array(items.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            FieldValue::Link(link) => serde_json::json!({
                "sys": {
                    "type": "Link",
                    "linkType": link.link_type.as_str(),
                    "id": link.id,
                }
            }),
        }
    }

    /// The string content, if this is a text scalar.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The link, if this is a link value.
    pub fn as_link(&self) -> Option<&Link> {
        match self {
            FieldValue::Link(link) => Some(link),
            _ => None,
        }
    }

    /// Whether this value is a link or contains any link beneath it.
    pub fn contains_links(&self) -> bool {
        !self.links().is_empty()
    }

    /// Collect every link in this value, depth-first, in source order.
    pub fn links(&self) -> Vec<&Link> {
        let mut out = Vec::new();
        self.collect_links(&mut out);
        out
    }

    fn collect_links<'a>(&'a self, out: &mut Vec<&'a Link>) {
        match self {
            FieldValue::Link(link) => out.push(link),
            FieldValue::List(items) => {
                for item in items {
                    item.collect_links(out);
                }
            }
            FieldValue::Object(map) => {
                for value in map.values() {
                    value.collect_links(out);
                }
            }
            _ => {}
        }
    }

    /// The typed empty of this value's shape, for the empty-on-clone policy.
    ///
    /// Strings empty to `""`, lists to `[]`, objects to `{}`. Scalars with
    /// no meaningful empty (numbers, booleans, links, null) return `None`
    /// and the field is skipped.
    pub fn empty_of_shape(&self) -> Option<FieldValue> {
        match self {
            FieldValue::Text(_) => Some(FieldValue::Text(String::new())),
            FieldValue::List(_) => Some(FieldValue::List(Vec::new())),
            FieldValue::Object(_) => Some(FieldValue::Object(BTreeMap::new())),
            _ => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(FieldValue::from_json(&value))
    }
}

fn parse_link(map: &serde_json::Map<String, JsonValue>) -> Option<Link> {
    let sys = map.get("sys")?.as_object()?;
    if sys.get("type")?.as_str()? != "Link" {
        return None;
    }
    let id = sys.get("id")?.as_str()?.to_string();
    let link_type = match sys.get("linkType")?.as_str()? {
        "Entry" => LinkType::Entry,
        "Asset" => LinkType::Asset,
        _ => return None,
    };
    Some(Link { link_type, id })
}

/// A content object fetched from the CMS.
///
/// `version` is the management-API version counter that every update bumps;
/// it drives the cheap half of change detection (the expensive half is the
/// content hash over translatable fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Unique entry id
    pub id: String,
    /// Id of the content type describing this entry's fields
    pub content_type: String,
    /// Monotonic version from the management API
    pub version: u64,
    /// Version last published, if ever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<u64>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Field id → locale-keyed value
    pub fields: BTreeMap<String, LocalizedValue>,
}

impl Entry {
    /// The value of a field under a specific locale.
    pub fn field_value(&self, field: &str, locale: &str) -> Option<&FieldValue> {
        self.fields.get(field).and_then(|locales| locales.get(locale))
    }

    /// The first non-empty string stored under any locale of a field.
    pub fn any_string(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|locales| {
            locales
                .values()
                .filter_map(FieldValue::as_text)
                .find(|s| !s.trim().is_empty())
        })
    }
}

/// Field types exposed by the content-type schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Symbol,
    Text,
    Integer,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    Link,
}

impl FieldType {
    /// Parse the management-API type name; unknown names map to Object,
    /// which the classifier treats as opaque.
    pub fn parse(name: &str) -> FieldType {
        match name {
            "Symbol" => FieldType::Symbol,
            "Text" => FieldType::Text,
            "Integer" => FieldType::Integer,
            "Number" => FieldType::Number,
            "Boolean" => FieldType::Boolean,
            "Date" => FieldType::Date,
            "Array" => FieldType::Array,
            "Link" => FieldType::Link,
            _ => FieldType::Object,
        }
    }
}

/// Item schema for Array fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsDef {
    /// Element type (Symbol for string arrays, Link for reference arrays)
    pub item_type: FieldType,
    /// For link items, what they point at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,
}

/// A single validation rule; only the enumeration (`in`) rule matters here,
/// as it supplies defaults for required fields absent on the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    /// Allowed values, when this is an `in` validation
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<JsonValue>>,
}

/// Schema of one field within a content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field id
    pub id: String,
    /// Declared type
    pub field_type: FieldType,
    /// Whether the CMS requires a value on create
    #[serde(default)]
    pub required: bool,
    /// For Link fields, what they point at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,
    /// For Array fields, the item schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemsDef>,
    /// Validation rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<Validation>,
}

impl FieldDef {
    /// Whether this field holds a link or a list of links per its schema.
    pub fn is_link_shaped(&self) -> bool {
        match self.field_type {
            FieldType::Link => true,
            FieldType::Array => self
                .items
                .as_ref()
                .map(|items| items.item_type == FieldType::Link)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// First allowed value of an `in` validation, if any.
    pub fn first_allowed(&self) -> Option<&JsonValue> {
        self.validations
            .iter()
            .find_map(|v| v.allowed.as_ref())
            .and_then(|allowed| allowed.first())
    }
}

/// The ordered field list describing a content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTypeSchema {
    /// Content type id
    pub id: String,
    /// Fields in schema order; traversal and diff output follow this order
    pub fields: Vec<FieldDef>,
}

impl ContentTypeSchema {
    /// Look up a field definition by id.
    pub fn field(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }
}

/// Provider language codes for one translation direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationContext {
    /// Provider code of the source text (e.g. "DE")
    pub source_language: String,
    /// Provider code of the target (e.g. "IT", "EN-GB")
    pub target_language: String,
}

impl TranslationContext {
    /// Create a new context.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_language: source.into(),
            target_language: target.into(),
        }
    }
}

/// The mapping from source ids to their translated counterparts.
///
/// Keys are `"Entry:<id>"` / `"Asset:<id>"`. Once a key is set it is never
/// remapped: shared sub-references in the source graph resolve to one
/// shared target, and cycles terminate on the memoized id. Asset keys map
/// to themselves (assets are shared, not cloned).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloneMap {
    map: BTreeMap<String, String>,
}

impl CloneMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_key(id: &str) -> String {
        format!("Entry:{}", id)
    }

    fn asset_key(id: &str) -> String {
        format!("Asset:{}", id)
    }

    /// Record a source→target entry pair.
    ///
    /// If the source is already mapped the existing target wins and is
    /// returned; the caller must not have created a second clone.
    pub fn record_entry(&mut self, source_id: &str, target_id: &str) -> String {
        self.map
            .entry(Self::entry_key(source_id))
            .or_insert_with(|| target_id.to_string())
            .clone()
    }

    /// Record an asset as shared (identity mapping).
    pub fn record_asset(&mut self, id: &str) {
        self.map
            .entry(Self::asset_key(id))
            .or_insert_with(|| id.to_string());
    }

    /// The target entry id for a source entry id, if mapped.
    pub fn target_entry(&self, source_id: &str) -> Option<&str> {
        self.map.get(&Self::entry_key(source_id)).map(String::as_str)
    }

    /// Rewrite a link through the map. Entry links map to their clone,
    /// asset links pass through unchanged.
    pub fn rewrite(&self, link: &Link) -> Option<Link> {
        match link.link_type {
            LinkType::Entry => self.target_entry(&link.id).map(Link::entry),
            LinkType::Asset => Some(link.clone()),
        }
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over raw `(key, target)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }
}

/// One node of the deep reference tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceNode {
    /// Entry id
    pub id: String,
    /// Entry version at scan time
    pub version: u64,
    /// Distance from the root (root is 0)
    pub depth: u32,
    /// Id of the entry whose field references this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The referencing field on the parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field: Option<String>,
    /// sha256 over the canonical serialization of translatable fields
    pub content_hash: String,
    /// Per-field hashes over translatable fields, for field-level diffs.
    /// Snapshots written by older builds may lack this; the diff then
    /// degrades to whole-node granularity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_hashes: FieldHashes,
    /// Entry modification time at scan time
    pub last_updated: DateTime<Utc>,
    /// Child references, in schema-then-source order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ReferenceNode>,
}

impl ReferenceNode {
    /// A copy of this node with its children removed, for the flattened map.
    pub fn without_children(&self) -> ReferenceNode {
        ReferenceNode {
            children: Vec::new(),
            ..self.clone()
        }
    }

    /// Total number of nodes in this subtree, self included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ReferenceNode::node_count).sum::<usize>()
    }

    /// Deepest depth found in this subtree.
    pub fn max_depth(&self) -> u32 {
        self.children
            .iter()
            .map(ReferenceNode::max_depth)
            .max()
            .unwrap_or(self.depth)
    }
}

/// Bounded-depth snapshot of the reference graph reachable from a source
/// entry, plus its flattened id→node index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceTree {
    /// Root source entry id
    pub source_entry_id: String,
    /// The mapped target entry id (the clone of the root)
    pub target_entry_id: String,
    /// Depth cap used for the scan
    pub max_depth: u32,
    /// When the scan ran
    pub last_scanned: DateTime<Utc>,
    /// The tree itself, root at depth 0
    pub reference_tree: ReferenceNode,
    /// id → node (children stripped), for O(1) diff lookups
    pub flattened_refs: BTreeMap<String, ReferenceNode>,
}

/// Metadata tracked per relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipMetadata {
    /// Source entry version at the last successful translation
    pub last_translated_version: u64,
    /// When the relationship was first created
    pub created_at: DateTime<Utc>,
    /// When the relationship last changed
    pub last_updated: DateTime<Utc>,
}

/// A snapshot of the target entry taken before an incremental update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    /// Unique backup id
    pub backup_id: String,
    /// The entry that was snapshotted
    pub entry_id: String,
    /// Entry version at snapshot time
    pub version: u64,
    /// Why the snapshot was taken
    pub reason: String,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Full entry content (fields and sys metadata) as raw JSON
    pub content: JsonValue,
}

/// The persisted record tying one source entry to one translated target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    /// Source entry id
    pub source_entry_id: String,
    /// Target (clone) entry id
    pub target_entry_id: String,
    /// Version/timestamps bookkeeping
    pub metadata: RelationshipMetadata,
    /// Translation direction
    pub translation_context: TranslationContext,
    /// Root-entry hashes over translatable fields at last translation
    pub field_hashes: FieldHashes,
    /// Source→target id mapping accumulated over all runs
    pub clone_mapping: CloneMap,
    /// Deep reference tree snapshot, once the tracker has run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_reference_map: Option<ReferenceTree>,
    /// Latest pre-update backup of the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_data: Option<BackupData>,
}

impl Relationship {
    /// The unique relationship id: `<sourceId>_<targetId>`.
    pub fn relationship_id(&self) -> String {
        relationship_id(&self.source_entry_id, &self.target_entry_id)
    }
}

/// Compose the unique id for a (source, target) pair.
pub fn relationship_id(source_id: &str, target_id: &str) -> String {
    format!("{}_{}", source_id, target_id)
}

/// How a changed reference was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// Version bumped, content hash unchanged
    Version,
    /// Content hash changed at the same version
    Content,
    /// Both moved; reported once
    VersionAndContent,
}

/// Classification of a single field difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldChangeKind {
    /// The field did not exist in the stored state
    Added,
    /// The field existed and its hash moved
    Modified,
    /// The field existed and is now absent
    Deleted,
}

/// One field-level difference on an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Field id
    pub field_name: String,
    /// Added / modified / deleted
    pub change_type: FieldChangeKind,
    /// Current value (absent for deletions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<FieldValue>,
    /// Whether the classifier marks this field translatable
    pub is_translatable: bool,
    /// Whether the update pass should issue translation work for it
    pub needs_translation: bool,
}

/// A referenced entry whose version or content moved since the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedReference {
    /// Entry id
    pub id: String,
    /// Version recorded in the snapshot
    pub old_version: u64,
    /// Version observed now
    pub new_version: u64,
    /// What tripped the detection
    pub change_kind: ChangeKind,
    /// Depth at which the reference sits
    pub depth: u32,
    /// Field-level differences, in schema order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_changes: Vec<FieldChange>,
}

/// A referenced entry absent from the stored snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReference {
    /// Entry id
    pub id: String,
    /// Depth at which it was discovered
    pub depth: u32,
    /// Parent entry holding the reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Referencing field on the parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field: Option<String>,
}

/// A referenced entry present in the stored snapshot but gone now.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedReference {
    /// Entry id
    pub id: String,
    /// Referencing field recorded in the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field: Option<String>,
    /// Depth recorded in the snapshot
    pub depth: u32,
}

/// Result of diffing a fresh reference tree against the stored snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDiff {
    /// References whose version or content moved
    pub changed: Vec<ChangedReference>,
    /// References absent from the snapshot
    pub added: Vec<NewReference>,
    /// References present in the snapshot but gone from the live graph
    pub removed: Vec<RemovedReference>,
}

impl ReferenceDiff {
    /// Whether nothing moved at all.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of one first-clone run for one target language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneReport {
    /// The source entry
    pub original_entry_id: String,
    /// The newly created root clone
    pub cloned_entry_id: String,
    /// Provider code the run translated into
    pub target_language: String,
    /// Stored locale tag written to culture fields
    pub target_locale: String,
    /// Full mapping accumulated during the run
    pub clone_mapping: CloneMap,
    /// Ids of entries created by this run, in creation order
    pub created_entry_ids: Vec<String>,
}

/// Outcome of cloning one newly discovered reference during an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReferenceOutcome {
    /// Source entry id of the reference
    pub id: String,
    /// Whether the clone was created
    pub success: bool,
    /// Target id on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Failure description on error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured result of an incremental update.
///
/// The engine never throws past its boundary: failures surface here with
/// `success = false` and an explanatory message, leaving prior state
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    /// Whether the update completed and persisted
    pub success: bool,
    /// Field ids patched on the target or its children
    pub fields_updated: Vec<String>,
    /// Backup taken before mutating, when one was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    /// Target entry version after the final write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u64>,
    /// Per-reference outcomes for newly discovered references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_references: Vec<NewReferenceOutcome>,
    /// Human-readable summary
    pub message: String,
}

impl UpdateReport {
    /// The canonical failure report: nothing updated, prior state intact.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            fields_updated: Vec::new(),
            backup_id: None,
            new_version: None,
            new_references: Vec::new(),
            message: message.into(),
        }
    }
}

/// Result of a read-only status check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Whether a relationship exists for the pair
    pub has_relationship: bool,
    /// Whether nothing needs translating
    pub up_to_date: bool,
    /// Root-entry field differences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_changes: Vec<FieldChange>,
    /// Deep reference differences
    #[serde(default)]
    pub reference_diff: ReferenceDiff,
    /// Manual-edit conflicts on the target. Detection is a stub: always
    /// empty in this build.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    /// Relationship metadata, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RelationshipMetadata>,
}

/// A request-scoped cooperative cancellation flag.
///
/// Clones share the flag. The engine checks it between I/O steps; on
/// cancellation, already-created drafts are left in place and the
/// relationship is not updated (orphans are reconciled on the next run
/// because memoization is in-memory only).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the active state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Bail with `MirrorError::Cancelled` if tripped.
    pub fn ensure_active(&self) -> MirrorResult<()> {
        if self.is_cancelled() {
            Err(MirrorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_value_link_round_trip() {
        let raw = json!({
            "sys": { "type": "Link", "linkType": "Entry", "id": "e42" }
        });
        let value = FieldValue::from_json(&raw);
        assert_eq!(value, FieldValue::Link(Link::entry("e42")));
        assert_eq!(value.to_json(), raw);
    }

    #[test]
    fn test_field_value_non_link_object_stays_object() {
        let raw = json!({ "sys": { "type": "Entry", "id": "x" } });
        let value = FieldValue::from_json(&raw);
        assert!(matches!(value, FieldValue::Object(_)));
    }

    #[test]
    fn test_links_collected_in_source_order() {
        let raw = json!([
            { "sys": { "type": "Link", "linkType": "Entry", "id": "a" } },
            { "sys": { "type": "Link", "linkType": "Asset", "id": "img" } },
            { "sys": { "type": "Link", "linkType": "Entry", "id": "b" } },
        ]);
        let value = FieldValue::from_json(&raw);
        let ids: Vec<_> = value.links().iter().map(|l| l.id.clone()).collect();
        assert_eq!(ids, vec!["a", "img", "b"]);
    }

    #[test]
    fn test_whole_numbers_round_trip_as_integers() {
        let value = FieldValue::from_json(&json!(3));
        assert_eq!(value.to_json(), json!(3));
        let value = FieldValue::from_json(&json!(2.5));
        assert_eq!(value.to_json(), json!(2.5));
    }

    #[test]
    fn test_empty_of_shape() {
        assert_eq!(
            FieldValue::Text("hi".into()).empty_of_shape(),
            Some(FieldValue::Text(String::new()))
        );
        assert_eq!(
            FieldValue::List(vec![FieldValue::Bool(true)]).empty_of_shape(),
            Some(FieldValue::List(Vec::new()))
        );
        assert_eq!(FieldValue::Number(3.0).empty_of_shape(), None);
        assert_eq!(FieldValue::Link(Link::entry("x")).empty_of_shape(), None);
    }

    #[test]
    fn test_clone_map_never_remaps() {
        let mut map = CloneMap::new();
        let first = map.record_entry("src", "t1");
        assert_eq!(first, "t1");
        let second = map.record_entry("src", "t2");
        assert_eq!(second, "t1");
        assert_eq!(map.target_entry("src"), Some("t1"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_clone_map_asset_identity() {
        let mut map = CloneMap::new();
        map.record_asset("img1");
        let rewritten = map.rewrite(&Link::asset("img1")).unwrap();
        assert_eq!(rewritten, Link::asset("img1"));
        // Assets pass through even when unrecorded
        assert_eq!(
            map.rewrite(&Link::asset("other")),
            Some(Link::asset("other"))
        );
        // Unmapped entries do not
        assert_eq!(map.rewrite(&Link::entry("ghost")), None);
    }

    #[test]
    fn test_relationship_id_format() {
        assert_eq!(relationship_id("src", "tgt"), "src_tgt");
    }

    #[test]
    fn test_reference_node_counts() {
        let node = ReferenceNode {
            id: "root".into(),
            version: 1,
            depth: 0,
            parent_id: None,
            parent_field: None,
            content_hash: "h".into(),
            field_hashes: FieldHashes::new(),
            last_updated: Utc::now(),
            children: vec![ReferenceNode {
                id: "child".into(),
                version: 1,
                depth: 1,
                parent_id: Some("root".into()),
                parent_field: Some("elements".into()),
                content_hash: "h2".into(),
                field_hashes: FieldHashes::new(),
                last_updated: Utc::now(),
                children: Vec::new(),
            }],
        };
        assert_eq!(node.node_count(), 2);
        assert_eq!(node.max_depth(), 1);
        assert!(node.without_children().children.is_empty());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let shared = token.clone();
        assert!(token.ensure_active().is_ok());
        shared.cancel();
        assert!(matches!(
            token.ensure_active(),
            Err(MirrorError::Cancelled)
        ));
    }

    #[test]
    fn test_relationship_serializes_camel_case() {
        let rel = Relationship {
            source_entry_id: "s".into(),
            target_entry_id: "t".into(),
            metadata: RelationshipMetadata {
                last_translated_version: 3,
                created_at: Utc::now(),
                last_updated: Utc::now(),
            },
            translation_context: TranslationContext::new("DE", "IT"),
            field_hashes: FieldHashes::new(),
            clone_mapping: CloneMap::new(),
            deep_reference_map: None,
            backup_data: None,
        };
        let json = serde_json::to_value(&rel).unwrap();
        assert!(json.get("sourceEntryId").is_some());
        assert!(json["metadata"].get("lastTranslatedVersion").is_some());
        assert!(json["translationContext"].get("targetLanguage").is_some());
    }
}
