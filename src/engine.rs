/// The clone and incremental-translate engine.
///
/// On first run the engine performs a recursive clone: every reachable
/// source entry gets a draft counterpart with link fields rewritten
/// through the clone map, text and markdown translated, culture and
/// authors remapped, and prefix/empty/copy-as-is policies applied. On
/// later runs it consumes the tracker's diff and patches exactly the
/// fields that changed, clones newly added references, and re-projects
/// link fields so removals disappear.
///
/// Translation is best-effort throughout: a provider failure keeps the
/// source text and the run continues. The engine's public operations
/// return structured reports and never panic past their boundary.
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cms::{EntryQuery, ManagementApi};
use crate::error::{MirrorError, MirrorResult};
use crate::hash;
use crate::markdown;
use crate::policy::{FieldKind, FieldPolicy};
use crate::store::RelationshipStore;
use crate::tracker::{ReferenceTracker, TrackerConfig, TreeScan};
use crate::translator::{TranslateOptions, Translator};
use crate::types::{
    BackupData, CancelToken, CloneMap, CloneReport, Entry, FieldChange, FieldChangeKind,
    FieldDef, FieldType, FieldValue, Link, LinkType, LocalizedValue, NewReferenceOutcome,
    ReferenceTree, Relationship, RelationshipMetadata, StatusReport, TranslationContext,
    UpdateReport, relationship_id,
};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The deployment's single storage locale
    pub storage_locale: String,
    /// Content type a first clone must be rooted at
    pub root_content_type: String,
    /// Depth cap for reference tracking
    pub max_depth: u32,
    /// Whether incremental updates clone newly discovered references
    pub auto_translate_new_refs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_locale: "en-US-POSIX".to_string(),
            root_content_type: "cmsPage".to_string(),
            max_depth: 3,
            auto_translate_new_refs: true,
        }
    }
}

/// A first-clone request.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// The entry to clone
    pub source_entry_id: String,
    /// Provider code of the source text; auto-detected from the source
    /// entry's culture field when absent
    pub source_language: Option<String>,
    /// Provider code to translate into
    pub target_language: String,
}

/// Per-run mutable state of a recursive clone.
///
/// The memo doubles as the clone map: it deduplicates shared references
/// and terminates cycles that survive the depth cap. It lives only for
/// the duration of one request.
struct CloneRun {
    memo: CloneMap,
    processing: HashSet<String>,
    created: Vec<Entry>,
}

impl CloneRun {
    fn new(memo: CloneMap) -> Self {
        Self {
            memo,
            processing: HashSet::new(),
            created: Vec::new(),
        }
    }
}

/// The orchestrator over CMS, translator, store and tracker.
pub struct CloneEngine {
    api: Arc<dyn ManagementApi>,
    translator: Arc<dyn Translator>,
    store: Arc<dyn RelationshipStore>,
    tracker: ReferenceTracker,
    policy: Arc<FieldPolicy>,
    config: EngineConfig,
    /// Single-flight guard per relationship id: two concurrent updates on
    /// the same pair would corrupt the stored state
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl CloneEngine {
    /// Assemble an engine from its collaborators.
    pub fn new(
        api: Arc<dyn ManagementApi>,
        translator: Arc<dyn Translator>,
        store: Arc<dyn RelationshipStore>,
        policy: Arc<FieldPolicy>,
        config: EngineConfig,
    ) -> Self {
        let tracker = ReferenceTracker::new(
            api.clone(),
            policy.clone(),
            TrackerConfig {
                max_depth: config.max_depth,
                auto_translate_new_refs: config.auto_translate_new_refs,
                storage_locale: config.storage_locale.clone(),
            },
        );
        Self {
            api,
            translator,
            store,
            tracker,
            policy,
            config,
            in_flight: DashMap::new(),
        }
    }

    // ========================================================================
    // First clone
    // ========================================================================

    /// Recursively clone a source entry into the target language.
    pub async fn clone_entry(
        &self,
        request: &CloneRequest,
        cancel: &CancelToken,
    ) -> MirrorResult<CloneReport> {
        cancel.ensure_active()?;
        let source = self.api.entry(&request.source_entry_id).await?;

        if source.content_type != self.config.root_content_type {
            return Err(MirrorError::InvalidInput {
                reason: format!(
                    "clone must start at a '{}' entry, '{}' is a '{}'",
                    self.config.root_content_type, source.id, source.content_type
                ),
            });
        }

        let source_language = match &request.source_language {
            Some(language) => language.clone(),
            None => self.detect_source_language(&source)?,
        };
        let target_locale = self
            .policy
            .culture_map
            .locale_for(&request.target_language)
            .ok_or_else(|| MirrorError::InvalidInput {
                reason: format!(
                    "unknown target language '{}'",
                    request.target_language
                ),
            })?
            .to_string();
        let context = TranslationContext::new(source_language, request.target_language.clone());

        let mut run = CloneRun::new(CloneMap::new());
        let root_target_id = self
            .clone_recursive(source.clone(), &context, &target_locale, &mut run, cancel)
            .await?;

        self.fixup_cyclic_links(&mut run).await;

        let schema = self.tracker.schema(&source.content_type).await?;
        let now = Utc::now();
        let relationship = Relationship {
            source_entry_id: source.id.clone(),
            target_entry_id: root_target_id.clone(),
            metadata: RelationshipMetadata {
                last_translated_version: source.version,
                created_at: now,
                last_updated: now,
            },
            translation_context: context,
            field_hashes: hash::hash_translatable_fields(&source, &schema, &self.policy),
            clone_mapping: run.memo.clone(),
            deep_reference_map: None,
            backup_data: None,
        };
        self.store.store(&relationship).await?;

        let scan = self.tracker.scan(&source, &root_target_id).await?;
        self.store.store_deep_map(&scan.tree).await?;

        tracing::info!(
            "cloned '{}' into '{}' ({} entries created, {} mapped)",
            source.id,
            root_target_id,
            run.created.len(),
            run.memo.len()
        );

        Ok(CloneReport {
            original_entry_id: source.id,
            cloned_entry_id: root_target_id,
            target_language: request.target_language.clone(),
            target_locale,
            clone_mapping: run.memo,
            created_entry_ids: run.created.iter().map(|e| e.id.clone()).collect(),
        })
    }

    /// Resolve the provider code from the source entry's culture field.
    fn detect_source_language(&self, source: &Entry) -> MirrorResult<String> {
        let locale = source
            .fields
            .keys()
            .find(|field| self.policy.is_culture_field(field))
            .and_then(|field| source.any_string(field))
            .ok_or_else(|| MirrorError::InvalidInput {
                reason: format!(
                    "source '{}' has no culture field; pass sourceLanguage explicitly",
                    source.id
                ),
            })?;
        self.policy
            .culture_map
            .provider_for(locale)
            .map(String::from)
            .ok_or_else(|| MirrorError::InvalidInput {
                reason: format!("source culture '{}' maps to no known language", locale),
            })
    }

    /// Clone one entry and everything reachable beneath it.
    fn clone_recursive<'a>(
        &'a self,
        source: Entry,
        context: &'a TranslationContext,
        target_locale: &'a str,
        run: &'a mut CloneRun,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, MirrorResult<String>> {
        Box::pin(async move {
            // Shared references and cycles resolve to the memoized clone.
            if let Some(target_id) = run.memo.target_entry(&source.id) {
                return Ok(target_id.to_string());
            }
            cancel.ensure_active()?;

            run.processing.insert(source.id.clone());
            let schema = self.tracker.schema(&source.content_type).await?;

            let mut new_fields: BTreeMap<String, LocalizedValue> = BTreeMap::new();
            for def in &schema.fields {
                cancel.ensure_active()?;
                match source.fields.get(&def.id) {
                    Some(localized) => {
                        if let Some(value) = self
                            .clone_field(&source, def, localized, context, target_locale, run, cancel)
                            .await?
                        {
                            new_fields.insert(def.id.clone(), value);
                        }
                    }
                    None if def.required => {
                        if let Some(default) = self.default_for_field(def) {
                            let mut locales = LocalizedValue::new();
                            locales.insert(self.config.storage_locale.clone(), default);
                            new_fields.insert(def.id.clone(), locales);
                        }
                    }
                    None => {}
                }
            }

            let created = self.api.create_entry(&source.content_type, &new_fields).await?;
            run.processing.remove(&source.id);
            let target_id = run.memo.record_entry(&source.id, &created.id);
            run.created.push(created);
            Ok(target_id)
        })
    }

    /// Transform one present field according to its classification.
    async fn clone_field(
        &self,
        source: &Entry,
        def: &FieldDef,
        localized: &LocalizedValue,
        context: &TranslationContext,
        target_locale: &str,
        run: &mut CloneRun,
        cancel: &CancelToken,
    ) -> MirrorResult<Option<LocalizedValue>> {
        let kind = self.policy.classify(&source.content_type, def, source);
        let value = match kind {
            FieldKind::EmptyOnClone => {
                let empty = localized
                    .values()
                    .next()
                    .and_then(FieldValue::empty_of_shape);
                match empty {
                    Some(empty) => {
                        let mut locales = LocalizedValue::new();
                        locales.insert(self.config.storage_locale.clone(), empty);
                        Some(locales)
                    }
                    None => None, // no typed default for this shape
                }
            }
            FieldKind::Culture => {
                let mut locales = LocalizedValue::new();
                locales.insert(
                    self.config.storage_locale.clone(),
                    FieldValue::Text(target_locale.to_string()),
                );
                Some(locales)
            }
            FieldKind::Author => {
                let mut out = LocalizedValue::new();
                for (locale, value) in localized {
                    let relinked = self
                        .relink_authors(value.clone(), context, target_locale, run, cancel)
                        .await?;
                    out.insert(locale.clone(), relinked);
                }
                Some(out)
            }
            FieldKind::CopyAsIs | FieldKind::Links => {
                let mut out = LocalizedValue::new();
                for (locale, value) in localized {
                    let rewritten = self
                        .clone_links_in_value(value.clone(), context, target_locale, run, cancel)
                        .await?;
                    out.insert(locale.clone(), rewritten);
                }
                Some(out)
            }
            FieldKind::Markdown => {
                let mut out = LocalizedValue::new();
                for (locale, value) in localized {
                    out.insert(locale.clone(), self.translate_value(value, context, true).await);
                }
                Some(out)
            }
            FieldKind::Translatable => {
                let mut out = LocalizedValue::new();
                for (locale, value) in localized {
                    out.insert(locale.clone(), self.translate_value(value, context, false).await);
                }
                Some(out)
            }
            FieldKind::Passthrough => Some(localized.clone()),
        };

        // The prefix goes on after translation, once.
        let value = match value {
            Some(mut locales) if self.policy.is_prefixed(&def.id) => {
                for text in locales.values_mut() {
                    if let FieldValue::Text(s) = text {
                        if !s.is_empty() && !s.starts_with(&self.policy.clone_prefix) {
                            *s = self.policy.apply_prefix(s);
                        }
                    }
                }
                Some(locales)
            }
            other => other,
        };
        Ok(value)
    }

    /// Attempt to re-link author references to existing target-culture
    /// authors; fall through to a normal clone on miss.
    async fn relink_authors(
        &self,
        value: FieldValue,
        context: &TranslationContext,
        target_locale: &str,
        run: &mut CloneRun,
        cancel: &CancelToken,
    ) -> MirrorResult<FieldValue> {
        match value {
            FieldValue::Link(link) if link.link_type == LinkType::Entry => {
                let author = match self.api.entry(&link.id).await {
                    Ok(author) => author,
                    Err(e) => {
                        tracing::warn!("author '{}' unreachable, keeping link: {}", link.id, e);
                        return Ok(FieldValue::Link(link));
                    }
                };
                if let Some(existing) = self.find_target_author(&author, target_locale).await {
                    run.memo.record_entry(&link.id, &existing);
                    return Ok(FieldValue::Link(Link::entry(existing)));
                }
                let target_id = self
                    .clone_recursive(author, context, target_locale, run, cancel)
                    .await?;
                Ok(FieldValue::Link(Link::entry(target_id)))
            }
            FieldValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(
                        Box::pin(self.relink_authors(item, context, target_locale, run, cancel))
                            .await?,
                    );
                }
                Ok(FieldValue::List(out))
            }
            other => Ok(other),
        }
    }

    /// Find an existing author with the same name in the target culture.
    async fn find_target_author(&self, author: &Entry, target_locale: &str) -> Option<String> {
        if author.content_type != self.policy.author_content_type {
            return None;
        }
        let name = author.any_string(&self.policy.author_match_field)?;
        let query = EntryQuery::of_type(&self.policy.author_content_type)
            .field_equals(
                &self.policy.author_match_field,
                &self.config.storage_locale,
                name,
            )
            .field_equals(
                &self.policy.author_locale_field,
                &self.config.storage_locale,
                target_locale,
            )
            .limit(1);
        match self.api.entries(&query).await {
            Ok(matches) => matches.into_iter().next().map(|e| e.id),
            Err(e) => {
                tracing::warn!("author lookup failed for '{}': {}", author.id, e);
                None
            }
        }
    }

    /// Walk a value, cloning entry links depth-first and rewriting them to
    /// their targets. Asset links pass through unchanged and are recorded
    /// identity in the clone map.
    fn clone_links_in_value<'a>(
        &'a self,
        value: FieldValue,
        context: &'a TranslationContext,
        target_locale: &'a str,
        run: &'a mut CloneRun,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, MirrorResult<FieldValue>> {
        Box::pin(async move {
            match value {
                FieldValue::Link(link) => match link.link_type {
                    LinkType::Asset => {
                        run.memo.record_asset(&link.id);
                        Ok(FieldValue::Link(link))
                    }
                    LinkType::Entry => {
                        // A link back onto the processing stack keeps the
                        // original id; the post-run fixup pass rewrites it
                        // once the clone exists.
                        if run.processing.contains(&link.id) {
                            return Ok(FieldValue::Link(link));
                        }
                        let child = match self.api.entry(&link.id).await {
                            Ok(child) => child,
                            Err(e) => {
                                tracing::warn!(
                                    "referenced entry '{}' unreachable, keeping link: {}",
                                    link.id,
                                    e
                                );
                                return Ok(FieldValue::Link(link));
                            }
                        };
                        let target_id = self
                            .clone_recursive(child, context, target_locale, run, cancel)
                            .await?;
                        Ok(FieldValue::Link(Link::entry(target_id)))
                    }
                },
                FieldValue::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(
                            self.clone_links_in_value(item, context, target_locale, run, cancel)
                                .await?,
                        );
                    }
                    Ok(FieldValue::List(out))
                }
                FieldValue::Object(map) => {
                    let mut out = BTreeMap::new();
                    for (key, item) in map {
                        out.insert(
                            key,
                            self.clone_links_in_value(item, context, target_locale, run, cancel)
                                .await?,
                        );
                    }
                    Ok(FieldValue::Object(out))
                }
                scalar => Ok(scalar),
            }
        })
    }

    /// Second pass for cycles: links that had to keep their source id
    /// (the target did not exist yet) are rewritten now that the full
    /// clone map is known.
    async fn fixup_cyclic_links(&self, run: &mut CloneRun) {
        let created = std::mem::take(&mut run.created);
        for entry in created {
            let rewritten_fields: BTreeMap<String, LocalizedValue> = entry
                .fields
                .iter()
                .map(|(field, locales)| {
                    let locales = locales
                        .iter()
                        .map(|(locale, value)| (locale.clone(), rewrite_links(value, &run.memo)))
                        .collect();
                    (field.clone(), locales)
                })
                .collect();

            if rewritten_fields != entry.fields {
                let mut patched = entry.clone();
                patched.fields = rewritten_fields;
                if let Err(e) = self.api.update_entry(&patched).await {
                    tracing::warn!("cycle fixup on '{}' failed: {}", entry.id, e);
                }
            }
            run.created.push(entry);
        }
    }

    /// Default for a required field absent on the source.
    fn default_for_field(&self, def: &FieldDef) -> Option<FieldValue> {
        if self.policy.empty_on_clone.contains(&def.id) {
            return match def.field_type {
                FieldType::Symbol | FieldType::Text => Some(FieldValue::Text(String::new())),
                FieldType::Array => Some(FieldValue::List(Vec::new())),
                FieldType::Object => Some(FieldValue::Object(BTreeMap::new())),
                _ => None,
            };
        }
        if let Some(allowed) = def.first_allowed() {
            return Some(FieldValue::from_json(allowed));
        }
        match def.field_type {
            FieldType::Integer | FieldType::Number => Some(FieldValue::Number(0.0)),
            FieldType::Boolean => Some(FieldValue::Bool(false)),
            FieldType::Date => Some(FieldValue::Text(Utc::now().to_rfc3339())),
            FieldType::Symbol | FieldType::Text => Some(FieldValue::Text(String::new())),
            FieldType::Array => Some(FieldValue::List(Vec::new())),
            FieldType::Object => Some(FieldValue::Object(BTreeMap::new())),
            FieldType::Link => None,
        }
    }

    // ========================================================================
    // Translation
    // ========================================================================

    /// Translate a single value; lists translate element-wise.
    async fn translate_value(
        &self,
        value: &FieldValue,
        context: &TranslationContext,
        as_markdown: bool,
    ) -> FieldValue {
        match value {
            FieldValue::Text(text) => {
                let translated = if as_markdown {
                    self.translate_markdown(text, context).await
                } else {
                    self.translate_text(text, context).await
                };
                FieldValue::Text(translated)
            }
            FieldValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Box::pin(self.translate_value(item, context, as_markdown)).await);
                }
                FieldValue::List(out)
            }
            other => other.clone(),
        }
    }

    /// Best-effort plain-text translation with prefix preservation.
    async fn translate_text(&self, text: &str, context: &TranslationContext) -> String {
        if text.chars().filter(|c| !c.is_whitespace()).count() < 2 {
            return text.to_string();
        }
        let (had_prefix, body) = self.policy.split_prefix(text);
        match self
            .translator
            .translate(body, context, TranslateOptions::default())
            .await
        {
            Ok(translated) if had_prefix => self.policy.apply_prefix(&translated),
            Ok(translated) => translated,
            Err(e) => {
                tracing::warn!("translation failed, keeping source text: {}", e);
                text.to_string()
            }
        }
    }

    /// Markdown-safe translation: image blocks are lifted out before the
    /// body call and rebuilt afterwards with independently translated
    /// captions. URLs survive byte-for-byte.
    async fn translate_markdown(&self, text: &str, context: &TranslationContext) -> String {
        let (body, blocks) = markdown::extract_images(text);

        let translated_body = match self
            .translator
            .translate(&body, context, TranslateOptions::markdown())
            .await
        {
            Ok(translated) => translated,
            Err(e) => {
                tracing::warn!("markdown translation failed, keeping source text: {}", e);
                body.clone()
            }
        };

        let caption_futures = blocks.iter().map(|block| async {
            if block.caption.chars().filter(|c| !c.is_whitespace()).count() < 2 {
                return Some(block.caption.clone());
            }
            self.translator
                .translate(&block.caption, context, TranslateOptions::default())
                .await
                .ok()
        });
        let captions = futures::future::join_all(caption_futures).await;

        markdown::restore_images(&translated_body, &blocks, &captions)
    }

    // ========================================================================
    // Incremental update
    // ========================================================================

    /// Apply source changes to an existing clone, field by field.
    ///
    /// Serialized per relationship id: a second update on the same pair
    /// waits for the first.
    pub async fn incremental_update(
        &self,
        source_id: &str,
        target_id: &str,
        cancel: &CancelToken,
    ) -> UpdateReport {
        let key = relationship_id(source_id, target_id);
        let lock = self
            .in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        match self.update_inner(source_id, target_id, cancel).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("incremental update '{}_{}' failed: {}", source_id, target_id, e);
                UpdateReport::failed(e.to_string())
            }
        }
    }

    async fn update_inner(
        &self,
        source_id: &str,
        target_id: &str,
        cancel: &CancelToken,
    ) -> MirrorResult<UpdateReport> {
        cancel.ensure_active()?;
        let Some(relationship) = self.store.get(source_id, target_id).await? else {
            return Ok(UpdateReport::failed(format!(
                "no relationship for '{}' -> '{}'",
                source_id, target_id
            )));
        };

        let source = self.api.entry(source_id).await?;
        let target = self.api.entry(target_id).await?;
        let context = relationship.translation_context.clone();

        // Snapshot the target before touching anything.
        let backup = BackupData {
            backup_id: uuid::Uuid::new_v4().simple().to_string(),
            entry_id: target.id.clone(),
            version: target.version,
            reason: "pre-incremental-update".to_string(),
            created_at: Utc::now(),
            content: serde_json::to_value(&target)?,
        };
        self.store.store_backup(source_id, target_id, &backup).await?;

        let scan = self.tracker.scan(&source, target_id).await?;
        let stored_tree = match &relationship.deep_reference_map {
            Some(tree) => tree.clone(),
            None => match self.store.get_deep_map(source_id, target_id).await? {
                Some(tree) => tree,
                None => empty_tree(&scan),
            },
        };
        let diff = self.tracker.diff(&stored_tree, &scan).await?;

        let schema = self.tracker.schema(&source.content_type).await?;
        let root_changes = self.root_field_changes(&source, &schema, &relationship);

        cancel.ensure_active()?;

        let mut fields_updated = Vec::new();
        let mut run = CloneRun::new(relationship.clone_mapping.clone());

        // Newly added references become clones of their own.
        let mut new_outcomes = Vec::new();
        if self.config.auto_translate_new_refs {
            let target_locale = self
                .policy
                .culture_map
                .locale_for(&context.target_language)
                .unwrap_or(&self.config.storage_locale)
                .to_string();
            for added in &diff.added {
                let child = match scan.entries.get(&added.id) {
                    Some(child) => child.clone(),
                    None => {
                        new_outcomes.push(NewReferenceOutcome {
                            id: added.id.clone(),
                            success: false,
                            target_id: None,
                            error: Some("entry disappeared during update".to_string()),
                        });
                        continue;
                    }
                };
                match self
                    .clone_recursive(child, &context, &target_locale, &mut run, cancel)
                    .await
                {
                    Ok(new_target) => new_outcomes.push(NewReferenceOutcome {
                        id: added.id.clone(),
                        success: true,
                        target_id: Some(new_target),
                        error: None,
                    }),
                    Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                    Err(e) => new_outcomes.push(NewReferenceOutcome {
                        id: added.id.clone(),
                        success: false,
                        target_id: None,
                        error: Some(e.to_string()),
                    }),
                }
            }
            self.fixup_cyclic_links(&mut run).await;
        }
        let clone_mapping = run.memo;

        // Patch changed children field by field.
        for changed in &diff.changed {
            cancel.ensure_active()?;
            let Some(child_target_id) = clone_mapping.target_entry(&changed.id) else {
                tracing::warn!("changed reference '{}' has no clone, skipping", changed.id);
                continue;
            };
            let translatable: Vec<&FieldChange> = changed
                .field_changes
                .iter()
                .filter(|change| change.needs_translation)
                .collect();
            if translatable.is_empty() {
                continue;
            }
            let Some(child_source) = scan.entries.get(&changed.id) else {
                continue;
            };
            match self
                .patch_child(child_source, child_target_id, &translatable, &context)
                .await
            {
                Ok(patched) => {
                    fields_updated
                        .extend(patched.into_iter().map(|f| format!("{}.{}", changed.id, f)));
                }
                Err(e) => {
                    tracing::warn!("failed to patch clone of '{}': {}", changed.id, e);
                }
            }
        }

        // Re-project link fields of parents whose reference lists moved.
        let affected = affected_parents(&diff, &stored_tree, &scan);
        for (parent_id, field) in &affected {
            if parent_id == source_id {
                continue; // the root is patched in the final write below
            }
            match self
                .rewrite_parent_field(parent_id, field, &scan, &clone_mapping)
                .await
            {
                Ok(true) => fields_updated.push(format!("{}.{}", parent_id, field)),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        "failed to rewrite '{}.{}' on the target side: {}",
                        parent_id,
                        field,
                        e
                    );
                }
            }
        }

        // One write for the root: translatable changes plus link
        // re-projection.
        cancel.ensure_active()?;
        let mut new_target_fields = target.fields.clone();
        let mut root_dirty = false;

        for change in &root_changes {
            if !change.needs_translation {
                if change.change_type == FieldChangeKind::Deleted {
                    root_dirty |= new_target_fields.remove(&change.field_name).is_some();
                }
                continue;
            }
            let Some(source_value) = source.fields.get(&change.field_name) else {
                continue;
            };
            let as_markdown = self
                .policy
                .is_markdown(&source.content_type, &change.field_name);
            let mut translated = LocalizedValue::new();
            for (locale, value) in source_value {
                let mut value = self.translate_value(value, &context, as_markdown).await;
                if self.policy.is_prefixed(&change.field_name) {
                    if let FieldValue::Text(s) = &mut value {
                        if !s.is_empty() && !s.starts_with(&self.policy.clone_prefix) {
                            *s = self.policy.apply_prefix(s);
                        }
                    }
                }
                translated.insert(locale.clone(), value);
            }
            new_target_fields.insert(change.field_name.clone(), translated);
            fields_updated.push(change.field_name.clone());
            root_dirty = true;
        }

        for (parent_id, field) in &affected {
            if parent_id != source_id {
                continue;
            }
            if let Some(source_value) = source.fields.get(field) {
                let rewritten: LocalizedValue = source_value
                    .iter()
                    .map(|(locale, value)| {
                        (locale.clone(), reproject_links(value, &clone_mapping))
                    })
                    .collect();
                new_target_fields.insert(field.clone(), rewritten);
                fields_updated.push(field.clone());
                root_dirty = true;
            }
        }

        let new_version = if root_dirty {
            let mut patched = target.clone();
            patched.fields = new_target_fields;
            // A failure here aborts the whole update: the relationship
            // and snapshot stay at their previous state.
            let updated = self.api.update_entry(&patched).await?;
            Some(updated.version)
        } else {
            None
        };

        // Only now does the new state become authoritative.
        let mut updated_relationship = relationship;
        updated_relationship.metadata.last_translated_version = source.version;
        updated_relationship.metadata.last_updated = Utc::now();
        updated_relationship.field_hashes =
            hash::hash_translatable_fields(&source, &schema, &self.policy);
        updated_relationship.clone_mapping = clone_mapping;
        updated_relationship.deep_reference_map = None;
        self.store.store(&updated_relationship).await?;
        self.store.store_deep_map(&scan.tree).await?;

        let message = if fields_updated.is_empty() && new_outcomes.is_empty() {
            "no translatable changes".to_string()
        } else {
            format!(
                "updated {} field(s), cloned {} new reference(s)",
                fields_updated.len(),
                new_outcomes.iter().filter(|o| o.success).count()
            )
        };

        Ok(UpdateReport {
            success: true,
            fields_updated,
            backup_id: Some(backup.backup_id),
            new_version,
            new_references: new_outcomes,
            message,
        })
    }

    /// Translate and write changed fields on one cloned child.
    async fn patch_child(
        &self,
        child_source: &Entry,
        child_target_id: &str,
        changes: &[&FieldChange],
        context: &TranslationContext,
    ) -> MirrorResult<Vec<String>> {
        let mut child_target = self.api.entry(child_target_id).await?;
        let mut patched = Vec::new();

        for change in changes {
            let Some(source_value) = child_source.fields.get(&change.field_name) else {
                continue;
            };
            let as_markdown = self
                .policy
                .is_markdown(&child_source.content_type, &change.field_name);
            let mut translated = LocalizedValue::new();
            for (locale, value) in source_value {
                translated.insert(
                    locale.clone(),
                    self.translate_value(value, context, as_markdown).await,
                );
            }
            child_target.fields.insert(change.field_name.clone(), translated);
            patched.push(change.field_name.clone());
        }

        if !patched.is_empty() {
            self.api.update_entry(&child_target).await?;
        }
        Ok(patched)
    }

    /// Re-project one nested parent's link field through the clone map.
    /// Returns whether the target side was actually written.
    async fn rewrite_parent_field(
        &self,
        parent_source_id: &str,
        field: &str,
        scan: &TreeScan,
        clone_mapping: &CloneMap,
    ) -> MirrorResult<bool> {
        let Some(parent_target_id) = clone_mapping.target_entry(parent_source_id) else {
            return Ok(false);
        };
        let parent_source = match scan.entries.get(parent_source_id) {
            Some(entry) => entry.clone(),
            None => self.api.entry(parent_source_id).await?,
        };
        let Some(source_value) = parent_source.fields.get(field) else {
            return Ok(false);
        };

        let mut parent_target = self.api.entry(parent_target_id).await?;
        let rewritten: LocalizedValue = source_value
            .iter()
            .map(|(locale, value)| (locale.clone(), reproject_links(value, clone_mapping)))
            .collect();
        parent_target.fields.insert(field.to_string(), rewritten);
        self.api.update_entry(&parent_target).await?;
        Ok(true)
    }

    /// Field-level diff of the root entry against the stored hashes.
    fn root_field_changes(
        &self,
        source: &Entry,
        schema: &crate::types::ContentTypeSchema,
        relationship: &Relationship,
    ) -> Vec<FieldChange> {
        let current = hash::hash_translatable_fields(source, schema, &self.policy);
        let mut changes = Vec::new();

        for def in &schema.fields {
            let Some(current_hash) = current.get(&def.id) else {
                continue;
            };
            let change_type = match relationship.field_hashes.get(&def.id) {
                None => FieldChangeKind::Added,
                Some(stored) if stored != current_hash => FieldChangeKind::Modified,
                Some(_) => continue,
            };
            changes.push(FieldChange {
                field_name: def.id.clone(),
                change_type,
                new_value: source
                    .field_value(&def.id, &self.config.storage_locale)
                    .cloned(),
                is_translatable: true,
                needs_translation: true,
            });
        }

        for field in relationship.field_hashes.keys() {
            if !current.contains_key(field) {
                changes.push(FieldChange {
                    field_name: field.clone(),
                    change_type: FieldChangeKind::Deleted,
                    new_value: None,
                    is_translatable: true,
                    needs_translation: false,
                });
            }
        }
        changes
    }

    // ========================================================================
    // Status check
    // ========================================================================

    /// Read-only change detection for a pair.
    ///
    /// Runs the detection half of an update without writing to the CMS.
    /// On the no-change path the tree snapshot is still refreshed so that
    /// pure removals do not linger in the stored state.
    pub async fn status(&self, source_id: &str, target_id: &str) -> MirrorResult<StatusReport> {
        let Some(relationship) = self.store.get(source_id, target_id).await? else {
            return Ok(StatusReport {
                has_relationship: false,
                up_to_date: false,
                root_changes: Vec::new(),
                reference_diff: Default::default(),
                conflicts: Vec::new(),
                metadata: None,
            });
        };

        let source = self.api.entry(source_id).await?;
        let scan = self.tracker.scan(&source, target_id).await?;
        let stored_tree = match &relationship.deep_reference_map {
            Some(tree) => tree.clone(),
            None => match self.store.get_deep_map(source_id, target_id).await? {
                Some(tree) => tree,
                None => empty_tree(&scan),
            },
        };
        let diff = self.tracker.diff(&stored_tree, &scan).await?;

        let schema = self.tracker.schema(&source.content_type).await?;
        let root_changes = self.root_field_changes(&source, &schema, &relationship);

        let up_to_date = root_changes.is_empty() && diff.is_empty();
        if up_to_date {
            self.store.store_deep_map(&scan.tree).await?;
        }

        Ok(StatusReport {
            has_relationship: true,
            up_to_date,
            root_changes,
            reference_diff: diff,
            // Conflict detection is a stub; see DESIGN notes.
            conflicts: Vec::new(),
            metadata: Some(relationship.metadata),
        })
    }

    /// Rebuild and persist the deep reference snapshot without
    /// translating anything.
    pub async fn rebuild_deep_refs(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> MirrorResult<ReferenceTree> {
        let source = self.api.entry(source_id).await?;
        let scan = self.tracker.scan(&source, target_id).await?;
        self.store.store_deep_map(&scan.tree).await?;
        Ok(scan.tree)
    }
}

/// A snapshot with only the root, for relationships that predate deep
/// tracking: every current reference then diffs as new.
fn empty_tree(scan: &TreeScan) -> ReferenceTree {
    let root = scan.tree.reference_tree.without_children();
    ReferenceTree {
        source_entry_id: scan.tree.source_entry_id.clone(),
        target_entry_id: scan.tree.target_entry_id.clone(),
        max_depth: scan.tree.max_depth,
        last_scanned: scan.tree.last_scanned,
        flattened_refs: BTreeMap::from([(root.id.clone(), root.clone())]),
        reference_tree: root,
    }
}

/// Rewrite entry links through the map where a target exists; everything
/// else passes through unchanged.
fn rewrite_links(value: &FieldValue, map: &CloneMap) -> FieldValue {
    match value {
        FieldValue::Link(link) if link.link_type == LinkType::Entry => {
            match map.target_entry(&link.id) {
                Some(target) => FieldValue::Link(Link::entry(target)),
                None => value.clone(),
            }
        }
        FieldValue::List(items) => {
            FieldValue::List(items.iter().map(|item| rewrite_links(item, map)).collect())
        }
        FieldValue::Object(fields) => FieldValue::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), rewrite_links(item, map)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Re-project a link list through the clone map: mapped entry links point
/// at their clones, unmapped entry links are dropped, assets pass through,
/// and order follows the source.
fn reproject_links(value: &FieldValue, map: &CloneMap) -> FieldValue {
    match value {
        FieldValue::Link(link) => match map.rewrite(link) {
            Some(rewritten) => FieldValue::Link(rewritten),
            None => value.clone(),
        },
        FieldValue::List(items) => FieldValue::List(
            items
                .iter()
                .filter_map(|item| match item {
                    FieldValue::Link(link) => map.rewrite(link).map(FieldValue::Link),
                    other => Some(reproject_links(other, map)),
                })
                .collect(),
        ),
        FieldValue::Object(fields) => FieldValue::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), reproject_links(item, map)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Parents whose link lists must be re-projected, in discovery order.
fn affected_parents(
    diff: &crate::types::ReferenceDiff,
    stored_tree: &ReferenceTree,
    scan: &TreeScan,
) -> Vec<(String, String)> {
    let mut parents = Vec::new();
    let mut push = |parent: Option<(String, String)>| {
        if let Some(pair) = parent {
            if !parents.contains(&pair) {
                parents.push(pair);
            }
        }
    };

    for added in &diff.added {
        push(added
            .parent_id
            .clone()
            .zip(added.parent_field.clone()));
    }
    for removed in &diff.removed {
        let parent_id = stored_tree
            .flattened_refs
            .get(&removed.id)
            .and_then(|node| node.parent_id.clone())
            // The parent may have moved in the fresh scan; prefer its
            // current position when the stored one is gone.
            .or_else(|| {
                scan.tree
                    .flattened_refs
                    .get(&removed.id)
                    .and_then(|node| node.parent_id.clone())
            });
        push(parent_id.zip(removed.parent_field.clone()));
    }
    parents
}
