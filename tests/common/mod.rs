//! Shared fixtures for the integration suites: an in-memory CMS seeded
//! with the content model the engine targets, plus deterministic
//! translator doubles.
#![allow(dead_code)]

use async_trait::async_trait;
use content_mirror::{
    CloneEngine, CmsStore, CompositeStore, ContentTypeSchema, EngineConfig, Entry, FieldDef,
    FieldPolicy, FieldType, FieldValue, FileStore, Link, LinkType, LocalizedValue, ManagementApi,
    MemoryCms, MirrorResult, TranslateOptions, TranslationContext, Translator,
};
use content_mirror::translator::{LanguageInfo, TranslatorUsage};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const LOCALE: &str = "en-US-POSIX";

// ============================================================================
// Entry and schema builders
// ============================================================================

pub fn localized(value: FieldValue) -> LocalizedValue {
    let mut locales = LocalizedValue::new();
    locales.insert(LOCALE.to_string(), value);
    locales
}

pub fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

pub fn entry_links(ids: &[&str]) -> FieldValue {
    FieldValue::List(ids.iter().map(|id| FieldValue::Link(Link::entry(*id))).collect())
}

pub fn asset_link(id: &str) -> FieldValue {
    FieldValue::Link(Link::asset(id))
}

pub fn make_entry(id: &str, content_type: &str, version: u64, fields: Vec<(&str, FieldValue)>) -> Entry {
    Entry {
        id: id.to_string(),
        content_type: content_type.to_string(),
        version,
        published_version: None,
        updated_at: chrono::Utc::now(),
        fields: fields
            .into_iter()
            .map(|(field, value)| (field.to_string(), localized(value)))
            .collect(),
    }
}

fn text_def(id: &str) -> FieldDef {
    FieldDef {
        id: id.to_string(),
        field_type: FieldType::Symbol,
        required: false,
        link_type: None,
        items: None,
        validations: Vec::new(),
    }
}

fn long_text_def(id: &str) -> FieldDef {
    FieldDef {
        id: id.to_string(),
        field_type: FieldType::Text,
        required: false,
        link_type: None,
        items: None,
        validations: Vec::new(),
    }
}

fn link_list_def(id: &str) -> FieldDef {
    FieldDef {
        id: id.to_string(),
        field_type: FieldType::Array,
        required: false,
        link_type: None,
        items: Some(content_mirror::types::ItemsDef {
            item_type: FieldType::Link,
            link_type: Some(LinkType::Entry),
        }),
        validations: Vec::new(),
    }
}

pub fn page_schema() -> ContentTypeSchema {
    ContentTypeSchema {
        id: "cmsPage".to_string(),
        fields: vec![
            text_def("title"),
            long_text_def("teaserText"),
            text_def("culture"),
            text_def("slug"),
            link_list_def("authors"),
            link_list_def("elements"),
        ],
    }
}

pub fn sc_text_schema() -> ContentTypeSchema {
    ContentTypeSchema {
        id: "scText".to_string(),
        fields: vec![long_text_def("content"), link_list_def("elements")],
    }
}

pub fn author_schema() -> ContentTypeSchema {
    ContentTypeSchema {
        id: "author".to_string(),
        fields: vec![text_def("name"), text_def("locale")],
    }
}

pub fn seed_schemas(cms: &MemoryCms) {
    cms.put_content_type(page_schema());
    cms.put_content_type(sc_text_schema());
    cms.put_content_type(author_schema());
}

/// The S1 content graph: a German page with a markdown teaser, one text
/// element and an author that already has an Italian counterpart.
pub fn seed_german_page(cms: &MemoryCms) {
    seed_schemas(cms);
    cms.put_entry(make_entry(
        "A1",
        "author",
        1,
        vec![("name", text("Anna")), ("locale", text("de-DE"))],
    ));
    cms.put_entry(make_entry(
        "A2",
        "author",
        1,
        vec![("name", text("Anna")), ("locale", text("it-IT"))],
    ));
    cms.put_entry(make_entry(
        "E1",
        "scText",
        1,
        vec![("content", text("Mehr lesen"))],
    ));
    cms.put_entry(make_entry(
        "X",
        "cmsPage",
        3,
        vec![
            ("title", text("Willkommen")),
            ("teaserText", text("## Hallo\n\n![Bild](https://cdn/a.jpg)")),
            ("culture", text("de-DE")),
            ("slug", text("willkommen")),
            ("authors", entry_links(&["A1"])),
            ("elements", entry_links(&["E1"])),
        ],
    ));
}

// ============================================================================
// Translator doubles
// ============================================================================

/// Deterministic translator: `text` becomes `[<TARGET>] text` and every
/// call is recorded.
#[derive(Default)]
pub struct TaggingTranslator {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate(
        &self,
        text: &str,
        context: &TranslationContext,
        _options: TranslateOptions,
    ) -> MirrorResult<String> {
        self.calls.lock().unwrap().push(text.to_string());
        Ok(format!("[{}] {}", context.target_language, text))
    }

    async fn usage(&self) -> MirrorResult<TranslatorUsage> {
        Ok(TranslatorUsage {
            character_count: 0,
            character_limit: 500_000,
        })
    }

    async fn source_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }

    async fn target_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }
}

impl TaggingTranslator {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// A translator whose every call fails, for outage scenarios.
pub struct FailingTranslator;

#[async_trait]
impl Translator for FailingTranslator {
    async fn translate(
        &self,
        _text: &str,
        _context: &TranslationContext,
        _options: TranslateOptions,
    ) -> MirrorResult<String> {
        Err(content_mirror::MirrorError::Translator {
            message: "provider unavailable".to_string(),
        })
    }

    async fn usage(&self) -> MirrorResult<TranslatorUsage> {
        Err(content_mirror::MirrorError::Translator {
            message: "provider unavailable".to_string(),
        })
    }

    async fn source_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }

    async fn target_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// CMS doubles
// ============================================================================

/// A management API where every call fails, for fallback scenarios.
pub struct UnreachableCms;

#[async_trait]
impl ManagementApi for UnreachableCms {
    async fn entry(&self, _id: &str) -> MirrorResult<Entry> {
        Err(unreachable_error())
    }

    async fn content_type(&self, _id: &str) -> MirrorResult<ContentTypeSchema> {
        Err(unreachable_error())
    }

    async fn entries(&self, _query: &content_mirror::EntryQuery) -> MirrorResult<Vec<Entry>> {
        Err(unreachable_error())
    }

    async fn create_entry(
        &self,
        _content_type: &str,
        _fields: &BTreeMap<String, LocalizedValue>,
    ) -> MirrorResult<Entry> {
        Err(unreachable_error())
    }

    async fn update_entry(&self, _entry: &Entry) -> MirrorResult<Entry> {
        Err(unreachable_error())
    }

    async fn delete_entry(&self, _id: &str) -> MirrorResult<()> {
        Err(unreachable_error())
    }
}

fn unreachable_error() -> content_mirror::MirrorError {
    content_mirror::MirrorError::Cms {
        status: None,
        message: "connection refused".to_string(),
    }
}

// ============================================================================
// Engine assembly
// ============================================================================

pub fn build_engine(
    cms: Arc<MemoryCms>,
    translator: Arc<dyn Translator>,
    tracking_dir: &Path,
) -> CloneEngine {
    let config = EngineConfig::default();
    let store = Arc::new(CompositeStore::new(
        CmsStore::new(
            cms.clone(),
            CmsStore::DEFAULT_CONTENT_TYPE,
            config.storage_locale.clone(),
        ),
        FileStore::new(tracking_dir),
    ));
    CloneEngine::new(
        cms,
        translator,
        store,
        Arc::new(FieldPolicy::default()),
        config,
    )
}
