/// Field classification rules and clone side-effect policies.
///
/// Everything here is pure and stateless: given a content type, a field
/// definition and the entry carrying it, the policy answers what the
/// engine should do with the field. The many policy tables (prefix,
/// empty-on-clone, copy-as-is, markdown allowlist, author re-link,
/// culture mapping) live in one immutable [`FieldPolicy`] value that is
/// passed to the engine; request-level overrides build a new value rather
/// than mutating process state.
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Entry, FieldDef};

/// What the engine does with a field, resolved once per
/// (content type, field id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Attempt to re-link each referenced author to an existing
    /// target-culture author; fall through to a normal clone on miss
    Author,
    /// Emit a typed empty value instead of the source value
    EmptyOnClone,
    /// Copy the value, processing links only; scalars pass untranslated
    CopyAsIs,
    /// Write the target locale tag
    Culture,
    /// Translate through the markdown-safe path
    Markdown,
    /// A link or list of links: recurse and rewrite
    Links,
    /// Plain translatable text
    Translatable,
    /// Anything else: copy unchanged
    Passthrough,
}

/// Bidirectional mapping between provider language codes and stored
/// locale tags.
///
/// The forward direction drives culture-field stamping on clones; the
/// inverse direction auto-detects the source language from the source
/// entry's culture field on first clone.
#[derive(Debug, Clone)]
pub struct CultureMap {
    to_locale: BTreeMap<String, String>,
    to_provider: BTreeMap<String, String>,
}

impl CultureMap {
    /// Build a map from (provider code, locale tag) pairs.
    ///
    /// When several provider codes share a locale (e.g. `EN` and `EN-GB`
    /// both map to `en-GB`), the first pair wins the inverse direction.
    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let mut to_locale = BTreeMap::new();
        let mut to_provider = BTreeMap::new();
        for (code, locale) in pairs {
            let code = code.into().to_uppercase();
            let locale = locale.into();
            to_provider
                .entry(locale.to_lowercase())
                .or_insert_with(|| code.clone());
            to_locale.insert(code, locale);
        }
        Self {
            to_locale,
            to_provider,
        }
    }

    /// The stored locale tag for a provider code (`IT` → `it-IT`).
    pub fn locale_for(&self, provider_code: &str) -> Option<&str> {
        self.to_locale
            .get(&provider_code.to_uppercase())
            .map(String::as_str)
    }

    /// The provider code for a stored locale tag (`de-DE` → `DE`).
    pub fn provider_for(&self, locale: &str) -> Option<&str> {
        self.to_provider
            .get(&locale.to_lowercase())
            .map(String::as_str)
    }
}

impl Default for CultureMap {
    fn default() -> Self {
        Self::from_pairs([
            ("DE", "de-DE"),
            ("IT", "it-IT"),
            ("EN", "en-GB"),
            ("EN-GB", "en-GB"),
            ("FR", "fr-FR"),
            ("FR-CA", "fr-CA"),
            ("ES", "es-ES"),
            ("NL", "nl-NL"),
            ("NL-BE", "nl-BE"),
            ("PT-PT", "pt-PT"),
            ("PL", "pl-PL"),
            ("SV", "sv-SE"),
            ("TR", "tr-TR"),
        ])
    }
}

/// The immutable policy value steering clone side effects and the
/// translatable predicate.
#[derive(Debug, Clone)]
pub struct FieldPolicy {
    /// Prefix prepended to selected scalar fields of a clone
    pub clone_prefix: String,
    /// Fields receiving the clone prefix
    pub prefix_fields: BTreeSet<String>,
    /// Fields emptied on clone
    pub empty_on_clone: BTreeSet<String>,
    /// Fields copied verbatim (links still rewritten)
    pub copy_as_is: BTreeSet<String>,
    /// Fields holding author links eligible for re-linking
    pub author_fields: BTreeSet<String>,
    /// Content type of author entries
    pub author_content_type: String,
    /// Author field matched against the source author (`name`)
    pub author_match_field: String,
    /// Author field holding the entry's culture (`locale`)
    pub author_locale_field: String,
    /// content type id → markdown field ids
    pub markdown_fields: BTreeMap<String, BTreeSet<String>>,
    /// Fields never translated even when they hold text
    pub non_translatable: BTreeSet<String>,
    /// Link fields the tracker does not descend into
    pub untracked_fields: BTreeSet<String>,
    /// Provider code ↔ stored locale mapping
    pub culture_map: CultureMap,
}

fn string_set<const N: usize>(items: [&str; N]) -> BTreeSet<String> {
    items.into_iter().map(String::from).collect()
}

impl Default for FieldPolicy {
    fn default() -> Self {
        let mut markdown_fields = BTreeMap::new();
        markdown_fields.insert("cmsPage".to_string(), string_set(["teaserText"]));
        markdown_fields.insert("scText".to_string(), string_set(["content"]));
        markdown_fields.insert(
            "scSuperhero".to_string(),
            string_set(["text", "bulletList"]),
        );
        markdown_fields.insert("scTeaser".to_string(), string_set(["text"]));

        Self {
            clone_prefix: "[Clone] ".to_string(),
            prefix_fields: string_set(["title"]),
            empty_on_clone: string_set(["slug", "parentPage", "productionUrl", "authors"]),
            copy_as_is: string_set([
                "domain",
                "pageType",
                "productionUrl",
                "makeModel",
                "publicationDate",
                "lastModificationDate",
                "makeIds",
                "modelIds",
                "trackingName",
            ]),
            author_fields: string_set(["authors"]),
            author_content_type: "author".to_string(),
            author_match_field: "name".to_string(),
            author_locale_field: "locale".to_string(),
            markdown_fields,
            non_translatable: string_set([
                "slug",
                "internalName",
                "culture",
                "domain",
                "pageType",
                "publicationDate",
                "lastModificationDate",
                "trackingName",
                "makeModel",
                "makeIds",
                "modelIds",
                "fieldStatus",
                "automationTags",
                "featureFlags",
            ]),
            untracked_fields: string_set([
                "parentPage",
                "authors",
                "makeModel",
                "makeIds",
                "modelIds",
                "trackingName",
                "internalName",
                "fieldStatus",
                "automationTags",
                "culture",
                "domain",
                "pageType",
            ]),
            culture_map: CultureMap::default(),
        }
    }
}

impl FieldPolicy {
    /// Resolve what the engine does with a field.
    ///
    /// Author re-linking is checked before the empty set: `authors` sits
    /// in both tables by default, and the re-link behavior is the one the
    /// clone semantics require.
    pub fn classify(&self, content_type: &str, def: &FieldDef, entry: &Entry) -> FieldKind {
        if self.author_fields.contains(&def.id) && def.is_link_shaped() {
            return FieldKind::Author;
        }
        if self.empty_on_clone.contains(&def.id) {
            return FieldKind::EmptyOnClone;
        }
        if self.copy_as_is.contains(&def.id) {
            return FieldKind::CopyAsIs;
        }
        if self.is_culture_field(&def.id) {
            return FieldKind::Culture;
        }
        if self.is_markdown(content_type, &def.id) {
            return FieldKind::Markdown;
        }
        if def.is_link_shaped() {
            return FieldKind::Links;
        }
        if self.is_translatable(entry, def) {
            return FieldKind::Translatable;
        }
        FieldKind::Passthrough
    }

    /// The translatable predicate: text-bearing, not link-shaped, not
    /// denylisted, and non-empty in some locale.
    pub fn is_translatable(&self, entry: &Entry, def: &FieldDef) -> bool {
        if def.is_link_shaped() {
            return false;
        }
        if self.non_translatable.contains(&def.id) || self.is_culture_field(&def.id) {
            return false;
        }
        entry.any_string(&def.id).is_some()
    }

    /// Whether a field names the entry's stored culture.
    pub fn is_culture_field(&self, field_id: &str) -> bool {
        field_id.to_lowercase().contains("culture")
    }

    /// Whether a field is on the markdown allowlist for a content type.
    pub fn is_markdown(&self, content_type: &str, field_id: &str) -> bool {
        self.markdown_fields
            .get(content_type)
            .map(|fields| fields.contains(field_id))
            .unwrap_or(false)
    }

    /// Whether the tracker may descend into a link field.
    pub fn is_trackable(&self, field_id: &str) -> bool {
        !self.untracked_fields.contains(field_id)
    }

    /// Whether a field receives the clone prefix.
    pub fn is_prefixed(&self, field_id: &str) -> bool {
        self.prefix_fields.contains(field_id)
    }

    /// Split the clone prefix off a text, if present.
    ///
    /// Returns `(had_prefix, remainder)`; the prefix is re-prepended
    /// byte-for-byte after translation.
    pub fn split_prefix<'a>(&self, text: &'a str) -> (bool, &'a str) {
        match text.strip_prefix(&self.clone_prefix) {
            Some(rest) => (true, rest),
            None => (false, text),
        }
    }

    /// Prepend the clone prefix.
    pub fn apply_prefix(&self, text: &str) -> String {
        format!("{}{}", self.clone_prefix, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldType, FieldValue, ItemsDef, LinkType};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn def(id: &str, field_type: FieldType) -> FieldDef {
        FieldDef {
            id: id.into(),
            field_type,
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

    fn entry_with_text(field: &str, text: &str) -> Entry {
        let mut locales = BTreeMap::new();
        locales.insert("en-US-POSIX".to_string(), FieldValue::Text(text.into()));
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), locales);
        Entry {
            id: "e1".into(),
            content_type: "cmsPage".into(),
            version: 1,
            published_version: None,
            updated_at: Utc::now(),
            fields,
        }
    }

    #[test]
    fn test_author_wins_over_empty_set() {
        let policy = FieldPolicy::default();
        let entry = entry_with_text("title", "x");
        let kind = policy.classify("cmsPage", &link_list_def("authors"), &entry);
        assert_eq!(kind, FieldKind::Author);
    }

    #[test]
    fn test_empty_on_clone_for_slug() {
        let policy = FieldPolicy::default();
        let entry = entry_with_text("slug", "startseite");
        let kind = policy.classify("cmsPage", &def("slug", FieldType::Symbol), &entry);
        assert_eq!(kind, FieldKind::EmptyOnClone);
    }

    #[test]
    fn test_copy_as_is_for_domain() {
        let policy = FieldPolicy::default();
        let entry = entry_with_text("domain", "autoscout24.de");
        let kind = policy.classify("cmsPage", &def("domain", FieldType::Symbol), &entry);
        assert_eq!(kind, FieldKind::CopyAsIs);
    }

    #[test]
    fn test_culture_field_substring_case_insensitive() {
        let policy = FieldPolicy::default();
        assert!(policy.is_culture_field("culture"));
        assert!(policy.is_culture_field("pageCulture"));
        assert!(policy.is_culture_field("CultureCode"));
        assert!(!policy.is_culture_field("title"));
    }

    #[test]
    fn test_markdown_allowlist_is_per_content_type() {
        let policy = FieldPolicy::default();
        assert!(policy.is_markdown("scText", "content"));
        assert!(policy.is_markdown("cmsPage", "teaserText"));
        assert!(!policy.is_markdown("cmsPage", "content"));
        assert!(policy.is_markdown("scSuperhero", "bulletList"));
    }

    #[test]
    fn test_translatable_requires_non_empty_text() {
        let policy = FieldPolicy::default();
        let filled = entry_with_text("title", "Willkommen");
        let blank = entry_with_text("title", "   ");
        let title = def("title", FieldType::Symbol);
        assert!(policy.is_translatable(&filled, &title));
        assert!(!policy.is_translatable(&blank, &title));
    }

    #[test]
    fn test_translatable_rejects_denylist_and_links() {
        let policy = FieldPolicy::default();
        let entry = entry_with_text("internalName", "DE Startseite");
        assert!(!policy.is_translatable(&entry, &def("internalName", FieldType::Symbol)));
        assert!(!policy.is_translatable(&entry, &link_list_def("elements")));
    }

    #[test]
    fn test_tracker_denylist() {
        let policy = FieldPolicy::default();
        assert!(!policy.is_trackable("parentPage"));
        assert!(!policy.is_trackable("authors"));
        assert!(policy.is_trackable("elements"));
    }

    #[test]
    fn test_prefix_round_trip() {
        let policy = FieldPolicy::default();
        let (had, rest) = policy.split_prefix("[Clone] Willkommen");
        assert!(had);
        assert_eq!(rest, "Willkommen");
        assert_eq!(policy.apply_prefix(rest), "[Clone] Willkommen");

        let (had, rest) = policy.split_prefix("Willkommen");
        assert!(!had);
        assert_eq!(rest, "Willkommen");
    }

    #[test]
    fn test_culture_map_round_trip() {
        let map = CultureMap::default();
        assert_eq!(map.locale_for("it"), Some("it-IT"));
        assert_eq!(map.locale_for("EN"), Some("en-GB"));
        assert_eq!(map.provider_for("de-DE"), Some("DE"));
        assert_eq!(map.provider_for("nl-BE"), Some("NL-BE"));
        assert_eq!(map.locale_for("XX"), None);
    }
}
