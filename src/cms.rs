/// CMS management API boundary.
///
/// The engine, tracker and store all consume the CMS through the
/// [`ManagementApi`] trait. Two implementations live here:
///
/// - [`HttpCms`] - the real management API over HTTPS, scoped to one
///   space/environment pair, with per-call timeouts and bounded retries
///   for idempotent reads
/// - [`MemoryCms`] - an in-memory backend used by the test suite and for
///   local development without credentials
///
/// Entry creation is never retried: a duplicate draft is worse than a
/// surfaced error.
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{MirrorError, MirrorResult};
use crate::types::{
    ContentTypeSchema, Entry, FieldDef, FieldType, FieldValue, ItemsDef, LinkType, LocalizedValue,
    Validation,
};

/// Per-call timeout for management API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for idempotent reads.
const MAX_READ_ATTEMPTS: u32 = 3;

/// A filtered entry listing request.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    /// Restrict to one content type
    pub content_type: Option<String>,
    /// Equality filters on field values under a locale
    pub field_equals: Vec<FieldFilter>,
    /// Maximum number of entries to return
    pub limit: Option<usize>,
}

/// One `field == value` filter under a specific locale.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    /// Field id
    pub field: String,
    /// Locale the value is stored under
    pub locale: String,
    /// Expected string value
    pub value: String,
}

impl EntryQuery {
    /// Query all entries of a content type.
    pub fn of_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    /// Add an equality filter.
    pub fn field_equals(
        mut self,
        field: impl Into<String>,
        locale: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.field_equals.push(FieldFilter {
            field: field.into(),
            locale: locale.into(),
            value: value.into(),
        });
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The operations this crate needs from the CMS management API.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Fetch one entry by id.
    async fn entry(&self, id: &str) -> MirrorResult<Entry>;

    /// Fetch a content type schema by id.
    async fn content_type(&self, id: &str) -> MirrorResult<ContentTypeSchema>;

    /// List entries matching a query.
    async fn entries(&self, query: &EntryQuery) -> MirrorResult<Vec<Entry>>;

    /// Create a draft entry of the given content type.
    async fn create_entry(
        &self,
        content_type: &str,
        fields: &BTreeMap<String, LocalizedValue>,
    ) -> MirrorResult<Entry>;

    /// Update an entry's fields; returns the entry at its new version.
    async fn update_entry(&self, entry: &Entry) -> MirrorResult<Entry>;

    /// Delete an entry.
    async fn delete_entry(&self, id: &str) -> MirrorResult<()>;
}

// ============================================================================
// Wire format conversion
// ============================================================================

/// Parse a management-API entry payload into an [`Entry`].
pub fn entry_from_json(raw: &JsonValue) -> MirrorResult<Entry> {
    let sys = raw
        .get("sys")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| MirrorError::Cms {
            status: None,
            message: "entry payload missing sys".to_string(),
        })?;

    let id = sys
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| MirrorError::Cms {
            status: None,
            message: "entry payload missing sys.id".to_string(),
        })?
        .to_string();

    let version = sys.get("version").and_then(JsonValue::as_u64).unwrap_or(1);
    let published_version = sys.get("publishedVersion").and_then(JsonValue::as_u64);

    let content_type = sys
        .get("contentType")
        .and_then(|ct| ct.pointer("/sys/id"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| MirrorError::Cms {
            status: None,
            message: format!("entry '{}' missing contentType", id),
        })?
        .to_string();

    let updated_at = sys
        .get("updatedAt")
        .and_then(JsonValue::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    let mut fields = BTreeMap::new();
    if let Some(raw_fields) = raw.get("fields").and_then(JsonValue::as_object) {
        for (field_id, locales) in raw_fields {
            let Some(locales) = locales.as_object() else {
                continue;
            };
            let localized: LocalizedValue = locales
                .iter()
                .map(|(locale, value)| (locale.clone(), FieldValue::from_json(value)))
                .collect();
            fields.insert(field_id.clone(), localized);
        }
    }

    Ok(Entry {
        id,
        content_type,
        version,
        published_version,
        updated_at,
        fields,
    })
}

/// Serialize entry fields back into the management-API `fields` shape.
pub fn fields_to_json(fields: &BTreeMap<String, LocalizedValue>) -> JsonValue {
    JsonValue::Object(
        fields
            .iter()
            .map(|(field_id, locales)| {
                let localized = JsonValue::Object(
                    locales
                        .iter()
                        .map(|(locale, value)| (locale.clone(), value.to_json()))
                        .collect(),
                );
                (field_id.clone(), localized)
            })
            .collect(),
    )
}

/// Parse a management-API content type payload into a schema.
pub fn schema_from_json(raw: &JsonValue) -> MirrorResult<ContentTypeSchema> {
    let id = raw
        .pointer("/sys/id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| MirrorError::Cms {
            status: None,
            message: "content type payload missing sys.id".to_string(),
        })?
        .to_string();

    let mut fields = Vec::new();
    if let Some(raw_fields) = raw.get("fields").and_then(JsonValue::as_array) {
        for field in raw_fields {
            let Some(field_id) = field.get("id").and_then(JsonValue::as_str) else {
                continue;
            };
            let field_type = field
                .get("type")
                .and_then(JsonValue::as_str)
                .map(FieldType::parse)
                .unwrap_or(FieldType::Object);

            let link_type = field
                .get("linkType")
                .and_then(JsonValue::as_str)
                .and_then(parse_link_type);

            let items = field.get("items").and_then(JsonValue::as_object).map(|items| ItemsDef {
                item_type: items
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .map(FieldType::parse)
                    .unwrap_or(FieldType::Object),
                link_type: items
                    .get("linkType")
                    .and_then(JsonValue::as_str)
                    .and_then(parse_link_type),
            });

            let validations = field
                .get("validations")
                .and_then(JsonValue::as_array)
                .map(|rules| {
                    rules
                        .iter()
                        .map(|rule| Validation {
                            allowed: rule
                                .get("in")
                                .and_then(JsonValue::as_array)
                                .map(|values| values.to_vec()),
                        })
                        .collect()
                })
                .unwrap_or_default();

            fields.push(FieldDef {
                id: field_id.to_string(),
                field_type,
                required: field.get("required").and_then(JsonValue::as_bool).unwrap_or(false),
                link_type,
                items,
                validations,
            });
        }
    }

    Ok(ContentTypeSchema { id, fields })
}

fn parse_link_type(name: &str) -> Option<LinkType> {
    match name {
        "Entry" => Some(LinkType::Entry),
        "Asset" => Some(LinkType::Asset),
        _ => None,
    }
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Management API client scoped to one space/environment.
pub struct HttpCms {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpCms {
    /// Create a client for a space/environment pair.
    pub fn new(token: impl Into<String>, space_id: &str, environment_id: &str) -> MirrorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MirrorError::Cms {
                status: None,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            base_url: format!(
                "https://api.contentful.com/spaces/{}/environments/{}",
                space_id, environment_id
            ),
            token: token.into(),
            client,
        })
    }

    /// Issue a GET with bounded retries on transient failures.
    async fn get_json(&self, path: &str, params: &[(String, String)]) -> MirrorResult<JsonValue> {
        let mut last_err = None;
        for attempt in 1..=MAX_READ_ATTEMPTS {
            match self.get_json_once(path, params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < MAX_READ_ATTEMPTS => {
                    tracing::debug!("CMS read failed (attempt {}): {}", attempt, e);
                    last_err = Some(e);
                    // Exponential backoff before retry
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt - 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| MirrorError::Cms {
            status: None,
            message: "read retries exhausted".to_string(),
        }))
    }

    async fn get_json_once(&self, path: &str, params: &[(String, String)]) -> MirrorResult<JsonValue> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        json_body(response).await
    }
}

fn transport_error(e: reqwest::Error) -> MirrorError {
    MirrorError::Cms {
        status: None,
        message: e.to_string(),
    }
}

async fn json_body(response: reqwest::Response) -> MirrorResult<JsonValue> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(MirrorError::Cms {
            status: Some(status.as_u16()),
            message,
        });
    }
    response.json().await.map_err(transport_error)
}

#[async_trait]
impl ManagementApi for HttpCms {
    async fn entry(&self, id: &str) -> MirrorResult<Entry> {
        match self.get_json(&format!("/entries/{}", id), &[]).await {
            Ok(raw) => entry_from_json(&raw),
            Err(MirrorError::Cms {
                status: Some(404), ..
            }) => Err(MirrorError::EntryNotFound { id: id.to_string() }),
            Err(e) => Err(e),
        }
    }

    async fn content_type(&self, id: &str) -> MirrorResult<ContentTypeSchema> {
        let raw = self.get_json(&format!("/content_types/{}", id), &[]).await?;
        schema_from_json(&raw)
    }

    async fn entries(&self, query: &EntryQuery) -> MirrorResult<Vec<Entry>> {
        let mut params = Vec::new();
        if let Some(content_type) = &query.content_type {
            params.push(("content_type".to_string(), content_type.clone()));
        }
        for filter in &query.field_equals {
            params.push((
                format!("fields.{}.{}", filter.field, filter.locale),
                filter.value.clone(),
            ));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let raw = self.get_json("/entries", &params).await?;
        let items = raw
            .get("items")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        items.iter().map(entry_from_json).collect()
    }

    async fn create_entry(
        &self,
        content_type: &str,
        fields: &BTreeMap<String, LocalizedValue>,
    ) -> MirrorResult<Entry> {
        let url = format!("{}/entries", self.base_url);
        let body = serde_json::json!({ "fields": fields_to_json(fields) });

        // Creation is not retried: a duplicate draft cannot be told apart
        // from the intended one afterwards.
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("X-Contentful-Content-Type", content_type)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let raw = json_body(response).await?;
        entry_from_json(&raw)
    }

    async fn update_entry(&self, entry: &Entry) -> MirrorResult<Entry> {
        let url = format!("{}/entries/{}", self.base_url, entry.id);
        let body = serde_json::json!({ "fields": fields_to_json(&entry.fields) });

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("X-Contentful-Version", entry.version)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let raw = json_body(response).await?;
        entry_from_json(&raw)
    }

    async fn delete_entry(&self, id: &str) -> MirrorResult<()> {
        let current = self.entry(id).await?;
        let url = format!("{}/entries/{}", self.base_url, id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .header("X-Contentful-Version", current.version)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(MirrorError::Cms {
                status: Some(status.as_u16()),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory CMS backend.
///
/// Used by the test suite and for credential-less local development. The
/// version counter behaves like the real management API: every update
/// bumps it by one.
#[derive(Debug, Default)]
pub struct MemoryCms {
    entries: DashMap<String, Entry>,
    content_types: DashMap<String, ContentTypeSchema>,
}

impl MemoryCms {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a content type schema.
    pub fn put_content_type(&self, schema: ContentTypeSchema) {
        self.content_types.insert(schema.id.clone(), schema);
    }

    /// Seed an entry directly, keeping its id and version.
    pub fn put_entry(&self, entry: Entry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ManagementApi for MemoryCms {
    async fn entry(&self, id: &str) -> MirrorResult<Entry> {
        self.entries
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| MirrorError::EntryNotFound { id: id.to_string() })
    }

    async fn content_type(&self, id: &str) -> MirrorResult<ContentTypeSchema> {
        self.content_types
            .get(id)
            .map(|ct| ct.clone())
            .ok_or_else(|| MirrorError::Cms {
                status: Some(404),
                message: format!("content type '{}' not found", id),
            })
    }

    async fn entries(&self, query: &EntryQuery) -> MirrorResult<Vec<Entry>> {
        let mut matches: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| {
                if let Some(content_type) = &query.content_type {
                    if &e.content_type != content_type {
                        return false;
                    }
                }
                query.field_equals.iter().all(|filter| {
                    e.field_value(&filter.field, &filter.locale)
                        .and_then(FieldValue::as_text)
                        .map(|text| text == filter.value)
                        .unwrap_or(false)
                })
            })
            .map(|e| e.clone())
            .collect();

        // DashMap iteration order is arbitrary; sort for determinism.
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn create_entry(
        &self,
        content_type: &str,
        fields: &BTreeMap<String, LocalizedValue>,
    ) -> MirrorResult<Entry> {
        let entry = Entry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            content_type: content_type.to_string(),
            version: 1,
            published_version: None,
            updated_at: chrono::Utc::now(),
            fields: fields.clone(),
        };
        self.entries.insert(entry.id.clone(), entry.clone());
        Ok(entry)
    }

    async fn update_entry(&self, entry: &Entry) -> MirrorResult<Entry> {
        let mut stored = self
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| MirrorError::EntryNotFound {
                id: entry.id.clone(),
            })?;
        stored.fields = entry.fields.clone();
        stored.version += 1;
        stored.updated_at = chrono::Utc::now();
        Ok(stored.clone())
    }

    async fn delete_entry(&self, id: &str) -> MirrorResult<()> {
        self.entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MirrorError::EntryNotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_cms_create_and_fetch() {
        let cms = MemoryCms::new();
        let mut fields = BTreeMap::new();
        let mut title = LocalizedValue::new();
        title.insert("en-US-POSIX".to_string(), FieldValue::Text("Hallo".into()));
        fields.insert("title".to_string(), title);

        let created = cms.create_entry("cmsPage", &fields).await.unwrap();
        assert_eq!(created.version, 1);

        let fetched = cms.entry(&created.id).await.unwrap();
        assert_eq!(fetched.any_string("title"), Some("Hallo"));
    }

    #[tokio::test]
    async fn test_memory_cms_update_bumps_version() {
        let cms = MemoryCms::new();
        let created = cms.create_entry("cmsPage", &BTreeMap::new()).await.unwrap();

        let mut edited = created.clone();
        let mut title = LocalizedValue::new();
        title.insert("en-US-POSIX".to_string(), FieldValue::Text("Neu".into()));
        edited.fields.insert("title".to_string(), title);

        let updated = cms.update_entry(&edited).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.any_string("title"), Some("Neu"));
    }

    #[tokio::test]
    async fn test_memory_cms_query_by_field() {
        let cms = MemoryCms::new();
        for (name, locale) in [("Anna", "de-DE"), ("Anna", "it-IT"), ("Ben", "it-IT")] {
            let mut fields = BTreeMap::new();
            let mut name_value = LocalizedValue::new();
            name_value.insert("en-US-POSIX".into(), FieldValue::Text(name.into()));
            fields.insert("name".to_string(), name_value);
            let mut locale_value = LocalizedValue::new();
            locale_value.insert("en-US-POSIX".into(), FieldValue::Text(locale.into()));
            fields.insert("locale".to_string(), locale_value);
            cms.create_entry("author", &fields).await.unwrap();
        }

        let query = EntryQuery::of_type("author")
            .field_equals("name", "en-US-POSIX", "Anna")
            .field_equals("locale", "en-US-POSIX", "it-IT");
        let found = cms.entries(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].any_string("name"), Some("Anna"));
    }

    #[test]
    fn test_entry_from_management_json() {
        let raw = json!({
            "sys": {
                "id": "X",
                "version": 3,
                "publishedVersion": 2,
                "contentType": { "sys": { "id": "cmsPage" } },
                "updatedAt": "2026-05-01T10:00:00Z"
            },
            "fields": {
                "title": { "en-US-POSIX": "Willkommen" },
                "elements": {
                    "en-US-POSIX": [
                        { "sys": { "type": "Link", "linkType": "Entry", "id": "E1" } }
                    ]
                }
            }
        });

        let entry = entry_from_json(&raw).unwrap();
        assert_eq!(entry.id, "X");
        assert_eq!(entry.version, 3);
        assert_eq!(entry.published_version, Some(2));
        assert_eq!(entry.content_type, "cmsPage");
        assert_eq!(entry.any_string("title"), Some("Willkommen"));

        let elements = entry.field_value("elements", "en-US-POSIX").unwrap();
        assert_eq!(elements.links()[0].id, "E1");
    }

    #[test]
    fn test_schema_from_management_json() {
        let raw = json!({
            "sys": { "id": "cmsPage" },
            "fields": [
                { "id": "title", "type": "Symbol", "required": true },
                {
                    "id": "pageType", "type": "Symbol",
                    "validations": [ { "in": ["editorial", "landing"] } ]
                },
                {
                    "id": "elements", "type": "Array",
                    "items": { "type": "Link", "linkType": "Entry" }
                }
            ]
        });

        let schema = schema_from_json(&raw).unwrap();
        assert_eq!(schema.id, "cmsPage");
        assert!(schema.field("title").unwrap().required);
        assert_eq!(
            schema.field("pageType").unwrap().first_allowed(),
            Some(&json!("editorial"))
        );
        assert!(schema.field("elements").unwrap().is_link_shaped());
    }

    #[test]
    fn test_fields_round_trip_through_wire_shape() {
        let mut fields = BTreeMap::new();
        let mut value = LocalizedValue::new();
        value.insert(
            "en-US-POSIX".to_string(),
            FieldValue::List(vec![FieldValue::Link(crate::types::Link::entry("E1"))]),
        );
        fields.insert("elements".to_string(), value);

        let wire = json!({
            "sys": {
                "id": "e", "version": 1,
                "contentType": { "sys": { "id": "cmsPage" } },
                "updatedAt": "2026-05-01T10:00:00Z"
            },
            "fields": fields_to_json(&fields)
        });
        let parsed = entry_from_json(&wire).unwrap();
        assert_eq!(parsed.fields, fields);
    }
}
