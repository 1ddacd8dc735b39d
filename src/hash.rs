/// Content hashing for change detection.
///
/// This module is the bridge between entry payloads and the tracker's
/// change detection. It provides:
///
/// - Canonical serialization of field values (deterministic byte form)
/// - sha256 content hashes over an entry's translatable fields
/// - Per-field hashes for field-level diffs
///
/// Canonicalization sorts object keys, so two entries with the same
/// translatable content always hash identically regardless of field
/// insertion order.
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::policy::FieldPolicy;
use crate::types::{ContentTypeSchema, Entry, FieldHashes, LocalizedValue};

/// Hash a canonical byte form with sha256, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical serialization of a locale-keyed value.
///
/// Locale keys and `FieldValue::Object` keys live in `BTreeMap`s, so
/// `serde_json` already emits them sorted; no custom writer is needed.
fn canonical_localized(value: &LocalizedValue) -> String {
    serde_json::to_string(
        &value
            .iter()
            .map(|(locale, v)| (locale.clone(), v.to_json()))
            .collect::<BTreeMap<_, _>>(),
    )
    .unwrap_or_default()
}

/// Hash one locale-keyed field value.
pub fn hash_field(value: &LocalizedValue) -> String {
    sha256_hex(canonical_localized(value).as_bytes())
}

/// Per-field hashes over the fields the classifier marks translatable.
///
/// Only translatable fields participate: link rewrites, culture stamps and
/// copy-as-is fields must not trip change detection.
pub fn hash_translatable_fields(
    entry: &Entry,
    schema: &ContentTypeSchema,
    policy: &FieldPolicy,
) -> FieldHashes {
    let mut hashes = FieldHashes::new();
    for def in &schema.fields {
        let Some(value) = entry.fields.get(&def.id) else {
            continue;
        };
        if policy.is_translatable(entry, def) {
            hashes.insert(def.id.clone(), hash_field(value));
        }
    }
    hashes
}

/// Whole-entry content hash over translatable fields only.
///
/// Fields are folded in schema order, each as `id=<field hash>`, so the
/// node hash is stable across runs and independent of non-translatable
/// churn (link rewrites, publish state, tracking fields).
pub fn content_hash(entry: &Entry, schema: &ContentTypeSchema, policy: &FieldPolicy) -> String {
    let mut canonical = String::new();
    for def in &schema.fields {
        let Some(value) = entry.fields.get(&def.id) else {
            continue;
        };
        if policy.is_translatable(entry, def) {
            canonical.push_str(&def.id);
            canonical.push('=');
            canonical.push_str(&hash_field(value));
            canonical.push('\n');
        }
    }
    sha256_hex(canonical.as_bytes())
}
