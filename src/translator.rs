/// Machine-translator boundary.
///
/// Translation is a capability that may fail per call; the engine treats
/// every failure as "keep the source text" and moves on. Nothing in this
/// module panics or aborts a clone.
///
/// Implementations:
///
/// - [`DeepLClient`] - the DeepL v2 REST API
/// - [`NoopTranslator`] - a pass-through used when no API key is
///   configured; clones still work, strings keep their source text
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MirrorError, MirrorResult};
use crate::types::TranslationContext;

/// Per-call timeout for translator requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call options forwarded to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslateOptions {
    /// Ask the provider not to normalize whitespace and line breaks
    pub preserve_formatting: bool,
    /// Treat embedded markup as XML tags that must survive translation
    pub xml_tag_handling: bool,
}

impl TranslateOptions {
    /// The options the markdown path uses.
    pub fn markdown() -> Self {
        Self {
            preserve_formatting: true,
            xml_tag_handling: true,
        }
    }
}

/// Provider quota usage, for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorUsage {
    /// Characters consumed in the current period
    pub character_count: u64,
    /// Characters allowed in the current period
    pub character_limit: u64,
}

/// One supported language, for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    /// Provider language code (e.g. `DE`, `EN-GB`)
    pub language: String,
    /// Human-readable name
    pub name: String,
}

/// The operations this crate needs from a machine-translation provider.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate one text between provider language codes.
    async fn translate(
        &self,
        text: &str,
        context: &TranslationContext,
        options: TranslateOptions,
    ) -> MirrorResult<String>;

    /// Current quota usage.
    async fn usage(&self) -> MirrorResult<TranslatorUsage>;

    /// Languages accepted as source.
    async fn source_languages(&self) -> MirrorResult<Vec<LanguageInfo>>;

    /// Languages accepted as target.
    async fn target_languages(&self) -> MirrorResult<Vec<LanguageInfo>>;
}

// ============================================================================
// DeepL implementation
// ============================================================================

/// DeepL v2 API client.
pub struct DeepLClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl DeepLClient {
    /// Create a client from an API key.
    ///
    /// Free-tier keys (suffix `:fx`) route to `api-free.deepl.com`,
    /// everything else to `api.deepl.com`.
    pub fn new(api_key: impl Into<String>) -> MirrorResult<Self> {
        let api_key = api_key.into();
        let host = if api_key.ends_with(":fx") {
            "https://api-free.deepl.com"
        } else {
            "https://api.deepl.com"
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MirrorError::Translator {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            base_url: format!("{}/v2", host),
            api_key,
            client,
        })
    }

    async fn get_json(&self, path: &str) -> MirrorResult<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .send()
            .await
            .map_err(|e| MirrorError::Translator {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Translator {
                message: format!("HTTP {}: {}", status, response.text().await.unwrap_or_default()),
            });
        }
        response.json().await.map_err(|e| MirrorError::Translator {
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    source_lang: &'a str,
    target_lang: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    preserve_formatting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag_handling: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translations: Vec<Translation>,
}

#[derive(Debug, Deserialize)]
struct Translation {
    text: String,
}

#[async_trait]
impl Translator for DeepLClient {
    async fn translate(
        &self,
        text: &str,
        context: &TranslationContext,
        options: TranslateOptions,
    ) -> MirrorResult<String> {
        let request = TranslateRequest {
            text: [text],
            source_lang: &context.source_language,
            target_lang: &context.target_language,
            preserve_formatting: options.preserve_formatting,
            tag_handling: options.xml_tag_handling.then_some("xml"),
        };

        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| MirrorError::Translator {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Translator {
                message: format!("HTTP {}: {}", status, response.text().await.unwrap_or_default()),
            });
        }

        let parsed: TranslateResponse =
            response.json().await.map_err(|e| MirrorError::Translator {
                message: e.to_string(),
            })?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| MirrorError::Translator {
                message: "empty translations array".to_string(),
            })
    }

    async fn usage(&self) -> MirrorResult<TranslatorUsage> {
        let raw = self.get_json("/usage").await?;
        Ok(TranslatorUsage {
            character_count: raw.get("character_count").and_then(|v| v.as_u64()).unwrap_or(0),
            character_limit: raw.get("character_limit").and_then(|v| v.as_u64()).unwrap_or(0),
        })
    }

    async fn source_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        parse_languages(self.get_json("/languages?type=source").await?)
    }

    async fn target_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        parse_languages(self.get_json("/languages?type=target").await?)
    }
}

fn parse_languages(raw: serde_json::Value) -> MirrorResult<Vec<LanguageInfo>> {
    let items = raw.as_array().cloned().unwrap_or_default();
    Ok(items
        .into_iter()
        .filter_map(|item| {
            Some(LanguageInfo {
                language: item.get("language")?.as_str()?.to_string(),
                name: item.get("name")?.as_str()?.to_string(),
            })
        })
        .collect())
}

// ============================================================================
// No-op implementation
// ============================================================================

/// Pass-through translator for credential-less development.
///
/// Every string comes back unchanged, which is exactly the degraded mode
/// the engine already supports for provider outages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(
        &self,
        text: &str,
        _context: &TranslationContext,
        _options: TranslateOptions,
    ) -> MirrorResult<String> {
        Ok(text.to_string())
    }

    async fn usage(&self) -> MirrorResult<TranslatorUsage> {
        Ok(TranslatorUsage {
            character_count: 0,
            character_limit: 0,
        })
    }

    async fn source_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }

    async fn target_languages(&self) -> MirrorResult<Vec<LanguageInfo>> {
        Ok(Vec::new())
    }
}
