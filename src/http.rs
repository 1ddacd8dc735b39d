/// HTTP API for content-mirror.
///
/// A thin shell over the engine. Every clone/update request names its own
/// space and environment, so the CMS client, stores and engine are
/// assembled per request; only the translator client and configuration
/// are shared across requests.
///
/// # API Endpoints
///
/// ## Health & status
/// - `GET /health` - liveness
/// - `GET /api/deepl/status` - translator reachability and quota
///
/// ## Cloning
/// - `POST /api/clone` - recursive clone into one or more target languages
///
/// ## Incremental sync
/// - `GET /api/incremental/status` - change detection, read-only
/// - `POST /api/incremental/update` - apply source changes to a clone
/// - `GET /api/incremental/relationships/:entryId` - relationships by source
/// - `GET /api/incremental/backups/:entryId` - backup history
/// - `GET /api/incremental/deep-references/:sourceId/:targetId` - tree stats
/// - `POST /api/incremental/deep-references/:sourceId/:targetId/rebuild` - forced rescan
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cms::HttpCms;
use crate::config::ServerConfig;
use crate::engine::{CloneEngine, CloneRequest, EngineConfig};
use crate::error::{MirrorError, MirrorResult};
use crate::policy::FieldPolicy;
use crate::store::{CmsStore, CompositeStore, FileStore, RelationshipStore};
use crate::translator::{DeepLClient, NoopTranslator, Translator};
use crate::types::{
    BackupData, CancelToken, CloneMap, CloneReport, ReferenceTree, Relationship, StatusReport,
    UpdateReport,
};

/// Shared server state.
struct AppState {
    config: ServerConfig,
    translator: Arc<dyn Translator>,
    policy: Arc<FieldPolicy>,
}

impl AppState {
    /// Assemble the per-request engine for a space/environment pair.
    fn engine(&self, space_id: &str, environment_id: &str) -> MirrorResult<CloneEngine> {
        let engine_config = EngineConfig::default();
        let api = Arc::new(HttpCms::new(&self.config.cms_token, space_id, environment_id)?);
        let store = Arc::new(CompositeStore::new(
            CmsStore::new(
                api.clone(),
                CmsStore::DEFAULT_CONTENT_TYPE,
                engine_config.storage_locale.clone(),
            ),
            FileStore::new(&self.config.tracking_dir),
        ));
        Ok(CloneEngine::new(
            api,
            self.translator.clone(),
            store,
            self.policy.clone(),
            engine_config,
        ))
    }

    /// The store alone, for read endpoints that need no engine.
    fn store(&self, space_id: &str, environment_id: &str) -> MirrorResult<CompositeStore> {
        let api = Arc::new(HttpCms::new(&self.config.cms_token, space_id, environment_id)?);
        Ok(CompositeStore::new(
            CmsStore::new(
                api,
                CmsStore::DEFAULT_CONTENT_TYPE,
                EngineConfig::default().storage_locale,
            ),
            FileStore::new(&self.config.tracking_dir),
        ))
    }
}

/// The HTTP server.
pub struct HttpServer {
    state: Arc<AppState>,
    port: u16,
}

impl HttpServer {
    /// Build a server from configuration. The translator client is
    /// constructed once: DeepL when a key is present, pass-through
    /// otherwise.
    pub fn new(config: ServerConfig) -> MirrorResult<Self> {
        let translator: Arc<dyn Translator> = match &config.translator_key {
            Some(key) => Arc::new(DeepLClient::new(key.clone())?),
            None => Arc::new(NoopTranslator),
        };
        let port = config.port;
        Ok(Self {
            state: Arc::new(AppState {
                config,
                translator,
                policy: Arc::new(FieldPolicy::default()),
            }),
            port,
        })
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> MirrorResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let app = create_router(self.state);

        tracing::info!("listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| MirrorError::Config {
                reason: format!("failed to bind {}: {}", addr, e),
            })?;
        axum::serve(listener, app)
            .await
            .map_err(|e| MirrorError::Config {
                reason: format!("server error: {}", e),
            })?;
        Ok(())
    }
}

/// Create the Axum router with all routes.
fn create_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};
    use axum::Router;

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/deepl/status", get(handle_translator_status))
        .route("/api/clone", post(handle_clone))
        .route("/api/incremental/status", get(handle_status))
        .route("/api/incremental/update", post(handle_update))
        .route(
            "/api/incremental/relationships/:entryId",
            get(handle_relationships),
        )
        .route("/api/incremental/backups/:entryId", get(handle_backups))
        .route(
            "/api/incremental/deep-references/:sourceId/:targetId",
            get(handle_deep_refs),
        )
        .route(
            "/api/incremental/deep-references/:sourceId/:targetId/rebuild",
            post(handle_deep_refs_rebuild),
        )
        .with_state(state)
}

/// Error body returned on every failure path.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(e: MirrorError) -> ApiError {
    let (status, suggestion) = match &e {
        MirrorError::Config { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Some("check the server environment variables".to_string()),
        ),
        MirrorError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, None),
        MirrorError::EntryNotFound { .. } => (StatusCode::NOT_FOUND, None),
        MirrorError::Cms { status, .. } => (
            status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            None,
        ),
        MirrorError::Translator { .. } => (StatusCode::BAD_GATEWAY, None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            suggestion,
        }),
    )
}

// Handler implementations

async fn handle_health() -> Json<JsonValue> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TranslatorStatusResponse {
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<crate::translator::TranslatorUsage>,
    source_languages: usize,
    target_languages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn handle_translator_status(
    State(state): State<Arc<AppState>>,
) -> Json<TranslatorStatusResponse> {
    match state.translator.usage().await {
        Ok(usage) => {
            let source = state
                .translator
                .source_languages()
                .await
                .map(|l| l.len())
                .unwrap_or(0);
            let target = state
                .translator
                .target_languages()
                .await
                .map(|l| l.len())
                .unwrap_or(0);
            Json(TranslatorStatusResponse {
                reachable: true,
                usage: Some(usage),
                source_languages: source,
                target_languages: target,
                error: None,
            })
        }
        Err(e) => Json(TranslatorStatusResponse {
            reachable: false,
            usage: None,
            source_languages: 0,
            target_languages: 0,
            error: Some(e.to_string()),
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneBody {
    source_entry_id: String,
    space_id: String,
    environment_id: String,
    #[serde(default)]
    source_language: Option<String>,
    #[serde(default)]
    target_language: Option<String>,
    #[serde(default)]
    target_languages: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloneResponse {
    original_entry_id: String,
    cloned_entry_id: String,
    clone_mapping: CloneMap,
    all_results: Vec<CloneReport>,
    target_locales: Vec<String>,
}

async fn handle_clone(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloneBody>,
) -> Result<Json<CloneResponse>, ApiError> {
    let mut languages = body.target_languages.clone();
    if let Some(language) = &body.target_language {
        if !languages.contains(language) {
            languages.insert(0, language.clone());
        }
    }
    if languages.is_empty() {
        return Err(api_error(MirrorError::InvalidInput {
            reason: "targetLanguage or targetLanguages[] is required".to_string(),
        }));
    }

    let engine = state
        .engine(&body.space_id, &body.environment_id)
        .map_err(api_error)?;
    let cancel = CancelToken::new();

    let mut results = Vec::new();
    for language in &languages {
        let request = CloneRequest {
            source_entry_id: body.source_entry_id.clone(),
            source_language: body.source_language.clone(),
            target_language: language.clone(),
        };
        let report = engine.clone_entry(&request, &cancel).await.map_err(api_error)?;
        results.push(report);
    }

    let first = &results[0];
    Ok(Json(CloneResponse {
        original_entry_id: first.original_entry_id.clone(),
        cloned_entry_id: first.cloned_entry_id.clone(),
        clone_mapping: first.clone_mapping.clone(),
        target_locales: results.iter().map(|r| r.target_locale.clone()).collect(),
        all_results: results,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    entry_id: String,
    target_language: String,
    space_id: String,
    environment_id: String,
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusReport>, ApiError> {
    let store = state
        .store(&query.space_id, &query.environment_id)
        .map_err(api_error)?;

    // The status endpoint addresses the pair by target language; resolve
    // the target id through the stored relationships.
    let relationships = store.list_by_source(&query.entry_id).await.map_err(api_error)?;
    let Some(relationship) = relationships
        .iter()
        .find(|r| r.translation_context.target_language == query.target_language)
    else {
        return Ok(Json(StatusReport {
            has_relationship: false,
            up_to_date: false,
            root_changes: Vec::new(),
            reference_diff: Default::default(),
            conflicts: Vec::new(),
            metadata: None,
        }));
    };

    let engine = state
        .engine(&query.space_id, &query.environment_id)
        .map_err(api_error)?;
    let report = engine
        .status(&relationship.source_entry_id, &relationship.target_entry_id)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    source_entry_id: String,
    target_entry_id: String,
    space_id: String,
    environment_id: String,
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<UpdateReport>, ApiError> {
    let engine = state
        .engine(&body.space_id, &body.environment_id)
        .map_err(api_error)?;
    let cancel = CancelToken::new();
    let report = engine
        .incremental_update(&body.source_entry_id, &body.target_entry_id, &cancel)
        .await;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeQuery {
    space_id: String,
    environment_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipsResponse {
    entry_id: String,
    relationships: Vec<Relationship>,
}

async fn handle_relationships(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<RelationshipsResponse>, ApiError> {
    let store = state
        .store(&scope.space_id, &scope.environment_id)
        .map_err(api_error)?;
    let relationships = store.list_by_source(&entry_id).await.map_err(api_error)?;
    Ok(Json(RelationshipsResponse {
        entry_id,
        relationships,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupsResponse {
    entry_id: String,
    backups: Vec<BackupData>,
}

async fn handle_backups(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<BackupsResponse>, ApiError> {
    let store = state
        .store(&scope.space_id, &scope.environment_id)
        .map_err(api_error)?;
    let backups = store.list_backups(&entry_id).await.map_err(api_error)?;
    Ok(Json(BackupsResponse { entry_id, backups }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeepRefsResponse {
    source_entry_id: String,
    target_entry_id: String,
    node_count: usize,
    max_depth: u32,
    last_scanned: DateTime<Utc>,
}

fn deep_refs_response(tree: &ReferenceTree) -> DeepRefsResponse {
    DeepRefsResponse {
        source_entry_id: tree.source_entry_id.clone(),
        target_entry_id: tree.target_entry_id.clone(),
        node_count: tree.reference_tree.node_count(),
        max_depth: tree.reference_tree.max_depth(),
        last_scanned: tree.last_scanned,
    }
}

async fn handle_deep_refs(
    State(state): State<Arc<AppState>>,
    Path((source_id, target_id)): Path<(String, String)>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<DeepRefsResponse>, ApiError> {
    let store = state
        .store(&scope.space_id, &scope.environment_id)
        .map_err(api_error)?;
    match store.get_deep_map(&source_id, &target_id).await.map_err(api_error)? {
        Some(tree) => Ok(Json(deep_refs_response(&tree))),
        None => Err(api_error(MirrorError::EntryNotFound {
            id: format!("{}_{}", source_id, target_id),
        })),
    }
}

async fn handle_deep_refs_rebuild(
    State(state): State<Arc<AppState>>,
    Path((source_id, target_id)): Path<(String, String)>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<DeepRefsResponse>, ApiError> {
    let engine = state
        .engine(&scope.space_id, &scope.environment_id)
        .map_err(api_error)?;
    let tree = engine
        .rebuild_deep_refs(&source_id, &target_id)
        .await
        .map_err(api_error)?;
    Ok(Json(deep_refs_response(&tree)))
}

#[cfg(test)]
mod tests {
    // Handlers are thin projections over the engine; behavior is covered
    // by the integration suites in tests/.
}
