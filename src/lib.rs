//! # content-mirror - Locale-Aware CMS Cloning
//!
//! **Tagline:** *"Clone. Translate. Stay in sync."*
//!
//! content-mirror clones an entry in a headless CMS into one or more
//! target locales and keeps the clones current:
//!
//! - **Recursive cloning** - Every referenced child entry is cloned and
//!   translated; assets are shared by reference
//! - **Machine translation** - Plain text and markdown go through the
//!   provider; image URLs, prefixes and links survive byte-for-byte
//! - **Persistent relationships** - Each (source, target) pair carries a
//!   clone map, per-field hashes and a deep reference snapshot
//! - **Incremental sync** - Later edits on the source are diffed against
//!   the snapshot and only the changed fields are retranslated, however
//!   many reference hops deep they hide
//!
//! ## Quick Start
//!
//! ```ignore
//! use content_mirror::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = Arc::new(HttpCms::new(token, "space", "master")?);
//!     let store = Arc::new(CompositeStore::new(
//!         CmsStore::new(api.clone(), CmsStore::DEFAULT_CONTENT_TYPE, "en-US-POSIX"),
//!         FileStore::new(FileStore::default_dir()),
//!     ));
//!     let engine = CloneEngine::new(
//!         api,
//!         Arc::new(DeepLClient::new(key)?),
//!         store,
//!         Arc::new(FieldPolicy::default()),
//!         EngineConfig::default(),
//!     );
//!
//!     // First clone: DE page into Italian
//!     let report = engine
//!         .clone_entry(
//!             &CloneRequest {
//!                 source_entry_id: "4fT...".into(),
//!                 source_language: None, // detected from the culture field
//!                 target_language: "IT".into(),
//!             },
//!             &CancelToken::new(),
//!         )
//!         .await?;
//!
//!     // Later: push source edits to the clone
//!     let update = engine
//!         .incremental_update(&report.original_entry_id, &report.cloned_entry_id, &CancelToken::new())
//!         .await;
//!     println!("updated fields: {:?}", update.fields_updated);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Four cooperating layers, leaves first:
//!
//! 1. **Field policy** (`policy`) - pure classification rules: what is
//!    translatable, what gets emptied, prefixed, copied or re-linked
//! 2. **Relationship store** (`store`) - CMS-backed primary with a
//!    filesystem fallback
//! 3. **Reference tracker** (`tracker`) - bounded-depth reference trees,
//!    content hashes, three-way diffs
//! 4. **Clone engine** (`engine`) - the orchestrator walking the graph,
//!    calling the translator and writing CMS mutations
//!
//! The CMS and the machine translator are consumed through the traits in
//! `cms` and `translator`; the HTTP server in `http` (behind the `server`
//! feature) is a thin shell over the engine.

// Internal building blocks
mod config;
mod error;
mod hash;
mod markdown;

// Core layers
pub mod cms;
pub mod engine;
pub mod policy;
pub mod store;
pub mod tracker;
pub mod translator;
pub mod types;

// HTTP API (requires the server feature)
#[cfg(feature = "server")]
pub mod http;

// Public API exports
pub use config::{DEFAULT_PORT, ServerConfig};
pub use engine::{CloneEngine, CloneRequest, EngineConfig};
pub use error::{MirrorError, MirrorResult};
pub use policy::{CultureMap, FieldKind, FieldPolicy};
pub use tracker::{ReferenceTracker, TrackerConfig, TreeScan};
pub use types::{
    BackupData, CancelToken, ChangeKind, ChangedReference, CloneMap, CloneReport, ContentTypeSchema,
    Entry, FieldChange, FieldChangeKind, FieldDef, FieldType, FieldValue, Link, LinkType,
    LocalizedValue, NewReference, NewReferenceOutcome, ReferenceDiff, ReferenceNode, ReferenceTree,
    Relationship, RelationshipMetadata, RemovedReference, StatusReport, TranslationContext,
    UpdateReport,
};

// Boundary exports
pub use cms::{EntryQuery, HttpCms, ManagementApi, MemoryCms};
pub use store::{CmsStore, CompositeStore, FileStore, RelationshipStore};
pub use translator::{DeepLClient, NoopTranslator, TranslateOptions, Translator};

#[cfg(feature = "server")]
pub use http::HttpServer;

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use content_mirror::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cms::{HttpCms, ManagementApi, MemoryCms};
    pub use crate::engine::{CloneEngine, CloneRequest, EngineConfig};
    pub use crate::error::{MirrorError, MirrorResult};
    pub use crate::policy::FieldPolicy;
    pub use crate::store::{CmsStore, CompositeStore, FileStore, RelationshipStore};
    pub use crate::translator::{DeepLClient, NoopTranslator, Translator};
    pub use crate::types::{
        CancelToken, CloneReport, Entry, FieldValue, Link, Relationship, StatusReport,
        TranslationContext, UpdateReport,
    };
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// This should be called once at application startup. It configures the
/// tracing subscriber with an environment filter.
///
/// The log level can be controlled via the `MIRROR_LOG` environment
/// variable:
/// - `MIRROR_LOG=error` - Only errors
/// - `MIRROR_LOG=warn` - Errors and warnings
/// - `MIRROR_LOG=info` - General information (default)
/// - `MIRROR_LOG=debug` - Debug information
/// - `MIRROR_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MIRROR_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
