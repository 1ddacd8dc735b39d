/// Process configuration from the environment.
///
/// The server shell reads everything it needs at startup:
///
/// - `CMS_MANAGEMENT_TOKEN` - management API token (required)
/// - `TRANSLATOR_API_KEY` - provider key; absent means the pass-through
///   translator (clones still work, nothing is translated)
/// - `PORT` - HTTP port, default 3001
/// - `MIRROR_TRACKING_DIR` - fallback store directory, default
///   `~/.content-mirror/tracking`
use std::path::PathBuf;

use crate::error::{MirrorError, MirrorResult};
use crate::store::FileStore;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3001;

/// Everything the server needs from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// CMS management API token
    pub cms_token: String,
    /// Translator API key, when configured
    pub translator_key: Option<String>,
    /// HTTP port
    pub port: u16,
    /// Directory for the filesystem fallback store
    pub tracking_dir: PathBuf,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> MirrorResult<Self> {
        let cms_token = std::env::var("CMS_MANAGEMENT_TOKEN").map_err(|_| MirrorError::Config {
            reason: "CMS_MANAGEMENT_TOKEN is not set; export a management API token".to_string(),
        })?;

        let translator_key = std::env::var("TRANSLATOR_API_KEY").ok().filter(|k| !k.is_empty());
        if translator_key.is_none() {
            tracing::warn!("TRANSLATOR_API_KEY is not set, translations will be pass-through");
        }

        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| MirrorError::Config {
                reason: format!("PORT '{}' is not a valid port number", raw),
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let tracking_dir = std::env::var("MIRROR_TRACKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| FileStore::default_dir());

        Ok(Self {
            cms_token,
            translator_key,
            port,
            tracking_dir,
        })
    }
}
