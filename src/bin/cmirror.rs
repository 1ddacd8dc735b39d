//! content-mirror server binary.
//!
//! Reads its configuration from the environment (see [`ServerConfig`])
//! and serves the HTTP API. Flags override individual settings:
//!
//! ```text
//! CMS_MANAGEMENT_TOKEN=... TRANSLATOR_API_KEY=... cmirror --port 3001
//! ```
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use content_mirror::{HttpServer, ServerConfig};

#[derive(Parser)]
#[command(name = "cmirror", version, about = "Locale-aware CMS entry cloning server")]
struct Cli {
    /// HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Tracking directory for the filesystem fallback store
    /// (overrides MIRROR_TRACKING_DIR)
    #[arg(long)]
    tracking_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    content_mirror::init_logging();
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(tracking_dir) = cli.tracking_dir {
        config.tracking_dir = tracking_dir;
    }

    HttpServer::new(config)?.run().await?;
    Ok(())
}
