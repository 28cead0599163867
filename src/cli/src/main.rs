//! strata CLI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_core::error::Result;
use strata_store::{ImageReference, ImageStore, RegistryClient};

/// Pull container images and materialize their root filesystems.
#[derive(Parser)]
#[command(name = "strata", version, about)]
struct Cli {
    /// Image to pull (e.g. "library/alpine:3.6")
    #[arg(long)]
    image: String,

    /// Registry URL; overrides the registry implied by the image name
    #[arg(long)]
    url: Option<String>,

    /// Username for registry login
    #[arg(long, default_value = "")]
    username: String,

    /// Password for registry login
    #[arg(long, default_value = "")]
    password: String,

    /// Working directory, used for caching
    #[arg(long, default_value = "/tmp/strata")]
    workdir: PathBuf,

    /// Directory layers are unpacked into (default: <workdir>/overlays)
    #[arg(long)]
    overlaydir: Option<PathBuf>,

    /// Extract the image into this directory
    #[arg(long, conflicts_with = "mount")]
    extractto: Option<PathBuf>,

    /// Mount the image as an overlay filesystem at this directory
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Save the config of the image to this file as JSON
    #[arg(long)]
    saveconfig: Option<PathBuf>,

    /// Number of parallel layer downloads; <= 0 means one per layer
    #[arg(long, default_value_t = strata_store::DEFAULT_PARALLELISM)]
    parallel_downloads: i32,

    /// Re-hash cached blobs instead of trusting them by name
    #[arg(long)]
    validate_cache: bool,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    tracing::info!(version = strata_core::VERSION, "strata starting");

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let reference = ImageReference::parse(&cli.image)?;
    let registry = cli.url.clone().unwrap_or_else(|| reference.registry.clone());

    let reg = Arc::new(RegistryClient::new(&registry, &cli.username, &cli.password)?);
    reg.ping().await;

    let store = ImageStore::new(
        &cli.workdir,
        cli.overlaydir.as_deref(),
        cli.parallel_downloads,
        cli.validate_cache,
        reg,
    )?;

    let image_id = store.pull(&cli.image).await?;
    tracing::info!(image = %cli.image, id = %image_id, "image pulled");

    if let Some(dest) = &cli.extractto {
        // Extract into the given directory, removing it first in case
        // it already exists.
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        std::fs::create_dir_all(dest)?;
        store.unpack(&cli.image, dest).await?;
        tracing::info!(dest = %dest.display(), "image extracted");
    } else if let Some(dest) = &cli.mount {
        store.mount(&cli.image, dest).await?;
        tracing::info!(dest = %dest.display(), "image mounted");
    }

    if let Some(dest) = &cli.saveconfig {
        store.save_config(&cli.image, dest).await?;
        tracing::info!(dest = %dest.display(), "config saved");
    }

    Ok(())
}
