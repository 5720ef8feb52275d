//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `ingest <file>` -- ingest a local file
//! - `fetch <url>` -- ingest a remote URL
//! - `check-url <url>` -- run only the remote pre-flight check
//! - `config show|path|validate` -- inspect configuration
//! - `version` -- print build/version info

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::{self, Config, ConfigError, StorageBackend, StorageConfig};
use crate::media::{
    FsObjectStore, IngestContext, IngestError, MediaIngestor, MemoryObjectStore, ObjectStore,
    RawMediaInput, S3ObjectStore, StoreError, ValidationError,
};

/// Media ingestion pipeline: validate, normalize and publish media by content hash.
#[derive(Parser, Debug)]
#[command(
    name = "mediagate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Validate, normalize and publish media to object storage"
)]
pub struct Cli {
    /// Configuration file (default: $MEDIAGATE_CONFIG_PATH or ~/.config/mediagate/mediagate.json5).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless MEDIAGATE_LOG or RUST_LOG is set.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest a local file and print its descriptor as JSON.
    Ingest {
        file: PathBuf,

        /// Filename to record instead of the file's own name.
        #[arg(long)]
        name: Option<String>,

        /// Abort after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Print pipeline metrics to stderr when done.
        #[arg(long)]
        stats: bool,
    },

    /// Download a URL, ingest it and print its descriptor as JSON.
    Fetch {
        url: String,

        /// Abort after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Print pipeline metrics to stderr when done.
        #[arg(long)]
        stats: bool,
    },

    /// Check a URL's advertised type and size without downloading it.
    CheckUrl { url: String },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,

    /// Check the configuration file and list every problem found.
    Validate,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Resolve the configuration file path from the flag or the environment.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(config::get_config_path)
}

/// Open the object store selected by the storage section.
pub async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let store: Arc<dyn ObjectStore> = match storage.backend {
        StorageBackend::S3 => Arc::new(S3ObjectStore::from_env(&storage.s3_settings()).await),
        StorageBackend::Filesystem => Arc::new(
            FsObjectStore::new(storage.root_or_default(), storage.public_base_url.clone()).await?,
        ),
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
    };
    tracing::debug!(backend = store.backend_name(), bucket = %storage.bucket, "object store opened");
    Ok(store)
}

async fn build_ingestor(config: &Config) -> Result<MediaIngestor, StoreError> {
    let store = open_store(&config.storage).await?;
    Ok(MediaIngestor::new(config.ingest_settings(), store))
}

/// Context cancelled by Ctrl-C and bounded by `timeout_secs`.
fn request_context(timeout_secs: Option<u64>) -> IngestContext {
    let ctx = match timeout_secs {
        Some(secs) => IngestContext::with_timeout(Duration::from_secs(secs)),
        None => IngestContext::background(),
    };

    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    ctx
}

fn print_stats(ingestor: &MediaIngestor) -> CliResult {
    eprintln!("{}", serde_json::to_string_pretty(&ingestor.metrics())?);
    Ok(())
}

/// Read `file`, refusing files over `max_size` before loading them.
async fn read_input(file: &Path, max_size: u64) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let len = tokio::fs::metadata(file).await?.len();
    if len > max_size {
        return Err(IngestError::from(ValidationError::TooLarge {
            actual: len,
            limit: max_size,
        })
        .into());
    }
    Ok(tokio::fs::read(file).await?)
}

/// Run the `ingest <file>` subcommand.
pub async fn handle_ingest(
    config: &Config,
    file: &Path,
    name: Option<String>,
    timeout: Option<u64>,
    stats: bool,
) -> CliResult {
    let bytes = read_input(file, config.media.max_file_size).await?;
    let filename = name.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let ingestor = build_ingestor(config).await?;
    let ctx = request_context(timeout);
    let result = ingestor
        .ingest_bytes(RawMediaInput::new(bytes, filename), &ctx)
        .await;

    if stats {
        print_stats(&ingestor)?;
    }
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Run the `fetch <url>` subcommand.
pub async fn handle_fetch(
    config: &Config,
    url: &str,
    timeout: Option<u64>,
    stats: bool,
) -> CliResult {
    let ingestor = build_ingestor(config).await?;
    let ctx = request_context(timeout);
    let result = ingestor.ingest_url(url, &ctx).await;

    if stats {
        print_stats(&ingestor)?;
    }
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Run the `check-url <url>` subcommand.
pub async fn handle_check_url(config: &Config, url: &str) -> CliResult {
    // Pre-flight never touches storage.
    let ingestor = MediaIngestor::new(config.ingest_settings(), Arc::new(MemoryObjectStore::new()));
    let metadata = ingestor.check_url(url, &request_context(None)).await?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show(config: &Config) -> CliResult {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path(path: &Path) {
    println!("{}", path.display());
}

/// Run the `config validate` subcommand. Returns false if problems were found.
pub fn handle_config_validate(path: &Path) -> Result<bool, ConfigError> {
    match config::load_config_from(path) {
        Ok(_) => {
            println!("{}: ok", path.display());
            Ok(true)
        }
        Err(ConfigError::Invalid(issues)) => {
            for issue in &issues {
                eprintln!("{}", issue);
            }
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("mediagate {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("MEDIAGATE_BUILD_DATE"));
    println!("  Git commit: {}", env!("MEDIAGATE_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
