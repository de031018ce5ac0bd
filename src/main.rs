use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fileshare_server::app::App;
use fileshare_server::config::{AppConfig, CliConfig, FileConfig};
use fileshare_server::store::{FileStore, SqliteFileStore};
use fileshare_server::{media, metrics};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values set there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the SQLite database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory holding uploaded file bytes. Defaults to <db_dir>/Uploads.
    #[clap(long, value_parser = parse_path)]
    pub uploads_dir: Option<PathBuf>,

    /// Hours between reconciliation sweeps. 0 runs the sweep once and exits.
    #[clap(long, default_value_t = 0)]
    pub sweep_interval_hours: u64,

    /// URL of an S3-compatible gateway for derived assets (previews, covers).
    #[clap(long)]
    pub object_store_url: Option<String>,

    /// Bucket name on the object store gateway.
    #[clap(long)]
    pub object_store_bucket: Option<String>,

    /// Local directory for derived assets when no gateway URL is set.
    #[clap(long, value_parser = parse_path)]
    pub objects_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir,
        uploads_dir: cli_args.uploads_dir,
        sweep_interval_hours: Some(cli_args.sweep_interval_hours),
        object_store_url: cli_args.object_store_url,
        object_store_bucket: cli_args.object_store_bucket,
        objects_dir: cli_args.objects_dir,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening SQLite database at {:?}...", config.db_path());
    let store: Arc<dyn FileStore> = Arc::new(SqliteFileStore::open(&config.db_path())?);
    tokio::fs::create_dir_all(&config.uploads_dir)
        .await
        .with_context(|| format!("Failed to create uploads dir {:?}", config.uploads_dir))?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    if let Err(e) = media::check_ffmpeg_available().await {
        warn!("ffmpeg tooling unavailable, metadata extraction will fail: {e}");
    }

    let app = App::build(&config, store)?;
    info!("Running startup reconciliation sweep...");
    app.sweep.run().await?;

    let Some(interval_hours) = config.sweep_interval_hours else {
        info!("No sweep interval configured, done");
        app.pipeline.shutdown().await;
        return Ok(());
    };

    let shutdown = CancellationToken::new();
    let interval = Duration::from_secs(interval_hours * 60 * 60);
    info!("Sweeping every {} hours, Ctrl-C to stop", interval_hours);

    tokio::select! {
        _ = app.sweep.run_periodic(interval, shutdown.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
            shutdown.cancel();
        }
    }
    app.pipeline.shutdown().await;
    Ok(())
}
