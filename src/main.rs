mod commands;
mod config;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use retina_offline::artifacts::ArtifactMetadata;
use retina_offline::sync::SyncTag;
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "retina-offline")]
#[command(about = "Offline store, model cache and sync engine for the retina detection app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/retina-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create the offline store and install the request caches
  Init,
  /// Show storage usage, pending records and artifact cache usage
  Stats {
    /// Print as JSON
    #[arg(long)]
    json: bool,
  },
  /// Push pending records to the backend once
  Sync {
    /// Only drain one sync tag (detection-data, model-data)
    #[arg(long)]
    tag: Option<SyncTag>,
  },
  /// Remove synced records older than the retention window
  Sweep {
    /// Override store.retention_days
    #[arg(long)]
    days: Option<u32>,
  },
  /// Evict artifacts until the cache is within its limits
  Cleanup,
  /// Drop cached artifacts whose payload is missing or corrupt
  Validate,
  /// Download a model into the artifact cache
  Download {
    url: Url,
    /// Cache entry name
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "model")]
    category: String,
    #[arg(long)]
    pretrained: bool,
    #[arg(long)]
    accuracy: Option<f64>,
    #[arg(long)]
    description: Option<String>,
  },
  /// Run the connectivity-driven sync worker until interrupted
  Worker,
}

/// Log to stderr and, when a log directory is available, to a daily file.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
  let default_level = config.logging.level.clone().unwrap_or_else(|| "info".to_string());
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let (file_layer, guard) = match config
    .log_directory()
    .filter(|dir| std::fs::create_dir_all(dir).is_ok())
  {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "retina-offline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config);
  info!(command = ?args.command, "retina-offline starting");

  let ctx = commands::Context::open(config).await?;

  match args.command {
    Command::Init => commands::init(&ctx).await?,
    Command::Stats { json } => commands::show_stats(&ctx, json).await?,
    Command::Sync { tag } => commands::sync(&ctx, tag).await?,
    Command::Sweep { days } => commands::sweep(&ctx, days).await?,
    Command::Cleanup => commands::cleanup(&ctx).await?,
    Command::Validate => commands::validate(&ctx).await?,
    Command::Download {
      url,
      name,
      category,
      pretrained,
      accuracy,
      description,
    } => {
      let metadata = ArtifactMetadata {
        category,
        pretrained,
        accuracy,
        description,
      };
      commands::download(&ctx, &url, &name, metadata).await?
    }
    Command::Worker => commands::worker(&ctx).await?,
  }

  Ok(())
}
