//! estate-cache - drives the estate-tools offline cache from the command line.
//!
//! Fires the controller's lifecycle events (install, activate) against the
//! on-disk bucket store and replays page requests through the fetch handler.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use estate_cache_core::{
    CacheBucket, CachePolicyController, CacheStorage, Config, DiskCacheStorage, HttpFetcher,
    Request, ServiceWorkerHost,
};

/// Environment variable naming a directory for daily log files
const LOG_DIR_ENV: &str = "ESTATE_CACHE_LOG_DIR";

/// Log file prefix inside the log directory
const LOG_FILE_PREFIX: &str = "estate-cache.log";

type Controller = CachePolicyController<DiskCacheStorage, HttpFetcher>;

#[derive(Parser, Debug)]
#[command(name = "estate-cache")]
#[command(about = "Offline cache controller for estate-tools")]
#[command(version)]
struct Cli {
    /// Bucket directory (defaults to the platform cache directory)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Override the version tag
    #[arg(long)]
    cache_name: Option<String>,

    /// Override the origin relative assets resolve against
    #[arg(long)]
    origin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store every manifest asset in the current bucket
    Install,
    /// Delete every bucket except the current one
    Activate,
    /// Install, then activate
    Deploy,
    /// Serve one request through the fetch handler; the body goes to stdout
    Fetch {
        /// Absolute URL, or a path on the origin
        url: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Request header as `name: value`
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
    /// List buckets and their entries
    Buckets,
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
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
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let mut config = Config::load().context("Failed to load cache config")?;
    if let Some(name) = cli.cache_name {
        config = config.with_cache_name(name);
    }
    if let Some(origin) = cli.origin {
        config = config.with_origin(origin);
    }

    let cache_dir = cli
        .cache_dir
        .or_else(|| config.cache_dir())
        .unwrap_or_else(|| PathBuf::from("./cache"));
    let storage = DiskCacheStorage::new(&cache_dir)
        .await
        .with_context(|| format!("Failed to open cache directory {}", cache_dir.display()))?;
    let storage = Arc::new(storage);
    let fetcher = Arc::new(HttpFetcher::new().context("Failed to build HTTP client")?);

    info!(cache = %config.cache_name, dir = %cache_dir.display(), "estate-cache starting");
    let controller = CachePolicyController::new(config.clone(), storage.clone(), fetcher.clone());

    match cli.command {
        Command::Install => install(&controller).await,
        Command::Activate => activate(&controller).await,
        Command::Deploy => deploy(&ServiceWorkerHost::new(storage, fetcher), config).await,
        Command::Fetch {
            url,
            method,
            headers,
        } => fetch(&controller, &url, &method, &headers).await,
        Command::Buckets => list_buckets(&controller).await,
    }
}

async fn install(controller: &Controller) -> Result<()> {
    let outcome = controller.install().await.context("Install failed")?;
    eprintln!(
        "Installed {}: {} assets stored",
        outcome.cache_name, outcome.stored
    );
    Ok(())
}

async fn activate(controller: &Controller) -> Result<()> {
    let outcome = controller.activate().await.context("Activate failed")?;
    if outcome.deleted.is_empty() {
        eprintln!("Activated {}: no stale buckets", outcome.cache_name);
    } else {
        eprintln!(
            "Activated {}: deleted {}",
            outcome.cache_name,
            outcome.deleted.join(", ")
        );
    }
    Ok(())
}

async fn deploy(host: &ServiceWorkerHost<DiskCacheStorage, HttpFetcher>, config: Config) -> Result<()> {
    let report = host.deploy(config).await.context("Deploy failed")?;
    match report.activate {
        Some(activate) => eprintln!(
            "Deployed {}: {} assets stored, deleted [{}]",
            report.install.cache_name,
            report.install.stored,
            activate.deleted.join(", ")
        ),
        None => eprintln!(
            "Installed {}: {} assets stored, waiting to activate",
            report.install.cache_name, report.install.stored
        ),
    }
    Ok(())
}

async fn fetch(controller: &Controller, target: &str, method: &str, headers: &[String]) -> Result<()> {
    let url = controller.config().resolve(target)?;
    let mut request = Request::new(method, url);
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Header must look like `name: value`: {}", header))?;
        request = request.with_header(name.trim(), value.trim());
    }

    let served = controller
        .handle_fetch(&request)
        .await
        .with_context(|| format!("Fetch failed for {}", request.url))?;

    eprintln!(
        "{} {} ({}, {} bytes, {:?})",
        served.response.status,
        served.response.status_text,
        served.source,
        served.response.body.len(),
        controller.strategy_for(&request),
    );
    io::stdout().write_all(&served.response.body)?;
    Ok(())
}

async fn list_buckets(controller: &Controller) -> Result<()> {
    let storage = controller.storage();
    let names = storage.keys().await?;
    if names.is_empty() {
        println!("No buckets");
        return Ok(());
    }

    for name in names {
        let marker = if name == controller.cache_name() { "*" } else { " " };
        let bucket = storage.open(&name).await?;
        let entries = bucket
            .entries()
            .await
            .with_context(|| format!("Failed to read bucket {}", name))?;
        println!("{} {} ({} entries)", marker, name, entries.len());
        for entry in entries {
            println!(
                "    {:<60} {:>4} {:>8}",
                entry.key().to_string(),
                entry.response.status,
                entry.age_display()
            );
        }
    }
    Ok(())
}
