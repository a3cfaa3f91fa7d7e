//! Caravel Daemon
//!
//! Runs the build-and-deploy worker pool against the shared SQLite queue.
//! Deploy triggers and backend provisioning enter through the library API;
//! this binary keeps the queue drained.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use caravel_daemon::builds::{BuildWorker, WorkerConfig, run_worker_loop};
use caravel_daemon::githost::{GitHostClient, GitHostConfig};
use caravel_daemon::kms::HttpKeyService;
use caravel_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "caravel-daemon")]
#[command(version, about = "Caravel daemon - build and deploy worker pool")]
struct Args {
    /// Database file path
    #[arg(long, env = "CARAVEL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Key-management service URL
    #[arg(long, env = "CARAVEL_KMS_URL")]
    kms_url: String,

    /// Key-management service API key
    #[arg(long, env = "CARAVEL_KMS_API_KEY")]
    kms_api_key: String,

    /// Git host URL (enables webhook-triggered builds)
    #[arg(long, env = "CARAVEL_GITHOST_URL")]
    githost_url: Option<String>,

    /// Git host OAuth client id
    #[arg(long, env = "CARAVEL_GITHOST_CLIENT_ID", default_value = "")]
    githost_client_id: String,

    /// Git host OAuth client secret
    #[arg(long, env = "CARAVEL_GITHOST_CLIENT_SECRET", default_value = "")]
    githost_client_secret: String,

    /// Public callback URL registered on push webhooks
    #[arg(long, env = "CARAVEL_WEBHOOK_CALLBACK_URL", default_value = "")]
    webhook_callback_url: String,

    /// Shared secret for webhook deliveries
    #[arg(long, env = "CARAVEL_WEBHOOK_SECRET", default_value = "")]
    webhook_secret: String,

    /// Number of concurrent queue workers
    #[arg(long, default_value_t = 2, env = "CARAVEL_WORKERS")]
    workers: usize,

    /// Seconds between queue polls when the queue is empty
    #[arg(long, default_value_t = 5, env = "CARAVEL_POLL_INTERVAL")]
    poll_interval_secs: u64,

    /// Wall-clock cap in seconds for one build subprocess
    #[arg(long, default_value_t = 1800, env = "CARAVEL_BUILD_TIMEOUT")]
    build_timeout_secs: u64,

    /// Base directory for ephemeral build checkouts
    #[arg(long, env = "CARAVEL_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Upload CLI binary
    #[arg(long, default_value = "site-ctl", env = "CARAVEL_UPLOAD_BIN")]
    upload_bin: String,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "CARAVEL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CARAVEL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("caravel_daemon={}", args.log_level);
    caravel_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = args.workers,
        "Starting caravel-daemon"
    );

    // Initialize database
    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let kms = Arc::new(HttpKeyService::new(&args.kms_url, &args.kms_api_key)?);

    // Git host integration is optional: without it the daemon still serves
    // web deploys of prebuilt directories.
    let githost = match &args.githost_url {
        Some(url) => {
            let client = GitHostClient::new(&GitHostConfig {
                base_url: url.clone(),
                client_id: args.githost_client_id.clone(),
                client_secret: args.githost_client_secret.clone(),
                webhook_callback_url: args.webhook_callback_url.clone(),
                webhook_secret: args.webhook_secret.clone(),
            })?;
            info!(url = %url, "Git host integration enabled");
            Some(Arc::new(client))
        }
        None => None,
    };

    let workdir = match args.workdir {
        Some(dir) => dir,
        None => default_workdir()?,
    };
    tokio::fs::create_dir_all(&workdir).await?;

    let worker = Arc::new(BuildWorker::new(
        db.clone(),
        kms,
        githost,
        WorkerConfig {
            workdir,
            upload_bin: args.upload_bin.clone(),
            build_timeout: Duration::from_secs(args.build_timeout_secs),
        },
    ));

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);
    let poll_interval = Duration::from_secs(args.poll_interval_secs.max(1));

    let mut worker_handles = Vec::with_capacity(args.workers);
    for n in 0..args.workers.max(1) {
        let handle = tokio::spawn(run_worker_loop(
            db.clone(),
            Arc::clone(&worker),
            format!("worker-{n}"),
            poll_interval,
            shutdown_tx.subscribe(),
        ));
        worker_handles.push(handle);
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready. The `true` parameter unsets
    // $NOTIFY_SOCKET so build subprocesses don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Worker pool ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.caravel/daemon.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".caravel").join("daemon.db"))
}

/// Default build checkout directory: ~/.caravel/builds/
fn default_workdir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".caravel").join("builds"))
}
