//! blockhaus binary entry point

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blockhaus::config::{self, AppConfig};
use blockhaus::data::Database;
use blockhaus::error::{AppError, Result};
use blockhaus::service::{stats, RunOptions};
use blockhaus::{version, AppContext};

/// Bulk account blocker driven by a cookie-authenticated session.
#[derive(Parser, Debug)]
#[command(name = "blockhaus", version = version::version(), about)]
struct Cli {
    /// Cookie jar file (browser export JSON)
    #[arg(long, env = "BLOCKHAUS_COOKIES_PATH")]
    cookies: Option<PathBuf>,

    /// Target-list file
    #[arg(long, env = "BLOCKHAUS_TARGETS_PATH")]
    targets: Option<PathBuf>,

    /// Outcome history database
    #[arg(long, env = "BLOCKHAUS_DB_PATH")]
    db: Option<PathBuf>,

    /// Cache directory
    #[arg(long, env = "BLOCKHAUS_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Maximum targets to process this run
    #[arg(long)]
    max_targets: Option<usize>,

    /// Inter-call delay in seconds
    #[arg(long)]
    delay: Option<f64>,

    /// Enable the regional forwarding header (experimental)
    #[arg(long)]
    enable_forwarded_for: bool,

    /// Disable per-request transaction-id headers (minimal requests)
    #[arg(long)]
    disable_header_enhancement: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process the target list (test mode unless --all is given)
    Run {
        /// Process every target, not just the test-mode sample
        #[arg(long)]
        all: bool,
        /// After the primary pass, retry eligible failures automatically
        #[arg(long)]
        auto_retry: bool,
    },
    /// Process only the stored retry candidates
    Retry,
    /// Reset attempt counts on failed targets
    ResetRetry,
    /// Show progress statistics
    Stats,
    /// Dump recent error-message samples
    DebugErrors,
    /// Resolve a single target and show what the upstream reports
    Check {
        /// Handle or numeric id, per the target list's format
        target: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(error.exit_code());
        }
    };

    init_tracing(&config);
    tracing::info!(version = %version::version(), "blockhaus starting");

    if let Err(error) = dispatch(cli, config).await {
        tracing::error!(%error, "run failed");
        if matches!(error, AppError::Auth(_)) {
            eprintln!("authentication failed: refresh the cookie jar and re-run");
        }
        std::process::exit(error.exit_code());
    }
}

/// Layered config plus CLI overrides (flags beat env beats file).
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load()?;

    if let Some(path) = &cli.cookies {
        config.paths.cookies = path.clone();
    }
    if let Some(path) = &cli.targets {
        config.paths.targets = path.clone();
    }
    if let Some(path) = &cli.db {
        config.paths.database = path.clone();
    }
    if let Some(path) = &cli.cache_dir {
        config.paths.cache_dir = path.clone();
    }
    if let Some(delay) = cli.delay {
        if delay < 0.0 {
            return Err(AppError::Config("--delay must not be negative".to_string()));
        }
        config.run.delay_secs = delay;
    }
    if cli.enable_forwarded_for {
        config.api.enable_forwarded_for = true;
    }
    if cli.disable_header_enhancement {
        config.api.enable_header_enhancement = false;
    }

    Ok(config)
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn dispatch(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command.unwrap_or(Command::Run {
        all: false,
        auto_retry: false,
    }) {
        Command::Run { all, auto_retry } => {
            let list = config::load_target_list(&config.paths.targets)?;
            let max_targets = if all {
                cli.max_targets
            } else {
                // Test mode: a small sample unless an explicit limit is given.
                Some(cli.max_targets.unwrap_or(config.run.test_mode_limit))
            };

            let options = RunOptions {
                batch_size: config.run.batch_size,
                delay: Duration::from_secs_f64(config.run.delay_secs),
                max_targets,
                auto_retry,
                retry_ceiling: config.run.retry_ceiling,
                auto_retry_ceiling: config.run.auto_retry_ceiling,
            };

            let context = AppContext::new(config, shutdown_token()).await?;
            verify_session(&context).await?;
            let run_stats = context.manager().run(&list, &options).await?;

            tracing::info!(
                processed = run_stats.processed,
                blocked = run_stats.blocked,
                skipped = run_stats.skipped,
                errors = run_stats.errors,
                "run complete"
            );

            let report =
                stats::build_report(&context.db, &list, context.config.run.retry_ceiling).await?;
            println!("{}", report.render());
            Ok(())
        }
        Command::Retry => {
            let options = RunOptions {
                batch_size: config.run.batch_size,
                delay: Duration::from_secs_f64(config.run.delay_secs),
                max_targets: cli.max_targets,
                auto_retry: false,
                retry_ceiling: config.run.retry_ceiling,
                auto_retry_ceiling: config.run.auto_retry_ceiling,
            };

            let context = AppContext::new(config, shutdown_token()).await?;
            verify_session(&context).await?;
            let session_id = context.db.start_session(0).await?;
            let run_stats = context.manager().run_retries(&options, session_id).await?;
            context.db.complete_session(session_id).await?;

            tracing::info!(
                processed = run_stats.processed,
                blocked = run_stats.blocked,
                errors = run_stats.errors,
                "retry pass complete"
            );
            Ok(())
        }
        Command::ResetRetry => {
            let db = Database::open(&config.paths.database).await?;
            let affected = db.reset_attempts(None).await?;
            println!("reset attempt counts on {affected} failed targets");
            Ok(())
        }
        Command::Stats => {
            let db = Database::open(&config.paths.database).await?;
            let list = config::load_target_list(&config.paths.targets)?;
            let report = stats::build_report(&db, &list, config.run.retry_ceiling).await?;
            println!("{}", report.render());
            Ok(())
        }
        Command::DebugErrors => {
            let db = Database::open(&config.paths.database).await?;
            println!("{}", stats::render_error_samples(&db, 20).await?);
            Ok(())
        }
        Command::Check { target } => {
            let list = config::load_target_list(&config.paths.targets)?;
            let context = AppContext::new(config, shutdown_token()).await?;
            context.manager().check_target(&target, list.format).await?;
            Ok(())
        }
    }
}

/// Confirm the session is usable and log the caller identity before any
/// block traffic. A failed verification is not fatal on its own; a stale
/// session will surface as AuthError on the first real call.
async fn verify_session(context: &AppContext) -> Result<()> {
    match context.client.verify_credentials().await? {
        blockhaus::api::CallOutcome::Ok(body) => {
            let caller = body
                .get("screen_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            tracing::info!(caller, "session verified");
        }
        blockhaus::api::CallOutcome::Failed(info) => {
            tracing::warn!(?info, "credential verification failed, continuing");
        }
    }
    Ok(())
}

/// Cancellation token wired to SIGINT/SIGTERM. Delays and rate-limit
/// waits observe it; the in-flight call and its outcome commit finish
/// before exit.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("termination signal received, finishing in-flight work");
        signal_token.cancel();
    });

    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
