use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sitelens_config::{CliOverrides, Config, ConfigLoader};
use sitelens_core::ScanStatus;
use sitelens_server::{
    AppState,
    ci::{self, CiReport, EXIT_FATAL},
    create_app,
    infra::startup,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "sitelens")]
#[command(about = "Audit every page of a site and gate CI on score budgets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Configuration file (TOML or JSON); overrides SITELENS_CONFIG_PATH
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Site root to scan (overrides config)
    #[arg(long, global = true)]
    site: Option<String>,

    /// Number of concurrent route workers (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan the site and serve live reports over HTTP (default)
    Serve(ServeArgs),
    /// Scan the site once and exit non-zero when the budget fails
    Ci(CiArgs),
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
struct CiArgs {
    /// Write the budget result as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_config(global: &GlobalArgs, serve: Option<&ServeArgs>) -> anyhow::Result<Config> {
    let overrides = CliOverrides {
        site: global.site.clone(),
        host: serve.and_then(|s| s.host.clone()),
        port: serve.and_then(|s| s.port),
        concurrency: global.concurrency,
    };
    let mut loader = ConfigLoader::new().with_overrides(overrides);
    if let Some(path) = &global.config {
        loader = loader.with_config_path(path);
    }
    let config = loader
        .load()
        .context("failed to load configuration")?
        .into_config();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    startup::init_tracing();

    match cli.command {
        Some(Command::Ci(args)) => {
            let config = match load_config(&cli.global, None) {
                Ok(config) => config,
                Err(err) => {
                    error!("{err:#}");
                    return Ok(ExitCode::from(EXIT_FATAL));
                }
            };
            run_ci(config, args).await
        }
        Some(Command::Serve(args)) => {
            let config = load_config(&cli.global, Some(&args))?;
            run_server(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let args = ServeArgs::default();
            let config = load_config(&cli.global, Some(&args))?;
            run_server(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let history = startup::history_store().await?;
    let runtime = startup::build_runtime(&config, history).await?;

    let state = AppState::new(Arc::clone(&config), runtime.clone());
    let shutdown = CancellationToken::new();
    let forwarder = state.start_live_forwarder(shutdown.clone());

    let scan = runtime.clone();
    let scan_task = tokio::spawn(async move {
        match scan.run().await {
            Ok(session) => info!(
                scan = %session.id,
                status = session.status.as_str(),
                scanned = session.scanned_count,
                failed = session.failed_count,
                "scan finished"
            ),
            Err(err) => error!(error = %err, "scan did not run"),
        }
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address()))?;
    info!(
        "Starting sitelens for {} on http://{}",
        config.scan.site,
        listener.local_addr()?
    );

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    runtime.shutdown().await;
    shutdown.cancel();
    let _ = scan_task.await;
    let _ = forwarder.await;
    Ok(())
}

async fn run_ci(config: Config, args: CiArgs) -> anyhow::Result<ExitCode> {
    let history = startup::history_store().await?;
    let runtime = match startup::build_runtime(&config, history).await {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("{err:#}");
            return Ok(ExitCode::from(EXIT_FATAL));
        }
    };

    let interrupt = runtime.clone();
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupted; cancelling scan");
        interrupt.cancel();
    });

    let session = match runtime.run().await {
        Ok(session) => session,
        Err(err) => {
            error!(error = %err, "scan failed");
            watcher.abort();
            runtime.shutdown().await;
            return Ok(ExitCode::from(EXIT_FATAL));
        }
    };
    watcher.abort();

    let reports = runtime.reports();
    let result = runtime.evaluate_budget();
    let problems = ci::route_problems(&reports);
    print!("{}", ci::render_summary(&session, &problems, &result));

    if let Some(path) = &args.output {
        ci::write_report(
            path,
            &CiReport {
                session: &session,
                budget: &result,
                problems,
            },
        )?;
        info!(path = %path.display(), "budget result written");
    }

    runtime.shutdown().await;
    if session.status != ScanStatus::Complete {
        warn!(status = session.status.as_str(), "scan did not complete; budget verdict withheld");
        return Ok(ExitCode::from(EXIT_FATAL));
    }
    Ok(ExitCode::from(result.exit_code() as u8))
}
