//! coremesh CLI - supervise local proxy cores behind one edge proxy
//!
//! This is the CLI binary driving the coremesh library's run controller.

mod cli;
mod output;

use chrono::Utc;
use clap::Parser;
use cli::{Cli, Commands, DetectEndpointArgs, RunArgs};
use coremesh::assets::{self, GeoDownloader, HttpDownloader};
use coremesh::logsink::{open_append, APP_LOG_FILE_NAME};
use coremesh::system_proxy::detect_endpoint;
use coremesh::{
    validate, CoreMeshError, ProcessSupervisor, Result, RunController, RunPlan, ShutdownSignal,
    ShutdownTrigger, StateFile, SupervisorOptions, SystemProxyController, TokioLauncher,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Conf dir name under the home directory.
const DEFAULT_CONF_DIR_NAME: &str = ".v2n_coremesh";

fn main() {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run(args) => Some(conf_dir(args).join(APP_LOG_FILE_NAME)),
        Commands::DetectEndpoint(_) => None,
    };
    init_logging(cli.verbose, log_file.as_deref());

    if let Err(e) = run(cli) {
        eprintln!("{}", failure_message(&e));
        std::process::exit(1);
    }
}

/// The single stderr line for a failed command. The stderr log layer is not
/// used for it, so the error is not printed twice.
fn failure_message(e: &CoreMeshError) -> String {
    format!("coremesh: {}", e)
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => {
            output::print_banner(cli.silent);
            run_supervised(args, cli.verbose, cli.silent)
        }
        Commands::DetectEndpoint(args) => run_detect_endpoint(args),
    }
}

/// Initialize logging to stderr and, when given, to an append-only log file
///
/// `RUST_LOG` wins over `-v`. A log file that cannot be opened is reported
/// and skipped.
fn init_logging(verbose: u8, log_file: Option<&Path>) {
    let default_filter = match verbose {
        0 => "coremesh=info",
        1 => "coremesh=debug",
        _ => "coremesh=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (file_layer, file_error) = match log_file.map(|path| (path, open_append(path))) {
        Some((_, Ok(file))) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Some((path, Err(e))) => (None, Some(format!("{}: {}", path.display(), e))),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    if let Some(reason) = file_error {
        warn!("Application log file unavailable, logging to stderr only: {}", reason);
    }
}

/// `--conf-dir`, or `~/.v2n_coremesh`
fn conf_dir(args: &RunArgs) -> PathBuf {
    args.conf_dir.clone().unwrap_or_else(default_conf_dir)
}

fn default_conf_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CONF_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_DIR_NAME))
}

/// Load the parsed state and supervise one run until it ends
fn run_supervised(args: RunArgs, verbose: u8, silent: bool) -> Result<()> {
    let plan = prepare_run(&args, &HttpDownloader::default())?;
    output::print_plan(&plan, verbose, silent);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let outcome = runtime.block_on(async {
        let (trigger, shutdown) = ShutdownSignal::channel();
        tokio::spawn(forward_shutdown_signals(trigger));

        let controller = RunController::new(
            ProcessSupervisor::new(TokioLauncher, SupervisorOptions::default()),
            SystemProxyController::for_platform(),
        );
        controller.run(&plan, shutdown).await
    });

    output::print_outcome(&outcome, silent);
    outcome.into_result()
}

/// Everything before the first spawn: load state, refresh geo assets,
/// validate, and build the plan
fn prepare_run(args: &RunArgs, downloader: &dyn GeoDownloader) -> Result<RunPlan> {
    let conf_dir = conf_dir(args);
    let state = StateFile::load_for_run(&conf_dir)?;
    info!(
        conf_dir = %conf_dir.display(),
        parsed_at = %state.parsed_at,
        cores = state.config.cores.len(),
        "Loaded run state"
    );

    let asset_dir = args.asset_dir.clone().unwrap_or_else(|| conf_dir.clone());
    assets::ensure_geo_files(&asset_dir, Utc::now(), downloader)?;
    validate::for_run(&state.config)?;

    state.config.run_plan(Some(&asset_dir))
}

fn run_detect_endpoint(args: DetectEndpointArgs) -> Result<()> {
    let endpoint = detect_endpoint(&args.config)?;
    output::print_endpoint(&endpoint);
    Ok(())
}

/// Fire `trigger` on Ctrl-C, or SIGTERM on unix
async fn forward_shutdown_signals(trigger: ShutdownTrigger) {
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    trigger.trigger();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    ctrl_c().await;
}

/// Resolve on Ctrl-C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
