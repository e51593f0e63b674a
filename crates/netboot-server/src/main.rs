use clap::Parser;
use netboot_core::{install_signal_handler, shutdown_requested, NetbootConfig, Orchestrator};
use netboot_provision::{check_converter_prereqs, check_provisioner_prereqs, format_missing};
use netboot_server::{bind, serve, App, ServeError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "netbootd",
    version,
    about = "Boot session orchestrator for diskless network-booted machines"
)]
struct Cli {
    /// Configuration file (default: /etc/netboot/netboot.toml when present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.listen` from the configuration.
    #[arg(long)]
    listen: Option<String>,

    /// Override `state_dir` from the configuration.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("NETBOOT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    install_signal_handler();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ServeError> {
    let mut config = NetbootConfig::load_or_default(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    let mut missing = check_provisioner_prereqs(&config.provisioner);
    missing.extend(check_converter_prereqs(&config.converter));
    if !missing.is_empty() {
        warn!("{}", format_missing(&missing));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let orch = runtime.block_on(async {
        let orch = Orchestrator::open(&config)?;
        let report = orch.recover().await?;
        if !report.failed_sessions.is_empty() || !report.deactivated_targets.is_empty() {
            warn!(
                "recovered from unclean shutdown: {} session(s) failed, {} target(s) deactivated",
                report.failed_sessions.len(),
                report.deactivated_targets.len()
            );
        }
        Ok::<_, ServeError>(orch)
    })?;

    let shutdown = CancellationToken::new();
    let sweeper = {
        let _guard = runtime.enter();
        orch.spawn_liveness_sweeper(shutdown.clone())
    };

    let server = bind(&config.server.listen)?;
    info!(
        "netbootd listening on {} (state in {})",
        config.server.listen,
        config.state_dir.display()
    );
    let app = App::new(orch, runtime.handle().clone());
    serve(&app, &server, Duration::from_millis(250), shutdown_requested);

    shutdown.cancel();
    if let Err(e) = runtime.block_on(sweeper) {
        warn!("liveness sweeper ended abnormally: {e}");
    }
    info!("netbootd stopped");
    Ok(())
}
