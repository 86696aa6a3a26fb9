//! CLI entry point for the instrument supervisor.
//!
//! Loads `config/supervisor.toml` (or `--config`), brings up every enabled
//! instrument with the built-in simulated drivers, arms the timed ones, and runs
//! until Ctrl+C or `--run-for` seconds have passed.
//!
//! ```bash
//! inst-supervisor --config config/supervisor.toml --trigger Manual --run-for 5
//! ```

use anyhow::Result;
use clap::Parser;
use inst_supervisor::config::SupervisorConfig;
use inst_supervisor::drivers::builtin_catalog;
use inst_supervisor::logging::init_tracing;
use inst_supervisor::{ShutdownTarget, Supervisor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "inst-supervisor")]
#[command(about = "Run a set of instruments and route triggers to them", long_about = None)]
struct Cli {
    /// Supervisor configuration file
    #[arg(long, default_value = "config/supervisor.toml")]
    config: PathBuf,

    /// Trigger source to dispatch once everything is loaded (repeatable)
    #[arg(long = "trigger", value_name = "TAG")]
    triggers: Vec<String>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SupervisorConfig::load_from(&cli.config)?;
    init_tracing(&config.application.log_level)?;
    info!(application = %config.application.name, config = %cli.config.display(), "Starting");

    let catalog = builtin_catalog(config.instruments.iter().map(|e| e.name.as_str()));
    let mut supervisor = Supervisor::from_config(&config, catalog);

    let mut errors = supervisor.bus().errors.subscribe();
    tokio::spawn(async move {
        while let Some(event) = errors.recv().await {
            warn!(instrument = %event.name, index = event.index, "{}", event.error);
        }
    });

    let report = supervisor.load_all(&config.instruments, &config.application.data_dir);
    println!("{}", report.summary());
    for failure in &report.failed {
        println!("  {}: {}", failure.name, failure.error);
    }

    for name in supervisor.start_timers() {
        info!(instrument = %name, "Timer armed");
    }

    for tag in &cli.triggers {
        let submitted = supervisor.dispatch_trigger(tag);
        info!(tag = %tag, submitted, "Trigger dispatched");
    }

    match cli.run_for {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            println!("Running - press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    supervisor.flush_all().await?;
    for snapshot in supervisor.snapshots() {
        println!(
            "  [{}] {}: {} ({} acquisitions)",
            snapshot.index, snapshot.name, snapshot.status, snapshot.acquisitions
        );
    }

    supervisor.shutdown(ShutdownTarget::All).await?;
    info!("Shut down");
    Ok(())
}
