//! Luigi - multi-agent coding orchestrator
//!
//! CLI entry point: load config, wire the abort signal, and run or resume
//! a task.

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use luigi::cli::{Cli, EXIT_CONFIG};
use luigi::config::Config;
use luigi::orchestrator::Orchestrator;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match Config::load(cli.config.as_ref()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("luigi: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let repo = cli.repo.canonicalize().context("repository path does not exist")?;
    let orchestrator = Orchestrator::new(config);

    // Ctrl-c propagates one cancellation to every in-flight task
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt; aborting run");
            let _ = cancel.send(true);
        }
    });

    let report = match &cli.resume_run_id {
        Some(run_id) => orchestrator.resume(run_id).await?,
        None => {
            let task = cli.task.clone().unwrap_or_else(|| ".".to_string());
            orchestrator.run(&repo, Some(task)).await?
        }
    };

    println!("run {} {}", report.run_id, report.status);
    if let Some(failure) = &report.failure {
        eprintln!("luigi: {}: {}", failure.kind, failure.message);
    }
    std::process::exit(report.exit_code());
}
