//! Native messaging host launched by the browser.
//!
//! stdin/stdout belong to the browser; logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hostbridge::config::{BridgeConfig, CONFIG_ENV};
use hostbridge::{RelayConfig, logging, run_relay};

#[derive(Parser, Debug)]
#[command(name = "hostbridge-relay", version, about, ignore_errors = true)]
struct Args {
    /// Config file (also handed to the worker)
    #[arg(long, env = "HOSTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Worker executable
    #[arg(long, env = "HOSTBRIDGE_WORKER")]
    worker: Option<PathBuf>,

    /// Extra argument for the worker (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Caller origin and window handle passed by the browser
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    browser_args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let args = Args::parse();
    if !args.browser_args.is_empty() {
        tracing::debug!(browser_args = ?args.browser_args, "Ignoring browser arguments");
    }

    let (config, config_path) =
        BridgeConfig::discover(args.config.as_deref()).context("failed to load configuration")?;

    let mut settings = config.relay;
    if let Some(worker) = args.worker {
        settings.worker = Some(worker);
    }
    if !args.worker_args.is_empty() {
        settings.worker_args = args.worker_args;
    }

    let mut command = settings.worker_command();
    if let Some(path) = &config_path {
        command = command.with_env(CONFIG_ENV, path.to_string_lossy());
    }

    let relay_config = RelayConfig::new(command)
        .with_max_frame_bytes(settings.max_frame_bytes)
        .with_shutdown_grace(settings.shutdown_grace());
    tracing::info!(worker = %relay_config.command.program.display(), "Relay starting");

    run_relay(tokio::io::stdin(), tokio::io::stdout(), relay_config)
        .await
        .context("relay failed")?;

    tracing::info!("Relay stopped");
    Ok(())
}
