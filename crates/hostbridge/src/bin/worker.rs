//! Generation worker. Spawned by the relay, or run directly as a native host
//! with `--framing length`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use hostbridge::config::{BridgeConfig, CommandConfig};
use hostbridge::{CancellationToken, Framing, Generator, logging, run_worker};

#[derive(Parser, Debug)]
#[command(name = "hostbridge-worker", version, about)]
struct Args {
    #[arg(long, env = "HOSTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Framing on stdin/stdout
    #[arg(long, value_enum, default_value_t = FramingArg::Lines)]
    framing: FramingArg,

    /// Generator program, replacing the configured command
    #[arg(long, env = "HOSTBRIDGE_GENERATOR")]
    generator: Option<String>,

    /// Argument for the generator program (repeatable, `{prompt}` is substituted)
    #[arg(long = "generator-arg", allow_hyphen_values = true, requires = "generator")]
    generator_args: Vec<String>,

    /// Pause between streamed words in milliseconds
    #[arg(long)]
    pace_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    Lines,
    Length,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Lines => Framing::Lines,
            FramingArg::Length => Framing::LengthPrefixed,
        }
    }
}

fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let args = Args::parse();

    let (config, _) =
        BridgeConfig::discover(args.config.as_deref()).context("failed to load configuration")?;
    let mut generation = config.generation;
    if let Some(program) = args.generator {
        generation.command = Some(CommandConfig {
            program,
            args: args.generator_args,
        });
    }
    if let Some(pace_ms) = args.pace_ms {
        generation.pace_ms = pace_ms;
    }

    let worker_config = generation
        .worker_config()
        .with_framing(args.framing.into())
        .with_max_frame_bytes(config.relay.max_frame_bytes);
    let generator: Arc<dyn Generator> = Arc::new(generation.command_generator());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let shutdown = CancellationToken::new();
    let result = runtime.block_on(async {
        tokio::spawn(shutdown_signal(shutdown.clone()));
        run_worker(
            generator,
            worker_config,
            tokio::io::stdin(),
            tokio::io::stdout(),
            shutdown,
        )
        .await
    });

    // The blocking stdin reader can outlive the loop after a signal.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result.context("worker failed")
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
