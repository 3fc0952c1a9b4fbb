//! Tracing setup for both binaries.
//!
//! Logs always go to stderr: stdout carries protocol frames in the relay and
//! the worker alike.
//!
//! - `RUST_LOG` set: used as-is
//! - otherwise `HOSTBRIDGE_LOG` picks the level for `hostbridge` targets
//! - `LOG_FORMAT=json` switches to JSON lines

use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_LEVEL_ENV: &str = "HOSTBRIDGE_LOG";

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(default_directives(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    let ansi = std::io::stderr().is_terminal();

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(ansi).with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("hostbridge={level}")
}
