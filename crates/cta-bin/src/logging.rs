//! Subscriber setup for the `cta` binary.
//!
//! Everything is written to stderr so stdout stays free for command output
//! (`cta config`, `cta sources`). `RUST_LOG`, when set, takes precedence over
//! the `--log-level` flag.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, coloured.
    Pretty,
    /// One line per event, no colours.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Line format.
    pub format: LogFormat,
}

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid log level '{level}', expected one of trace, debug, info, warn, error"
        )),
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

fn filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Another subscriber (or `log` logger) was installed first.
fn already_set(e: &impl std::fmt::Display) -> bool {
    let message = e.to_string();
    message.contains("has already been set") || message.contains("already initialized")
}

/// Install the global subscriber. Calling it again is a no-op.
pub fn init(config: LogConfig) -> Result<(), String> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let env_filter = filter(config.level);
    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter),
            )
            .try_init(),
    };
    result.or_else(|e| {
        if already_set(&e) {
            Ok(())
        } else {
            Err(format!("failed to initialize logging: {e}"))
        }
    })
}
