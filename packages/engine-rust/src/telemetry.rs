//! Tracing subscriber setup for processes embedding the engine.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the host, which may call [`init_tracing`] once at startup.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset, e.g.
    /// `"info,switchyard_engine=debug"`.
    pub filter: String,
    pub format: LogFormat,
    /// JSON only: attach the current span and span list to each event.
    pub with_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            with_spans: true,
        }
    }
}

/// Builds the filter: `RUST_LOG` if set, else `config.filter`.
fn filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .with_context(|| format!("invalid log filter `{}`", config.filter)),
    }
}

/// Installs a global `tracing` subscriber.
///
/// # Errors
///
/// Fails if the filter directives do not parse or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = filter(config)?;
    let output = match config.format {
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(config.with_spans)
            .with_span_list(config.with_spans)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!(format = ?config.format, "tracing initialized");
    Ok(())
}
