//! Logging system configuration and initialization
//!
//! - Console output on stderr (human readable or JSON)
//! - Optional daily rolling log file written through a non-blocking appender
//! - `RUST_LOG` overrides the configured level when set

use anyhow::{Context, Result};
use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

/// Log file prefix; the rolling appender appends the date
pub const LOG_FILE_PREFIX: &str = "deckvault.log";

/// Local wall-clock timestamps with millisecond precision
struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds the level filter.
///
/// Dependency targets are held at `warn`/`info` unless `trace` was requested,
/// so SQL statements and HTTP internals do not drown the pipeline logs.
pub fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(level).with_context(|| format!("Invalid log level '{level}'"))?;
    if !level.to_lowercase().contains("trace") {
        for directive in [
            "sqlx::query=warn",
            "sqlx::sqlite=warn",
            "reqwest=info",
            "hyper=warn",
            "hyper_util=warn",
            "h2=warn",
            "rustls=warn",
        ] {
            filter = filter.add_directive(directive.parse()?);
        }
    }
    Ok(filter)
}

/// Initialize logging with the given configuration.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the lifetime of the process.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_env_filter(&config.level)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.file_output {
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("Failed to create log directory {}", config.directory.display()))?;
        let (file_writer, file_guard) = non_blocking(rolling::daily(&config.directory, LOG_FILE_PREFIX));
        guard = Some(file_guard);

        let file_layer = fmt::Layer::new()
            .with_writer(file_writer)
            .with_timer(LocalTimeFormatter)
            .with_target(true)
            .with_ansi(false);
        layers.push(if config.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        });
    }

    if config.console_output {
        let console_layer = fmt::Layer::new()
            .with_writer(std::io::stderr)
            .with_timer(LocalTimeFormatter)
            .with_target(false);
        layers.push(if config.json_format {
            console_layer.json().boxed()
        } else {
            console_layer.boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(level = %config.level, file = config.file_output, "Logging initialized");
    Ok(guard)
}
