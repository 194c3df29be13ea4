//! Logging setup for parfs binaries.
//!
//! All crates in the workspace emit diagnostics through `tracing`; this crate
//! owns subscriber construction so every daemon and tool configures logging
//! the same way: an env-filterable console layer plus an optional rolling
//! file layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Re-export the macros so dependents do not need a direct `tracing` dep.
pub use tracing::{debug, error, info, trace, warn};

/// Log file rotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    Daily,
    Never,
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::Hourly
    }
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level filter used when `RUST_LOG` is not set (trace..error).
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files; `None` disables file output.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for rotated log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    /// Emit JSON-formatted events instead of the human format.
    #[serde(default)]
    pub json_format: bool,

    /// Also log to stdout.
    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "parfs".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

/// One event-formatting layer, boxed so console and file sinks can share a
/// single layer list regardless of writer type.
type EventLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn event_layer<W>(json: bool, writer: W) -> EventLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_writer(writer).boxed()
    }
}

/// Install the global subscriber. Call once at startup.
///
/// The returned guard flushes the non-blocking file writer on drop and must
/// outlive the program's logging.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut sinks: Vec<EventLayer> = Vec::new();
    if config.console_output {
        sinks.push(event_layer(config.json_format, std::io::stdout));
    }

    let guard = config.log_dir.as_ref().map(|log_dir| {
        let appender = rolling::RollingFileAppender::builder()
            .rotation(config.rotation.into())
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(log_dir)
            .expect("failed to create rolling file appender");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        sinks.push(event_layer(config.json_format, writer));
        guard
    });

    tracing_subscriber::registry().with(sinks).with(filter).init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "parfs");
        assert_eq!(config.rotation, Rotation::Hourly);
        assert!(config.console_output);
        assert!(!config.json_format);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_rotation_maps_to_appender_policy() {
        assert_eq!(rolling::Rotation::from(Rotation::Hourly), rolling::Rotation::HOURLY);
        assert_eq!(rolling::Rotation::from(Rotation::Daily), rolling::Rotation::DAILY);
        assert_eq!(rolling::Rotation::from(Rotation::Never), rolling::Rotation::NEVER);
    }

    #[test]
    fn test_rotation_from_toml_style_json() {
        let config: LogConfig = serde_json::from_str(r#"{"rotation": "daily"}"#).unwrap();
        assert_eq!(config.rotation, Rotation::Daily);
        // Unspecified fields take defaults.
        assert_eq!(config.level, "info");
    }
}
