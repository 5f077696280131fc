//! Tracing and logging support.
//!
//! The `weave` binary owns the subscriber; library crates only emit events.
//! Output goes to stderr so command results on stdout stay parseable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Human-readable format with colors.
    Pretty,

    /// Compact single-line format (default for the CLI).
    Compact,

    /// JSON lines, one event per line.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread IDs in output.
    pub thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

impl TracingConfig {
    /// Configuration for the global `--verbose` / `--log-format` flags
    pub fn from_flags(verbose: bool, format: TracingFormat) -> Self {
        Self {
            level: verbose.then_some(tracing::Level::DEBUG),
            format,
            // Machine-readable output keeps its timestamps
            timestamps: verbose || format == TracingFormat::Json,
            target: verbose,
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(self.target)
            .with_thread_ids(self.thread_ids);

        match (self.format, self.timestamps) {
            (TracingFormat::Pretty, true) => layer.pretty().boxed(),
            (TracingFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (TracingFormat::Compact, true) => layer.compact().boxed(),
            (TracingFormat::Compact, false) => layer.compact().without_time().boxed(),
            (TracingFormat::Json, true) => layer.json().boxed(),
            (TracingFormat::Json, false) => layer.json().without_time().boxed(),
        }
    }
}

/// Initialize tracing subscriber with default settings.
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs
/// - `RUST_LOG=weave_plugin_host=trace` - Per-crate filtering
pub fn init_subscriber() {
    init_subscriber_with_config(TracingConfig::default());
}

/// Initialize tracing subscriber with custom configuration.
///
/// A second call is ignored, so tests may initialise freely.
///
/// # Example
///
/// ```ignore
/// use weave_cli::tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};
///
/// init_subscriber_with_config(TracingConfig {
///     format: TracingFormat::Json,
///     ..Default::default()
/// });
/// ```
pub fn init_subscriber_with_config(config: TracingConfig) {
    let _ = tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.format, TracingFormat::Compact);
        assert!(config.timestamps);
        assert!(config.target);
        assert!(!config.thread_ids);
        assert!(config.level.is_none());
    }

    #[test]
    fn test_from_flags() {
        let verbose = TracingConfig::from_flags(true, TracingFormat::Pretty);
        assert_eq!(verbose.level, Some(tracing::Level::DEBUG));
        assert!(verbose.target);

        let json = TracingConfig::from_flags(false, TracingFormat::Json);
        assert!(json.level.is_none());
        assert!(json.timestamps);
        assert!(!json.target);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_subscriber_with_config(TracingConfig::from_flags(false, TracingFormat::Compact));
        init_subscriber();
    }
}
