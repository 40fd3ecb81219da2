//! Logging setup for the EMA runtime.
//!
//! One fmt subscriber with an env-filter: `RUST_LOG` wins, otherwise
//! the configured default level applies.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by the RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides, e.g. ("ema_engine", Level::DEBUG).
    pub module_levels: Vec<(String, Level)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn with_level(level: Level) -> Self {
        Self {
            log_level: level,
            ..Default::default()
        }
    }

    fn build_filter(&self) -> EnvFilter {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    }
}

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = config.build_filter();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Parse a CLI log-level string, defaulting to INFO on junk input.
pub fn parse_level(s: &str) -> Level {
    s.parse().unwrap_or(Level::INFO)
}
