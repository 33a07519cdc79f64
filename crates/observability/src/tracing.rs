//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Output format for the process log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production default).
    #[default]
    Json,
    /// Human-readable lines for local development.
    Pretty,
}

impl LogFormat {
    /// Parse `json` / `pretty` (case-insensitive); anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initialize tracing with JSON output and an `info` fallback filter.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with("info", LogFormat::Json);
}

/// Initialize tracing.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` is used.
pub fn init_with(default_filter: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.with_target(true).try_init(),
    };
}
