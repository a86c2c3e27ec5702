use tracing_subscriber::EnvFilter;

use crate::app::models::LogTag;
use crate::app::sinks::LogSink;

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(default_level)));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    }
}

fn normalize_level(level: &str) -> String {
    match level.trim().to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "" => "info".to_string(),
        other => other.to_string(),
    }
}

/// Log sink for headless runs: every engine log line becomes a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, text: &str, tag: LogTag) {
        match tag {
            LogTag::Error => tracing::error!(tag = %tag, "{text}"),
            LogTag::Warning => tracing::warn!(tag = %tag, "{text}"),
            LogTag::Raw => tracing::debug!(tag = %tag, "{text}"),
            LogTag::Info | LogTag::Success => tracing::info!(tag = %tag, "{text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_legacy_level_names() {
        assert_eq!(normalize_level("INFO"), "info");
        assert_eq!(normalize_level("WARNING"), "warn");
        assert_eq!(normalize_level("critical"), "error");
        assert_eq!(normalize_level("  "), "info");
    }
}
