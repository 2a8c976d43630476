//! Tracing bootstrap for the smoke binary.

use std::env;

use courier_core::LogLevel;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,courier=info,courier_smoke=debug";

/// Initialize the global tracing subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `COURIER_LOG`
/// 3) a filter derived from `LOG_LEVEL`
/// 4) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("COURIER_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    if let Some(level) = env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
        && let Ok(filter) = EnvFilter::try_new(level_filter(level))
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}

fn level_filter(level: LogLevel) -> String {
    format!("info,courier={level},courier_smoke={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_directives_from_log_level() {
        assert_eq!(
            level_filter(LogLevel::Debug),
            "info,courier=debug,courier_smoke=debug"
        );
        assert!(EnvFilter::try_new(level_filter(LogLevel::Warn)).is_ok());
    }
}
