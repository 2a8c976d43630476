use std::fmt::Display;

use crate::config::{ConfigHandle, LogLevel};

const TARGET: &str = "courier";

/// Level-gated diagnostics on top of `tracing`.
///
/// Every call reads the live config snapshot, so a level change published via
/// [`ConfigHandle`] takes effect on the next message.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLogger {
    config: ConfigHandle,
}

impl DiagnosticLogger {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    /// Whether a message at `level` passes the configured threshold.
    pub fn should_log(&self, level: LogLevel) -> bool {
        level <= self.config.load().debug.log_level
    }

    pub fn error(&self, message: impl Display) {
        let enabled = self.config.load().debug.enable_error_logging;
        if enabled && self.should_log(LogLevel::Error) {
            tracing::error!(target: TARGET, "{message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        if self.should_log(LogLevel::Warn) {
            tracing::warn!(target: TARGET, "{message}");
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.should_log(LogLevel::Info) {
            tracing::info!(target: TARGET, "{message}");
        }
    }

    pub fn debug(&self, message: impl Display) {
        if self.should_log(LogLevel::Debug) {
            tracing::debug!(target: TARGET, "{message}");
        }
    }

    /// Timing and cache-efficiency notes, independent of the level threshold.
    pub fn performance(&self, message: impl Display) {
        if self.performance_enabled() {
            tracing::info!(target: "courier::performance", "{message}");
        }
    }

    /// Identifier resolution traces, independent of the level threshold.
    pub fn lid(&self, message: impl Display) {
        if self.config.load().debug.enable_lid_logging {
            tracing::debug!(target: "courier::lid", "{message}");
        }
    }

    pub fn performance_enabled(&self) -> bool {
        self.config.load().debug.enable_performance_logging
    }
}
