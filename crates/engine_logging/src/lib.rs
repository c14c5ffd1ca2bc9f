#![deny(missing_docs)]
//! Shared logging utilities for the scrape workspace.
//!
//! This crate provides the `engine_*` logging macros used across the codebase,
//! run tags that let log lines from concurrent orchestration runs be told
//! apart, and a minimal test initializer for the global logger.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Short process-unique label for one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunTag(u64);

impl RunTag {
    /// Allocates the next tag. Tags are strictly increasing within a process.
    pub fn next() -> Self {
        RunTag(NEXT_RUN.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value of the tag.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:04}", self.0)
    }
}

/// Logs a trace-level message using the global logging facade.
#[macro_export]
macro_rules! engine_trace {
    ($($arg:tt)*) => {{
        log::trace!($($arg)*);
    }};
}

/// Logs an info-level message using the global logging facade.
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => {{
        log::info!($($arg)*);
    }};
}

/// Logs a debug-level message using the global logging facade.
#[macro_export]
macro_rules! engine_debug {
    ($($arg:tt)*) => {{
        log::debug!($($arg)*);
    }};
}

/// Logs a warn-level message using the global logging facade.
#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => {{
        log::warn!($($arg)*);
    }};
}

/// Logs an error-level message using the global logging facade.
#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
    }};
}

/// Initializes a simple terminal logger for use in tests.
///
/// This safely no-ops if another logger has already been initialized.
pub fn initialize_for_tests() {
    use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};

    // Use debug level in debug builds, info in release builds.
    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    // Ignore the error if a logger was already set by another test.
    let _ = CombinedLogger::init(vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]);
}

#[cfg(test)]
mod tests {
    use super::RunTag;

    #[test]
    fn run_tags_increase_and_format_padded() {
        let first = RunTag::next();
        let second = RunTag::next();
        assert!(second.value() > first.value());
        assert!(first.to_string().starts_with("run-"));
        assert!(first.to_string().len() >= "run-0001".len());
    }
}
