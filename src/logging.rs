/// Structured logging for the gauge discovery service
///
/// Provides context-rich logging with gauge identifiers, component tags and
/// severity levels. Events go through `tracing`; `init_logger` installs a
/// `tracing-subscriber` console layer and, for long discovery runs, an
/// append-mode log file.

use crate::model::{ApiError, StrategyKind};
use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Log Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    FloodHub,
    Generator,
    Store,
    Scoring,
    Database,
    System,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::FloodHub => write!(f, "FLOODHUB"),
            LogSource::Generator => write!(f, "GEN"),
            LogSource::Store => write!(f, "STORE"),
            LogSource::Scoring => write!(f, "SCORE"),
            LogSource::Database => write!(f, "DB"),
            LogSource::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected under load - throttling while the limiter adapts
    Expected,
    /// Unexpected failure - indicates service degradation, an API change or a bad key
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Initialization
// ---------------------------------------------------------------------------

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `min_level` when set. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init_logger(
    min_level: LogLevel,
    log_file: Option<&str>,
    console_timestamps: bool,
) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(min_level.as_filter()));

    let console_timed = console_timestamps.then(|| {
        tracing_fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let console_plain = (!console_timestamps).then(|| {
        tracing_fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
    });

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_timed)
        .with(console_plain)
        .with(file_layer)
        .try_init();
    Ok(())
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Log a general informational message
pub fn info(source: LogSource, gauge_id: Option<&str>, message: &str) {
    tracing::info!(source = %source, gauge = gauge_id.unwrap_or("-"), "{}", message);
}

/// Log a warning message
pub fn warn(source: LogSource, gauge_id: Option<&str>, message: &str) {
    tracing::warn!(source = %source, gauge = gauge_id.unwrap_or("-"), "{}", message);
}

/// Log an error message
pub fn error(source: LogSource, gauge_id: Option<&str>, message: &str) {
    tracing::error!(source = %source, gauge = gauge_id.unwrap_or("-"), "{}", message);
}

/// Log a debug message
pub fn debug(source: LogSource, gauge_id: Option<&str>, message: &str) {
    tracing::debug!(source = %source, gauge = gauge_id.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a failed upstream lookup.
///
/// NOT_FOUND never reaches this function: it is the normal outcome for the
/// overwhelming majority of probes and is not a failure.
pub fn classify_probe_failure(err: &ApiError) -> FailureType {
    match err {
        ApiError::Throttled => FailureType::Expected,
        ApiError::Timeout | ApiError::Network(_) => FailureType::Unknown,
        ApiError::ServerError(_) | ApiError::Rejected(_) | ApiError::Malformed { .. } => {
            FailureType::Unexpected
        }
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a failed lookup with automatic classification.
///
/// Malformed bodies are logged together with the raw payload.
pub fn log_probe_failure(gauge_id: &str, operation: &str, err: &ApiError) {
    let failure_type = classify_probe_failure(err);

    let mut message = format!("{} failed [{}]: {}", operation, failure_type, err);
    if let Some(raw) = err.raw_payload() {
        message.push_str(&format!(" | raw payload: {}", raw));
    }
    if matches!(err, ApiError::Rejected(401 | 403)) {
        message.push_str(" | check FLOOD_HUB_API_KEY");
    }

    match failure_type {
        FailureType::Expected => debug(LogSource::FloodHub, Some(gauge_id), &message),
        FailureType::Unexpected => error(LogSource::FloodHub, Some(gauge_id), &message),
        FailureType::Unknown => warn(LogSource::FloodHub, Some(gauge_id), &message),
    }
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Log the outcome counts of one generation strategy.
pub fn log_strategy_summary(strategy: StrategyKind, found: u64, not_found: u64, errors: u64) {
    let total = found + not_found + errors;
    let hit_rate = if total == 0 {
        0.0
    } else {
        found as f64 / total as f64 * 100.0
    };
    let message = format!(
        "Strategy {}: {}/{} found, {} not found, {} errors (hit rate {:.3}%)",
        strategy, found, total, not_found, errors, hit_rate
    );

    if errors == 0 {
        info(LogSource::Generator, None, &message);
    } else if errors == total {
        error(LogSource::Generator, None, &message);
    } else {
        warn(LogSource::Generator, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(classify_probe_failure(&ApiError::Throttled), FailureType::Expected);
        assert_eq!(classify_probe_failure(&ApiError::Timeout), FailureType::Unknown);
        assert_eq!(
            classify_probe_failure(&ApiError::ServerError(500)),
            FailureType::Unexpected
        );
        let malformed = ApiError::Malformed {
            reason: "expected value".into(),
            raw: "<html>".into(),
        };
        assert_eq!(classify_probe_failure(&malformed), FailureType::Unexpected);
    }

    #[test]
    fn test_filter_strings_match_tracing_levels() {
        assert_eq!(LogLevel::Warning.as_filter(), "warn");
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}
