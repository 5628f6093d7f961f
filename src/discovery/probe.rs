/// Probe executor
///
/// Resolves one candidate against the lookup API under the shared rate
/// limiter and retry policy. Every upstream request, including the model
/// fetch for found gauges, passes through the limiter first.

use super::ratelimit::RateLimiter;
use crate::config::RetryConfig;
use crate::ingest::floodhub::{thresholds_from_model, to_gauge_record};
use crate::ingest::{Lookup, LookupApi};
use crate::logging::{self, LogSource};
use crate::model::{ApiError, Candidate, FloodThresholds, GaugeRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Bounded exponential backoff between attempts of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Classified result of probing one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// `record.thresholds` is filled when the gauge has a usable model.
    Found { record: GaugeRecord, raw: String },
    NotFound,
    /// All attempts failed; `error` is the last failure seen.
    TransientError { error: ApiError },
}

pub struct ProbeExecutor {
    api: Arc<dyn LookupApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl ProbeExecutor {
    pub fn new(api: Arc<dyn LookupApi>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            api,
            limiter,
            retry,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn probe(&self, candidate: &Candidate) -> ProbeOutcome {
        let id = candidate.gauge_id.as_str();
        let lookup = self.with_retry(id, "gauge lookup", || self.api.get_gauge(id));

        match lookup {
            Ok(Lookup::Found { value, raw }) => {
                let mut record = to_gauge_record(value, Utc::now());
                if record.gauge_id != id {
                    logging::warn(
                        LogSource::FloodHub,
                        Some(id),
                        &format!("Lookup answered with gaugeId {}", record.gauge_id),
                    );
                    record.gauge_id = id.to_string();
                }
                if record.has_model {
                    record.thresholds = self.fetch_thresholds(id).unwrap_or_else(|e| {
                        logging::warn(
                            LogSource::FloodHub,
                            Some(id),
                            &format!("Gauge found but thresholds unavailable: {}", e),
                        );
                        None
                    });
                }
                logging::info(
                    LogSource::FloodHub,
                    Some(id),
                    &format!(
                        "FOUND via {} ({}, {})",
                        candidate.strategy,
                        record.source,
                        record.site_name.as_deref().unwrap_or("unnamed")
                    ),
                );
                ProbeOutcome::Found { record, raw }
            }
            Ok(Lookup::NotFound) => ProbeOutcome::NotFound,
            Err(error) => ProbeOutcome::TransientError { error },
        }
    }

    /// Thresholds from the model endpoint, `None` if the gauge has no usable
    /// model.
    pub fn fetch_thresholds(&self, gauge_id: &str) -> Result<Option<FloodThresholds>, ApiError> {
        let model = self.with_retry(gauge_id, "model lookup", || {
            self.api.get_gauge_model(gauge_id)
        })?;
        let thresholds = model.into_value().and_then(|m| thresholds_from_model(&m));
        if thresholds.is_none() {
            logging::debug(
                LogSource::FloodHub,
                Some(gauge_id),
                "Model has no ordered warning/danger thresholds",
            );
        }
        Ok(thresholds)
    }

    fn with_retry<T>(
        &self,
        gauge_id: &str,
        operation: &str,
        call: impl Fn() -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut attempt = 1;
        loop {
            self.limiter.acquire();
            match call() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.is_throttle() {
                        self.limiter.report_throttle();
                    }
                    logging::log_probe_failure(
                        gauge_id,
                        &format!("{} (attempt {}/{})", operation, attempt, self.retry.max_attempts),
                        &err,
                    );
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    std::thread::sleep(self.retry.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev_mode::ReplayApi;
    use crate::ingest::fixtures;
    use crate::model::StrategyKind;

    fn executor(api: Arc<ReplayApi>, max_attempts: u32) -> ProbeExecutor {
        let limiter = Arc::new(RateLimiter::new(
            1_000,
            Duration::from_secs(60),
            Duration::from_secs(60),
            3,
        ));
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        ProbeExecutor::new(api, limiter, retry)
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            gauge_id: id.to_string(),
            strategy: StrategyKind::Cluster,
            attempt: 1,
        }
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[test]
    fn test_found_gauge_carries_thresholds() {
        let api = Arc::new(
            ReplayApi::new()
                .with_gauge("hybas_4120570410", fixtures::GAUGE_TARBELA)
                .with_model("hybas_4120570410", fixtures::MODEL_TARBELA),
        );
        match executor(api, 3).probe(&candidate("hybas_4120570410")) {
            ProbeOutcome::Found { record, .. } => {
                let t = record.thresholds.expect("model thresholds attached");
                assert_eq!(t.danger_level, 5500.0);
            }
            other => panic!("expected FOUND, got {:?}", other),
        }
    }

    #[test]
    fn test_model_failure_keeps_found() {
        let api = Arc::new(ReplayApi::new().with_gauge("hybas_4120570410", fixtures::GAUGE_TARBELA));
        match executor(api, 3).probe(&candidate("hybas_4120570410")) {
            ProbeOutcome::Found { record, .. } => assert!(record.thresholds.is_none()),
            other => panic!("expected FOUND, got {:?}", other),
        }
    }

    #[test]
    fn test_not_found_is_single_request() {
        let api = Arc::new(ReplayApi::new());
        let exec = executor(api.clone(), 3);
        assert_eq!(exec.probe(&candidate("hybas_4129999999")), ProbeOutcome::NotFound);
        assert_eq!(exec.probe(&candidate("hybas_4129999999")), ProbeOutcome::NotFound);
        assert_eq!(api.calls_for("hybas_4129999999"), 2);
    }

    #[test]
    fn test_transient_failure_retried_until_success() {
        let api = Arc::new(ReplayApi::new().with_gauge("hybas_4121489010", fixtures::GAUGE_UNNAMED_HYBAS));
        api.fail_next("hybas_4121489010", ApiError::ServerError(502));
        api.fail_next("hybas_4121489010", ApiError::Timeout);

        let outcome = executor(api.clone(), 3).probe(&candidate("hybas_4121489010"));
        assert!(matches!(outcome, ProbeOutcome::Found { .. }));
        assert_eq!(api.calls_for("hybas_4121489010"), 3);
    }

    #[test]
    fn test_exhausted_retries_report_last_error() {
        let api = Arc::new(ReplayApi::new());
        api.fail_always("X9", ApiError::ServerError(503));
        let outcome = executor(api.clone(), 3).probe(&candidate("X9"));
        assert_eq!(
            outcome,
            ProbeOutcome::TransientError {
                error: ApiError::ServerError(503)
            }
        );
        assert_eq!(api.calls_for("X9"), 3);
    }

    #[test]
    fn test_throttle_raises_backoff_level() {
        let api = Arc::new(ReplayApi::new());
        api.fail_next("X1", ApiError::Throttled);
        let exec = executor(api, 2);
        assert_eq!(exec.probe(&candidate("X1")), ProbeOutcome::NotFound);
        assert_eq!(exec.limiter().backoff_level(), 1);
    }
}
