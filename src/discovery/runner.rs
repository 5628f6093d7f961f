/// Discovery run orchestration
///
/// One dispatcher thread pulls candidates from the generator into a bounded
/// queue; a fixed pool of workers probes them, classifies FOUND gauges and
/// records every result in the store. The queue bound is what keeps the
/// generator from running ahead of the rate limiter.
///
/// A run stops when the generator is exhausted, the candidate budget is
/// spent, the deadline passes or the caller cancels. Probes already in
/// flight finish and are recorded; candidates still queued are dropped
/// unprobed and regenerated by the next run.

use super::generator::CandidateGenerator;
use super::probe::{ProbeExecutor, ProbeOutcome};
use super::store::{DiscoveryStore, RecordOutcome, StoreError, StoredGauge};
use crate::alert::thresholds::ThresholdCache;
use crate::analysis::Assessor;
use crate::logging::{self, LogSource};
use crate::model::{Candidate, ProbeResult, ProbeStatus};
use crate::report::RunReport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const IDLE_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunBudget {
    pub max_candidates: Option<u64>,
    pub deadline: Option<Instant>,
}

impl RunBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn new(max_candidates: Option<u64>, time_limit: Option<Duration>) -> Self {
        Self {
            max_candidates,
            deadline: time_limit.map(|d| Instant::now() + d),
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every strategy ran dry and nothing was left in flight.
    Exhausted,
    BudgetExhausted,
    DeadlineReached,
    Cancelled,
}

/// What `process_candidate` did with one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Probed upstream and recorded.
    Probed(ProbeStatus),
    /// Already FOUND or NOT_FOUND in the store; no request was made.
    AlreadyFinal(ProbeStatus),
}

impl Processed {
    pub fn status(&self) -> ProbeStatus {
        match self {
            Processed::Probed(status) | Processed::AlreadyFinal(status) => *status,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct DiscoveryRunner {
    executor: Arc<ProbeExecutor>,
    store: Arc<DiscoveryStore>,
    assessor: Arc<Assessor>,
    cache: Arc<ThresholdCache>,
    workers: usize,
    queue_capacity: usize,
    transient_ttl: chrono::Duration,
    checkpoint: Option<(PathBuf, u64)>,
}

impl DiscoveryRunner {
    pub fn new(
        executor: Arc<ProbeExecutor>,
        store: Arc<DiscoveryStore>,
        assessor: Arc<Assessor>,
        cache: Arc<ThresholdCache>,
    ) -> Self {
        Self {
            executor,
            store,
            assessor,
            cache,
            workers: 8,
            queue_capacity: 64,
            transient_ttl: chrono::Duration::minutes(60),
            checkpoint: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_transient_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.transient_ttl = ttl;
        self
    }

    /// Save the store to `path` every `every` dispatched candidates and at
    /// the end of the run.
    pub fn with_checkpoint(mut self, path: PathBuf, every: u64) -> Self {
        self.checkpoint = Some((path, every.max(1)));
        self
    }

    pub fn store(&self) -> &Arc<DiscoveryStore> {
        &self.store
    }

    pub fn run(
        &self,
        generator: &mut CandidateGenerator,
        budget: &RunBudget,
        cancel: &CancelToken,
    ) -> Result<RunReport, StoreError> {
        let report = Mutex::new(RunReport::new(Utc::now()));
        let in_flight = AtomicUsize::new(0);
        let skipped = AtomicU64::new(0);
        let halted = AtomicBool::new(false);
        let failure: Mutex<Option<StoreError>> = Mutex::new(None);
        let stopping =
            || cancel.is_cancelled() || halted.load(Ordering::SeqCst) || budget.deadline_passed();

        logging::info(
            LogSource::System,
            None,
            &format!(
                "Discovery run starting: {} workers, queue {}, {} gauges already known",
                self.workers,
                self.queue_capacity,
                self.store.found_count()
            ),
        );

        let (tx, rx) = crossbeam_channel::bounded::<Candidate>(self.queue_capacity);
        let mut dispatched = 0u64;

        let stop_reason = std::thread::scope(|scope| -> StopReason {
            for _ in 0..self.workers {
                let rx = rx.clone();
                let (report, in_flight, skipped, halted, failure) =
                    (&report, &in_flight, &skipped, &halted, &failure);
                let stopping = &stopping;
                scope.spawn(move || {
                    for candidate in rx.iter() {
                        if stopping() {
                            skipped.fetch_add(1, Ordering::SeqCst);
                        } else {
                            match self.process_candidate(&candidate) {
                                Ok(Processed::Probed(status)) => report
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .record(candidate.strategy, status),
                                Ok(Processed::AlreadyFinal(_)) => {
                                    skipped.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => {
                                    logging::error(
                                        LogSource::Store,
                                        Some(&candidate.gauge_id),
                                        &format!("Failed to record probe result: {}", e),
                                    );
                                    failure
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner())
                                        .get_or_insert(e);
                                    halted.store(true, Ordering::SeqCst);
                                }
                            }
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
            drop(rx);

            let reason = loop {
                if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                    break StopReason::Cancelled;
                }
                if budget.deadline_passed() {
                    break StopReason::DeadlineReached;
                }
                if budget.max_candidates.is_some_and(|max| dispatched >= max) {
                    break StopReason::BudgetExhausted;
                }

                let Some(candidate) = generator.next_candidate() else {
                    // Results still in flight may seed new pattern or
                    // cluster candidates.
                    if in_flight.load(Ordering::SeqCst) > 0 {
                        std::thread::sleep(IDLE_POLL);
                        continue;
                    }
                    break StopReason::Exhausted;
                };

                in_flight.fetch_add(1, Ordering::SeqCst);
                if tx.send(candidate).is_err() {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    break StopReason::Cancelled;
                }
                dispatched += 1;

                if let Some((path, every)) = &self.checkpoint {
                    if dispatched % every == 0 {
                        generator.checkpoint();
                        if let Err(e) = self.store.save(path) {
                            logging::error(
                                LogSource::Store,
                                None,
                                &format!("Checkpoint after {} candidates failed: {}", dispatched, e),
                            );
                            failure
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .get_or_insert(e);
                            halted.store(true, Ordering::SeqCst);
                            break StopReason::Cancelled;
                        }
                        logging::debug(
                            LogSource::Store,
                            None,
                            &format!("Checkpoint after {} candidates", dispatched),
                        );
                    }
                }
            };
            drop(tx);
            reason
        });

        if let Some(err) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(err);
        }

        generator.checkpoint();
        if let Some((path, _)) = &self.checkpoint {
            self.store.save(path)?;
        }

        if stop_reason == StopReason::Exhausted {
            if let Some(at) = self.store.next_retry_at() {
                logging::info(
                    LogSource::Generator,
                    None,
                    &format!("Transient failures become eligible again from {}", at),
                );
            }
        }

        let mut report = report.into_inner().unwrap_or_else(|e| e.into_inner());
        report.finished_at = Some(Utc::now());
        report.stop_reason = Some(stop_reason);
        report.dispatched = dispatched;
        report.skipped = skipped.into_inner();
        report.gauges_in_store = self.store.found_count();
        report.backoff_level = self.executor.limiter().backoff_level();
        Ok(report)
    }

    /// Probe one candidate and record the result.
    ///
    /// Identifiers with a final status are not probed again and come back
    /// as `AlreadyFinal` with the recorded status.
    pub fn process_candidate(&self, candidate: &Candidate) -> Result<Processed, StoreError> {
        if let Some(status) = self.store.final_status(&candidate.gauge_id) {
            return Ok(Processed::AlreadyFinal(status));
        }
        self.probe_and_record(candidate).map(Processed::Probed)
    }

    fn probe_and_record(&self, candidate: &Candidate) -> Result<ProbeStatus, StoreError> {

        match self.executor.probe(candidate) {
            ProbeOutcome::Found { record, raw } => {
                let now = Utc::now();
                let id = record.gauge_id.clone();
                let assessment = self.assessor.assess_at(&record, now);
                let tier = assessment.tier;
                let score = assessment.score;
                let thresholds = record.thresholds.clone();

                let outcome = self.store.record_result(
                    candidate,
                    ProbeResult::found(now, raw),
                    Some(StoredGauge {
                        record,
                        assessment: Some(assessment),
                    }),
                )?;
                if outcome == RecordOutcome::Created {
                    logging::info(
                        LogSource::Scoring,
                        Some(&id),
                        &format!("Classified {} (score {})", tier, score),
                    );
                }
                if let Some(levels) = thresholds {
                    self.cache.upsert(&id, &levels, now);
                }
                Ok(ProbeStatus::Found)
            }
            ProbeOutcome::NotFound => {
                self.store
                    .record_result(candidate, ProbeResult::not_found(Utc::now()), None)?;
                Ok(ProbeStatus::NotFound)
            }
            ProbeOutcome::TransientError { error } => {
                let result = ProbeResult::transient(
                    Utc::now(),
                    self.transient_ttl,
                    error.raw_payload().map(String::from),
                );
                if let Some(at) = result.retry_after {
                    logging::debug(
                        LogSource::Store,
                        Some(&candidate.gauge_id),
                        &format!("Recorded TRANSIENT_ERROR ({}), eligible again after {}", error, at),
                    );
                }
                self.store.record_result(candidate, result, None)?;
                Ok(ProbeStatus::TransientError)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Maintenance passes over known gauges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub checked: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub without_model: usize,
    pub failed: usize,
}

/// Re-fetch thresholds for every known gauge with a model, updating both
/// the store and the threshold cache.
pub fn refresh_thresholds(
    executor: &ProbeExecutor,
    store: &DiscoveryStore,
    cache: &ThresholdCache,
) -> RefreshSummary {
    let mut summary = RefreshSummary::default();
    for stored in store.iter_found() {
        let id = stored.record.gauge_id.as_str();
        if !stored.record.has_model {
            summary.without_model += 1;
            continue;
        }
        summary.checked += 1;
        match executor.fetch_thresholds(id) {
            Ok(Some(levels)) => {
                store.refresh_thresholds(id, Some(levels.clone()));
                if cache.upsert(id, &levels, Utc::now()) {
                    summary.changed += 1;
                    logging::info(LogSource::FloodHub, Some(id), "Thresholds changed upstream");
                } else {
                    summary.unchanged += 1;
                }
            }
            Ok(None) => summary.without_model += 1,
            Err(e) => {
                summary.failed += 1;
                logging::warn(
                    LogSource::FloodHub,
                    Some(id),
                    &format!("Threshold refresh failed, keeping cached levels: {}", e),
                );
            }
        }
    }
    summary
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclassifySummary {
    pub assessed: usize,
    pub changed: usize,
}

/// Re-run evidence aggregation, scoring and tier classification for every
/// known gauge, e.g. after the reference stations or weights changed.
pub fn reclassify_all(store: &DiscoveryStore, assessor: &Assessor) -> ReclassifySummary {
    let mut summary = ReclassifySummary::default();
    let now = Utc::now();
    for stored in store.iter_found() {
        let id = stored.record.gauge_id.as_str();
        let fresh = assessor.assess_at(&stored.record, now);
        let changed = stored
            .assessment
            .as_ref()
            .is_none_or(|old| !old.same_outcome(&fresh));
        if changed {
            summary.changed += 1;
            let before = stored
                .assessment
                .as_ref()
                .map(|a| format!("{} ({})", a.tier, a.score))
                .unwrap_or_else(|| "unassessed".to_string());
            logging::info(
                LogSource::Scoring,
                Some(id),
                &format!("Reclassified {} -> {} ({})", before, fresh.tier, fresh.score),
            );
        }
        store.set_assessment(id, fresh);
        summary.assessed += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tiers::Tier;
    use crate::config::DiscoveryConfig;
    use crate::dev_mode::ReplayApi;
    use crate::discovery::probe::RetryPolicy;
    use crate::discovery::ratelimit::RateLimiter;
    use crate::ingest::fixtures::{GAUGE_TARBELA, GAUGE_UNNAMED_HYBAS, MODEL_TARBELA};
    use crate::model::{ApiError, StrategyKind};
    use crate::stations::ReferenceRegistry;

    fn runner_with(api: Arc<ReplayApi>) -> DiscoveryRunner {
        let limiter = Arc::new(RateLimiter::new(
            1000,
            Duration::from_secs(1),
            Duration::from_secs(1),
            2,
        ));
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let executor = Arc::new(ProbeExecutor::new(api, limiter, retry));
        let assessor = Arc::new(Assessor::from_config(
            &DiscoveryConfig::default(),
            Arc::new(ReferenceRegistry::builtin()),
        ));
        DiscoveryRunner::new(
            executor,
            Arc::new(DiscoveryStore::new()),
            assessor,
            Arc::new(ThresholdCache::new()),
        )
        .with_workers(2)
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            gauge_id: id.into(),
            strategy: StrategyKind::Range,
            attempt: 1,
        }
    }

    fn replay() -> ReplayApi {
        ReplayApi::new()
            .with_gauge("hybas_4120570410", GAUGE_TARBELA)
            .with_model("hybas_4120570410", MODEL_TARBELA)
            .with_gauge("hybas_4121489010", GAUGE_UNNAMED_HYBAS)
    }

    #[test]
    fn test_found_gauge_is_classified_and_cached() {
        let runner = runner_with(Arc::new(replay()));
        let status = runner.process_candidate(&candidate("hybas_4120570410")).unwrap();
        assert_eq!(status, Processed::Probed(ProbeStatus::Found));

        let stored = runner.store().gauge("hybas_4120570410").unwrap();
        let assessment = stored.assessment.expect("assessed on creation");
        assert_eq!(assessment.tier, Tier::VerifiedPhysical);
        assert!(runner.cache.get("hybas_4120570410").is_some());
    }

    #[test]
    fn test_not_found_is_not_probed_twice() {
        let api = Arc::new(replay());
        let runner = runner_with(Arc::clone(&api));
        let c = candidate("hybas_4129999990");

        assert_eq!(runner.process_candidate(&c).unwrap(), Processed::Probed(ProbeStatus::NotFound));
        assert_eq!(
            runner.process_candidate(&c).unwrap(),
            Processed::AlreadyFinal(ProbeStatus::NotFound)
        );
        assert_eq!(api.calls_for("hybas_4129999990"), 1);
        assert_eq!(runner.store().attempts("hybas_4129999990"), 1);
    }

    #[test]
    fn test_transient_failure_gets_retry_after() {
        let api = Arc::new(replay());
        api.fail_always("hybas_4120570410", ApiError::ServerError(503));
        let runner = runner_with(Arc::clone(&api)).with_transient_ttl(chrono::Duration::minutes(5));

        let status = runner.process_candidate(&candidate("hybas_4120570410")).unwrap();
        assert_eq!(status, Processed::Probed(ProbeStatus::TransientError));
        let entry = runner.store().probe_entry("hybas_4120570410").unwrap();
        let latest = entry.latest().unwrap();
        assert_eq!(latest.retry_after, Some(latest.probed_at + chrono::Duration::minutes(5)));
        assert!(runner.store().gauge("hybas_4120570410").is_none());
    }

    #[test]
    fn test_run_stops_on_budget() {
        let runner = runner_with(Arc::new(replay()));
        let mut generator = CandidateGenerator::new(Arc::clone(runner.store())).with_strategy(
            Box::new(crate::discovery::generator::RangeStrategy::new(
                "hybas_", 10, 4120570400, 4120570500, 10,
            )),
            1,
        );

        let report = runner
            .run(&mut generator, &RunBudget::new(Some(3), None), &CancelToken::new())
            .unwrap();
        assert_eq!(report.stop_reason, Some(StopReason::BudgetExhausted));
        assert_eq!(report.dispatched, 3);
        assert_eq!(report.totals().probed() + report.skipped, 3);
    }

    #[test]
    fn test_cancelled_run_dispatches_nothing() {
        let runner = runner_with(Arc::new(replay()));
        let mut generator = CandidateGenerator::new(Arc::clone(runner.store())).with_strategy(
            Box::new(crate::discovery::generator::RangeStrategy::new(
                "hybas_", 10, 4120570400, 4120570500, 10,
            )),
            1,
        );
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = runner.run(&mut generator, &RunBudget::unlimited(), &cancel).unwrap();
        assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
        assert_eq!(report.dispatched, 0);
    }

    #[test]
    fn test_reclassify_after_policy_change() {
        let runner = runner_with(Arc::new(replay()));
        runner.process_candidate(&candidate("hybas_4120570410")).unwrap();

        let unchanged = reclassify_all(runner.store(), &runner.assessor);
        assert_eq!(unchanged, ReclassifySummary { assessed: 1, changed: 0 });

        let mut config = DiscoveryConfig::default();
        config.scoring.physical_network = 0;
        let strict = Assessor::from_config(&config, Arc::new(ReferenceRegistry::builtin()));
        let changed = reclassify_all(runner.store(), &strict);
        assert_eq!(changed.changed, 1);
        let tier = runner
            .store()
            .gauge("hybas_4120570410")
            .and_then(|g| g.assessment)
            .map(|a| a.tier);
        assert_eq!(tier, Some(Tier::LikelyPhysical));
    }

    #[test]
    fn test_refresh_updates_cache() {
        let runner = runner_with(Arc::new(replay()));
        runner.process_candidate(&candidate("hybas_4120570410")).unwrap();
        runner.process_candidate(&candidate("hybas_4121489010")).unwrap();

        let summary = refresh_thresholds(&runner.executor, runner.store(), &runner.cache);
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.without_model, 1);
        assert_eq!(summary.failed, 0);
    }
}
