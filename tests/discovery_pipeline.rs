/// End-to-end discovery tests against a replayed lookup API
///
/// These tests run the real generator, limiter, executor, store, assessor
/// and threshold cache; only the network is replaced by `ReplayApi`.
///
/// Run with: cargo test --test discovery_pipeline

use gauge_discovery::alert::thresholds::ThresholdCache;
use gauge_discovery::analysis::Assessor;
use gauge_discovery::analysis::tiers::Tier;
use gauge_discovery::config::{DiscoveryConfig, GeneratorConfig};
use gauge_discovery::dev_mode::ReplayApi;
use gauge_discovery::discovery::generator::{CandidateGenerator, ClusterStrategy, RangeStrategy};
use gauge_discovery::discovery::probe::{ProbeExecutor, RetryPolicy};
use gauge_discovery::discovery::ratelimit::RateLimiter;
use gauge_discovery::discovery::runner::{
    CancelToken, DiscoveryRunner, Processed, RunBudget, StopReason,
};
use gauge_discovery::discovery::store::{DiscoveryStore, StoreError};
use gauge_discovery::model::{ApiError, Candidate, ProbeStatus, StrategyKind};
use gauge_discovery::report;
use gauge_discovery::stations::ReferenceRegistry;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const TARBELA: &str = "hybas_4120570410";
const BASIN: &str = "hybas_4120570440";
const KALABAGH: &str = "hybas_4120570470";

fn replay() -> ReplayApi {
    ReplayApi::new()
        .with_gauge(
            TARBELA,
            r#"{"gaugeId": "hybas_4120570410",
                "location": {"latitude": 33.90, "longitude": 72.70},
                "source": "WAPDA", "siteName": "Tarbela Dam", "river": "Indus",
                "qualityVerified": true, "hasModel": true}"#,
        )
        .with_model(
            TARBELA,
            r#"{"gaugeId": "hybas_4120570410", "gaugeModelId": "m1",
                "thresholds": {"warningLevel": 4500.0, "dangerLevel": 5500.0,
                               "extremeDangerLevel": 6500.0},
                "gaugeValueUnit": "CUBIC_METERS_PER_SECOND"}"#,
        )
        .with_gauge(
            BASIN,
            r#"{"gaugeId": "hybas_4120570440",
                "location": {"latitude": 27.0, "longitude": 64.0},
                "source": "HYBAS", "qualityVerified": false, "hasModel": false}"#,
        )
        .with_gauge(
            KALABAGH,
            r#"{"gaugeId": "hybas_4120570470",
                "location": {"latitude": 32.96, "longitude": 71.55},
                "source": "GRDC", "siteName": "Kalabagh",
                "qualityVerified": false, "hasModel": false}"#,
        )
}

struct Pipeline {
    api: Arc<ReplayApi>,
    store: Arc<DiscoveryStore>,
    cache: Arc<ThresholdCache>,
    runner: DiscoveryRunner,
}

fn pipeline(api: Arc<ReplayApi>, store: Arc<DiscoveryStore>, max_attempts: u32) -> Pipeline {
    let limiter = Arc::new(RateLimiter::new(
        1000,
        Duration::from_secs(1),
        Duration::from_secs(1),
        2,
    ));
    let retry = RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    let executor = Arc::new(ProbeExecutor::new(api.clone(), limiter, retry));
    let assessor = Arc::new(Assessor::from_config(
        &DiscoveryConfig::default(),
        Arc::new(ReferenceRegistry::builtin()),
    ));
    let cache = Arc::new(ThresholdCache::new());
    let runner = DiscoveryRunner::new(executor, store.clone(), assessor, cache.clone())
        .with_workers(4)
        .with_queue_capacity(4)
        .with_transient_ttl(ChronoDuration::minutes(60));
    Pipeline {
        api,
        store,
        cache,
        runner,
    }
}

/// hybas_4120570400 ..= hybas_4120570500, every tenth id: 11 candidates.
fn range_generator(store: &Arc<DiscoveryStore>) -> CandidateGenerator {
    CandidateGenerator::new(store.clone()).with_strategy(
        Box::new(RangeStrategy::new("hybas_", 10, 4120570400, 4120570500, 10)),
        1,
    )
}

fn tier_of(store: &DiscoveryStore, id: &str) -> Option<Tier> {
    store.gauge(id).and_then(|g| g.assessment).map(|a| a.tier)
}

// ---------------------------------------------------------------------------
// Discovery and classification
// ---------------------------------------------------------------------------

#[test]
fn test_range_run_discovers_and_classifies_every_gauge() {
    let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 3);
    let mut generator = range_generator(&p.store);

    let run = p
        .runner
        .run(&mut generator, &RunBudget::unlimited(), &CancelToken::new())
        .expect("run succeeds");

    assert_eq!(run.stop_reason, Some(StopReason::Exhausted));
    assert_eq!(run.dispatched, 11);
    let range = &run.strategies[&StrategyKind::Range];
    assert_eq!((range.found, range.not_found, range.errors), (3, 8, 0));

    assert_eq!(p.store.found_ids(), vec![TARBELA, BASIN, KALABAGH]);
    assert_eq!(tier_of(&p.store, TARBELA), Some(Tier::VerifiedPhysical));
    assert_eq!(tier_of(&p.store, BASIN), Some(Tier::LikelyVirtual));
    // Strong evidence but no quality flag: capped.
    assert_eq!(tier_of(&p.store, KALABAGH), Some(Tier::Uncertain));

    let cached = p.cache.get(TARBELA).expect("thresholds cached on FOUND");
    assert_eq!(cached.danger_level, 5500.0);
    assert!(p.cache.get(BASIN).is_none());
}

#[test]
fn test_registry_report_explains_every_tier() {
    let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 3);
    p.runner
        .run(
            &mut range_generator(&p.store),
            &RunBudget::unlimited(),
            &CancelToken::new(),
        )
        .unwrap();

    let registry = report::build_registry(&p.store, &ReferenceRegistry::builtin(), Utc::now());
    assert_eq!(registry.summary.total, 3);
    assert_eq!(registry.summary.with_thresholds, 1);
    assert_eq!(registry.summary.by_tier["UNCERTAIN"], 1);

    let kalabagh = registry
        .gauges
        .iter()
        .find(|g| g.gauge_id == KALABAGH)
        .unwrap();
    assert_eq!(kalabagh.matched_station.as_deref(), Some("KALABAGH"));
    assert!(kalabagh.evidence.iter().any(|line| line.contains("not quality verified")));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    report::write_json(&registry, &path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"VERIFIED_PHYSICAL\""));
}

#[test]
fn test_cluster_follows_new_hits_outward() {
    let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 3);
    let seed = Candidate {
        gauge_id: TARBELA.into(),
        strategy: StrategyKind::Range,
        attempt: 1,
    };
    assert_eq!(p.runner.process_candidate(&seed).unwrap().status(), ProbeStatus::Found);

    let mut generator = CandidateGenerator::new(p.store.clone())
        .with_strategy(Box::new(ClusterStrategy::new(30, 10)), 1);
    let run = p
        .runner
        .run(&mut generator, &RunBudget::unlimited(), &CancelToken::new())
        .unwrap();

    assert_eq!(run.stop_reason, Some(StopReason::Exhausted));
    // 0440 is three steps from the seed, 0470 three steps from 0440.
    assert_eq!(run.strategies[&StrategyKind::Cluster].found, 2);
    assert_eq!(p.store.found_count(), 3);
}

// ---------------------------------------------------------------------------
// Idempotence and retries
// ---------------------------------------------------------------------------

#[test]
fn test_not_found_reprobe_is_a_no_op() {
    let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 3);
    let c = Candidate {
        gauge_id: "hybas_4120570420".into(),
        strategy: StrategyKind::Range,
        attempt: 1,
    };
    assert_eq!(
        p.runner.process_candidate(&c).unwrap(),
        Processed::Probed(ProbeStatus::NotFound)
    );
    let before = p.store.probe_entry(&c.gauge_id).unwrap();

    assert_eq!(
        p.runner.process_candidate(&c).unwrap(),
        Processed::AlreadyFinal(ProbeStatus::NotFound)
    );
    assert_eq!(p.store.probe_entry(&c.gauge_id).unwrap(), before);
    assert_eq!(p.api.calls_for(&c.gauge_id), 1);
}

#[test]
fn test_transient_failure_waits_for_ttl_then_reemits() {
    let api = Arc::new(replay());
    api.fail_always(TARBELA, ApiError::ServerError(503));
    let p = pipeline(api, Arc::new(DiscoveryStore::new()), 3);

    let mut generator = CandidateGenerator::new(p.store.clone()).with_strategy(
        Box::new(RangeStrategy::new("hybas_", 10, 4120570410, 4120570410, 10)),
        1,
    );
    let first = generator.next_candidate().expect("one id in range");
    assert_eq!(first.attempt, 1);

    assert_eq!(
        p.runner.process_candidate(&first).unwrap(),
        Processed::Probed(ProbeStatus::TransientError)
    );
    assert_eq!(p.api.calls_for(TARBELA), 3, "retried up to max_attempts");

    let entry = p.store.probe_entry(TARBELA).unwrap();
    let failed = entry.latest().unwrap();
    let retry_after = failed.retry_after.expect("retry_after recorded");
    assert_eq!(retry_after, failed.probed_at + ChronoDuration::minutes(60));

    assert!(generator.next_candidate_at(failed.probed_at + ChronoDuration::minutes(1)).is_none());

    let again = generator
        .next_candidate_at(retry_after + ChronoDuration::seconds(1))
        .expect("re-emitted once the TTL has passed");
    assert_eq!(again.gauge_id, TARBELA);
    assert_eq!(again.attempt, 2);

    p.api.clear_failures(TARBELA);
    assert_eq!(
        p.runner.process_candidate(&again).unwrap(),
        Processed::Probed(ProbeStatus::Found)
    );
    assert_eq!(tier_of(&p.store, TARBELA), Some(Tier::VerifiedPhysical));
}

// ---------------------------------------------------------------------------
// Checkpoint and resume
// ---------------------------------------------------------------------------

#[test]
fn test_resumed_run_never_reprobes() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("checkpoint.json");
    let api = Arc::new(replay());

    {
        let store = Arc::new(DiscoveryStore::open(&checkpoint).unwrap());
        let p = pipeline(api.clone(), store, 3);
        let runner = p.runner.with_checkpoint(checkpoint.clone(), 2);
        let run = runner
            .run(
                &mut range_generator(&p.store),
                &RunBudget::new(Some(4), None),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(run.stop_reason, Some(StopReason::BudgetExhausted));
    }

    let store = Arc::new(DiscoveryStore::open(&checkpoint).unwrap());
    assert_eq!(store.probed_count(), 4);
    let p = pipeline(api.clone(), store, 3);
    let run = p
        .runner
        .run(
            &mut range_generator(&p.store),
            &RunBudget::unlimited(),
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(run.dispatched, 7);
    assert_eq!(p.store.probed_count(), 11);
    assert_eq!(p.store.found_count(), 3);
    for value in (4120570400u64..=4120570500).step_by(10) {
        let id = format!("hybas_{}", value);
        assert_eq!(api.calls_for(&id), 1, "{} probed more than once", id);
    }
}

#[test]
fn test_failed_checkpoint_skips_queued_candidates() {
    let dir = tempfile::tempdir().unwrap();
    // A non-empty directory where the checkpoint file should go makes every
    // save fail at the final rename.
    let checkpoint = dir.path().join("checkpoint.json");
    std::fs::create_dir(&checkpoint).unwrap();
    std::fs::write(checkpoint.join("occupied"), "").unwrap();

    let api = Arc::new(replay().with_latency(Duration::from_millis(30)));
    let p = pipeline(api.clone(), Arc::new(DiscoveryStore::new()), 1);
    let runner = p
        .runner
        .with_workers(1)
        .with_queue_capacity(8)
        .with_checkpoint(checkpoint, 5);

    let result = runner.run(
        &mut range_generator(&p.store),
        &RunBudget::unlimited(),
        &CancelToken::new(),
    );

    assert!(matches!(result, Err(StoreError::Io { .. })));
    // Only the lookup already in flight when the save failed may complete.
    assert!(
        api.total_calls() <= 2,
        "{} lookups after the checkpoint failed",
        api.total_calls()
    );
}

#[test]
fn test_corrupt_checkpoint_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    std::fs::write(&path, "{\"version\": 1, \"probes\": [").unwrap();

    match DiscoveryStore::open(&path) {
        Err(StoreError::Corrupt { .. }) => {}
        other => panic!("expected Corrupt, got {:?}", other.map(|s| s.probed_count())),
    }
}

#[test]
fn test_already_final_candidates_count_as_skipped() {
    let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 3);
    p.runner
        .run(&mut range_generator(&p.store), &RunBudget::unlimited(), &CancelToken::new())
        .unwrap();
    // Eleven gauge lookups plus one model lookup for Tarbela.
    assert_eq!(p.api.total_calls(), 12);

    // A generator over an empty store hands out every id again.
    let fresh = Arc::new(DiscoveryStore::new());
    let run = p
        .runner
        .run(&mut range_generator(&fresh), &RunBudget::unlimited(), &CancelToken::new())
        .unwrap();

    assert_eq!(run.dispatched, 11);
    assert_eq!(run.skipped, 11);
    assert_eq!(run.totals().probed(), 0);
    assert_eq!(run.totals().hit_rate(), 0.0);
    assert_eq!(p.api.total_calls(), 12);
}

// ---------------------------------------------------------------------------
// Generation determinism
// ---------------------------------------------------------------------------

#[test]
fn test_same_store_state_yields_same_candidates() {
    let now = Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap();
    let seeded = || {
        let p = pipeline(Arc::new(replay()), Arc::new(DiscoveryStore::new()), 1);
        for id in [TARBELA, BASIN] {
            let c = Candidate {
                gauge_id: id.into(),
                strategy: StrategyKind::Range,
                attempt: 1,
            };
            p.runner.process_candidate(&c).unwrap();
        }
        p.store
    };

    let take = |store: Arc<DiscoveryStore>| -> Vec<Candidate> {
        let mut generator = CandidateGenerator::from_config(&GeneratorConfig::default(), store);
        (0..60).filter_map(|_| generator.next_candidate_at(now)).collect()
    };

    let a = take(seeded());
    let b = take(seeded());
    assert_eq!(a.len(), 60);
    assert_eq!(a, b);
    assert!(a.iter().any(|c| c.strategy == StrategyKind::Cluster));
    assert!(a.iter().any(|c| c.strategy == StrategyKind::Pattern));
    assert!(a.iter().any(|c| c.strategy == StrategyKind::Range));
}

// ---------------------------------------------------------------------------
// Shared rate limit
// ---------------------------------------------------------------------------

/// Sorted grant instants never fit `budget + 1` grants inside one window.
fn assert_window_respected(mut grants: Vec<Instant>, budget: usize, window: Duration) {
    grants.sort();
    for i in 0..grants.len().saturating_sub(budget) {
        assert!(
            grants[i + budget].duration_since(grants[i]) >= window,
            "{} grants inside one window starting at grant {}",
            budget + 1,
            i
        );
    }
}

#[test]
fn test_fifty_workers_share_a_budget_of_two_hundred() {
    const BUDGET: usize = 200;
    const WORKERS: usize = 50;
    const PER_WORKER: usize = 10;
    let window = Duration::from_millis(500);
    let limiter = Arc::new(RateLimiter::new(
        BUDGET as u32,
        window,
        Duration::from_secs(5),
        2,
    ));

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || {
                (0..PER_WORKER)
                    .map(|_| limiter.acquire())
                    .collect::<Vec<Instant>>()
            })
        })
        .collect();
    let grants: Vec<Instant> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(grants.len(), WORKERS * PER_WORKER);
    assert_window_respected(grants, BUDGET, window);
}

#[test]
fn test_no_window_exceeds_budget_under_contention() {
    const BUDGET: usize = 20;
    let window = Duration::from_millis(250);
    let limiter = Arc::new(RateLimiter::new(
        BUDGET as u32,
        window,
        Duration::from_secs(60),
        2,
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || (0..8).map(|_| limiter.acquire()).collect::<Vec<Instant>>())
        })
        .collect();
    let grants: Vec<Instant> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(grants.len(), 64);
    assert_window_respected(grants, BUDGET, window);
}
