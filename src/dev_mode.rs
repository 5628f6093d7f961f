/// Development mode: replay recorded Flood Hub payloads
///
/// When the live API is unavailable (no key, quota exhausted, offline
/// development), `ReplayApi` answers lookups from a set of recorded gauge and
/// model payloads. Identifiers it does not know resolve to NOT_FOUND, the
/// same way the live service answers for unlisted gauges.
///
/// Failures can be scripted per identifier to exercise the retry and backoff
/// paths without touching the network.

use crate::ingest::floodhub::{
    FloodHubGauge, FloodHubGaugeModel, parse_gauge_response, parse_model_response,
};
use crate::ingest::{Lookup, LookupApi};
use crate::model::ApiError;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// On-disk replay file layout: raw JSON objects keyed by gauge id.
#[derive(Debug, Default, Deserialize)]
struct ReplayFile {
    #[serde(default)]
    gauges: HashMap<String, serde_json::Value>,
    #[serde(default)]
    models: HashMap<String, serde_json::Value>,
}

/// Lookup API backed by recorded payloads.
#[derive(Default)]
pub struct ReplayApi {
    gauges: HashMap<String, String>,
    models: HashMap<String, String>,
    latency: Option<Duration>,
    scripted: Mutex<HashMap<String, VecDeque<ApiError>>>,
    always_failing: Mutex<HashMap<String, ApiError>>,
    gauge_calls: Mutex<HashMap<String, u32>>,
    call_log: Mutex<Vec<Instant>>,
    total_calls: AtomicU64,
}

impl ReplayApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a replay file of the form
    /// `{"gauges": {"<id>": {...}}, "models": {"<id>": {...}}}`.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        let file: ReplayFile = serde_json::from_str(&text)?;

        let mut api = Self::new();
        for (id, value) in file.gauges {
            api.gauges.insert(id, value.to_string());
        }
        for (id, value) in file.models {
            api.models.insert(id, value.to_string());
        }
        Ok(api)
    }

    /// Register a raw gauge payload.
    pub fn with_gauge(mut self, gauge_id: &str, raw: impl Into<String>) -> Self {
        self.gauges.insert(gauge_id.to_string(), raw.into());
        self
    }

    /// Register a raw model payload.
    pub fn with_model(mut self, gauge_id: &str, raw: impl Into<String>) -> Self {
        self.models.insert(gauge_id.to_string(), raw.into());
        self
    }

    /// Sleep this long inside every lookup.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next gauge lookup for `gauge_id` fails with `err`. Queued failures
    /// are consumed in order.
    pub fn fail_next(&self, gauge_id: &str, err: ApiError) {
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(gauge_id.to_string())
            .or_default()
            .push_back(err);
    }

    /// Every gauge lookup for `gauge_id` fails with `err` until cleared.
    pub fn fail_always(&self, gauge_id: &str, err: ApiError) {
        self.always_failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(gauge_id.to_string(), err);
    }

    pub fn clear_failures(&self, gauge_id: &str) {
        self.always_failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(gauge_id);
        self.scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(gauge_id);
    }

    pub fn known_gauges(&self) -> usize {
        self.gauges.len()
    }

    /// Number of gauge lookups made for one identifier.
    pub fn calls_for(&self, gauge_id: &str) -> u32 {
        self.gauge_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(gauge_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total lookups of either kind.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Start instants of every lookup, in call order.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
    }

    fn scripted_failure(&self, gauge_id: &str) -> Option<ApiError> {
        let queued = self
            .scripted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(gauge_id)
            .and_then(|q| q.pop_front());
        queued.or_else(|| {
            self.always_failing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(gauge_id)
                .cloned()
        })
    }
}

impl LookupApi for ReplayApi {
    fn get_gauge(&self, gauge_id: &str) -> Result<Lookup<FloodHubGauge>, ApiError> {
        self.record_call();
        *self
            .gauge_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(gauge_id.to_string())
            .or_insert(0) += 1;

        if let Some(err) = self.scripted_failure(gauge_id) {
            return Err(err);
        }

        match self.gauges.get(gauge_id) {
            Some(raw) => Ok(Lookup::Found {
                value: parse_gauge_response(raw)?,
                raw: raw.clone(),
            }),
            None => Ok(Lookup::NotFound),
        }
    }

    fn get_gauge_model(&self, gauge_id: &str) -> Result<Lookup<FloodHubGaugeModel>, ApiError> {
        self.record_call();
        match self.models.get(gauge_id) {
            Some(raw) => Ok(Lookup::Found {
                value: parse_model_response(raw)?,
                raw: raw.clone(),
            }),
            None => Ok(Lookup::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fixtures;

    #[test]
    fn test_unknown_ids_are_not_found() {
        let api = ReplayApi::new().with_gauge("hybas_4120570410", fixtures::GAUGE_TARBELA);
        assert!(api.get_gauge("hybas_4120570410").unwrap().is_found());
        assert_eq!(api.get_gauge("hybas_4120570411").unwrap(), Lookup::NotFound);
        assert_eq!(api.calls_for("hybas_4120570411"), 1);
        assert_eq!(api.total_calls(), 2);
    }

    #[test]
    fn test_scripted_failures_are_consumed_in_order() {
        let api = ReplayApi::new().with_gauge("hybas_4120570410", fixtures::GAUGE_TARBELA);
        api.fail_next("hybas_4120570410", ApiError::Throttled);
        api.fail_next("hybas_4120570410", ApiError::ServerError(503));

        assert_eq!(api.get_gauge("hybas_4120570410"), Err(ApiError::Throttled));
        assert_eq!(api.get_gauge("hybas_4120570410"), Err(ApiError::ServerError(503)));
        assert!(api.get_gauge("hybas_4120570410").unwrap().is_found());
    }

    #[test]
    fn test_fail_always_until_cleared() {
        let api = ReplayApi::new();
        api.fail_always("X1", ApiError::Timeout);
        assert_eq!(api.get_gauge("X1"), Err(ApiError::Timeout));
        assert_eq!(api.get_gauge("X1"), Err(ApiError::Timeout));
        api.clear_failures("X1");
        assert_eq!(api.get_gauge("X1").unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"gauges": {{"hybas_4120570410": {}}}, "models": {{"hybas_4120570410": {}}}}}"#,
                fixtures::GAUGE_TARBELA,
                fixtures::MODEL_TARBELA
            ),
        )
        .unwrap();

        let api = ReplayApi::from_file(&path).expect("replay file loads");
        assert_eq!(api.known_gauges(), 1);
        let model = api.get_gauge_model("hybas_4120570410").unwrap();
        assert!(model.is_found());
    }
}
