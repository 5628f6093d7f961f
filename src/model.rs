/// Core data types for the gauge discovery service.
///
/// This module defines the shared domain model imported by all other modules:
/// candidates and probe outcomes, discovered gauge records, flood thresholds,
/// and the upstream lookup error taxonomy.
///
/// It contains no I/O. The only logic here is constructors and small
/// predicates that belong with the types themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identifier conventions
// ---------------------------------------------------------------------------

/// Prefix used by the upstream provider for gauges derived from HydroBASINS
/// sub-basins rather than from a physical monitoring network.
pub const MODELED_ID_PREFIX: &str = "hybas_";

/// Provenance label the upstream provider attaches to HydroBASINS-derived
/// gauges.
pub const MODELED_SOURCE_LABEL: &str = "HYBAS";

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Which generation strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Range,
    Pattern,
    Cluster,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Range => write!(f, "range"),
            StrategyKind::Pattern => write!(f, "pattern"),
            StrategyKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// An identifier to be probed against the upstream lookup API.
///
/// `attempt` counts how many times this identifier has been handed out for
/// probing, including this one. It only grows: a transient failure that is
/// retried after its TTL comes back with `attempt + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub gauge_id: String,
    pub strategy: StrategyKind,
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Probe outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Found,
    NotFound,
    TransientError,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Found => write!(f, "FOUND"),
            ProbeStatus::NotFound => write!(f, "NOT_FOUND"),
            ProbeStatus::TransientError => write!(f, "TRANSIENT_ERROR"),
        }
    }
}

/// The recorded outcome of one probe.
///
/// `retry_after` is only set for `TransientError` results: the candidate
/// becomes eligible for another probe once that instant has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub probed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl ProbeResult {
    pub fn found(probed_at: DateTime<Utc>, payload: String) -> Self {
        Self {
            status: ProbeStatus::Found,
            probed_at,
            payload: Some(payload),
            retry_after: None,
        }
    }

    pub fn not_found(probed_at: DateTime<Utc>) -> Self {
        Self {
            status: ProbeStatus::NotFound,
            probed_at,
            payload: None,
            retry_after: None,
        }
    }

    pub fn transient(
        probed_at: DateTime<Utc>,
        ttl: chrono::Duration,
        payload: Option<String>,
    ) -> Self {
        Self {
            status: ProbeStatus::TransientError,
            probed_at,
            payload,
            retry_after: Some(probed_at + ttl),
        }
    }
}

// ---------------------------------------------------------------------------
// Gauge records
// ---------------------------------------------------------------------------

/// WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Unit the upstream model reports its thresholds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GaugeValueUnit {
    #[serde(rename = "METERS")]
    Meters,
    #[serde(rename = "CUBIC_METERS_PER_SECOND")]
    CubicMetersPerSecond,
    #[default]
    #[serde(rename = "GAUGE_VALUE_UNIT_UNSPECIFIED")]
    #[serde(other)]
    Unspecified,
}

impl fmt::Display for GaugeValueUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaugeValueUnit::Meters => write!(f, "m"),
            GaugeValueUnit::CubicMetersPerSecond => write!(f, "m3/s"),
            GaugeValueUnit::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Provider-asserted flood thresholds for a gauge.
///
/// Levels in ascending order:
///   warning < danger < extreme_danger
///
/// Some upstream models publish no extreme level; the first two are always
/// present on a valid threshold set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodThresholds {
    pub warning_level: f64,
    pub danger_level: f64,
    pub extreme_danger_level: Option<f64>,
    pub unit: GaugeValueUnit,
}

impl FloodThresholds {
    /// True if the levels are finite and strictly ascending.
    pub fn is_ordered(&self) -> bool {
        let base = self.warning_level.is_finite()
            && self.danger_level.is_finite()
            && self.warning_level < self.danger_level;
        match self.extreme_danger_level {
            Some(extreme) => base && extreme.is_finite() && self.danger_level < extreme,
            None => base,
        }
    }
}

/// A gauge discovered behind the upstream lookup API.
///
/// Identity (`gauge_id`) and `location` never change after the first FOUND
/// probe. Only `thresholds` may be refreshed by later probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeRecord {
    pub gauge_id: String,
    pub location: Option<Coordinate>,
    pub source: String,
    pub site_name: Option<String>,
    pub river: Option<String>,
    pub quality_verified: bool,
    pub has_model: bool,
    pub thresholds: Option<FloodThresholds>,
    pub discovered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures of a single upstream lookup.
///
/// Every variant classifies the probe as TRANSIENT_ERROR. "No such gauge" is
/// not an error and is reported through `ingest::Lookup::NotFound` instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// HTTP 429 or an explicit quota signal.
    #[error("throttled by upstream (HTTP 429)")]
    Throttled,
    #[error("request timed out")]
    Timeout,
    /// 5xx response.
    #[error("HTTP error: {0}")]
    ServerError(u16),
    /// 401/403 and other unexpected 4xx responses.
    #[error("request rejected: HTTP {0}")]
    Rejected(u16),
    #[error("network error: {0}")]
    Network(String),
    /// The body could not be parsed into the expected shape.
    #[error("Parse error: {reason}")]
    Malformed { reason: String, raw: String },
}

impl ApiError {
    pub fn is_throttle(&self) -> bool {
        matches!(self, ApiError::Throttled)
    }

    /// Raw body worth keeping for offline inspection, if any.
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            ApiError::Malformed { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_transient_result_sets_retry_after_from_ttl() {
        let at = Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap();
        let result = ProbeResult::transient(at, chrono::Duration::minutes(30), None);
        assert_eq!(result.status, ProbeStatus::TransientError);
        assert_eq!(
            result.retry_after,
            Some(Utc.with_ymd_and_hms(2024, 8, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_final_results_have_no_retry_after() {
        let at = Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap();
        assert!(ProbeResult::not_found(at).retry_after.is_none());
        assert!(ProbeResult::found(at, "{}".into()).retry_after.is_none());
    }

    #[test]
    fn test_threshold_ordering() {
        let mut t = FloodThresholds {
            warning_level: 4500.0,
            danger_level: 5500.0,
            extreme_danger_level: Some(6500.0),
            unit: GaugeValueUnit::CubicMetersPerSecond,
        };
        assert!(t.is_ordered());

        t.extreme_danger_level = None;
        assert!(t.is_ordered(), "missing extreme level is still a valid set");

        t.danger_level = 4000.0;
        assert!(!t.is_ordered(), "danger below warning must be rejected");
    }

    #[test]
    fn test_unknown_unit_deserializes_as_unspecified() {
        let unit: GaugeValueUnit = serde_json::from_str("\"FURLONGS\"").unwrap();
        assert_eq!(unit, GaugeValueUnit::Unspecified);
        let unit: GaugeValueUnit = serde_json::from_str("\"METERS\"").unwrap();
        assert_eq!(unit, GaugeValueUnit::Meters);
    }

    #[test]
    fn test_only_malformed_errors_carry_payload() {
        let err = ApiError::Malformed {
            reason: "missing gaugeId".into(),
            raw: "{\"oops\":1}".into(),
        };
        assert_eq!(err.raw_payload(), Some("{\"oops\":1}"));
        assert!(ApiError::ServerError(503).raw_payload().is_none());
        assert!(ApiError::Throttled.is_throttle());
    }
}
