//! Flood threshold cache.
//!
//! Keeps each gauge's warning / danger / extreme levels for a downstream
//! monitor, independent of whether live forecasts are available. The cache
//! does not care how a gauge is classified: a LIKELY_VIRTUAL gauge keeps its
//! thresholds, and the monitor gets the tier's confidence label alongside
//! them.

use crate::analysis::tiers::{ConfidenceLabel, Tier};
use crate::discovery::store::StoreError;
use crate::model::{FloodThresholds, GaugeValueUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedThresholds {
    pub gauge_id: String,
    pub warning_level: f64,
    pub danger_level: f64,
    pub extreme_danger_level: Option<f64>,
    pub unit: GaugeValueUnit,
    pub refreshed_at: DateTime<Utc>,
}

impl CachedThresholds {
    pub fn levels(&self) -> FloodThresholds {
        FloodThresholds {
            warning_level: self.warning_level,
            danger_level: self.danger_level,
            extreme_danger_level: self.extreme_danger_level,
            unit: self.unit,
        }
    }
}

/// Flood severity levels, in ascending order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloodSeverity {
    Warning,
    Danger,
    Extreme,
}

/// Thresholds as handed to a downstream monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorThresholds {
    pub thresholds: CachedThresholds,
    pub confidence: ConfidenceLabel,
}

/// A flood alert triggered when a value reaches a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct FloodAlert {
    pub gauge_id: String,
    pub severity: FloodSeverity,
    pub value: f64,
    pub threshold: f64,
    pub confidence: ConfidenceLabel,
    pub message: String,
}

/// Highest level reached by `value`, or `None` below the warning level.
pub fn check_flood_level(value: f64, thresholds: &FloodThresholds) -> Option<(FloodSeverity, f64)> {
    if !value.is_finite() {
        return None;
    }
    if let Some(extreme) = thresholds.extreme_danger_level {
        if value >= extreme {
            return Some((FloodSeverity::Extreme, extreme));
        }
    }
    if value >= thresholds.danger_level {
        Some((FloodSeverity::Danger, thresholds.danger_level))
    } else if value >= thresholds.warning_level {
        Some((FloodSeverity::Warning, thresholds.warning_level))
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct ThresholdCache {
    entries: RwLock<BTreeMap<String, CachedThresholds>>,
}

impl ThresholdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a gauge's thresholds. Returns `true` if the levels
    /// changed (a refresh with identical levels only bumps the timestamp).
    pub fn upsert(&self, gauge_id: &str, levels: &FloodThresholds, refreshed_at: DateTime<Utc>) -> bool {
        let entry = CachedThresholds {
            gauge_id: gauge_id.to_string(),
            warning_level: levels.warning_level,
            danger_level: levels.danger_level,
            extreme_danger_level: levels.extreme_danger_level,
            unit: levels.unit,
            refreshed_at,
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let changed = entries
            .get(gauge_id)
            .is_none_or(|old| old.levels() != *levels);
        entries.insert(gauge_id.to_string(), entry);
        changed
    }

    pub fn remove(&self, gauge_id: &str) -> Option<CachedThresholds> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(gauge_id)
    }

    pub fn get(&self, gauge_id: &str) -> Option<CachedThresholds> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(gauge_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, ordered by gauge id.
    pub fn entries(&self) -> Vec<CachedThresholds> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Thresholds for a downstream monitor, labeled with the gauge's tier.
    pub fn for_monitor(&self, gauge_id: &str, tier: Option<Tier>) -> Option<MonitorThresholds> {
        self.get(gauge_id).map(|thresholds| MonitorThresholds {
            thresholds,
            confidence: tier
                .map(|t| t.confidence_label())
                .unwrap_or(ConfidenceLabel::Unclassified),
        })
    }

    /// Evaluate a current value against the cached thresholds.
    pub fn check(&self, gauge_id: &str, value: f64, tier: Option<Tier>) -> Option<FloodAlert> {
        let monitor = self.for_monitor(gauge_id, tier)?;
        let (severity, threshold) = check_flood_level(value, &monitor.thresholds.levels())?;
        let unit = monitor.thresholds.unit;
        Some(FloodAlert {
            gauge_id: gauge_id.to_string(),
            severity,
            value,
            threshold,
            confidence: monitor.confidence,
            message: format!(
                "{}: {:?} level reached ({:.1} {} >= {:.1} {}), {}",
                gauge_id, severity, value, unit, threshold, unit, monitor.confidence
            ),
        })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let entries = self.entries();
        let json = serde_json::to_string_pretty(&entries).map_err(|e| io_err(e.into()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    /// Load a saved cache. A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<CachedThresholds> =
            serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|e| (e.gauge_id.clone(), e))
                    .collect(),
            ),
        })
    }
}
