/// Discovery store
///
/// Durable, deduplicated record of every identifier ever probed, plus the
/// gauge records created by FOUND probes. The store is the only state shared
/// between probe workers:
///
///   probes  : gauge_id -> ProbeEntry   (append-only result history)
///   gauges  : gauge_id -> StoredGauge  (created once, on first FOUND)
///   retries : (retry_after, gauge_id)  (TRANSIENT_ERROR entries awaiting TTL)
///   cursors : strategy name -> position
///
/// A write holds the probe map lock for its whole duration, so two workers
/// racing on the same identifier cannot both create a record and a
/// checkpoint never sees half of a write. Locks are always taken in the
/// order probes, gauges, retries.

use crate::analysis::Assessment;
use crate::logging::{self, LogSource};
use crate::model::{Candidate, FloodThresholds, GaugeRecord, ProbeResult, ProbeStatus, StrategyKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("checkpoint is inconsistent: {0}")]
    Inconsistent(String),
    #[error("FOUND result for {0} recorded without a gauge record")]
    MissingRecord(String),
}

// ---------------------------------------------------------------------------
// Stored types
// ---------------------------------------------------------------------------

/// Every probe of one identifier, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeEntry {
    pub gauge_id: String,
    /// Strategy that first produced the identifier.
    pub strategy: StrategyKind,
    pub attempts: u32,
    pub results: Vec<ProbeResult>,
}

impl ProbeEntry {
    fn new(gauge_id: &str, strategy: StrategyKind) -> Self {
        Self {
            gauge_id: gauge_id.to_string(),
            strategy,
            attempts: 0,
            results: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&ProbeResult> {
        self.results.last()
    }

    /// FOUND is sticky: once a gauge exists, later results cannot demote it.
    pub fn status(&self) -> Option<ProbeStatus> {
        if self.results.iter().any(|r| r.status == ProbeStatus::Found) {
            return Some(ProbeStatus::Found);
        }
        self.latest().map(|r| r.status)
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.status(),
            Some(ProbeStatus::Found) | Some(ProbeStatus::NotFound)
        )
    }

    fn pending_retry(&self) -> Option<DateTime<Utc>> {
        match self.status() {
            Some(ProbeStatus::TransientError) => self.latest().and_then(|r| r.retry_after),
            _ => None,
        }
    }
}

/// A discovered gauge and its current classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGauge {
    pub record: GaugeRecord,
    pub assessment: Option<Assessment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First FOUND for this identifier: the gauge record was created.
    Created,
    /// Repeat FOUND carrying new thresholds.
    ThresholdsRefreshed,
    /// Record unchanged: repeat NOT_FOUND (not appended), or repeat FOUND
    /// with the same data (appended to the history only).
    AlreadyKnown,
    /// Result appended to the history.
    Recorded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub found: usize,
    pub not_found: usize,
    pub transient: usize,
}

/// Serialized form of the whole store.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub cursors: BTreeMap<String, u64>,
    pub probes: Vec<ProbeEntry>,
    pub gauges: Vec<StoredGauge>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DiscoveryStore {
    probes: RwLock<HashMap<String, ProbeEntry>>,
    gauges: RwLock<HashMap<String, StoredGauge>>,
    retries: Mutex<BTreeSet<(DateTime<Utc>, String)>>,
    cursors: Mutex<BTreeMap<String, u64>>,
    found_count: AtomicUsize,
}

impl DiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_probes(&self) -> RwLockReadGuard<'_, HashMap<String, ProbeEntry>> {
        self.probes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn read_gauges(&self) -> RwLockReadGuard<'_, HashMap<String, StoredGauge>> {
        self.gauges.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a probe result.
    ///
    /// A FOUND result must come with the gauge record it produced. The first
    /// FOUND per identifier creates the record; later ones are appended to
    /// the history and may only refresh its thresholds. A NOT_FOUND on top of
    /// a NOT_FOUND changes nothing.
    pub fn record_result(
        &self,
        candidate: &Candidate,
        result: ProbeResult,
        gauge: Option<StoredGauge>,
    ) -> Result<RecordOutcome, StoreError> {
        let id = candidate.gauge_id.as_str();
        if result.status == ProbeStatus::Found && gauge.is_none() {
            return Err(StoreError::MissingRecord(id.to_string()));
        }

        let mut probes = self.probes.write().unwrap_or_else(|e| e.into_inner());
        let entry = probes
            .entry(id.to_string())
            .or_insert_with(|| ProbeEntry::new(id, candidate.strategy));

        let previous = entry.status();
        if previous == Some(ProbeStatus::NotFound) && result.status == ProbeStatus::NotFound {
            return Ok(RecordOutcome::AlreadyKnown);
        }

        let mut outcome = RecordOutcome::Recorded;
        if let Some(new_gauge) = gauge.filter(|_| result.status == ProbeStatus::Found) {
            let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
            match gauges.entry(id.to_string()) {
                Entry::Occupied(mut existing) => {
                    let current = &mut existing.get_mut().record;
                    outcome = if new_gauge.record.thresholds.is_some()
                        && current.thresholds != new_gauge.record.thresholds
                    {
                        current.thresholds = new_gauge.record.thresholds;
                        RecordOutcome::ThresholdsRefreshed
                    } else {
                        RecordOutcome::AlreadyKnown
                    };
                }
                Entry::Vacant(slot) => {
                    slot.insert(new_gauge);
                    self.found_count.fetch_add(1, Ordering::SeqCst);
                    outcome = RecordOutcome::Created;
                }
            }
        }

        let old_retry = entry.pending_retry();
        entry.attempts = entry.attempts.max(candidate.attempt);
        entry.results.push(result);
        let new_retry = entry.pending_retry();

        if old_retry != new_retry {
            let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = old_retry {
                retries.remove(&(at, id.to_string()));
            }
            if let Some(at) = new_retry {
                retries.insert((at, id.to_string()));
            }
        }

        Ok(outcome)
    }

    pub fn has_been_probed(&self, gauge_id: &str) -> bool {
        self.read_probes()
            .get(gauge_id)
            .is_some_and(|e| !e.results.is_empty())
    }

    /// True if the identifier may be handed out for probing at `now`: never
    /// probed, or a TRANSIENT_ERROR whose TTL has expired.
    pub fn is_eligible_at(&self, gauge_id: &str, now: DateTime<Utc>) -> bool {
        match self.read_probes().get(gauge_id) {
            None => true,
            Some(entry) => match entry.status() {
                None => true,
                Some(ProbeStatus::TransientError) => {
                    entry.pending_retry().is_none_or(|at| at <= now)
                }
                Some(_) => false,
            },
        }
    }

    pub fn attempts(&self, gauge_id: &str) -> u32 {
        self.read_probes().get(gauge_id).map(|e| e.attempts).unwrap_or(0)
    }

    pub fn status(&self, gauge_id: &str) -> Option<ProbeStatus> {
        self.read_probes().get(gauge_id).and_then(|e| e.status())
    }

    pub fn final_status(&self, gauge_id: &str) -> Option<ProbeStatus> {
        self.read_probes()
            .get(gauge_id)
            .filter(|e| e.is_final())
            .and_then(|e| e.status())
    }

    pub fn probe_entry(&self, gauge_id: &str) -> Option<ProbeEntry> {
        self.read_probes().get(gauge_id).cloned()
    }

    /// TRANSIENT_ERROR identifiers whose TTL has expired, oldest first.
    pub fn due_retries_at(&self, now: DateTime<Utc>) -> Vec<(String, StrategyKind)> {
        let due: Vec<String> = {
            let retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
            retries
                .iter()
                .take_while(|(at, _)| *at <= now)
                .map(|(_, id)| id.clone())
                .collect()
        };
        let probes = self.read_probes();
        due.into_iter()
            .filter_map(|id| {
                let strategy = probes.get(&id)?.strategy;
                Some((id, strategy))
            })
            .collect()
    }

    /// Earliest pending TTL expiry, if any.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        retries.iter().next().map(|(at, _)| *at)
    }

    /// Every discovered gauge, ordered by identifier.
    pub fn iter_found(&self) -> impl Iterator<Item = StoredGauge> {
        let mut found: Vec<StoredGauge> = self.read_gauges().values().cloned().collect();
        found.sort_by(|a, b| a.record.gauge_id.cmp(&b.record.gauge_id));
        found.into_iter()
    }

    pub fn found_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_gauges().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn found_count(&self) -> usize {
        self.found_count.load(Ordering::SeqCst)
    }

    pub fn probed_count(&self) -> usize {
        self.read_probes().len()
    }

    pub fn gauge(&self, gauge_id: &str) -> Option<StoredGauge> {
        self.read_gauges().get(gauge_id).cloned()
    }

    pub fn set_assessment(&self, gauge_id: &str, assessment: Assessment) -> bool {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        match gauges.get_mut(gauge_id) {
            Some(gauge) => {
                gauge.assessment = Some(assessment);
                true
            }
            None => false,
        }
    }

    /// Replace a gauge's thresholds. Identity and coordinate are untouched.
    pub fn refresh_thresholds(&self, gauge_id: &str, thresholds: Option<FloodThresholds>) -> bool {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        match gauges.get_mut(gauge_id) {
            Some(gauge) => {
                gauge.record.thresholds = thresholds;
                true
            }
            None => false,
        }
    }

    pub fn cursor(&self, strategy: &str) -> Option<u64> {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(strategy)
            .copied()
    }

    pub fn set_cursor(&self, strategy: &str, position: u64) {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strategy.to_string(), position);
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.read_probes().values() {
            match entry.status() {
                Some(ProbeStatus::Found) => counts.found += 1,
                Some(ProbeStatus::NotFound) => counts.not_found += 1,
                Some(ProbeStatus::TransientError) => counts.transient += 1,
                None => {}
            }
        }
        counts
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Consistent snapshot of the whole store, sorted by identifier.
    pub fn checkpoint(&self) -> Checkpoint {
        let probe_map = self.read_probes();
        let gauge_map = self.read_gauges();

        let mut probes: Vec<ProbeEntry> = probe_map
            .values()
            .filter(|e| !e.results.is_empty())
            .cloned()
            .collect();
        probes.sort_by(|a, b| a.gauge_id.cmp(&b.gauge_id));

        let mut gauges: Vec<StoredGauge> = gauge_map.values().cloned().collect();
        gauges.sort_by(|a, b| a.record.gauge_id.cmp(&b.record.gauge_id));

        Checkpoint {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            cursors: self
                .cursors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            probes,
            gauges,
        }
    }

    /// Rebuild a store from a snapshot, rejecting snapshots whose probe
    /// history and gauge records disagree.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self, StoreError> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }

        let mut store = Self::new();
        for entry in checkpoint.probes {
            if entry.results.is_empty() {
                return Err(StoreError::Inconsistent(format!(
                    "{} has no probe results",
                    entry.gauge_id
                )));
            }
            if let Some(at) = entry.pending_retry() {
                store
                    .retries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert((at, entry.gauge_id.clone()));
            }
            let id = entry.gauge_id.clone();
            if store
                .probes
                .get_mut()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), entry)
                .is_some()
            {
                return Err(StoreError::Inconsistent(format!("{} listed twice", id)));
            }
        }

        for gauge in checkpoint.gauges {
            let id = gauge.record.gauge_id.clone();
            if store.status(&id) != Some(ProbeStatus::Found) {
                return Err(StoreError::Inconsistent(format!(
                    "gauge {} has no FOUND probe result",
                    id
                )));
            }
            if store
                .gauges
                .get_mut()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone(), gauge)
                .is_some()
            {
                return Err(StoreError::Inconsistent(format!("gauge {} listed twice", id)));
            }
        }

        let found = store.read_gauges().len();
        let found_probes = store
            .read_probes()
            .values()
            .filter(|e| e.status() == Some(ProbeStatus::Found))
            .count();
        if found != found_probes {
            return Err(StoreError::Inconsistent(format!(
                "{} FOUND probes but {} gauge records",
                found_probes, found
            )));
        }
        store.found_count.store(found, Ordering::SeqCst);
        *store.cursors.lock().unwrap_or_else(|e| e.into_inner()) = checkpoint.cursors;
        Ok(store)
    }

    /// Write a checkpoint atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let checkpoint = self.checkpoint();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("tmp");
        let file = std::fs::File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &checkpoint).map_err(|e| StoreError::Io {
            path: tmp.clone(),
            source: e.into(),
        })?;
        writer.flush().map_err(io_err)?;
        drop(writer);
        std::fs::rename(&tmp, path).map_err(io_err)?;

        logging::debug(
            LogSource::Store,
            None,
            &format!(
                "Checkpoint saved: {} probed, {} found -> {}",
                checkpoint.probes.len(),
                checkpoint.gauges.len(),
                path.display()
            ),
        );
        Ok(())
    }

    /// Open a checkpoint. A missing file is a fresh start; an unreadable one
    /// is an error, never a silent restart from zero.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            logging::info(
                LogSource::Store,
                None,
                &format!("No checkpoint at {}, starting fresh", path.display()),
            );
            return Ok(Self::new());
        }

        let file = std::fs::File::open(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let store = Self::from_checkpoint(checkpoint)?;

        logging::info(
            LogSource::Store,
            None,
            &format!(
                "Resumed from {}: {} probed, {} found",
                path.display(),
                store.probed_count(),
                store.found_count()
            ),
        );
        Ok(store)
    }
}
