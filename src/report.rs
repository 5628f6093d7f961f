//! Run and registry reports
//!
//! Two outputs for operators and downstream collaborators:
//!
//! - `RunReport`: per-strategy FOUND / NOT_FOUND / ERROR counts and hit rate
//!   for one discovery run, so an operator can decide whether to continue,
//!   switch strategy, or stop.
//! - `RegistryReport`: every discovered gauge with coordinate, provenance,
//!   tier, score, evidence trail and thresholds, plus tier / source / quality
//!   summaries. Written as JSON for the dashboard.

use crate::analysis::tiers::{ConfidenceLabel, Tier};
use crate::discovery::runner::StopReason;
use crate::discovery::store::DiscoveryStore;
use crate::logging::{self, LogSource};
use crate::model::{FloodThresholds, ProbeStatus, StrategyKind};
use crate::stations::ReferenceRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// Run Report
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub found: u64,
    pub not_found: u64,
    pub errors: u64,
}

impl StrategyReport {
    pub fn probed(&self) -> u64 {
        self.found + self.not_found + self.errors
    }

    /// Percentage of probes that found a gauge.
    pub fn hit_rate(&self) -> f64 {
        match self.probed() {
            0 => 0.0,
            n => self.found as f64 / n as f64 * 100.0,
        }
    }

    pub fn record(&mut self, status: ProbeStatus) {
        match status {
            ProbeStatus::Found => self.found += 1,
            ProbeStatus::NotFound => self.not_found += 1,
            ProbeStatus::TransientError => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub dispatched: u64,
    /// Queued candidates dropped unprobed because the run was stopping.
    pub skipped: u64,
    pub strategies: BTreeMap<StrategyKind, StrategyReport>,
    pub gauges_in_store: usize,
    pub backoff_level: u32,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            stop_reason: None,
            dispatched: 0,
            skipped: 0,
            strategies: BTreeMap::new(),
            gauges_in_store: 0,
            backoff_level: 0,
        }
    }

    pub fn record(&mut self, strategy: StrategyKind, status: ProbeStatus) {
        self.strategies.entry(strategy).or_default().record(status);
    }

    pub fn totals(&self) -> StrategyReport {
        self.strategies
            .values()
            .fold(StrategyReport::default(), |mut acc, s| {
                acc.found += s.found;
                acc.not_found += s.not_found;
                acc.errors += s.errors;
                acc
            })
    }
}

pub fn log_run_report(report: &RunReport) {
    for (strategy, counts) in &report.strategies {
        logging::log_strategy_summary(*strategy, counts.found, counts.not_found, counts.errors);
    }
    let totals = report.totals();
    logging::info(
        LogSource::System,
        None,
        &format!(
            "Run stopped ({:?}): {} dispatched, {} probed, {} found (hit rate {:.3}%), {} gauges in store",
            report.stop_reason,
            report.dispatched,
            totals.probed(),
            totals.found,
            totals.hit_rate(),
            report.gauges_in_store
        ),
    );
}

pub fn print_run_report(report: &RunReport) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("DISCOVERY RUN SUMMARY");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("{:<10} {:>8} {:>10} {:>8} {:>10}", "Strategy", "Found", "Not found", "Errors", "Hit rate");
    for (strategy, s) in &report.strategies {
        println!(
            "{:<10} {:>8} {:>10} {:>8} {:>9.3}%",
            strategy.to_string(),
            s.found,
            s.not_found,
            s.errors,
            s.hit_rate()
        );
    }
    let t = report.totals();
    println!(
        "{:<10} {:>8} {:>10} {:>8} {:>9.3}%",
        "total",
        t.found,
        t.not_found,
        t.errors,
        t.hit_rate()
    );
    println!();
    if let Some(reason) = report.stop_reason {
        println!("Stopped:          {:?}", reason);
    }
    println!("Dispatched:       {} ({} skipped: stopping or already final)", report.dispatched, report.skipped);
    println!("Gauges in store:  {}", report.gauges_in_store);
    println!("Backoff level:    {}", report.backoff_level);
    println!("═══════════════════════════════════════════════════════════");
}

// ============================================================================
// Registry Report
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub gauge_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source: String,
    pub site_name: Option<String>,
    pub river: Option<String>,
    pub quality_verified: bool,
    pub has_model: bool,
    pub tier: Option<Tier>,
    pub score: Option<u8>,
    pub confidence: ConfidenceLabel,
    pub evidence: Vec<String>,
    pub matched_station: Option<String>,
    pub thresholds: Option<FloodThresholds>,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_tier: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub quality_verified: usize,
    pub with_thresholds: usize,
    pub external_matches: usize,
    pub unassessed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryReport {
    pub generated_at: DateTime<Utc>,
    pub summary: RegistrySummary,
    /// Reference stations per agency the gauges were validated against.
    pub station_coverage: BTreeMap<String, usize>,
    pub gauges: Vec<RegistryEntry>,
}

pub fn build_registry(
    store: &DiscoveryStore,
    stations: &ReferenceRegistry,
    generated_at: DateTime<Utc>,
) -> RegistryReport {
    let mut summary = RegistrySummary::default();
    for tier in Tier::ALL {
        summary.by_tier.insert(tier.to_string(), 0);
    }

    let gauges: Vec<RegistryEntry> = store
        .iter_found()
        .map(|stored| {
            let record = stored.record;
            let assessment = stored.assessment;

            summary.total += 1;
            let source = if record.source.trim().is_empty() {
                "UNKNOWN".to_string()
            } else {
                record.source.clone()
            };
            *summary.by_source.entry(source).or_default() += 1;
            if record.quality_verified {
                summary.quality_verified += 1;
            }
            if record.thresholds.is_some() {
                summary.with_thresholds += 1;
            }
            match &assessment {
                Some(a) => {
                    *summary.by_tier.entry(a.tier.to_string()).or_default() += 1;
                    if a.evidence.external_match.is_some() {
                        summary.external_matches += 1;
                    }
                }
                None => summary.unassessed += 1,
            }

            RegistryEntry {
                latitude: record.location.map(|l| l.latitude),
                longitude: record.location.map(|l| l.longitude),
                tier: assessment.as_ref().map(|a| a.tier),
                score: assessment.as_ref().map(|a| a.score.value()),
                confidence: assessment
                    .as_ref()
                    .map(|a| a.tier.confidence_label())
                    .unwrap_or(ConfidenceLabel::Unclassified),
                evidence: assessment
                    .as_ref()
                    .map(|a| a.notes.clone())
                    .unwrap_or_default(),
                matched_station: assessment
                    .as_ref()
                    .and_then(|a| a.evidence.external_match.as_ref())
                    .map(|m| m.station_id.clone()),
                gauge_id: record.gauge_id,
                source: record.source,
                site_name: record.site_name,
                river: record.river,
                quality_verified: record.quality_verified,
                has_model: record.has_model,
                thresholds: record.thresholds,
                discovered_at: record.discovered_at,
            }
        })
        .collect();

    RegistryReport {
        generated_at,
        summary,
        station_coverage: stations.coverage_by_agency(),
        gauges,
    }
}

pub fn print_registry_summary(report: &RegistryReport) {
    let s = &report.summary;
    let pct = |n: usize| {
        if s.total == 0 {
            0.0
        } else {
            n as f64 / s.total as f64 * 100.0
        }
    };

    println!("\n═══════════════════════════════════════════════════════════");
    println!("GAUGE REGISTRY ({} gauges)", s.total);
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Reliability tiers:");
    for tier in Tier::ALL {
        let n = s.by_tier.get(tier.as_str()).copied().unwrap_or(0);
        println!("  {:<18} {:>6}  ({:.1}%)", tier.as_str(), n, pct(n));
    }
    if s.unassessed > 0 {
        println!("  {:<18} {:>6}", "unassessed", s.unassessed);
    }
    println!();
    println!("Sources:");
    for (source, n) in &s.by_source {
        println!("  {:<18} {:>6}  ({:.1}%)", source, n, pct(*n));
    }
    println!();
    println!("Quality verified: {:>6}  ({:.1}%)", s.quality_verified, pct(s.quality_verified));
    println!("With thresholds:  {:>6}  ({:.1}%)", s.with_thresholds, pct(s.with_thresholds));
    println!("Station matches:  {:>6}  ({:.1}%)", s.external_matches, pct(s.external_matches));
    println!();
    println!("Reference stations:");
    for (agency, n) in &report.station_coverage {
        println!("  {:<18} {:>6}", agency, n);
    }
    println!("═══════════════════════════════════════════════════════════");
}

/// Write any report as pretty JSON.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
}
