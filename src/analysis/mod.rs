/// Reliability classification of discovered gauges.
///
/// Evidence aggregation, confidence scoring and tier classification are pure
/// functions of a gauge record, the reference station set and the configured
/// weights. `Assessor` runs the three steps in order and keeps the evidence
/// trail with the result so every tier can be explained after the fact.
///
/// Submodules:
/// - `evidence`: naming, provenance, id-format and station cross-reference.
/// - `scoring` : weighted-additive confidence score.
/// - `tiers`   : score ranges plus the quality-flag cap.

pub mod evidence;
pub mod scoring;
pub mod tiers;

use crate::config::DiscoveryConfig;
use crate::model::GaugeRecord;
use crate::stations::ReferenceRegistry;
use chrono::{DateTime, Utc};
use evidence::{EvidenceAggregator, EvidenceBundle};
use scoring::{ConfidenceScore, ConfidenceScorer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiers::{Tier, TierClassifier};

/// Current classification of one gauge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub evidence: EvidenceBundle,
    pub score: ConfidenceScore,
    pub tier: Tier,
    /// Human-readable evidence trail.
    pub notes: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}

impl Assessment {
    /// True if `other` reached the same conclusion from the same evidence.
    pub fn same_outcome(&self, other: &Assessment) -> bool {
        self.evidence == other.evidence && self.score == other.score && self.tier == other.tier
    }
}

pub struct Assessor {
    aggregator: EvidenceAggregator,
    scorer: ConfidenceScorer,
    classifier: TierClassifier,
}

impl Assessor {
    pub fn new(
        aggregator: EvidenceAggregator,
        scorer: ConfidenceScorer,
        classifier: TierClassifier,
    ) -> Self {
        Self {
            aggregator,
            scorer,
            classifier,
        }
    }

    pub fn from_config(config: &DiscoveryConfig, stations: Arc<ReferenceRegistry>) -> Self {
        Self::new(
            EvidenceAggregator::new(&config.evidence, stations),
            ConfidenceScorer::new(config.scoring.clone()),
            TierClassifier::new(config.tiers.clone()),
        )
    }

    pub fn assess(&self, record: &GaugeRecord) -> Assessment {
        self.assess_at(record, Utc::now())
    }

    pub fn assess_at(&self, record: &GaugeRecord, now: DateTime<Utc>) -> Assessment {
        let evidence = self.aggregator.aggregate(record);
        let score = self.scorer.score(&evidence);
        let tier = self.classifier.classify(score, record.quality_verified);
        let mut notes = evidence.describe(record);
        if !record.quality_verified && tier == Tier::Uncertain && self.would_exceed_cap(score) {
            notes.push(format!("Capped at {}: not quality verified", Tier::Uncertain));
        }

        Assessment {
            notes,
            evidence,
            score,
            tier,
            assessed_at: now,
        }
    }

    fn would_exceed_cap(&self, score: ConfidenceScore) -> bool {
        self.classifier.classify(score, true) > Tier::Uncertain
    }
}
