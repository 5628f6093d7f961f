/// Confidence scoring
///
/// Weighted-additive score over an evidence bundle. Each factor contributes
/// up to its weight; the sum is clamped to 0..=100. Provenance carries the
/// largest single weight. The scorer holds no state besides its weights, so
/// the same bundle always produces the same score.

use super::evidence::{EvidenceBundle, IdFormatClass, ProvenanceClass};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub named_site: u32,
    pub named_river: u32,
    pub physical_network: u32,
    pub modeled_source: u32,
    pub unknown_source: u32,
    pub quality_verified: u32,
    pub conventional_id_format: u32,
    /// Awarded in full at 0 km, scaled down linearly to 0 at the tolerance.
    pub external_match_max: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            named_site: 30,
            named_river: 20,
            physical_network: 40,
            modeled_source: 10,
            unknown_source: 0,
            quality_verified: 10,
            conventional_id_format: 20,
            external_match_max: 30,
        }
    }
}

/// Integer confidence in 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidenceScore(u8);

impl ConfidenceScore {
    pub const MAX: u8 = 100;

    pub fn new(points: u32) -> Self {
        Self(points.min(Self::MAX as u32) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ConfidenceScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    weights: ScoringWeights,
}

impl ConfidenceScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, bundle: &EvidenceBundle) -> ConfidenceScore {
        let w = &self.weights;
        let mut points = 0u32;

        if bundle.named_site {
            points += w.named_site;
        }
        if bundle.named_river {
            points += w.named_river;
        }
        points += match bundle.provenance {
            ProvenanceClass::PhysicalNetwork => w.physical_network,
            ProvenanceClass::ModeledSource => w.modeled_source,
            ProvenanceClass::Unknown => w.unknown_source,
        };
        if bundle.quality_verified {
            points += w.quality_verified;
        }
        if bundle.id_format == IdFormatClass::Conventional {
            points += w.conventional_id_format;
        }
        if let Some(m) = &bundle.external_match {
            let proximity = if m.proximity.is_finite() {
                m.proximity.clamp(0.0, 1.0)
            } else {
                0.0
            };
            points += (w.external_match_max as f64 * proximity).round() as u32;
        }

        ConfidenceScore::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::evidence::ExternalMatch;

    fn bundle() -> EvidenceBundle {
        EvidenceBundle {
            named_site: false,
            named_river: false,
            provenance: ProvenanceClass::ModeledSource,
            quality_verified: false,
            id_format: IdFormatClass::ModeledConvention,
            external_match: None,
        }
    }

    fn station_match(proximity: f64) -> Option<ExternalMatch> {
        Some(ExternalMatch {
            station_id: "TARBELA".into(),
            station_name: "Tarbela Dam".into(),
            agency: "WAPDA".into(),
            distance_km: (1.0 - proximity) * 5.0,
            proximity,
        })
    }

    #[test]
    fn test_modeled_unnamed_gauge_scores_low() {
        let score = ConfidenceScorer::default().score(&bundle());
        assert_eq!(score.value(), 10);
    }

    #[test]
    fn test_fully_evidenced_gauge_clamps_to_100() {
        let b = EvidenceBundle {
            named_site: true,
            named_river: true,
            provenance: ProvenanceClass::PhysicalNetwork,
            quality_verified: true,
            id_format: IdFormatClass::Conventional,
            external_match: station_match(1.0),
        };
        assert_eq!(ConfidenceScorer::default().score(&b).value(), 100);
    }

    #[test]
    fn test_external_boost_scales_with_proximity() {
        let scorer = ConfidenceScorer::default();
        let mut b = bundle();
        b.external_match = station_match(0.5);
        assert_eq!(scorer.score(&b).value(), 10 + 15);
        b.external_match = station_match(0.0);
        assert_eq!(scorer.score(&b).value(), 10);
    }

    #[test]
    fn test_provenance_is_largest_single_weight() {
        let w = ScoringWeights::default();
        for other in [
            w.named_site,
            w.named_river,
            w.quality_verified,
            w.conventional_id_format,
            w.external_match_max,
        ] {
            assert!(w.physical_network > other);
        }
    }

    #[test]
    fn test_score_is_deterministic() {
        let scorer = ConfidenceScorer::default();
        let mut b = bundle();
        b.named_site = true;
        b.external_match = station_match(0.37);
        let first = scorer.score(&b);
        for _ in 0..100 {
            assert_eq!(scorer.score(&b.clone()), first);
        }
    }
}
