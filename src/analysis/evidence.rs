/// Evidence aggregation
///
/// Collects the scoring inputs for one discovered gauge: naming metadata,
/// provenance, the upstream quality flag, the identifier's naming convention,
/// and a geographic cross-reference against independently known stations.

use crate::config::EvidenceConfig;
use crate::model::{Coordinate, GaugeRecord};
use crate::stations::ReferenceRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceClass {
    /// Label of a physical monitoring network (high trust).
    PhysicalNetwork,
    /// Basin-model derived label (low trust).
    ModeledSource,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFormatClass {
    /// Follows the modeled-source naming convention.
    ModeledConvention,
    Conventional,
}

/// Nearest reference station inside the tolerance radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMatch {
    pub station_id: String,
    pub station_name: String,
    pub agency: String,
    pub distance_km: f64,
    /// 1.0 at zero distance, falling linearly to 0.0 at the tolerance radius.
    pub proximity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub named_site: bool,
    pub named_river: bool,
    pub provenance: ProvenanceClass,
    pub quality_verified: bool,
    pub id_format: IdFormatClass,
    pub external_match: Option<ExternalMatch>,
}

impl EvidenceBundle {
    /// Human-readable trail of what the score was built from.
    pub fn describe(&self, record: &GaugeRecord) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(site) = record.site_name.as_deref().filter(|_| self.named_site) {
            lines.push(format!("Named site: {}", site));
        }
        if let Some(river) = record.river.as_deref().filter(|_| self.named_river) {
            lines.push(format!("Named river: {}", river));
        }
        match self.provenance {
            ProvenanceClass::PhysicalNetwork => {
                lines.push(format!("Physical network: {}", record.source))
            }
            ProvenanceClass::ModeledSource => {
                lines.push(format!("{} - needs verification", record.source))
            }
            ProvenanceClass::Unknown if record.source.trim().is_empty() => {
                lines.push("No source label".to_string())
            }
            ProvenanceClass::Unknown => lines.push(format!("Unknown source: {}", record.source)),
        }
        if self.quality_verified {
            lines.push("Quality verified".to_string());
        }
        if self.id_format == IdFormatClass::Conventional {
            lines.push("Non-modeled ID format".to_string());
        }
        match &self.external_match {
            Some(m) => lines.push(format!(
                "Matches {} station {} ({:.2}km)",
                m.agency, m.station_name, m.distance_km
            )),
            None if record.location.is_none() => {
                lines.push("No coordinates for external validation".to_string())
            }
            None => {}
        }
        lines
    }
}

pub struct EvidenceAggregator {
    physical_sources: Vec<String>,
    modeled_sources: Vec<String>,
    modeled_id_prefix: String,
    tolerance_km: f64,
    stations: Arc<ReferenceRegistry>,
}

impl EvidenceAggregator {
    pub fn new(config: &EvidenceConfig, stations: Arc<ReferenceRegistry>) -> Self {
        Self {
            physical_sources: normalize_labels(&config.physical_sources),
            modeled_sources: normalize_labels(&config.modeled_sources),
            modeled_id_prefix: config.modeled_id_prefix.to_ascii_lowercase(),
            tolerance_km: config.tolerance_km,
            stations,
        }
    }

    pub fn tolerance_km(&self) -> f64 {
        self.tolerance_km
    }

    pub fn stations(&self) -> &ReferenceRegistry {
        &self.stations
    }

    pub fn aggregate(&self, record: &GaugeRecord) -> EvidenceBundle {
        EvidenceBundle {
            named_site: has_text(record.site_name.as_deref()),
            named_river: has_text(record.river.as_deref()),
            provenance: self.classify_provenance(&record.source),
            quality_verified: record.quality_verified,
            id_format: self.classify_id_format(&record.gauge_id),
            external_match: record.location.and_then(|loc| self.external_match(loc)),
        }
    }

    pub fn classify_provenance(&self, source: &str) -> ProvenanceClass {
        let label = source.trim().to_ascii_uppercase();
        if label.is_empty() {
            ProvenanceClass::Unknown
        } else if self.physical_sources.contains(&label) {
            ProvenanceClass::PhysicalNetwork
        } else if self.modeled_sources.contains(&label) {
            ProvenanceClass::ModeledSource
        } else {
            ProvenanceClass::Unknown
        }
    }

    pub fn classify_id_format(&self, gauge_id: &str) -> IdFormatClass {
        if gauge_id.to_ascii_lowercase().starts_with(&self.modeled_id_prefix) {
            IdFormatClass::ModeledConvention
        } else {
            IdFormatClass::Conventional
        }
    }

    pub fn external_match(&self, location: Coordinate) -> Option<ExternalMatch> {
        let (station, distance_km) = self.stations.nearest(location)?;
        if distance_km > self.tolerance_km {
            return None;
        }
        Some(ExternalMatch {
            station_id: station.station_id.clone(),
            station_name: station.name.clone(),
            agency: station.agency.clone(),
            distance_km,
            proximity: (1.0 - distance_km / self.tolerance_km).clamp(0.0, 1.0),
        })
    }
}

fn normalize_labels(labels: &[String]) -> Vec<String> {
    labels.iter().map(|l| l.trim().to_ascii_uppercase()).collect()
}

fn has_text(value: Option<&str>) -> bool {
    value.is_some_and(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn aggregator() -> EvidenceAggregator {
        EvidenceAggregator::new(&EvidenceConfig::default(), Arc::new(ReferenceRegistry::builtin()))
    }

    fn record(id: &str, source: &str, lat: f64, lon: f64) -> GaugeRecord {
        GaugeRecord {
            gauge_id: id.to_string(),
            location: Some(Coordinate {
                latitude: lat,
                longitude: lon,
            }),
            source: source.to_string(),
            site_name: Some("Tarbela Dam".into()),
            river: Some("   ".into()),
            quality_verified: true,
            has_model: true,
            thresholds: None,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn test_provenance_classes() {
        let agg = aggregator();
        assert_eq!(agg.classify_provenance("WAPDA"), ProvenanceClass::PhysicalNetwork);
        assert_eq!(agg.classify_provenance(" grdc "), ProvenanceClass::PhysicalNetwork);
        assert_eq!(agg.classify_provenance("HYBAS"), ProvenanceClass::ModeledSource);
        assert_eq!(agg.classify_provenance("GLOFAS"), ProvenanceClass::Unknown);
        assert_eq!(agg.classify_provenance(""), ProvenanceClass::Unknown);
    }

    #[test]
    fn test_id_format() {
        let agg = aggregator();
        assert_eq!(agg.classify_id_format("hybas_4120570410"), IdFormatClass::ModeledConvention);
        assert_eq!(agg.classify_id_format("HYBAS_4120570410"), IdFormatClass::ModeledConvention);
        assert_eq!(agg.classify_id_format("PK_TARBELA_01"), IdFormatClass::Conventional);
    }

    #[test]
    fn test_whitespace_names_do_not_count() {
        let bundle = aggregator().aggregate(&record("hybas_1", "WAPDA", 10.0, 10.0));
        assert!(bundle.named_site);
        assert!(!bundle.named_river);
    }

    #[test]
    fn test_exact_station_match_has_full_proximity() {
        let bundle = aggregator().aggregate(&record("hybas_1", "WAPDA", 33.90, 72.70));
        let m = bundle.external_match.expect("sits on Tarbela Dam");
        assert_eq!(m.station_id, "TARBELA");
        assert!(m.distance_km < 1e-9);
        assert!((m.proximity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_proximity_decays_with_distance() {
        // 0.027 degrees of latitude is roughly 3 km.
        let bundle = aggregator().aggregate(&record("hybas_1", "WAPDA", 33.927, 72.70));
        let m = bundle.external_match.expect("within 5 km");
        assert!(m.distance_km > 2.9 && m.distance_km < 3.1, "got {}", m.distance_km);
        assert!(m.proximity > 0.35 && m.proximity < 0.45, "got {}", m.proximity);
    }

    #[test]
    fn test_no_match_outside_tolerance_or_without_location() {
        let agg = aggregator();
        assert!(agg.aggregate(&record("hybas_1", "HYBAS", 10.0, 10.0)).external_match.is_none());

        let mut r = record("hybas_1", "HYBAS", 33.90, 72.70);
        r.location = None;
        let bundle = agg.aggregate(&r);
        assert!(bundle.external_match.is_none());
        assert!(bundle
            .describe(&r)
            .contains(&"No coordinates for external validation".to_string()));
    }

    #[test]
    fn test_evidence_trail() {
        let r = record("PK_TARBELA_01", "WAPDA", 33.90, 72.70);
        let lines = aggregator().aggregate(&r).describe(&r);
        assert_eq!(
            lines,
            vec![
                "Named site: Tarbela Dam",
                "Physical network: WAPDA",
                "Quality verified",
                "Non-modeled ID format",
                "Matches WAPDA station Tarbela Dam (0.00km)",
            ]
        );
    }
}
