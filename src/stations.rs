/// Reference station registry for external validation.
///
/// Defines the independently sourced physical stations (dams, barrages,
/// headworks and agency monitoring points) that discovered gauges are
/// cross-referenced against. A gauge sitting on top of a known station is
/// strong evidence that it reports from real hardware.
///
/// The built-in registry covers the Pakistani networks operated by WAPDA,
/// the Federal Flood Division, PMD and NDMA. Deployments can replace it with
/// a TOML file (`[[stations]]` entries) owned by whoever curates the list.

use crate::config::ConfigError;
use crate::model::Coordinate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0088;

// ---------------------------------------------------------------------------
// Station metadata
// ---------------------------------------------------------------------------

/// A physical station known from an agency other than the upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStation {
    /// Agency station code, e.g. "TARBELA" or "FFD_CHITRAL".
    pub station_id: String,
    pub name: String,
    /// Owning agency label, e.g. "WAPDA".
    pub agency: String,
    #[serde(default)]
    pub river: Option<String>,
    /// WGS84 latitude.
    pub latitude: f64,
    /// WGS84 longitude.
    pub longitude: f64,
}

impl ReferenceStation {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Compile-time entry of the built-in registry.
struct BuiltinStation {
    station_id: &'static str,
    name: &'static str,
    agency: &'static str,
    river: &'static str,
    latitude: f64,
    longitude: f64,
}

/// Known physical stations, grouped by operating agency.
///
/// Sources:
///   - WAPDA: major dams and barrages on the Indus system
///   - FFD: Federal Flood Division monitoring points
///   - PMD: Pakistan Meteorological Department hydro stations
///   - NDMA: disaster management reference points
static BUILTIN_STATIONS: &[BuiltinStation] = &[
    // Indus River System
    BuiltinStation { station_id: "TARBELA", name: "Tarbela Dam", agency: "WAPDA", river: "Indus", latitude: 33.90, longitude: 72.70 },
    BuiltinStation { station_id: "KALABAGH", name: "Kalabagh", agency: "WAPDA", river: "Indus", latitude: 32.96, longitude: 71.55 },
    BuiltinStation { station_id: "CHASHMA", name: "Chashma Barrage", agency: "WAPDA", river: "Indus", latitude: 32.45, longitude: 71.35 },
    BuiltinStation { station_id: "SUKKUR", name: "Sukkur Barrage", agency: "WAPDA", river: "Indus", latitude: 27.70, longitude: 68.85 },
    BuiltinStation { station_id: "KOTRI", name: "Kotri Barrage", agency: "WAPDA", river: "Indus", latitude: 25.37, longitude: 68.31 },
    // Chenab River System
    BuiltinStation { station_id: "MARALA", name: "Marala Headworks", agency: "WAPDA", river: "Chenab", latitude: 32.67, longitude: 74.46 },
    BuiltinStation { station_id: "KHANKI", name: "Khanki Headworks", agency: "WAPDA", river: "Chenab", latitude: 31.30, longitude: 73.58 },
    BuiltinStation { station_id: "QADIRABAD", name: "Qadirabad Barrage", agency: "WAPDA", river: "Chenab", latitude: 31.40, longitude: 73.52 },
    // Jhelum River System
    BuiltinStation { station_id: "MANGLA", name: "Mangla Dam", agency: "WAPDA", river: "Jhelum", latitude: 33.13, longitude: 73.64 },
    BuiltinStation { station_id: "RASUL", name: "Rasul Barrage", agency: "WAPDA", river: "Jhelum", latitude: 31.36, longitude: 73.52 },
    // Ravi River System
    BuiltinStation { station_id: "JASSAR", name: "Jassar Barrage", agency: "WAPDA", river: "Ravi", latitude: 31.05, longitude: 73.92 },
    BuiltinStation { station_id: "BALLOKI", name: "Balloki Headworks", agency: "WAPDA", river: "Ravi", latitude: 31.22, longitude: 73.72 },
    // Sutlej River System
    BuiltinStation { station_id: "SULEMANKI", name: "Sulemanki Headworks", agency: "WAPDA", river: "Sutlej", latitude: 30.07, longitude: 73.07 },
    BuiltinStation { station_id: "ISLAM", name: "Islam Headworks", agency: "WAPDA", river: "Sutlej", latitude: 30.92, longitude: 72.18 },
    // Kabul and Kurram
    BuiltinStation { station_id: "WARSAK", name: "Warsak Dam", agency: "WAPDA", river: "Kabul", latitude: 34.15, longitude: 71.40 },
    BuiltinStation { station_id: "KURRAM", name: "Kurram Tangi Dam", agency: "WAPDA", river: "Kurram", latitude: 33.77, longitude: 69.95 },
    // Federal Flood Division
    BuiltinStation { station_id: "FFD_ATTOCK", name: "Attock", agency: "FFD", river: "Indus", latitude: 33.77, longitude: 72.36 },
    BuiltinStation { station_id: "FFD_NOWSHERA", name: "Nowshera", agency: "FFD", river: "Kabul", latitude: 34.02, longitude: 71.98 },
    BuiltinStation { station_id: "FFD_KURAM", name: "Kuram Garhi", agency: "FFD", river: "Indus", latitude: 32.58, longitude: 71.13 },
    BuiltinStation { station_id: "FFD_CHITRAL", name: "Chitral", agency: "FFD", river: "Chitral", latitude: 35.85, longitude: 71.79 },
    BuiltinStation { station_id: "FFD_ZHOB", name: "Zhob", agency: "FFD", river: "Zhob", latitude: 31.34, longitude: 69.45 },
    BuiltinStation { station_id: "FFD_SIBI", name: "Sibi", agency: "FFD", river: "Nari", latitude: 29.54, longitude: 67.88 },
    BuiltinStation { station_id: "FFD_TRIMMU", name: "Trimmu", agency: "FFD", river: "Chenab", latitude: 31.05, longitude: 72.18 },
    BuiltinStation { station_id: "FFD_SIDHNAI", name: "Sidhnai", agency: "FFD", river: "Ravi", latitude: 30.67, longitude: 72.92 },
    // Pakistan Meteorological Department
    BuiltinStation { station_id: "PMD_PESHAWAR", name: "Peshawar", agency: "PMD", river: "Kabul", latitude: 34.02, longitude: 71.53 },
    BuiltinStation { station_id: "PMD_LAHORE", name: "Lahore", agency: "PMD", river: "Ravi", latitude: 31.55, longitude: 74.35 },
    BuiltinStation { station_id: "PMD_MULTAN", name: "Multan", agency: "PMD", river: "Chenab", latitude: 30.20, longitude: 71.45 },
    BuiltinStation { station_id: "PMD_HYDERABAD", name: "Hyderabad", agency: "PMD", river: "Indus", latitude: 25.37, longitude: 68.37 },
    BuiltinStation { station_id: "PMD_KARACHI", name: "Karachi", agency: "PMD", river: "Hub", latitude: 24.86, longitude: 67.01 },
    BuiltinStation { station_id: "PMD_QUETTA", name: "Quetta", agency: "PMD", river: "Hab", latitude: 30.18, longitude: 66.98 },
    BuiltinStation { station_id: "PMD_GILGIT", name: "Gilgit", agency: "PMD", river: "Gilgit", latitude: 35.92, longitude: 74.31 },
    BuiltinStation { station_id: "PMD_SKARDU", name: "Skardu", agency: "PMD", river: "Indus", latitude: 35.30, longitude: 75.63 },
    // National Disaster Management Authority
    BuiltinStation { station_id: "NDMA_MZD", name: "Muzaffarabad", agency: "NDMA", river: "Jhelum", latitude: 34.37, longitude: 73.47 },
    BuiltinStation { station_id: "NDMA_MITHI", name: "Mithi", agency: "NDMA", river: "Rann", latitude: 24.74, longitude: 69.78 },
    BuiltinStation { station_id: "NDMA_JACOB", name: "Jacobabad", agency: "NDMA", river: "Indus", latitude: 28.28, longitude: 68.44 },
    BuiltinStation { station_id: "NDMA_DIKAN", name: "DI Khan", agency: "NDMA", river: "Indus", latitude: 31.83, longitude: 70.90 },
    BuiltinStation { station_id: "NDMA_BANNU", name: "Bannu", agency: "NDMA", river: "Kurram", latitude: 32.99, longitude: 70.60 },
];

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StationFile {
    stations: Vec<ReferenceStation>,
}

/// Read-only set of reference stations used during one discovery run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceRegistry {
    stations: Vec<ReferenceStation>,
}

impl ReferenceRegistry {
    pub fn new(stations: Vec<ReferenceStation>) -> Self {
        Self { stations }
    }

    /// The compiled-in WAPDA / FFD / PMD / NDMA station list.
    pub fn builtin() -> Self {
        let stations = BUILTIN_STATIONS
            .iter()
            .map(|s| ReferenceStation {
                station_id: s.station_id.to_string(),
                name: s.name.to_string(),
                agency: s.agency.to_string(),
                river: Some(s.river.to_string()),
                latitude: s.latitude,
                longitude: s.longitude,
            })
            .collect();
        Self { stations }
    }

    /// Load stations from a TOML file of `[[stations]]` tables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|reason| ConfigError::Invalid(format!(
            "{}: {}",
            path.display(),
            reason
        )))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let file: StationFile = toml::from_str(text).map_err(|e| e.to_string())?;
        let registry = Self::new(file.stations);
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for station in &self.stations {
            if !seen.insert(station.station_id.as_str()) {
                return Err(format!("duplicate station id '{}'", station.station_id));
            }
            if !(-90.0..=90.0).contains(&station.latitude)
                || !(-180.0..=180.0).contains(&station.longitude)
            {
                return Err(format!(
                    "station '{}' has out-of-range coordinates ({}, {})",
                    station.station_id, station.latitude, station.longitude
                ));
            }
        }
        Ok(())
    }

    pub fn stations(&self) -> &[ReferenceStation] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Looks up a station by code. Returns `None` if not found.
    pub fn find(&self, station_id: &str) -> Option<&ReferenceStation> {
        self.stations.iter().find(|s| s.station_id == station_id)
    }

    /// Closest station to `point`, with its distance in kilometres.
    ///
    /// Ties are broken by station id so the answer does not depend on file
    /// order.
    pub fn nearest(&self, point: Coordinate) -> Option<(&ReferenceStation, f64)> {
        self.stations
            .iter()
            .map(|s| (s, haversine_km(point, s.coordinate())))
            .min_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| a.0.station_id.cmp(&b.0.station_id))
            })
    }

    /// Every station within `tolerance_km` of `point`, nearest first.
    pub fn within(&self, point: Coordinate, tolerance_km: f64) -> Vec<(&ReferenceStation, f64)> {
        let mut matches: Vec<_> = self
            .stations
            .iter()
            .map(|s| (s, haversine_km(point, s.coordinate())))
            .filter(|(_, d)| *d <= tolerance_km)
            .collect();
        matches.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.station_id.cmp(&b.0.station_id))
        });
        matches
    }

    /// Station counts per owning agency.
    pub fn coverage_by_agency(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for station in &self.stations {
            *counts.entry(station.agency.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Great-circle distance between two coordinates, in kilometres.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
