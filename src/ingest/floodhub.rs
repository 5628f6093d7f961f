/// Google Flood Hub API Client
///
/// Looks up gauge metadata and flood threshold models by identifier. The
/// service offers no enumeration endpoint for the region of interest, which
/// is why discovery probes identifiers one at a time.
///
/// Gauge lookup:  GET {base}/gauges/{gaugeId}
/// Model lookup:  GET {base}/gaugeModels/{gaugeId}
///
/// The API key travels in the `X-goog-api-key` header.

use super::{Lookup, LookupApi};
use crate::config::ApiConfig;
use crate::model::{ApiError, Coordinate, FloodThresholds, GaugeRecord, GaugeValueUnit};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

const API_KEY_HEADER: &str = "X-goog-api-key";

// ============================================================================
// Flood Hub Response Structures
// ============================================================================

/// Gauge metadata as returned by `GET /gauges/{id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloodHubGauge {
    pub gauge_id: String,
    #[serde(default)]
    pub location: Option<FloodHubLocation>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub river: Option<String>,
    #[serde(default)]
    pub quality_verified: bool,
    #[serde(default)]
    pub has_model: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FloodHubLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Threshold model as returned by `GET /gaugeModels/{id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloodHubGaugeModel {
    #[serde(default)]
    pub gauge_id: Option<String>,
    #[serde(default)]
    pub gauge_model_id: Option<String>,
    #[serde(default)]
    pub thresholds: Option<FloodHubThresholds>,
    #[serde(default)]
    pub gauge_value_unit: GaugeValueUnit,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloodHubThresholds {
    pub warning_level: Option<f64>,
    pub danger_level: Option<f64>,
    #[serde(default)]
    pub extreme_danger_level: Option<f64>,
}

// ============================================================================
// URL Builders
// ============================================================================

pub fn build_gauge_url(base_url: &str, gauge_id: &str) -> String {
    format!("{}/gauges/{}", base_url.trim_end_matches('/'), gauge_id)
}

pub fn build_model_url(base_url: &str, gauge_id: &str) -> String {
    format!("{}/gaugeModels/{}", base_url.trim_end_matches('/'), gauge_id)
}

// ============================================================================
// Response Classification & Parsing
// ============================================================================

/// Map a non-success HTTP status onto the lookup taxonomy.
///
/// 404 and 400 both mean "no gauge by that identifier": the service answers
/// malformed-but-plausible ids with 400. Everything else is transient.
pub fn classify_status<T>(status: u16) -> Result<Lookup<T>, ApiError> {
    match status {
        400 | 404 => Ok(Lookup::NotFound),
        429 => Err(ApiError::Throttled),
        408 | 504 => Err(ApiError::Timeout),
        500..=599 => Err(ApiError::ServerError(status)),
        _ => Err(ApiError::Rejected(status)),
    }
}

pub fn parse_gauge_response(raw: &str) -> Result<FloodHubGauge, ApiError> {
    let gauge: FloodHubGauge = serde_json::from_str(raw).map_err(|e| ApiError::Malformed {
        reason: e.to_string(),
        raw: raw.to_string(),
    })?;
    if gauge.gauge_id.trim().is_empty() {
        return Err(ApiError::Malformed {
            reason: "empty gaugeId".to_string(),
            raw: raw.to_string(),
        });
    }
    Ok(gauge)
}

pub fn parse_model_response(raw: &str) -> Result<FloodHubGaugeModel, ApiError> {
    serde_json::from_str(raw).map_err(|e| ApiError::Malformed {
        reason: e.to_string(),
        raw: raw.to_string(),
    })
}

/// Usable thresholds from a model response.
///
/// Models without both warning and danger levels, or with levels out of
/// order, yield `None`.
pub fn thresholds_from_model(model: &FloodHubGaugeModel) -> Option<FloodThresholds> {
    let t = model.thresholds.as_ref()?;
    let thresholds = FloodThresholds {
        warning_level: t.warning_level?,
        danger_level: t.danger_level?,
        extreme_danger_level: t.extreme_danger_level,
        unit: model.gauge_value_unit,
    };
    thresholds.is_ordered().then_some(thresholds)
}

/// Convert a gauge response into a discovery record.
///
/// A missing `source` is kept as an empty label so the provenance check can
/// classify it as unknown.
pub fn to_gauge_record(gauge: FloodHubGauge, discovered_at: DateTime<Utc>) -> GaugeRecord {
    let location = gauge
        .location
        .filter(|l| l.latitude.is_finite() && l.longitude.is_finite())
        .map(|l| Coordinate {
            latitude: l.latitude,
            longitude: l.longitude,
        });

    GaugeRecord {
        gauge_id: gauge.gauge_id,
        location,
        source: gauge.source.unwrap_or_default(),
        site_name: non_blank(gauge.site_name),
        river: non_blank(gauge.river),
        quality_verified: gauge.quality_verified,
        has_model: gauge.has_model,
        thresholds: None,
        discovered_at,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ============================================================================
// HTTP Client
// ============================================================================

/// Blocking Flood Hub client shared by all probe workers.
pub struct FloodHubClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

impl FloodHubClient {
    pub fn new(config: &ApiConfig, api_key: String) -> Result<Self, ApiError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key,
        })
    }

    /// Body of a successful response, `None` when the gauge does not exist.
    fn fetch(&self, url: &str) -> Result<Option<String>, ApiError> {
        let response = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Accept", "application/json")
            .send()
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return classify_status::<()>(status.as_u16()).map(|_| None);
        }

        response.text().map(Some).map_err(map_transport_error)
    }
}

fn map_transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout
    } else if let Some(status) = err.status() {
        match classify_status::<()>(status.as_u16()) {
            Err(e) => e,
            Ok(_) => ApiError::Rejected(status.as_u16()),
        }
    } else {
        ApiError::Network(err.to_string())
    }
}

impl LookupApi for FloodHubClient {
    fn get_gauge(&self, gauge_id: &str) -> Result<Lookup<FloodHubGauge>, ApiError> {
        match self.fetch(&build_gauge_url(&self.base_url, gauge_id))? {
            Some(raw) => Ok(Lookup::Found {
                value: parse_gauge_response(&raw)?,
                raw,
            }),
            None => Ok(Lookup::NotFound),
        }
    }

    fn get_gauge_model(&self, gauge_id: &str) -> Result<Lookup<FloodHubGaugeModel>, ApiError> {
        match self.fetch(&build_model_url(&self.base_url, gauge_id))? {
            Some(raw) => Ok(Lookup::Found {
                value: parse_model_response(&raw)?,
                raw,
            }),
            None => Ok(Lookup::NotFound),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
