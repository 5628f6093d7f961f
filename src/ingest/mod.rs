/// Upstream lookup API.
///
/// `LookupApi` is the seam between discovery and the network: the live
/// Flood Hub client implements it over HTTP, and `dev_mode::ReplayApi`
/// implements it from recorded payloads for offline runs and tests.

pub mod floodhub;

#[cfg(test)]
pub(crate) mod fixtures;

use crate::model::ApiError;
use floodhub::{FloodHubGauge, FloodHubGaugeModel};

/// Outcome of a lookup that reached the upstream service.
///
/// `NotFound` is a normal answer, not an error: almost every probed
/// identifier resolves to it.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found { value: T, raw: String },
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            Lookup::NotFound => None,
        }
    }
}

/// Identifier-keyed gauge metadata lookup.
///
/// Implementations must be safe to call from many probe workers at once.
pub trait LookupApi: Send + Sync {
    fn get_gauge(&self, gauge_id: &str) -> Result<Lookup<FloodHubGauge>, ApiError>;

    fn get_gauge_model(&self, gauge_id: &str) -> Result<Lookup<FloodHubGaugeModel>, ApiError>;
}
