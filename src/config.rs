//! Service configuration.
//!
//! Everything tunable lives in one TOML file (`discovery.toml` by default).
//! Every section is optional and falls back to the defaults below, so an
//! empty file is a valid configuration. Secrets never live in the file: the
//! Flood Hub API key and the database URL come from the environment, with a
//! `.env` file loaded through `dotenv`.

use crate::analysis::scoring::ScoringWeights;
use crate::analysis::tiers::TierPolicy;
use crate::model::{MODELED_ID_PREFIX, MODELED_SOURCE_LABEL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://floodforecasting.googleapis.com/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub api: ApiConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub run: RunConfig,
    pub evidence: EvidenceConfig,
    pub scoring: ScoringWeights,
    pub tiers: TierPolicy,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 10,
            user_agent: concat!("gauge_discovery/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Upstream request budget shared by all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum requests in any rolling window.
    pub requests_per_window: u32,
    pub window_secs: u64,
    /// Throttle-free time needed to undo one backoff level.
    pub cooldown_secs: u64,
    /// Each level halves the budget; this caps how far it can fall.
    pub max_backoff_level: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window_secs: 60,
            cooldown_secs: 300,
            max_backoff_level: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// How long a TRANSIENT_ERROR candidate waits before it may be probed again.
    pub transient_ttl_minutes: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            transient_ttl_minutes: 60,
        }
    }
}

impl RetryConfig {
    pub fn transient_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.transient_ttl_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Stop after dispatching this many candidates.
    pub candidate_budget: Option<u64>,
    /// Stop scheduling new work after this many minutes.
    pub deadline_minutes: Option<u64>,
    /// Save the checkpoint after every N dispatched candidates.
    pub checkpoint_every: u64,
    pub checkpoint_path: PathBuf,
    pub registry_path: PathBuf,
    pub threshold_cache_path: PathBuf,
    /// Replaces the built-in reference stations when set.
    pub reference_stations_path: Option<PathBuf>,
    /// Cached thresholds older than this are reported as stale.
    pub threshold_max_age_hours: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            candidate_budget: None,
            deadline_minutes: None,
            checkpoint_every: 500,
            checkpoint_path: PathBuf::from("discovery_checkpoint.json"),
            registry_path: PathBuf::from("gauge_registry.json"),
            threshold_cache_path: PathBuf::from("threshold_cache.json"),
            reference_stations_path: None,
            threshold_max_age_hours: 6,
        }
    }
}

impl RunConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_minutes.map(|m| Duration::from_secs(m * 60))
    }
}

/// Inputs to the evidence aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Provenance labels of physical monitoring networks (high trust).
    pub physical_sources: Vec<String>,
    /// Provenance labels of modeled / basin-derived gauges (low trust).
    pub modeled_sources: Vec<String>,
    /// Identifier prefix of the modeled-source naming convention.
    pub modeled_id_prefix: String,
    /// Reference stations further away than this do not count as a match.
    pub tolerance_km: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            physical_sources: vec!["GRDC".into(), "WAPDA".into(), "PMD".into()],
            modeled_sources: vec![MODELED_SOURCE_LABEL.into()],
            modeled_id_prefix: MODELED_ID_PREFIX.into(),
            tolerance_km: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub strategies: Vec<StrategyConfig>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        // Pakistan sub-region of the HydroBASINS level-12 id space.
        Self {
            strategies: vec![
                StrategyConfig::Cluster {
                    weight: 4,
                    radius: 500,
                    step: 10,
                },
                StrategyConfig::Pattern {
                    weight: 2,
                    prefix: Some(MODELED_ID_PREFIX.into()),
                    varying_digits: 4,
                    top_endings: 5,
                },
                StrategyConfig::Range {
                    weight: 1,
                    prefix: MODELED_ID_PREFIX.into(),
                    width: 10,
                    start: 4_120_000_000,
                    end: 4_129_999_999,
                    step: 10,
                },
            ],
        }
    }
}

/// One generation strategy, tagged by `kind` in the TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Every `step`-th identifier in `[start, end]`, ascending.
    Range {
        weight: u32,
        prefix: String,
        width: usize,
        start: u64,
        end: u64,
        #[serde(default = "default_step")]
        step: u64,
    },
    /// Unseen identifiers sharing stems, endings and digit frequencies with
    /// known hits.
    Pattern {
        weight: u32,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_varying_digits")]
        varying_digits: u32,
        #[serde(default = "default_top_endings")]
        top_endings: usize,
    },
    /// ±`radius` around every known hit, walked outward in `step` increments.
    Cluster {
        weight: u32,
        radius: u64,
        #[serde(default = "default_step")]
        step: u64,
    },
}

fn default_step() -> u64 {
    1
}

fn default_varying_digits() -> u32 {
    4
}

fn default_top_endings() -> usize {
    5
}

impl StrategyConfig {
    pub fn weight(&self) -> u32 {
        match self {
            StrategyConfig::Range { weight, .. }
            | StrategyConfig::Pattern { weight, .. }
            | StrategyConfig::Cluster { weight, .. } => *weight,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl DiscoveryConfig {
    /// Parse and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DiscoveryConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DiscoveryConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.run.workers == 0 {
            return invalid("run.workers must be at least 1".into());
        }
        if self.run.queue_capacity == 0 {
            return invalid("run.queue_capacity must be at least 1".into());
        }
        if self.rate_limit.requests_per_window == 0 || self.rate_limit.window_secs == 0 {
            return invalid("rate_limit budget and window must be non-zero".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.transient_ttl_minutes < 0 {
            return invalid("retry.transient_ttl_minutes cannot be negative".into());
        }
        if !(self.evidence.tolerance_km > 0.0) {
            return invalid("evidence.tolerance_km must be positive".into());
        }
        self.tiers.validate().map_err(ConfigError::Invalid)?;

        if self.generator.strategies.is_empty() {
            return invalid("generator.strategies is empty".into());
        }
        for strategy in &self.generator.strategies {
            if strategy.weight() == 0 {
                return invalid(format!("strategy {:?} has zero weight", strategy));
            }
            match strategy {
                StrategyConfig::Range { width, start, end, step, .. } => {
                    if start > end {
                        return invalid(format!("range start {} exceeds end {}", start, end));
                    }
                    if *step == 0 {
                        return invalid("range step must be at least 1".into());
                    }
                    if *width == 0 || *width > 19 || end.to_string().len() > *width {
                        return invalid(format!("range end {} does not fit width {}", end, width));
                    }
                }
                StrategyConfig::Pattern { varying_digits, top_endings, .. } => {
                    if !(2..=6).contains(varying_digits) {
                        return invalid("pattern varying_digits must be within 2..=6".into());
                    }
                    if *top_endings == 0 {
                        return invalid("pattern top_endings must be at least 1".into());
                    }
                }
                StrategyConfig::Cluster { radius, step, .. } => {
                    if *step == 0 || radius < step {
                        return invalid("cluster radius must be at least one step".into());
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Flood Hub API key from `FLOOD_HUB_API_KEY`, falling back to
/// `GOOGLE_FLOOD_HUB_API_KEY`. A `.env` file in the working directory is
/// honoured.
pub fn api_key_from_env() -> Option<String> {
    dotenv::dotenv().ok();
    ["FLOOD_HUB_API_KEY", "GOOGLE_FLOOD_HUB_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}
