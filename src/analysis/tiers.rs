/// Reliability tiers
///
/// Score ranges map to four tiers. Gauges the upstream provider has not
/// quality-verified are capped, whatever their score: the flag is necessary
/// for the top tiers but not sufficient.

use super::scoring::ConfidenceScore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    LikelyVirtual,
    Uncertain,
    LikelyPhysical,
    VerifiedPhysical,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::VerifiedPhysical,
        Tier::LikelyPhysical,
        Tier::Uncertain,
        Tier::LikelyVirtual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::VerifiedPhysical => "VERIFIED_PHYSICAL",
            Tier::LikelyPhysical => "LIKELY_PHYSICAL",
            Tier::Uncertain => "UNCERTAIN",
            Tier::LikelyVirtual => "LIKELY_VIRTUAL",
        }
    }

    pub fn confidence_label(&self) -> ConfidenceLabel {
        match self {
            Tier::VerifiedPhysical => ConfidenceLabel::High,
            Tier::LikelyPhysical => ConfidenceLabel::Moderate,
            Tier::Uncertain => ConfidenceLabel::Low,
            Tier::LikelyVirtual => ConfidenceLabel::VeryLow,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label attached to anything handed to a downstream monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLabel {
    High,
    Moderate,
    Low,
    VeryLow,
    /// The gauge has not been assessed yet.
    Unclassified,
}

impl fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLabel::High => write!(f, "high confidence"),
            ConfidenceLabel::Moderate => write!(f, "moderate confidence"),
            ConfidenceLabel::Low => write!(f, "low confidence"),
            ConfidenceLabel::VeryLow => write!(f, "very low confidence (likely modeled)"),
            ConfidenceLabel::Unclassified => write!(f, "unclassified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicy {
    pub verified_physical_min: u8,
    pub likely_physical_min: u8,
    pub uncertain_min: u8,
    /// Highest tier a gauge without the upstream quality flag can reach.
    pub unverified_cap: Option<Tier>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            verified_physical_min: 80,
            likely_physical_min: 60,
            uncertain_min: 30,
            unverified_cap: Some(Tier::Uncertain),
        }
    }
}

impl TierPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.verified_physical_min > ConfidenceScore::MAX {
            return Err(format!(
                "tiers.verified_physical_min {} exceeds {}",
                self.verified_physical_min,
                ConfidenceScore::MAX
            ));
        }
        if !(self.verified_physical_min > self.likely_physical_min
            && self.likely_physical_min > self.uncertain_min)
        {
            return Err(format!(
                "tier boundaries must be strictly descending, got {} / {} / {}",
                self.verified_physical_min, self.likely_physical_min, self.uncertain_min
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierClassifier {
    policy: TierPolicy,
}

impl TierClassifier {
    pub fn new(policy: TierPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    pub fn classify(&self, score: ConfidenceScore, quality_verified: bool) -> Tier {
        let p = &self.policy;
        let s = score.value();
        let by_score = if s >= p.verified_physical_min {
            Tier::VerifiedPhysical
        } else if s >= p.likely_physical_min {
            Tier::LikelyPhysical
        } else if s >= p.uncertain_min {
            Tier::Uncertain
        } else {
            Tier::LikelyVirtual
        };

        match p.unverified_cap {
            Some(cap) if !quality_verified => by_score.min(cap),
            _ => by_score,
        }
    }
}
