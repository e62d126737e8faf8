use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Review,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Review => "REVIEW",
            Self::Block => "BLOCK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("decision thresholds must satisfy 0.0 <= low < high <= 1.0 (low={low}, high={high})")]
    InvalidThresholds { low: f64, high: f64 },
}

/// Maps a risk score to a decision using two half-open cut points.
///
/// A score that lands exactly on a threshold belongs to the more severe
/// bucket: `low` is REVIEW, `high` is BLOCK.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    low: f64,
    high: f64,
}

impl DecisionPolicy {
    pub fn new(low: f64, high: f64) -> Result<Self, PolicyError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(low) || !in_range(high) || low >= high {
            return Err(PolicyError::InvalidThresholds { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn decide(&self, score: f64) -> Decision {
        if score >= self.high {
            Decision::Block
        } else if score >= self.low {
            Decision::Review
        } else {
            Decision::Allow
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            low: 0.3,
            high: 0.6,
        }
    }
}
