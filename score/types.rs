// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single predictor value as it arrives from the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateValue {
    Numeric(f64),
    Level(String),
}

impl fmt::Display for CovariateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CovariateValue::Numeric(value) => write!(f, "{value}"),
            CovariateValue::Level(level) => f.write_str(level),
        }
    }
}

/// Named predictors for one buyer. A covariate that is absent from the map is missing;
/// it is never read as zero.
pub type Covariates = BTreeMap<String, CovariateValue>;

/// One first-time buyer, used for training, scoring, or held-out validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub customer_id: String,
    pub client_id: String,
    pub covariates: Covariates,
    /// Whole days from first purchase to the second purchase or to the observation cutoff.
    pub outcome_time: Option<i64>,
    /// `true` when a second purchase was observed, `false` when right-censored.
    pub event_observed: bool,
    pub net_margin_realized: Option<f64>,
}

impl Record {
    pub fn covariate(&self, name: &str) -> Option<&CovariateValue> {
        self.covariates.get(name)
    }
}

/// A record together with everything the scoring engine derived for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: Record,
    pub conversion_probability: f64,
    pub risk_multiplier: f64,
    pub score: f64,
    pub expected_profit: f64,
    pub expected_value: f64,
}

impl ScoredRecord {
    /// Records with an undefined expected value are kept for reporting but never segmented.
    #[inline]
    pub fn is_segmentable(&self) -> bool {
        self.expected_value.is_finite() && self.score.is_finite()
    }
}

/// A record that could not be scored, with the reason it was excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRejection {
    pub customer_id: String,
    pub reason: String,
}

/// Ordinal buyer segment, 1 being the lowest expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuyerSegment(pub u8);

impl fmt::Display for BuyerSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The row shape handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub customer_id: String,
    pub client_id: String,
    pub score: f64,
    pub expected_value: f64,
    pub buyer_segment: BuyerSegment,
    pub client_group: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expected_value: f64) -> ScoredRecord {
        ScoredRecord {
            record: Record {
                customer_id: "c1".to_string(),
                client_id: "k1".to_string(),
                covariates: Covariates::new(),
                outcome_time: Some(3),
                event_observed: false,
                net_margin_realized: None,
            },
            conversion_probability: 0.1,
            risk_multiplier: 1.0,
            score: 0.1,
            expected_profit: expected_value / 0.1,
            expected_value,
        }
    }

    #[test]
    fn non_finite_expected_value_is_not_segmentable() {
        assert!(record(4.2).is_segmentable());
        assert!(!record(f64::NAN).is_segmentable());
        assert!(!record(f64::INFINITY).is_segmentable());
    }

    #[test]
    fn covariate_value_display_is_plain() {
        assert_eq!(CovariateValue::Level("2019Q3".into()).to_string(), "2019Q3");
        assert_eq!(CovariateValue::Numeric(12.0).to_string(), "12");
    }
}
