// ========================================================================================
//
//                               THE SCORING ENGINE
//
// ========================================================================================
//
// Combines the three fitted artifacts into one expected-value score per record:
//
//   conversion_probability = curve.lookup(outcome_time)
//   score                  = conversion_probability * exp(beta . x)
//   expected_value         = score * predicted profit
//
// Everything here is a pure function of the record and the borrowed fits, so batches
// are scored in parallel and a record scored twice yields identical bits.

use crate::profit::ProfitFit;
use crate::survival::baseline::BaselineCurveTable;
use crate::survival::encoding::EncodingError;
use crate::survival::hazard::HazardFit;
use crate::types::{Record, RecordRejection, ScoredRecord};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoreError {
    #[error("record '{customer_id}' is invalid: {reason}")]
    InvalidRecord { customer_id: String, reason: String },
    #[error("record '{customer_id}' could not be encoded: {source}")]
    Encoding {
        customer_id: String,
        source: EncodingError,
    },
}

impl ScoreError {
    pub fn customer_id(&self) -> &str {
        match self {
            ScoreError::InvalidRecord { customer_id, .. } => customer_id,
            ScoreError::Encoding { customer_id, .. } => customer_id,
        }
    }
}

/// The scored and the rejected part of one batch, both in input order.
#[derive(Debug, Clone, Default)]
pub struct ScoredBatch {
    pub scored: Vec<ScoredRecord>,
    pub rejected: Vec<RecordRejection>,
}

/// Borrowed view over one model version.
#[derive(Debug, Clone, Copy)]
pub struct ScoringEngine<'a> {
    hazard: &'a HazardFit,
    curve: &'a BaselineCurveTable,
    profit: &'a ProfitFit,
}

impl<'a> ScoringEngine<'a> {
    pub fn new(
        hazard: &'a HazardFit,
        curve: &'a BaselineCurveTable,
        profit: &'a ProfitFit,
    ) -> Self {
        Self {
            hazard,
            curve,
            profit,
        }
    }

    fn check(&self, record: &Record) -> Result<i64, ScoreError> {
        let invalid = |reason: String| ScoreError::InvalidRecord {
            customer_id: record.customer_id.clone(),
            reason,
        };
        let time = record
            .outcome_time
            .ok_or_else(|| invalid("outcome time is missing".to_string()))?;
        if time < 0 {
            return Err(invalid(format!("outcome time {time} is negative")));
        }
        Ok(time)
    }

    /// Scores one record.
    pub fn score(&self, record: &Record) -> Result<ScoredRecord, ScoreError> {
        let time = self.check(record)?;
        // Missing or non-finite covariates are record defects, not encoding mismatches.
        let encoding = |source: EncodingError| match source {
            EncodingError::MissingCovariate(_) | EncodingError::NonFinite { .. } => {
                ScoreError::InvalidRecord {
                    customer_id: record.customer_id.clone(),
                    reason: source.to_string(),
                }
            }
            other => ScoreError::Encoding {
                customer_id: record.customer_id.clone(),
                source: other,
            },
        };

        let conversion_probability = self.curve.lookup(time);
        let risk_multiplier = self
            .hazard
            .predict_risk(&record.covariates)
            .map_err(encoding)?;
        let score = conversion_probability * risk_multiplier;
        let expected_profit = self.profit.predict(&record.covariates).map_err(encoding)?;
        let expected_value = score * expected_profit;

        Ok(ScoredRecord {
            record: record.clone(),
            conversion_probability,
            risk_multiplier,
            score,
            expected_profit,
            expected_value,
        })
    }

    /// Scores a batch in parallel. Failing records are logged and reported, never fatal.
    pub fn score_batch(&self, records: &[Record]) -> ScoredBatch {
        let results: Vec<Result<ScoredRecord, ScoreError>> =
            records.par_iter().map(|record| self.score(record)).collect();

        let mut batch = ScoredBatch {
            scored: Vec::with_capacity(results.len()),
            rejected: Vec::new(),
        };
        for result in results {
            match result {
                Ok(scored) => {
                    if !scored.is_segmentable() {
                        log::warn!(
                            "Record '{}' has undefined expected value; it will not be segmented",
                            scored.record.customer_id
                        );
                    }
                    batch.scored.push(scored);
                }
                Err(err) => {
                    log::warn!("Skipping record '{}': {err}", err.customer_id());
                    batch.rejected.push(RecordRejection {
                        customer_id: err.customer_id().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        log::info!(
            "Scored {} of {} records ({} rejected)",
            batch.scored.len(),
            records.len(),
            batch.rejected.len()
        );
        batch
    }
}
