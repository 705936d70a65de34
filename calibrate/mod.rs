//! Calibration of the score against held-out outcomes.
//!
//! Held-out records are scored exactly as in production and bucketed into
//! fixed-width bins over [0, 1]. Each bin compares the mean predicted score with
//! the fraction of records that converted within the horizon.

use crate::engine::ScoringEngine;
use crate::types::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    pub bin_width: f64,
    /// Days within which a second purchase counts as a conversion.
    pub horizon: i64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            bin_width: 0.05,
            horizon: 90,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("bin width must lie in (0, 1], got {0}")]
    InvalidBinWidth(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: Option<f64>,
    /// Observed conversion rate; `None` for an empty bin.
    pub observed_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub bins: Vec<CalibrationBin>,
    pub scored: usize,
    pub rejected: usize,
    /// Scores that were non-finite or fell outside [0, 1].
    pub out_of_domain: usize,
    pub brier_score: Option<f64>,
    pub expected_calibration_error: Option<f64>,
}

impl CalibrationReport {
    /// Records that landed in a bin.
    pub fn binned(&self) -> usize {
        self.bins.iter().map(|bin| bin.count).sum()
    }

    /// True when observed rates never decrease across non-empty bins.
    pub fn is_monotone(&self) -> bool {
        let rates: Vec<f64> = self.bins.iter().filter_map(|bin| bin.observed_rate).collect();
        rates.windows(2).all(|pair| pair[0] <= pair[1])
    }
}

/// Whether the record converted within `horizon` days.
pub fn outcome_within_horizon(record: &Record, horizon: i64) -> bool {
    record.event_observed && record.outcome_time.is_some_and(|time| time <= horizon)
}

fn bin_count(width: f64) -> Result<usize, CalibrationError> {
    if !width.is_finite() || width <= 0.0 || width > 1.0 {
        return Err(CalibrationError::InvalidBinWidth(width));
    }
    // 1 / 0.05 is 20.000000000000004 in floating point.
    Ok(((1.0 / width) - 1e-9).ceil().max(1.0) as usize)
}

/// Scores `held_out` with `engine` and reports calibration. Poor calibration is
/// reported, never an error.
pub fn validate(
    held_out: &[Record],
    engine: &ScoringEngine<'_>,
    options: &CalibrationOptions,
) -> Result<CalibrationReport, CalibrationError> {
    let n_bins = bin_count(options.bin_width)?;
    let batch = engine.score_batch(held_out);

    let mut counts = vec![0usize; n_bins];
    let mut predicted = vec![0.0; n_bins];
    let mut observed = vec![0.0; n_bins];
    let mut out_of_domain = 0usize;
    let mut squared_error = 0.0;

    for scored in &batch.scored {
        let p = scored.score;
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            out_of_domain += 1;
            continue;
        }
        let y = if outcome_within_horizon(&scored.record, options.horizon) {
            1.0
        } else {
            0.0
        };
        let idx = ((p / options.bin_width).floor() as usize).min(n_bins - 1);
        counts[idx] += 1;
        predicted[idx] += p;
        observed[idx] += y;
        squared_error += (p - y) * (p - y);
    }

    let binned: usize = counts.iter().sum();
    let bins: Vec<CalibrationBin> = (0..n_bins)
        .map(|idx| {
            let count = counts[idx];
            let mean = |sum: f64| (count > 0).then(|| sum / count as f64);
            CalibrationBin {
                lower: idx as f64 * options.bin_width,
                upper: if idx + 1 == n_bins {
                    1.0
                } else {
                    (idx + 1) as f64 * options.bin_width
                },
                count,
                mean_predicted: mean(predicted[idx]),
                observed_rate: mean(observed[idx]),
            }
        })
        .collect();

    let (brier_score, expected_calibration_error) = if binned > 0 {
        let ece = bins
            .iter()
            .filter_map(|bin| {
                let gap = (bin.mean_predicted? - bin.observed_rate?).abs();
                Some(bin.count as f64 / binned as f64 * gap)
            })
            .sum();
        (Some(squared_error / binned as f64), Some(ece))
    } else {
        (None, None)
    };

    if out_of_domain > 0 {
        log::warn!("{out_of_domain} held-out scores fell outside [0, 1] and were not binned");
    }
    log::info!(
        "Calibration over {binned} records in {n_bins} bins: Brier {:?}, ECE {:?}",
        brier_score,
        expected_calibration_error
    );

    Ok(CalibrationReport {
        bins,
        scored: batch.scored.len(),
        rejected: batch.rejected.len(),
        out_of_domain,
        brier_score,
        expected_calibration_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_width_must_be_a_fraction() {
        assert_eq!(bin_count(0.05).unwrap(), 20);
        assert_eq!(bin_count(0.1).unwrap(), 10);
        assert_eq!(bin_count(0.3).unwrap(), 4);
        assert_eq!(bin_count(1.0).unwrap(), 1);
        assert!(bin_count(0.0).is_err());
        assert!(bin_count(-0.1).is_err());
        assert!(bin_count(1.5).is_err());
        assert!(bin_count(f64::NAN).is_err());
    }

    #[test]
    fn outcome_requires_event_inside_horizon() {
        let mut record = Record {
            customer_id: "c".into(),
            client_id: "k".into(),
            covariates: Default::default(),
            outcome_time: Some(45),
            event_observed: true,
            net_margin_realized: None,
        };
        assert!(outcome_within_horizon(&record, 90));
        record.outcome_time = Some(91);
        assert!(!outcome_within_horizon(&record, 90));
        record.outcome_time = Some(10);
        record.event_observed = false;
        assert!(!outcome_within_horizon(&record, 90));
    }

    #[test]
    fn monotonicity_ignores_empty_bins() {
        let bin = |observed_rate: Option<f64>| CalibrationBin {
            lower: 0.0,
            upper: 0.0,
            count: usize::from(observed_rate.is_some()),
            mean_predicted: observed_rate,
            observed_rate,
        };
        let mut report = CalibrationReport {
            bins: vec![bin(Some(0.1)), bin(None), bin(Some(0.3))],
            scored: 2,
            rejected: 0,
            out_of_domain: 0,
            brier_score: None,
            expected_calibration_error: None,
        };
        assert!(report.is_monotone());
        report.bins.push(bin(Some(0.2)));
        assert!(!report.is_monotone());
    }
}
