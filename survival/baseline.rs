//! Discrete baseline conversion curve derived from a hazard fit.
//!
//! The cumulative baseline hazard is a step function over distinct event times.
//! It is forward-filled onto every integer day from 0 to the longest training
//! outcome time, and conversion probabilities for each horizon are tabulated from it.

use super::encoding::EncodingError;
use super::hazard::{HazardFit, TieMethod};
use crate::types::Record;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Long-tail conversion probability used when a horizon runs past the table.
pub const DEFAULT_FALLBACK_PROBABILITY: f64 = 0.007422;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveOptions {
    pub lookup_horizon: u32,
    pub fallback_probability: f64,
    pub min_event_times: usize,
    pub horizons: Vec<u32>,
}

impl Default for CurveOptions {
    fn default() -> Self {
        Self {
            lookup_horizon: 90,
            fallback_probability: DEFAULT_FALLBACK_PROBABILITY,
            min_event_times: 2,
            horizons: vec![30, 60, 90],
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CurveError {
    #[error("invalid curve options: {0}")]
    InvalidOptions(String),
    #[error("record '{customer_id}' cannot contribute to the baseline: {reason}")]
    InvalidRecord { customer_id: String, reason: String },
    #[error("risk multiplier could not be computed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("baseline needs at least {required} distinct event times, found {found}")]
    InsufficientData { required: usize, found: usize },
    #[error("horizon {0} is not tabulated")]
    UnknownHorizon(u32),
}

impl CurveOptions {
    pub fn validate(&self) -> Result<(), CurveError> {
        if self.horizons.is_empty() {
            return Err(CurveError::InvalidOptions(
                "at least one horizon is required".to_string(),
            ));
        }
        if self.horizons.contains(&0) {
            return Err(CurveError::InvalidOptions(
                "horizons must be positive".to_string(),
            ));
        }
        if !self.horizons.contains(&self.lookup_horizon) {
            return Err(CurveError::InvalidOptions(format!(
                "lookup horizon {} is not one of {:?}",
                self.lookup_horizon, self.horizons
            )));
        }
        if !(0.0..=1.0).contains(&self.fallback_probability) {
            return Err(CurveError::InvalidOptions(format!(
                "fallback probability {} is outside [0, 1]",
                self.fallback_probability
            )));
        }
        Ok(())
    }
}

/// One integer day of the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveRow {
    pub day: u32,
    /// `H(t)`.
    pub cumulative_hazard: f64,
    /// `H(t) - H(t-1)`, with `H(-1) = 0`.
    pub incremental_hazard: f64,
}

/// Dense per-day baseline hazard with conversion windows for every configured horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineCurveTable {
    ties: TieMethod,
    lookup_horizon: u32,
    fallback_probability: f64,
    horizons: Vec<u32>,
    /// `conversion[h][t]`, aligned with `horizons`.
    conversion: Vec<Vec<f64>>,
    rows: Vec<CurveRow>,
}

impl BaselineCurveTable {
    pub fn rows(&self) -> &[CurveRow] {
        &self.rows
    }

    /// Largest tabulated day.
    pub fn max_day(&self) -> u32 {
        self.rows.last().map(|row| row.day).unwrap_or(0)
    }

    pub fn horizons(&self) -> &[u32] {
        &self.horizons
    }

    pub fn lookup_horizon(&self) -> u32 {
        self.lookup_horizon
    }

    pub fn fallback_probability(&self) -> f64 {
        self.fallback_probability
    }

    pub fn ties(&self) -> TieMethod {
        self.ties
    }

    pub fn cumulative_hazard(&self, day: i64) -> Option<f64> {
        usize::try_from(day)
            .ok()
            .and_then(|idx| self.rows.get(idx))
            .map(|row| row.cumulative_hazard)
    }

    /// Baseline probability of converting within `horizon` days after day `day`.
    ///
    /// Days outside the table, or windows running past it, return the fallback probability.
    pub fn conversion(&self, day: i64, horizon: u32) -> Result<f64, CurveError> {
        let position = self
            .horizons
            .iter()
            .position(|&h| h == horizon)
            .ok_or(CurveError::UnknownHorizon(horizon))?;
        Ok(self.tabulated(position, day))
    }

    /// Conversion probability at the lookup horizon. Depends on `day` only.
    pub fn lookup(&self, day: i64) -> f64 {
        match self.horizons.iter().position(|&h| h == self.lookup_horizon) {
            Some(position) => self.tabulated(position, day),
            None => self.fallback_probability,
        }
    }

    fn tabulated(&self, position: usize, day: i64) -> f64 {
        usize::try_from(day)
            .ok()
            .and_then(|idx| self.conversion[position].get(idx))
            .copied()
            .unwrap_or(self.fallback_probability)
    }
}

fn curve_time(record: &Record) -> Result<u32, CurveError> {
    let invalid = |reason: String| CurveError::InvalidRecord {
        customer_id: record.customer_id.clone(),
        reason,
    };
    let time = record
        .outcome_time
        .ok_or_else(|| invalid("outcome time is missing".to_string()))?;
    u32::try_from(time).map_err(|_| invalid(format!("outcome time {time} is out of range")))
}

/// Builds the baseline table for `fit` from the records it was trained on.
pub fn derive_curve(
    fit: &HazardFit,
    records: &[Record],
    options: &CurveOptions,
) -> Result<BaselineCurveTable, CurveError> {
    options.validate()?;
    let times = records
        .iter()
        .map(curve_time)
        .collect::<Result<Vec<_>, _>>()?;
    let risks = records
        .par_iter()
        .map(|record| fit.predict_risk(&record.covariates))
        .collect::<Result<Vec<f64>, _>>()?;

    // (risk of everyone leaving at t, risk of events at t, number of events at t)
    let mut by_time: BTreeMap<u32, (f64, f64, usize)> = BTreeMap::new();
    for ((&time, &risk), record) in times.iter().zip(&risks).zip(records) {
        let entry = by_time.entry(time).or_insert((0.0, 0.0, 0));
        entry.0 += risk;
        if record.event_observed {
            entry.1 += risk;
            entry.2 += 1;
        }
    }

    let event_times = by_time.values().filter(|(_, _, d)| *d > 0).count();
    if event_times < options.min_event_times {
        return Err(CurveError::InsufficientData {
            required: options.min_event_times,
            found: event_times,
        });
    }

    // Walk from the latest time down so the risk set is a running sum.
    let mut increments: BTreeMap<u32, f64> = BTreeMap::new();
    let mut at_risk = 0.0;
    for (&time, &(leaving, event_risk, deaths)) in by_time.iter().rev() {
        at_risk += leaving;
        if deaths == 0 {
            continue;
        }
        let increment: f64 = (0..deaths)
            .map(|l| 1.0 / (at_risk - fit.ties().tied_fraction(l, deaths) * event_risk))
            .sum();
        increments.insert(time, increment);
    }

    let max_day = by_time.keys().next_back().copied().unwrap_or(0);
    let mut rows = Vec::with_capacity(max_day as usize + 1);
    let mut cumulative = 0.0;
    for day in 0..=max_day {
        let increment = increments.get(&day).copied().unwrap_or(0.0);
        cumulative += increment;
        rows.push(CurveRow {
            day,
            cumulative_hazard: cumulative,
            incremental_hazard: increment,
        });
    }

    let conversion: Vec<Vec<f64>> = options
        .horizons
        .iter()
        .map(|&horizon| {
            (0..=max_day as usize)
                .map(|t| match rows.get(t + horizon as usize) {
                    Some(ahead) => {
                        let now = rows[t].cumulative_hazard;
                        let later = ahead.cumulative_hazard;
                        ((1.0 - (-later).exp()) - (1.0 - (-now).exp())).max(0.0)
                    }
                    None => options.fallback_probability,
                })
                .collect::<Vec<f64>>()
        })
        .collect();

    log::info!(
        "Baseline curve: {} days, {} event times, H({}) = {:.6}",
        rows.len(),
        event_times,
        max_day,
        cumulative
    );

    Ok(BaselineCurveTable {
        ties: fit.ties(),
        lookup_horizon: options.lookup_horizon,
        fallback_probability: options.fallback_probability,
        horizons: options.horizons.clone(),
        conversion,
        rows,
    })
}
