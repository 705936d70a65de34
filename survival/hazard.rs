//! Cox proportional-hazards fit over right-censored repurchase times.
//!
//! The partial likelihood is maximized with Newton-Raphson and step halving. Tied
//! outcome times use the Efron correction by default; Breslow is available and the
//! chosen method is recorded on the fit so the baseline estimator can match it.

use super::encoding::{CovariateEncoder, CovariateSpec, EncodingError, UnseenLevelPolicy};
use crate::linalg::{RANK_TOLERANCE, effective_rank};
use crate::types::{Covariates, Record};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_STEP_HALVINGS: usize = 30;

/// Approximation used for the partial likelihood when events share an outcome time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieMethod {
    #[default]
    Efron,
    Breslow,
}

impl TieMethod {
    /// Fraction of the tied-event risk removed from the risk set for the `l`-th of `d` tied events.
    #[inline]
    pub(crate) fn tied_fraction(self, l: usize, d: usize) -> f64 {
        match self {
            TieMethod::Efron => l as f64 / d as f64,
            TieMethod::Breslow => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoxOptions {
    pub ties: TieMethod,
    pub max_iterations: usize,
    /// Convergence threshold on the relative change of the log partial likelihood.
    pub tolerance: f64,
    pub unseen_levels: UnseenLevelPolicy,
}

impl Default for CoxOptions {
    fn default() -> Self {
        Self {
            ties: TieMethod::Efron,
            max_iterations: 20,
            tolerance: 1e-9,
            unseen_levels: UnseenLevelPolicy::Reject,
        }
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("at least two records are required to fit the hazard model, found {0}")]
    TooFewRecords(usize),
    #[error("record '{0}' has no outcome time")]
    MissingOutcomeTime(String),
    #[error("record '{customer_id}' has negative outcome time {time}")]
    NegativeOutcomeTime { customer_id: String, time: i64 },
    #[error("no events were observed; the partial likelihood is flat")]
    NoEvents,
    #[error("all records share outcome time {time} with event={event}; the partial likelihood is degenerate")]
    Degenerate { time: i64, event: bool },
    #[error("covariate encoding failed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("design matrix has rank {rank} but {columns} columns")]
    RankDeficient { rank: usize, columns: usize },
    #[error("information matrix could not be solved: {0}")]
    Singular(#[from] LinalgError),
    #[error("coefficients became non-finite at iteration {0}")]
    NonFinite(usize),
}

/// Immutable result of a hazard fit.
///
/// Holds the encoder that fixed the factor levels, so out-of-sample records are
/// encoded exactly as the training records were.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardFit {
    ties: TieMethod,
    log_likelihood: f64,
    null_log_likelihood: f64,
    iterations: usize,
    converged: bool,
    events: usize,
    encoder: CovariateEncoder,
    coefficients: Array1<f64>,
}

impl HazardFit {
    pub fn ties(&self) -> TieMethod {
        self.ties
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn null_log_likelihood(&self) -> f64 {
        self.null_log_likelihood
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn events(&self) -> usize {
        self.events
    }

    /// `β · x` for one record.
    pub fn linear_predictor(&self, covariates: &Covariates) -> Result<f64, EncodingError> {
        let row = self.encoder.encode(covariates)?;
        Ok(row.dot(&self.coefficients))
    }

    /// Risk multiplier `exp(β · x)` on the uncentered covariate scale.
    pub fn predict_risk(&self, covariates: &Covariates) -> Result<f64, EncodingError> {
        Ok(self.linear_predictor(covariates)?.exp())
    }

    /// `exp(β)` for a named design column such as `channel[paid]`.
    pub fn hazard_ratio(&self, column: &str) -> Option<f64> {
        self.encoder
            .column_names()
            .iter()
            .position(|name| name == column)
            .map(|idx| self.coefficients[idx].exp())
    }
}

pub(crate) fn observed_time(record: &Record) -> Result<i64, FitError> {
    match record.outcome_time {
        None => Err(FitError::MissingOutcomeTime(record.customer_id.clone())),
        Some(time) if time < 0 => Err(FitError::NegativeOutcomeTime {
            customer_id: record.customer_id.clone(),
            time,
        }),
        Some(time) => Ok(time),
    }
}

struct CoxDesign {
    x: Array2<f64>,
    times: Vec<i64>,
    events: Vec<bool>,
    /// Record indices sorted by outcome time, latest first.
    descending: Vec<usize>,
}

struct PartialLikelihood {
    log_likelihood: f64,
    gradient: Array1<f64>,
    information: Array2<f64>,
}

fn add_scaled_outer(target: &mut Array2<f64>, weight: f64, v: ArrayView1<'_, f64>) {
    let column = v.insert_axis(Axis(1));
    let row = v.insert_axis(Axis(0));
    ndarray::linalg::general_mat_mul(weight, &column, &row, 1.0, target);
}

fn evaluate(design: &CoxDesign, beta: &Array1<f64>, ties: TieMethod) -> PartialLikelihood {
    let p = beta.len();
    let eta = design.x.dot(beta);
    let risk = eta.mapv(f64::exp);

    let mut log_likelihood = 0.0;
    let mut gradient = Array1::<f64>::zeros(p);
    let mut information = Array2::<f64>::zeros((p, p));

    let mut s0 = 0.0;
    let mut s1 = Array1::<f64>::zeros(p);
    let mut s2 = Array2::<f64>::zeros((p, p));

    let order = &design.descending;
    let mut start = 0usize;
    while start < order.len() {
        let time = design.times[order[start]];
        let mut end = start;
        while end < order.len() && design.times[order[end]] == time {
            end += 1;
        }

        let mut d0 = 0.0;
        let mut d1 = Array1::<f64>::zeros(p);
        let mut d2 = Array2::<f64>::zeros((p, p));
        let mut deaths = 0usize;
        for &i in &order[start..end] {
            let xi = design.x.row(i);
            let r = risk[i];
            s0 += r;
            s1.scaled_add(r, &xi);
            add_scaled_outer(&mut s2, r, xi);
            if design.events[i] {
                deaths += 1;
                d0 += r;
                d1.scaled_add(r, &xi);
                add_scaled_outer(&mut d2, r, xi);
                log_likelihood += eta[i];
                gradient += &xi;
            }
        }

        for l in 0..deaths {
            let frac = ties.tied_fraction(l, deaths);
            let a0 = s0 - frac * d0;
            let a1 = &s1 - &(&d1 * frac);
            let a2 = &s2 - &(&d2 * frac);
            let mean = &a1 / a0;
            log_likelihood -= a0.ln();
            gradient -= &mean;
            information += &(&a2 / a0);
            add_scaled_outer(&mut information, -1.0, mean.view());
        }

        start = end;
    }

    PartialLikelihood {
        log_likelihood,
        gradient,
        information,
    }
}

/// Fits the proportional-hazards model on `records`.
pub fn fit_hazard_model(
    records: &[Record],
    covariates: &[CovariateSpec],
    options: &CoxOptions,
) -> Result<HazardFit, FitError> {
    if records.len() < 2 {
        return Err(FitError::TooFewRecords(records.len()));
    }
    let times = records
        .iter()
        .map(observed_time)
        .collect::<Result<Vec<_>, _>>()?;
    let events: Vec<bool> = records.iter().map(|r| r.event_observed).collect();
    let event_count = events.iter().filter(|&&e| e).count();
    if event_count == 0 {
        return Err(FitError::NoEvents);
    }
    if times.iter().all(|&t| t == times[0]) && events.iter().all(|&e| e == events[0]) {
        return Err(FitError::Degenerate {
            time: times[0],
            event: events[0],
        });
    }

    let encoder = CovariateEncoder::fit(
        covariates,
        records.iter().map(|r| &r.covariates),
        options.unseen_levels,
    )?;
    let raw = encoder.design_matrix(records.iter().map(|r| &r.covariates))?;

    // The partial likelihood is invariant to centering; centering keeps exp() in range.
    let means = raw
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(raw.ncols()));
    let x = &raw - &means;
    let rank = effective_rank(&x, RANK_TOLERANCE)?;
    if rank < x.ncols() {
        return Err(FitError::RankDeficient {
            rank,
            columns: x.ncols(),
        });
    }

    let mut descending: Vec<usize> = (0..records.len()).collect();
    descending.sort_by(|&a, &b| times[b].cmp(&times[a]).then(a.cmp(&b)));
    let design = CoxDesign {
        x,
        times,
        events,
        descending,
    };

    let mut beta = Array1::<f64>::zeros(design.x.ncols());
    let mut current = evaluate(&design, &beta, options.ties);
    let null_log_likelihood = current.log_likelihood;
    let mut converged = false;
    let mut iterations = 0usize;

    for iteration in 1..=options.max_iterations {
        iterations = iteration;
        let step = current.information.solve(&current.gradient)?;

        let mut scale = 1.0;
        let mut candidate = &beta + &step;
        let mut next = evaluate(&design, &candidate, options.ties);
        let mut halvings = 0usize;
        while (!next.log_likelihood.is_finite() || next.log_likelihood < current.log_likelihood)
            && halvings < MAX_STEP_HALVINGS
        {
            scale *= 0.5;
            halvings += 1;
            candidate = &beta + &(&step * scale);
            next = evaluate(&design, &candidate, options.ties);
        }
        if halvings > 0 {
            log::debug!("Cox iteration {iteration}: step halved {halvings} time(s)");
        }
        if candidate.iter().any(|v| !v.is_finite()) || !next.log_likelihood.is_finite() {
            return Err(FitError::NonFinite(iteration));
        }

        let change = (next.log_likelihood - current.log_likelihood).abs();
        beta = candidate;
        current = next;
        log::debug!(
            "Cox iteration {iteration}: log partial likelihood {:.8}",
            current.log_likelihood
        );

        if change <= options.tolerance * current.log_likelihood.abs().max(1.0) {
            converged = true;
            break;
        }
    }

    if !converged {
        log::warn!(
            "Cox fit did not converge after {} iterations; using the last iterate",
            options.max_iterations
        );
    }
    log::info!(
        "Cox fit ({:?} ties): {} records, {} events, log partial likelihood {:.4} -> {:.4} in {} iterations",
        options.ties,
        records.len(),
        event_count,
        null_log_likelihood,
        current.log_likelihood,
        iterations
    );

    Ok(HazardFit {
        ties: options.ties,
        log_likelihood: current.log_likelihood,
        null_log_likelihood,
        iterations,
        converged,
        events: event_count,
        encoder,
        coefficients: beta,
    })
}
