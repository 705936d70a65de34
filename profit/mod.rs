//! Ordinary least-squares model of realized profit contribution.
//!
//! Uses the same covariates as the hazard model, with an intercept, and its own
//! encoder fit on the records that carry a realized margin. A level that never occurs
//! among those records predicts the reference-level profit, so any level the hazard
//! model accepts can be scored.

use crate::linalg::{RANK_TOLERANCE, effective_rank};
use crate::survival::encoding::{
    CovariateEncoder, CovariateSpec, EncodingError, UnseenLevelPolicy,
};
use crate::types::{Covariates, Record};
use ndarray::{Array1, Array2, s};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfitError {
    #[error("no records carry a realized margin")]
    NoRecords,
    #[error("record '{customer_id}' has non-finite realized margin {value}")]
    NonFiniteTarget { customer_id: String, value: f64 },
    #[error("covariate encoding failed: {0}")]
    Encoding(#[from] EncodingError),
    #[error("design matrix is rank deficient: rank {rank} with {columns} columns over {rows} rows")]
    RankDeficient {
        rank: usize,
        columns: usize,
        rows: usize,
    },
    #[error("normal equations could not be solved: {0}")]
    Solve(#[from] LinalgError),
}

/// Immutable OLS fit. The first coefficient is the intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitFit {
    observations: usize,
    r_squared: f64,
    residual_std_error: f64,
    encoder: CovariateEncoder,
    coefficients: Array1<f64>,
}

impl ProfitFit {
    pub fn intercept(&self) -> f64 {
        self.coefficients[0]
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    pub fn r_squared(&self) -> f64 {
        self.r_squared
    }

    pub fn residual_std_error(&self) -> f64 {
        self.residual_std_error
    }

    /// Predicted profit contribution. May be negative.
    pub fn predict(&self, covariates: &Covariates) -> Result<f64, EncodingError> {
        let row = self.encoder.encode(covariates)?;
        let slopes = self.coefficients.slice(s![1..]);
        Ok(self.intercept() + row.dot(&slopes))
    }
}

/// Fits the profit regression on the records that carry `net_margin_realized`.
pub fn fit_profit_model(
    records: &[Record],
    covariates: &[CovariateSpec],
) -> Result<ProfitFit, ProfitError> {
    let mut used: Vec<&Record> = Vec::with_capacity(records.len());
    let mut target = Vec::with_capacity(records.len());
    for record in records {
        if let Some(value) = record.net_margin_realized {
            if !value.is_finite() {
                return Err(ProfitError::NonFiniteTarget {
                    customer_id: record.customer_id.clone(),
                    value,
                });
            }
            used.push(record);
            target.push(value);
        }
    }
    if used.is_empty() {
        return Err(ProfitError::NoRecords);
    }
    let y = Array1::from_vec(target);

    let encoder = CovariateEncoder::fit(
        covariates,
        used.iter().map(|r| &r.covariates),
        UnseenLevelPolicy::Reference,
    )?;
    let encoded = encoder.design_matrix(used.iter().map(|r| &r.covariates))?;
    let mut x = Array2::<f64>::ones((used.len(), encoded.ncols() + 1));
    x.slice_mut(s![.., 1..]).assign(&encoded);

    let rank = effective_rank(&x, RANK_TOLERANCE)?;
    if rank < x.ncols() {
        return Err(ProfitError::RankDeficient {
            rank,
            columns: x.ncols(),
            rows: x.nrows(),
        });
    }

    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&y);
    let coefficients = xtx.solve(&xty)?;

    let fitted = x.dot(&coefficients);
    let residuals = &y - &fitted;
    let rss = residuals.dot(&residuals);
    let mean = y.mean().unwrap_or(0.0);
    let tss = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 1.0 };
    let dof = x.nrows().saturating_sub(x.ncols());
    let residual_std_error = if dof > 0 {
        (rss / dof as f64).sqrt()
    } else {
        0.0
    };

    log::info!(
        "Profit model: {} records, {} columns, R^2 = {:.4}, residual SE = {:.4}",
        x.nrows(),
        x.ncols(),
        r_squared,
        residual_std_error
    );

    Ok(ProfitFit {
        observations: x.nrows(),
        r_squared,
        residual_std_error,
        encoder,
        coefficients,
    })
}
