//! Categorical and numeric covariate encoding shared by the hazard and profit models.
//!
//! The encoder is fit once on training records. It fixes the factor levels for every
//! categorical covariate (sorted, first level is the reference) and the canonical
//! column order. Prediction must go through the same encoder so that coefficients
//! line up with the columns they were estimated on.

use crate::types::{CovariateValue, Covariates};
use ndarray::{Array1, Array2, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariateKind {
    Categorical,
    Numeric,
}

/// Name and kind of one configured predictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateSpec {
    pub name: String,
    pub kind: CovariateKind,
}

impl CovariateSpec {
    pub fn categorical(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CovariateKind::Categorical,
        }
    }

    pub fn numeric(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CovariateKind::Numeric,
        }
    }
}

/// What to do with a categorical level that was not present at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnseenLevelPolicy {
    /// Fail with [`EncodingError::UnknownLevel`].
    #[default]
    Reject,
    /// Encode the level as the reference level (all indicator columns zero).
    Reference,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodingError {
    #[error("covariate '{0}' is missing")]
    MissingCovariate(String),
    #[error("covariate '{covariate}' has level '{level}' which was not seen during fitting")]
    UnknownLevel { covariate: String, level: String },
    #[error("covariate '{covariate}' expected a {expected:?} value but found '{found}'")]
    KindMismatch {
        covariate: String,
        expected: CovariateKind,
        found: String,
    },
    #[error("covariate '{covariate}' has non-finite value {value}")]
    NonFinite { covariate: String, value: f64 },
    #[error("categorical covariate '{covariate}' has {found} distinct level(s); at least two are required")]
    TooFewLevels { covariate: String, found: usize },
    #[error("no covariates were configured")]
    NoCovariates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EncodedTerm {
    Categorical { name: String, levels: Vec<String> },
    Numeric { name: String },
}

impl EncodedTerm {
    fn width(&self) -> usize {
        match self {
            EncodedTerm::Categorical { levels, .. } => levels.len() - 1,
            EncodedTerm::Numeric { .. } => 1,
        }
    }
}

/// Treatment-contrast encoding frozen at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateEncoder {
    policy: UnseenLevelPolicy,
    terms: Vec<EncodedTerm>,
}

impl CovariateEncoder {
    /// Establishes factor levels from the training covariates.
    pub fn fit<'a, I>(
        specs: &[CovariateSpec],
        rows: I,
        policy: UnseenLevelPolicy,
    ) -> Result<Self, EncodingError>
    where
        I: IntoIterator<Item = &'a Covariates>,
    {
        if specs.is_empty() {
            return Err(EncodingError::NoCovariates);
        }
        let mut level_sets: Vec<BTreeSet<String>> = vec![BTreeSet::new(); specs.len()];
        for row in rows {
            for (spec, levels) in specs.iter().zip(level_sets.iter_mut()) {
                let value = row
                    .get(&spec.name)
                    .ok_or_else(|| EncodingError::MissingCovariate(spec.name.clone()))?;
                match (spec.kind, value) {
                    (CovariateKind::Categorical, CovariateValue::Level(level)) => {
                        if !levels.contains(level) {
                            levels.insert(level.clone());
                        }
                    }
                    (CovariateKind::Numeric, CovariateValue::Numeric(number)) => {
                        if !number.is_finite() {
                            return Err(EncodingError::NonFinite {
                                covariate: spec.name.clone(),
                                value: *number,
                            });
                        }
                    }
                    (expected, other) => {
                        return Err(EncodingError::KindMismatch {
                            covariate: spec.name.clone(),
                            expected,
                            found: other.to_string(),
                        });
                    }
                }
            }
        }

        let mut terms = Vec::with_capacity(specs.len());
        for (spec, levels) in specs.iter().zip(level_sets) {
            match spec.kind {
                CovariateKind::Categorical => {
                    if levels.len() < 2 {
                        return Err(EncodingError::TooFewLevels {
                            covariate: spec.name.clone(),
                            found: levels.len(),
                        });
                    }
                    terms.push(EncodedTerm::Categorical {
                        name: spec.name.clone(),
                        levels: levels.into_iter().collect(),
                    });
                }
                CovariateKind::Numeric => terms.push(EncodedTerm::Numeric {
                    name: spec.name.clone(),
                }),
            }
        }
        Ok(Self { policy, terms })
    }

    /// Number of design columns produced per record.
    pub fn width(&self) -> usize {
        self.terms.iter().map(EncodedTerm::width).sum()
    }

    pub fn policy(&self) -> UnseenLevelPolicy {
        self.policy
    }

    /// Column labels in design order, e.g. `channel[paid_search]` or `reg_lag_days`.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.width());
        for term in &self.terms {
            match term {
                EncodedTerm::Categorical { name, levels } => {
                    for level in levels.iter().skip(1) {
                        names.push(format!("{name}[{level}]"));
                    }
                }
                EncodedTerm::Numeric { name } => names.push(name.clone()),
            }
        }
        names
    }

    /// Levels of a categorical covariate, reference level first.
    pub fn levels(&self, covariate: &str) -> Option<&[String]> {
        self.terms.iter().find_map(|term| match term {
            EncodedTerm::Categorical { name, levels } if name == covariate => {
                Some(levels.as_slice())
            }
            _ => None,
        })
    }

    /// Writes the encoded row into `out`, which must be exactly [`Self::width`] long.
    pub fn encode_into(
        &self,
        covariates: &Covariates,
        mut out: ArrayViewMut1<'_, f64>,
    ) -> Result<(), EncodingError> {
        debug_assert_eq!(out.len(), self.width());
        out.fill(0.0);
        let mut offset = 0usize;
        for term in &self.terms {
            match term {
                EncodedTerm::Categorical { name, levels } => {
                    let level = match covariates.get(name) {
                        Some(CovariateValue::Level(level)) => level,
                        Some(other) => {
                            return Err(EncodingError::KindMismatch {
                                covariate: name.clone(),
                                expected: CovariateKind::Categorical,
                                found: other.to_string(),
                            });
                        }
                        None => return Err(EncodingError::MissingCovariate(name.clone())),
                    };
                    match levels.binary_search(level) {
                        Ok(0) => {}
                        Ok(position) => out[offset + position - 1] = 1.0,
                        Err(_) => match self.policy {
                            UnseenLevelPolicy::Reference => {}
                            UnseenLevelPolicy::Reject => {
                                return Err(EncodingError::UnknownLevel {
                                    covariate: name.clone(),
                                    level: level.clone(),
                                });
                            }
                        },
                    }
                    offset += levels.len() - 1;
                }
                EncodedTerm::Numeric { name } => {
                    let value = match covariates.get(name) {
                        Some(CovariateValue::Numeric(value)) => *value,
                        Some(other) => {
                            return Err(EncodingError::KindMismatch {
                                covariate: name.clone(),
                                expected: CovariateKind::Numeric,
                                found: other.to_string(),
                            });
                        }
                        None => return Err(EncodingError::MissingCovariate(name.clone())),
                    };
                    if !value.is_finite() {
                        return Err(EncodingError::NonFinite {
                            covariate: name.clone(),
                            value,
                        });
                    }
                    out[offset] = value;
                    offset += 1;
                }
            }
        }
        Ok(())
    }

    pub fn encode(&self, covariates: &Covariates) -> Result<Array1<f64>, EncodingError> {
        let mut row = Array1::zeros(self.width());
        self.encode_into(covariates, row.view_mut())?;
        Ok(row)
    }

    /// Stacks encoded rows into an `[n, width]` design matrix.
    pub fn design_matrix<'a, I>(&self, rows: I) -> Result<Array2<f64>, EncodingError>
    where
        I: ExactSizeIterator<Item = &'a Covariates>,
    {
        let mut matrix = Array2::zeros((rows.len(), self.width()));
        for (covariates, out) in rows.zip(matrix.rows_mut()) {
            self.encode_into(covariates, out)?;
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn row(channel: &str, lag: f64) -> Covariates {
        let mut covariates = Covariates::new();
        covariates.insert("channel".into(), CovariateValue::Level(channel.into()));
        covariates.insert("lag".into(), CovariateValue::Numeric(lag));
        covariates
    }

    fn specs() -> Vec<CovariateSpec> {
        vec![
            CovariateSpec::categorical("channel"),
            CovariateSpec::numeric("lag"),
        ]
    }

    #[test]
    fn levels_are_sorted_and_first_is_reference() {
        let rows = [row("seo", 1.0), row("affiliate", 2.0), row("paid", 3.0)];
        let encoder =
            CovariateEncoder::fit(&specs(), rows.iter(), UnseenLevelPolicy::Reject).unwrap();
        assert_eq!(
            encoder.levels("channel").unwrap(),
            &["affiliate".to_string(), "paid".into(), "seo".into()]
        );
        assert_eq!(
            encoder.column_names(),
            vec!["channel[paid]", "channel[seo]", "lag"]
        );
        assert_eq!(encoder.encode(&row("affiliate", 4.0)).unwrap(), array![0.0, 0.0, 4.0]);
        assert_eq!(encoder.encode(&row("seo", 5.0)).unwrap(), array![0.0, 1.0, 5.0]);
    }

    #[test]
    fn unseen_level_follows_policy() {
        let rows = [row("seo", 1.0), row("paid", 2.0)];
        let strict =
            CovariateEncoder::fit(&specs(), rows.iter(), UnseenLevelPolicy::Reject).unwrap();
        assert_eq!(
            strict.encode(&row("tv", 1.0)),
            Err(EncodingError::UnknownLevel {
                covariate: "channel".into(),
                level: "tv".into()
            })
        );

        let lenient =
            CovariateEncoder::fit(&specs(), rows.iter(), UnseenLevelPolicy::Reference).unwrap();
        assert_eq!(lenient.encode(&row("tv", 1.0)).unwrap(), array![0.0, 1.0]);
    }

    #[test]
    fn single_level_categorical_is_rejected() {
        let rows = [row("seo", 1.0), row("seo", 2.0)];
        let err = CovariateEncoder::fit(&specs(), rows.iter(), UnseenLevelPolicy::Reject)
            .unwrap_err();
        assert_eq!(
            err,
            EncodingError::TooFewLevels {
                covariate: "channel".into(),
                found: 1
            }
        );
    }

    #[test]
    fn missing_covariate_is_not_zero() {
        let rows = [row("seo", 1.0), row("paid", 2.0)];
        let encoder =
            CovariateEncoder::fit(&specs(), rows.iter(), UnseenLevelPolicy::Reject).unwrap();
        let mut partial = row("seo", 1.0);
        partial.remove("lag");
        assert_eq!(
            encoder.encode(&partial),
            Err(EncodingError::MissingCovariate("lag".into()))
        );
    }
}
