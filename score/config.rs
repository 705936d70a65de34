// ========================================================================================
//
//                               PIPELINE CONFIGURATION
//
// ========================================================================================
//
// Every externally tunable constant lives here and is read from TOML. Every field has a
// default, so an empty file is a valid configuration.

use crate::calibrate::CalibrationOptions;
use crate::io::ColumnSchema;
use crate::segment::{BuyerOptions, BuyerThresholds, ClientOptions, TreeControl};
use crate::survival::{CoxOptions, CovariateSpec, CurveOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pinned buyer thresholds. Scoring needs these; they are only refit on request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_thresholds: Option<BuyerThresholds>,
    pub covariates: Vec<CovariateSpec>,
    pub hazard: CoxOptions,
    pub curve: CurveOptions,
    pub buyer: BuyerOptions,
    pub client: ClientOptions,
    pub calibration: CalibrationOptions,
    pub columns: ColumnSchema,
}

pub fn default_covariates() -> Vec<CovariateSpec> {
    vec![
        CovariateSpec::categorical("acquisition_quarter"),
        CovariateSpec::categorical("acquisition_channel"),
        CovariateSpec::categorical("user_group"),
        CovariateSpec::numeric("reg_to_purchase_days"),
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buyer_thresholds: None,
            covariates: default_covariates(),
            hazard: CoxOptions::default(),
            curve: CurveOptions::default(),
            buyer: BuyerOptions::default(),
            client: ClientOptions::default(),
            calibration: CalibrationOptions::default(),
            columns: ColumnSchema::default(),
        }
    }
}

fn check_tree(label: &str, tree: &TreeControl) -> Result<(), ConfigError> {
    if !tree.cp.is_finite() || tree.cp < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "{label}: cp must be a non-negative number, got {}",
            tree.cp
        )));
    }
    if tree.min_bucket == 0 || tree.min_split < 2 {
        return Err(ConfigError::Invalid(format!(
            "{label}: min_split must be at least 2 and min_bucket at least 1"
        )));
    }
    if tree.max_leaves == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "{label}: max_leaves must be positive"
        )));
    }
    Ok(())
}

impl PipelineConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.covariates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one covariate is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.covariates {
            if spec.name.is_empty() || !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "covariate names must be unique and non-empty, got '{}'",
                    spec.name
                )));
            }
        }

        if self.hazard.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "hazard.max_iterations must be positive".to_string(),
            ));
        }
        if !self.hazard.tolerance.is_finite() || self.hazard.tolerance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "hazard.tolerance must be positive, got {}",
                self.hazard.tolerance
            )));
        }

        self.curve
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        if self.buyer.segment_count < 2 || self.buyer.segment_count > usize::from(u8::MAX) {
            return Err(ConfigError::Invalid(format!(
                "buyer.segment_count must be between 2 and 255, got {}",
                self.buyer.segment_count
            )));
        }
        check_tree("buyer.tree", &self.buyer.tree)?;
        if let Some(thresholds) = &self.buyer_thresholds {
            if thresholds.segment_count() != self.buyer.segment_count {
                return Err(ConfigError::Invalid(format!(
                    "buyer_thresholds define {} segments but buyer.segment_count is {}",
                    thresholds.segment_count(),
                    self.buyer.segment_count
                )));
            }
        }

        check_tree("client.tree", &self.client.tree)?;
        if self.client.min_clients == 0 {
            return Err(ConfigError::Invalid(
                "client.min_clients must be positive".to_string(),
            ));
        }

        let width = self.calibration.bin_width;
        if !width.is_finite() || width <= 0.0 || width > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "calibration.bin_width must lie in (0, 1], got {width}"
            )));
        }
        if self.calibration.horizon <= 0 {
            return Err(ConfigError::Invalid(format!(
                "calibration.horizon must be positive, got {}",
                self.calibration.horizon
            )));
        }

        self.columns
            .validate(&self.covariates)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survival::{CovariateKind, TieMethod};

    #[test]
    fn empty_document_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.curve.fallback_probability, 0.007422);
        assert_eq!(config.curve.horizons, vec![30, 60, 90]);
        assert_eq!(config.calibration.bin_width, 0.05);
        assert_eq!(config.hazard.ties, TieMethod::Efron);
        assert!(config.buyer_thresholds.is_none());
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let text = r#"
buyer_thresholds = [0.25, 1.5]

[[covariates]]
name = "channel"
kind = "categorical"

[[covariates]]
name = "lag"
kind = "numeric"

[hazard]
ties = "breslow"

[curve]
horizons = [30, 90]
"#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.covariates.len(), 2);
        assert_eq!(config.covariates[1].kind, CovariateKind::Numeric);
        assert_eq!(config.hazard.ties, TieMethod::Breslow);
        assert_eq!(config.hazard.max_iterations, 20);
        assert_eq!(config.curve.lookup_horizon, 90);
        assert_eq!(
            config.buyer_thresholds.as_ref().map(|t| t.edges().to_vec()),
            Some(vec![0.25, 1.5])
        );
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        for text in [
            "[curve]\nhorizons = []\n",
            "[curve]\nhorizons = [30, 60]\n",
            "[curve]\nfallback_probability = 1.5\n",
            "[calibration]\nbin_width = 0.0\n",
            "buyer_thresholds = [2.0, 1.0]\n",
            "buyer_thresholds = [1.0]\n",
            "covariates = []\n",
            "[columns]\ncensored_value = \"1\"\n",
            "[columns]\nevent_value = \"\"\n",
        ] {
            assert!(
                PipelineConfig::from_toml_str(text).is_err(),
                "accepted invalid configuration:\n{text}"
            );
        }
    }

    #[test]
    fn save_then_load_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = PipelineConfig {
            buyer_thresholds: Some(BuyerThresholds::new(vec![0.1, 0.9]).unwrap()),
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }
}
