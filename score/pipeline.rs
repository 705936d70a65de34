// ========================================================================================
//
//                                   THE PIPELINE
//
// ========================================================================================
//
// Composes the stages into two runs:
//
//   train:  records -> HazardFit -> BaselineCurveTable, and records -> ProfitFit
//   score:  records -> ScoringEngine -> buyer segments (pinned) + client groups -> rows
//
// Fitted artifacts are plain values passed by reference. Nothing is cached between runs
// and buyer thresholds are only refit through `retrain_buyer_thresholds`.

use crate::calibrate::{CalibrationError, CalibrationReport, validate};
use crate::config::{ConfigError, PipelineConfig};
use crate::engine::ScoringEngine;
use crate::io::{DataError, RecordSource, SegmentSink};
use crate::profit::{ProfitError, ProfitFit, fit_profit_model};
use crate::segment::{
    BuyerThresholds, ClientGroups, SegmentError, fit_buyer_thresholds, fit_client_groups,
};
use crate::survival::{
    BaselineCurveTable, CurveError, FitError, HazardFit, derive_curve, fit_hazard_model,
};
use crate::types::{Record, RecordRejection, ScoredRecord, SegmentRow};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Hazard model fit failed: {0}")]
    Hazard(#[from] FitError),
    #[error("Baseline curve derivation failed: {0}")]
    Curve(#[from] CurveError),
    #[error("Profit model fit failed: {0}")]
    Profit(#[from] ProfitError),
    #[error("Segmentation failed: {0}")]
    Segment(#[from] SegmentError),
    #[error("Validation failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Customer '{0}' appears more than once in the batch.")]
    DuplicateCustomer(String),
    #[error("No buyer thresholds are pinned in the configuration; retrain them first.")]
    ThresholdsNotPinned,
    #[error("Failed to read or write model file: {0}")]
    ModelIo(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    ModelParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    ModelSerialize(#[from] toml::ser::Error),
}

/// Everything one training run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModels {
    pub hazard: HazardFit,
    pub curve: BaselineCurveTable,
    pub profit: ProfitFit,
}

impl TrainedModels {
    pub fn engine(&self) -> ScoringEngine<'_> {
        ScoringEngine::new(&self.hazard, &self.curve, &self.profit)
    }

    /// Saves the artifacts as human-readable TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::info!("Saved trained models to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let toml_string = fs::read_to_string(path.as_ref())?;
        let models = toml::from_str(&toml_string)?;
        Ok(models)
    }
}

/// Fits the hazard model, its baseline curve and the profit model. Any failure aborts.
pub fn train(training: &[Record], config: &PipelineConfig) -> Result<TrainedModels, PipelineError> {
    config.validate()?;
    log::info!("Training on {} records", training.len());

    let hazard = fit_hazard_model(training, &config.covariates, &config.hazard)?;
    let curve = derive_curve(&hazard, training, &config.curve)?;
    let profit = fit_profit_model(training, &config.covariates)?;

    log::info!(
        "Trained models: {} events over {} Cox iterations, {}-day lookup with fallback {}, \
         profit residual SE {:.4}",
        hazard.events(),
        hazard.iterations(),
        curve.lookup_horizon(),
        curve.fallback_probability(),
        profit.residual_std_error()
    );
    Ok(TrainedModels {
        hazard,
        curve,
        profit,
    })
}

/// The result of scoring one batch.
#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    /// One row per segmented record, in input order.
    pub rows: Vec<SegmentRow>,
    pub rejected: Vec<RecordRejection>,
    /// Scored records whose expected value was undefined.
    pub unsegmented: Vec<String>,
    pub client_groups: ClientGroups,
}

fn check_unique(batch: &[Record]) -> Result<(), PipelineError> {
    let mut seen = AHashSet::with_capacity(batch.len());
    for record in batch {
        if !seen.insert(record.customer_id.as_str()) {
            return Err(PipelineError::DuplicateCustomer(record.customer_id.clone()));
        }
    }
    Ok(())
}

/// Scores a batch and segments it with the given (pinned) buyer thresholds.
pub fn score_batch(
    batch: &[Record],
    models: &TrainedModels,
    thresholds: &BuyerThresholds,
    config: &PipelineConfig,
) -> Result<ScoringOutcome, PipelineError> {
    check_unique(batch)?;
    let scored = models.engine().score_batch(batch);
    let client_groups = fit_client_groups(&scored.scored, &config.client)?;

    let mut rows = Vec::with_capacity(scored.scored.len());
    let mut unsegmented = Vec::new();
    for record in &scored.scored {
        let segment = thresholds.assign(record.expected_value);
        let group = client_groups.group_for(&record.record.client_id);
        match (record.is_segmentable(), segment, group) {
            (true, Some(buyer_segment), Some(client_group)) => rows.push(SegmentRow {
                customer_id: record.record.customer_id.clone(),
                client_id: record.record.client_id.clone(),
                score: record.score,
                expected_value: record.expected_value,
                buyer_segment,
                client_group,
            }),
            _ => unsegmented.push(record.record.customer_id.clone()),
        }
    }

    log::info!(
        "Segmented {} of {} records into {} buyer segments and {} client leaves",
        rows.len(),
        batch.len(),
        thresholds.segment_count(),
        client_groups.leaves().len()
    );
    Ok(ScoringOutcome {
        rows,
        rejected: scored.rejected,
        unsegmented,
        client_groups,
    })
}

/// Reads a batch from `source`, scores it with the thresholds pinned in `config`,
/// and writes the rows to `sink`.
pub fn run_scoring(
    source: &dyn RecordSource,
    sink: &mut dyn SegmentSink,
    models: &TrainedModels,
    config: &PipelineConfig,
) -> Result<ScoringOutcome, PipelineError> {
    let thresholds = config
        .buyer_thresholds
        .as_ref()
        .ok_or(PipelineError::ThresholdsNotPinned)?;
    let batch = source.load_records()?;
    let outcome = score_batch(&batch, models, thresholds, config)?;
    sink.write_rows(&outcome.rows)?;
    Ok(outcome)
}

/// The explicit offline refit of buyer thresholds. The result is meant to be pinned
/// in configuration, not used silently.
pub fn retrain_buyer_thresholds(
    scored: &[ScoredRecord],
    config: &PipelineConfig,
) -> Result<BuyerThresholds, PipelineError> {
    let thresholds = fit_buyer_thresholds(scored, &config.buyer)?;
    log::info!("Retrained buyer thresholds: {:?}", thresholds.edges());
    Ok(thresholds)
}

/// Scores held-out records and reports calibration against their outcomes.
pub fn validate_held_out(
    held_out: &[Record],
    models: &TrainedModels,
    config: &PipelineConfig,
) -> Result<CalibrationReport, PipelineError> {
    Ok(validate(held_out, &models.engine(), &config.calibration)?)
}
