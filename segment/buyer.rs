//! Ordinal buyer segments on expected value.
//!
//! The thresholds come from a regression tree of score on the dense rank of
//! expected value. They are fit in an explicit retraining step and then pinned;
//! assignment only ever compares against the stored edges.

use super::SegmentError;
use super::tree::{RegressionTree, TreeControl};
use crate::types::{BuyerSegment, ScoredRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuyerOptions {
    pub segment_count: usize,
    pub tree: TreeControl,
}

impl Default for BuyerOptions {
    fn default() -> Self {
        Self {
            segment_count: 3,
            tree: TreeControl::default(),
        }
    }
}

/// Strictly increasing expected-value edges. `n` edges give `n + 1` segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct BuyerThresholds {
    edges: Vec<f64>,
}

impl BuyerThresholds {
    pub fn new(edges: Vec<f64>) -> Result<Self, SegmentError> {
        if edges.is_empty() {
            return Err(SegmentError::InvalidThresholds(
                "at least one edge is required".to_string(),
            ));
        }
        if let Some(bad) = edges.iter().find(|edge| !edge.is_finite()) {
            return Err(SegmentError::InvalidThresholds(format!(
                "edge {bad} is not finite"
            )));
        }
        if let Some(pair) = edges.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(SegmentError::InvalidThresholds(format!(
                "edges must be strictly increasing, found {} then {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self { edges })
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn segment_count(&self) -> usize {
        self.edges.len() + 1
    }

    /// Segment `1 + #{edges <= value}`. `None` for a non-finite value.
    pub fn assign(&self, expected_value: f64) -> Option<BuyerSegment> {
        if !expected_value.is_finite() {
            return None;
        }
        let above = self.edges.partition_point(|&edge| edge <= expected_value);
        u8::try_from(above + 1).ok().map(BuyerSegment)
    }
}

impl TryFrom<Vec<f64>> for BuyerThresholds {
    type Error = SegmentError;

    fn try_from(edges: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(edges)
    }
}

impl From<BuyerThresholds> for Vec<f64> {
    fn from(thresholds: BuyerThresholds) -> Self {
        thresholds.edges
    }
}

/// Fits expected-value thresholds from a scored population.
///
/// Records with a non-finite expected value are ignored. Each rank cut of the
/// tree becomes the smallest expected value ranked above it.
pub fn fit_buyer_thresholds(
    scored: &[ScoredRecord],
    options: &BuyerOptions,
) -> Result<BuyerThresholds, SegmentError> {
    let segment_count = options.segment_count.max(2);
    let usable: Vec<&ScoredRecord> = scored.iter().filter(|s| s.is_segmentable()).collect();
    let required = options
        .tree
        .min_split
        .max(segment_count * options.tree.min_bucket.max(1));
    if usable.len() < required {
        return Err(SegmentError::InsufficientData {
            stage: "buyer thresholds",
            required,
            found: usable.len(),
        });
    }

    let mut distinct: Vec<f64> = usable.iter().map(|s| s.expected_value).collect();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();

    let ranks: Vec<f64> = usable
        .iter()
        .map(|s| {
            let position = distinct.partition_point(|&value| value < s.expected_value);
            (position + 1) as f64
        })
        .collect();
    let scores: Vec<f64> = usable.iter().map(|s| s.score).collect();

    let control = TreeControl {
        max_leaves: Some(segment_count),
        ..options.tree.clone()
    };
    let tree = RegressionTree::fit_ordered(&ranks, &scores, &control)?;
    let cuts = tree.cut_points();
    if cuts.len() < segment_count - 1 {
        return Err(SegmentError::InsufficientData {
            stage: "buyer threshold splits",
            required: segment_count - 1,
            found: cuts.len(),
        });
    }

    let edges: Vec<f64> = cuts
        .iter()
        .map(|cut| {
            // Ranks are 1-based and cuts sit halfway between two ranks.
            let first_above = cut.ceil() as usize;
            distinct[first_above - 1]
        })
        .collect();
    log::info!(
        "Buyer thresholds from {} records ({} distinct values): {:?}",
        usable.len(),
        distinct.len(),
        edges
    );
    BuyerThresholds::new(edges)
}
