//! Segmentation of scored buyers and their originating clients.

pub mod buyer;
pub mod client;
pub mod tree;

pub use buyer::{BuyerOptions, BuyerThresholds, fit_buyer_thresholds};
pub use client::{ClientGroups, ClientLeaf, ClientOptions, fit_client_groups};
pub use tree::{RegressionTree, Split, SplitRule, TreeControl, TreeError, TreeNode};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SegmentError {
    #[error("not enough data for {stage}: need {required}, found {found}")]
    InsufficientData {
        stage: &'static str,
        required: usize,
        found: usize,
    },
    #[error("invalid buyer thresholds: {0}")]
    InvalidThresholds(String),
    #[error("tree fit failed: {0}")]
    Tree(#[from] TreeError),
}
