//! Client groups: a tree of score on client id, with each client mapped to its leaf mean.

use super::SegmentError;
use super::tree::{RegressionTree, TreeControl};
use crate::types::ScoredRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub min_clients: usize,
    pub tree: TreeControl,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            min_clients: 2,
            tree: TreeControl::default(),
        }
    }
}

/// Clients that landed in the same leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientLeaf {
    pub value: f64,
    pub records: usize,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClientGroups {
    tree: RegressionTree,
    assignment: BTreeMap<String, usize>,
}

impl ClientGroups {
    pub fn client_count(&self) -> usize {
        self.assignment.len()
    }

    /// Leaf mean score for a client seen at fit time.
    pub fn group_for(&self, client_id: &str) -> Option<f64> {
        self.assignment
            .get(client_id)
            .map(|&leaf| self.tree.nodes()[leaf].mean)
    }

    pub fn leaves(&self) -> Vec<ClientLeaf> {
        let mut by_leaf: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (client, &leaf) in &self.assignment {
            by_leaf.entry(leaf).or_default().push(client.clone());
        }
        by_leaf
            .into_iter()
            .map(|(leaf, clients)| {
                let node = &self.tree.nodes()[leaf];
                ClientLeaf {
                    value: node.mean,
                    records: node.count,
                    clients,
                }
            })
            .collect()
    }
}

/// Fits client groups on the segmentable part of a scored population.
pub fn fit_client_groups(
    scored: &[ScoredRecord],
    options: &ClientOptions,
) -> Result<ClientGroups, SegmentError> {
    let usable: Vec<&ScoredRecord> = scored.iter().filter(|s| s.is_segmentable()).collect();
    let clients: BTreeSet<&str> = usable
        .iter()
        .map(|s| s.record.client_id.as_str())
        .collect();
    let required = options.min_clients.max(1);
    if clients.len() < required {
        return Err(SegmentError::InsufficientData {
            stage: "client groups",
            required,
            found: clients.len(),
        });
    }

    let ids: Vec<&str> = usable.iter().map(|s| s.record.client_id.as_str()).collect();
    let scores: Vec<f64> = usable.iter().map(|s| s.score).collect();
    let tree = RegressionTree::fit_categorical(&ids, &scores, &options.tree)?;

    let assignment: BTreeMap<String, usize> = clients
        .iter()
        .filter_map(|&client| {
            tree.leaf_for_category(client)
                .map(|leaf| (client.to_string(), leaf))
        })
        .collect();
    log::info!(
        "Client groups: {} clients from {} records in {} leaves",
        assignment.len(),
        usable.len(),
        tree.leaves().len()
    );
    Ok(ClientGroups { tree, assignment })
}
