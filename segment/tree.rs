//! Single-predictor regression tree (anova recursive partitioning).
//!
//! Splits minimize the within-node sum of squares of the response. An ordered
//! predictor is cut at midpoints between adjacent distinct values; an unordered
//! categorical predictor has its categories ordered by mean response first, which
//! makes the best ordered cut the best subset split under squared error.
//!
//! Growth is best-first. A split is only taken when it removes at least
//! `cp * SS(root)`, so `cp` behaves like the rpart complexity parameter, and
//! `max_leaves` stops growth early with the largest improvements kept.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeControl {
    /// Minimum fraction of the root sum of squares a split must remove.
    pub cp: f64,
    /// Smallest node that is considered for splitting.
    pub min_split: usize,
    /// Smallest allowed child.
    pub min_bucket: usize,
    pub max_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_leaves: Option<usize>,
}

impl Default for TreeControl {
    fn default() -> Self {
        Self {
            cp: 0.01,
            min_split: 20,
            min_bucket: 7,
            max_depth: 30,
            max_leaves: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("predictor has {predictor} values but response has {response}")]
    LengthMismatch { predictor: usize, response: usize },
    #[error("cannot grow a tree on zero observations")]
    Empty,
    #[error("observation {0} has a non-finite predictor or response")]
    NonFinite(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    /// Observations with `x < cut` go left.
    Below(f64),
    /// Observations whose category is in `left` go left, those in `right` go right.
    Categories {
        left: BTreeSet<String>,
        right: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub rule: SplitRule,
    /// Reduction in sum of squares achieved by this split.
    pub improvement: f64,
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub count: usize,
    pub mean: f64,
    pub deviance: f64,
    pub depth: usize,
    pub split: Option<Split>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

/// A fitted tree. Node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

enum Predictor<'a> {
    Ordered(&'a [f64]),
    Categorical { codes: Vec<usize>, levels: Vec<String> },
}

struct Candidate {
    improvement: f64,
    rule: SplitRule,
    left: Vec<usize>,
    right: Vec<usize>,
}

fn mean_and_deviance(members: &[usize], y: &[f64]) -> (f64, f64) {
    let n = members.len() as f64;
    let mean = members.iter().map(|&i| y[i]).sum::<f64>() / n;
    let deviance = members.iter().map(|&i| (y[i] - mean).powi(2)).sum();
    (mean, deviance)
}

/// Sum-of-squares reduction from splitting into groups with these counts and sums.
#[inline]
fn gain(n_left: f64, sum_left: f64, n_right: f64, sum_right: f64) -> f64 {
    let diff = sum_left / n_left - sum_right / n_right;
    n_left * n_right / (n_left + n_right) * diff * diff
}

impl Predictor<'_> {
    fn best_split(&self, members: &[usize], y: &[f64], min_bucket: usize) -> Option<Candidate> {
        let min_bucket = min_bucket.max(1);
        match self {
            Predictor::Ordered(x) => {
                let mut sorted = members.to_vec();
                sorted.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then(a.cmp(&b)));
                let n = sorted.len();
                let total: f64 = sorted.iter().map(|&i| y[i]).sum();
                let mut best: Option<(f64, usize)> = None;
                let mut sum_left = 0.0;
                for cut in 1..n {
                    sum_left += y[sorted[cut - 1]];
                    if cut < min_bucket || n - cut < min_bucket {
                        continue;
                    }
                    if x[sorted[cut - 1]] == x[sorted[cut]] {
                        continue;
                    }
                    let improvement =
                        gain(cut as f64, sum_left, (n - cut) as f64, total - sum_left);
                    if best.is_none_or(|(value, _)| improvement > value) {
                        best = Some((improvement, cut));
                    }
                }
                best.map(|(improvement, cut)| Candidate {
                    improvement,
                    rule: SplitRule::Below((x[sorted[cut - 1]] + x[sorted[cut]]) / 2.0),
                    left: sorted[..cut].to_vec(),
                    right: sorted[cut..].to_vec(),
                })
            }
            Predictor::Categorical { codes, levels } => {
                let mut groups: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
                for &i in members {
                    let entry = groups.entry(codes[i]).or_insert((0, 0.0));
                    entry.0 += 1;
                    entry.1 += y[i];
                }
                let mut ordered: Vec<(usize, usize, f64)> = groups
                    .into_iter()
                    .map(|(code, (count, sum))| (code, count, sum))
                    .collect();
                ordered.sort_by(|a, b| {
                    (a.2 / a.1 as f64)
                        .total_cmp(&(b.2 / b.1 as f64))
                        .then_with(|| levels[a.0].cmp(&levels[b.0]))
                });

                let n = members.len();
                let total: f64 = ordered.iter().map(|g| g.2).sum();
                let mut best: Option<(f64, usize)> = None;
                let mut n_left = 0usize;
                let mut sum_left = 0.0;
                for boundary in 1..ordered.len() {
                    n_left += ordered[boundary - 1].1;
                    sum_left += ordered[boundary - 1].2;
                    if n_left < min_bucket || n - n_left < min_bucket {
                        continue;
                    }
                    let improvement =
                        gain(n_left as f64, sum_left, (n - n_left) as f64, total - sum_left);
                    if best.is_none_or(|(value, _)| improvement > value) {
                        best = Some((improvement, boundary));
                    }
                }
                best.map(|(improvement, boundary)| {
                    let left_codes: BTreeSet<usize> =
                        ordered[..boundary].iter().map(|g| g.0).collect();
                    let (left, right): (Vec<usize>, Vec<usize>) =
                        members.iter().copied().partition(|&i| left_codes.contains(&codes[i]));
                    let names = |range: &[(usize, usize, f64)]| -> BTreeSet<String> {
                        range.iter().map(|g| levels[g.0].clone()).collect()
                    };
                    Candidate {
                        improvement,
                        rule: SplitRule::Categories {
                            left: names(&ordered[..boundary]),
                            right: names(&ordered[boundary..]),
                        },
                        left,
                        right,
                    }
                })
            }
        }
    }
}

fn check_inputs(predictor_len: usize, y: &[f64]) -> Result<(), TreeError> {
    if predictor_len != y.len() {
        return Err(TreeError::LengthMismatch {
            predictor: predictor_len,
            response: y.len(),
        });
    }
    if y.is_empty() {
        return Err(TreeError::Empty);
    }
    if let Some(idx) = y.iter().position(|v| !v.is_finite()) {
        return Err(TreeError::NonFinite(idx));
    }
    Ok(())
}

impl RegressionTree {
    /// Grows a tree of `y` on an ordered numeric predictor.
    pub fn fit_ordered(x: &[f64], y: &[f64], control: &TreeControl) -> Result<Self, TreeError> {
        check_inputs(x.len(), y)?;
        if let Some(idx) = x.iter().position(|v| !v.is_finite()) {
            return Err(TreeError::NonFinite(idx));
        }
        Ok(Self::grow(&Predictor::Ordered(x), y, control))
    }

    /// Grows a tree of `y` on an unordered categorical predictor.
    pub fn fit_categorical<S: AsRef<str>>(
        x: &[S],
        y: &[f64],
        control: &TreeControl,
    ) -> Result<Self, TreeError> {
        check_inputs(x.len(), y)?;
        let levels: Vec<String> = x
            .iter()
            .map(|value| value.as_ref())
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .map(str::to_string)
            .collect();
        let codes = x
            .iter()
            .map(|value| {
                levels
                    .binary_search_by(|level| level.as_str().cmp(value.as_ref()))
                    .unwrap_or(0)
            })
            .collect();
        Ok(Self::grow(
            &Predictor::Categorical { codes, levels },
            y,
            control,
        ))
    }

    fn grow(predictor: &Predictor<'_>, y: &[f64], control: &TreeControl) -> Self {
        let all: Vec<usize> = (0..y.len()).collect();
        let (mean, deviance) = mean_and_deviance(&all, y);
        let mut nodes = vec![TreeNode {
            count: all.len(),
            mean,
            deviance,
            depth: 0,
            split: None,
        }];
        // Rounding noise in a constant response must not pass as an improvement.
        let noise_floor = 1e-12 * y.iter().map(|v| v * v).sum::<f64>();
        let threshold = (control.cp * deviance).max(noise_floor);
        let max_leaves = control.max_leaves.unwrap_or(usize::MAX).max(1);

        let evaluate = |node: &TreeNode, members: &[usize]| -> Option<Candidate> {
            if members.len() < control.min_split
                || node.depth >= control.max_depth
                || node.deviance <= noise_floor
            {
                return None;
            }
            predictor
                .best_split(members, y, control.min_bucket)
                .filter(|candidate| {
                    candidate.improvement > noise_floor && candidate.improvement >= threshold
                })
        };

        // (node index, pending split) for every leaf that can still be split.
        let mut frontier: Vec<(usize, Candidate)> = Vec::new();
        if let Some(candidate) = evaluate(&nodes[0], &all) {
            frontier.push((0, candidate));
        }
        let mut leaves = 1usize;

        while leaves < max_leaves && !frontier.is_empty() {
            let mut best = 0usize;
            for (position, (node, candidate)) in frontier.iter().enumerate() {
                let (best_node, best_candidate) = &frontier[best];
                if candidate.improvement > best_candidate.improvement
                    || (candidate.improvement == best_candidate.improvement && node < best_node)
                {
                    best = position;
                }
            }
            let (parent, candidate) = frontier.swap_remove(best);
            let depth = nodes[parent].depth + 1;

            let mut children = [0usize; 2];
            for (slot, members) in [&candidate.left, &candidate.right].into_iter().enumerate() {
                let (mean, deviance) = mean_and_deviance(members, y);
                let child = TreeNode {
                    count: members.len(),
                    mean,
                    deviance,
                    depth,
                    split: None,
                };
                children[slot] = nodes.len();
                if let Some(next) = evaluate(&child, members) {
                    frontier.push((nodes.len(), next));
                }
                nodes.push(child);
            }

            log::debug!(
                "Tree split node {parent} ({} obs): improvement {:.6e}",
                nodes[parent].count,
                candidate.improvement
            );
            nodes[parent].split = Some(Split {
                rule: candidate.rule,
                improvement: candidate.improvement,
                left: children[0],
                right: children[1],
            });
            leaves += 1;
        }

        Self { nodes }
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Indices of the terminal nodes, in creation order.
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&idx| self.nodes[idx].is_leaf())
            .collect()
    }

    /// Cut points of an ordered tree, ascending.
    pub fn cut_points(&self) -> Vec<f64> {
        let mut cuts: Vec<f64> = self
            .nodes
            .iter()
            .filter_map(|node| match node.split.as_ref().map(|split| &split.rule) {
                Some(SplitRule::Below(cut)) => Some(*cut),
                _ => None,
            })
            .collect();
        cuts.sort_by(f64::total_cmp);
        cuts
    }

    fn descend<F>(&self, mut goes_left: F) -> Option<usize>
    where
        F: FnMut(&SplitRule) -> Option<bool>,
    {
        let mut idx = 0usize;
        while let Some(split) = &self.nodes[idx].split {
            idx = if goes_left(&split.rule)? {
                split.left
            } else {
                split.right
            };
        }
        Some(idx)
    }

    /// Leaf reached by an ordered predictor value.
    pub fn leaf_for_value(&self, x: f64) -> Option<usize> {
        self.descend(|rule| match rule {
            SplitRule::Below(cut) => Some(x < *cut),
            SplitRule::Categories { .. } => None,
        })
    }

    /// Leaf reached by a category. `None` for a category the tree never saw.
    pub fn leaf_for_category(&self, category: &str) -> Option<usize> {
        self.descend(|rule| match rule {
            SplitRule::Categories { left, right } => {
                if left.contains(category) {
                    Some(true)
                } else if right.contains(category) {
                    Some(false)
                } else {
                    None
                }
            }
            SplitRule::Below(_) => None,
        })
    }

    pub fn predict_value(&self, x: f64) -> Option<f64> {
        self.leaf_for_value(x).map(|idx| self.nodes[idx].mean)
    }

    pub fn predict_category(&self, category: &str) -> Option<f64> {
        self.leaf_for_category(category).map(|idx| self.nodes[idx].mean)
    }
}
