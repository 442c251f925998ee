// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Random decision forests
//!
//! Each rank grows its share of the trees on its own shard, in parallel on
//! the context's local pool. The partial result is the rank's forest; the
//! root concatenates the forests in rank order. Trees are stored as
//! depth-first node lists: a split node is followed by its left subtree,
//! then its right subtree. Rows go left when `row[split_index] <= split_value`.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::{ExchangeMode, MergeOrder, ReduceAlgorithm};
use crate::table::NumericTable;

use super::{check_widths, Labeled};

const TREE_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForestTask {
    /// Labels are class indices in `0..classes`; impurity is Gini
    Classification { classes: usize },
    /// Labels are real responses; impurity is variance
    Regression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Trees in the whole forest, spread over the ranks
    pub tree_count: usize,
    /// Features drawn per split; 0 picks `√p` for classification, `p/3` for regression
    pub features_per_node: usize,
    pub min_observations_leaf: usize,
    pub min_observations_split: usize,
    pub min_impurity_decrease: f64,
    /// Levels below the root; must be at least 1
    pub max_tree_depth: usize,
    /// Upper bound on candidate thresholds per feature and node
    pub max_bins: usize,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            tree_count: 20,
            features_per_node: 0,
            min_observations_leaf: 1,
            min_observations_split: 2,
            min_impurity_decrease: 0.0,
            max_tree_depth: 10,
            max_bins: 256,
            bootstrap: true,
            seed: 777,
        }
    }
}

impl ForestParams {
    pub fn with_tree_count(mut self, trees: usize) -> Self {
        self.tree_count = trees;
        self
    }

    pub fn with_max_tree_depth(mut self, depth: usize) -> Self {
        self.max_tree_depth = depth;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> SpmdResult<()> {
        if self.tree_count == 0 {
            return Err(SpmdError::Invalid("forest needs at least one tree".to_string()));
        }
        if self.max_tree_depth == 0 {
            return Err(SpmdError::Invalid("max tree depth must be at least 1".to_string()));
        }
        if self.max_bins < 2 {
            return Err(SpmdError::Invalid(format!(
                "max bins must be at least 2, got {}",
                self.max_bins
            )));
        }
        if self.min_observations_leaf == 0 || self.min_observations_split < 2 {
            return Err(SpmdError::Invalid(format!(
                "need at least 1 row per leaf and 2 per split, got {} and {}",
                self.min_observations_leaf, self.min_observations_split
            )));
        }
        if self.min_impurity_decrease.is_nan() || self.min_impurity_decrease < 0.0 {
            return Err(SpmdError::Invalid(format!(
                "min impurity decrease must be non-negative, got {}",
                self.min_impurity_decrease
            )));
        }
        Ok(())
    }
}

/// One node of a trained tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningNode {
    /// Depth, 0 at the root
    pub level: usize,
    pub is_leaf: bool,
    /// Feature tested by a split; 0 at leaves
    pub split_index: usize,
    /// Threshold of a split; 0 at leaves
    pub split_value: f64,
    pub impurity: f64,
    /// Class distribution at a classification leaf. Zeros at splits, empty
    /// for regression.
    pub probability: Vec<f64>,
    pub sample_count: u64,
    /// Mean response or most frequent class of the rows reaching the node
    pub response: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<LearningNode>,
}

fn malformed() -> SpmdError {
    SpmdError::Invalid("tree node list is not a complete depth-first layout".to_string())
}

impl DecisionTree {
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.level).max().unwrap_or(0)
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf).count()
    }

    /// Index one past the subtree rooted at `start`
    fn subtree_end(&self, start: usize) -> SpmdResult<usize> {
        let mut pending = 1usize;
        let mut i = start;
        while pending > 0 {
            let node = self.nodes.get(i).ok_or_else(malformed)?;
            if node.is_leaf {
                pending -= 1;
            } else {
                pending += 1;
            }
            i += 1;
        }
        Ok(i)
    }

    /// Leaf reached by `row`
    pub fn leaf(&self, row: &[f64]) -> SpmdResult<&LearningNode> {
        let mut i = 0;
        loop {
            let node = self.nodes.get(i).ok_or_else(malformed)?;
            if node.is_leaf {
                return Ok(node);
            }
            let value = row.get(node.split_index).ok_or_else(|| {
                SpmdError::Invalid(format!(
                    "split on feature {} but row has {} values",
                    node.split_index,
                    row.len()
                ))
            })?;
            i = if *value <= node.split_value {
                i + 1
            } else {
                self.subtree_end(i + 1)?
            };
        }
    }
}

/// One rank's trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestPartial {
    pub feature_count: usize,
    pub trees: Vec<DecisionTree>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomForestModel {
    pub task: ForestTask,
    pub feature_count: usize,
    /// Every rank's trees, concatenated in rank order
    pub trees: Vec<DecisionTree>,
}

impl RandomForestModel {
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Node lists keyed by tree id
    pub fn tree_map(&self) -> BTreeMap<usize, &[LearningNode]> {
        self.trees
            .iter()
            .enumerate()
            .map(|(i, t)| (i, t.nodes.as_slice()))
            .collect()
    }

    fn check_width(&self, features: &NumericTable) -> SpmdResult<()> {
        if features.num_columns() != self.feature_count {
            return Err(SpmdError::Invalid(format!(
                "model has {} features, input has {}",
                self.feature_count,
                features.num_columns()
            )));
        }
        Ok(())
    }

    /// Class probabilities averaged over the trees, `rows × classes`
    pub fn predict_proba(&self, features: &NumericTable) -> SpmdResult<Array2<f64>> {
        let classes = match self.task {
            ForestTask::Classification { classes } => classes,
            ForestTask::Regression => {
                return Err(SpmdError::Invalid(
                    "regression forests have no class probabilities".to_string(),
                ))
            }
        };
        self.check_width(features)?;
        let mut out = Array2::<f64>::zeros((features.num_rows(), classes));
        let weight = 1.0 / self.trees.len().max(1) as f64;
        for i in 0..features.num_rows() {
            let row = features.row(i)?;
            for tree in &self.trees {
                let leaf = tree.leaf(&row)?;
                for (c, p) in leaf.probability.iter().enumerate().take(classes) {
                    out[[i, c]] += p * weight;
                }
            }
        }
        Ok(out)
    }

    /// Most probable class per row, or the mean tree response for regression
    pub fn predict(&self, features: &NumericTable) -> SpmdResult<Array1<f64>> {
        match self.task {
            ForestTask::Classification { .. } => {
                let proba = self.predict_proba(features)?;
                Ok(Array1::from_iter(proba.rows().into_iter().map(|r| argmax(r.iter()) as f64)))
            }
            ForestTask::Regression => {
                self.check_width(features)?;
                let mut out = Array1::<f64>::zeros(features.num_rows());
                for i in 0..features.num_rows() {
                    let row = features.row(i)?;
                    let mut sum = 0.0;
                    for tree in &self.trees {
                        sum += tree.leaf(&row)?.response;
                    }
                    out[i] = sum / self.trees.len().max(1) as f64;
                }
                Ok(out)
            }
        }
    }
}

fn argmax<'a>(values: impl Iterator<Item = &'a f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if *v > best_value {
            best = i;
            best_value = *v;
        }
    }
    best
}

/// Label statistics of the rows in one node
#[derive(Debug, Clone)]
struct NodeStats {
    n: u64,
    /// Per-class counts; empty for regression
    counts: Vec<u64>,
    sum: f64,
    sum_sq: f64,
}

impl NodeStats {
    fn empty(task: ForestTask) -> Self {
        let classes = match task {
            ForestTask::Classification { classes } => classes,
            ForestTask::Regression => 0,
        };
        Self {
            n: 0,
            counts: vec![0; classes],
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn add(&mut self, label: f64) {
        self.n += 1;
        if self.counts.is_empty() {
            self.sum += label;
            self.sum_sq += label * label;
        } else {
            self.counts[label as usize] += 1;
        }
    }

    fn remove(&mut self, label: f64) {
        self.n -= 1;
        if self.counts.is_empty() {
            self.sum -= label;
            self.sum_sq -= label * label;
        } else {
            self.counts[label as usize] -= 1;
        }
    }

    fn impurity(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let n = self.n as f64;
        if self.counts.is_empty() {
            let mean = self.sum / n;
            (self.sum_sq / n - mean * mean).max(0.0)
        } else {
            1.0 - self
                .counts
                .iter()
                .map(|&c| (c as f64 / n).powi(2))
                .sum::<f64>()
        }
    }

    fn probability(&self) -> Vec<f64> {
        let n = self.n.max(1) as f64;
        self.counts.iter().map(|&c| c as f64 / n).collect()
    }

    fn response(&self) -> f64 {
        if self.counts.is_empty() {
            self.sum / self.n.max(1) as f64
        } else {
            argmax(self.probability().iter()) as f64
        }
    }
}

struct Split {
    feature: usize,
    value: f64,
    decrease: f64,
}

/// CART growth over one shard
struct Grower<'a> {
    task: ForestTask,
    params: &'a ForestParams,
    columns: Vec<&'a [f64]>,
    labels: &'a [f64],
    features_per_node: usize,
}

impl Grower<'_> {
    fn stats(&self, rows: &[usize]) -> NodeStats {
        let mut stats = NodeStats::empty(self.task);
        for &r in rows {
            stats.add(self.labels[r]);
        }
        stats
    }

    fn grow(&self, seed: u64) -> DecisionTree {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = self.labels.len();
        let rows: Vec<usize> = if self.params.bootstrap {
            (0..n).map(|_| rng.gen_range(0..n)).collect()
        } else {
            (0..n).collect()
        };
        let mut nodes = Vec::new();
        self.grow_node(&mut rng, &rows, 0, &mut nodes);
        DecisionTree { nodes }
    }

    fn grow_node(
        &self,
        rng: &mut StdRng,
        rows: &[usize],
        level: usize,
        nodes: &mut Vec<LearningNode>,
    ) {
        let stats = self.stats(rows);
        let impurity = stats.impurity();
        let splittable = rows.len() >= self.params.min_observations_split
            && level < self.params.max_tree_depth
            && impurity > 0.0;
        let split = if splittable {
            self.best_split(rng, rows, &stats, impurity)
        } else {
            None
        };

        let Some(split) = split else {
            nodes.push(LearningNode {
                level,
                is_leaf: true,
                split_index: 0,
                split_value: 0.0,
                impurity,
                probability: stats.probability(),
                sample_count: stats.n,
                response: stats.response(),
            });
            return;
        };

        nodes.push(LearningNode {
            level,
            is_leaf: false,
            split_index: split.feature,
            split_value: split.value,
            impurity,
            probability: vec![0.0; stats.counts.len()],
            sample_count: stats.n,
            response: stats.response(),
        });
        let col = self.columns[split.feature];
        let (left, right): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&r| col[r] <= split.value);
        self.grow_node(rng, &left, level + 1, nodes);
        self.grow_node(rng, &right, level + 1, nodes);
    }

    /// Candidate thresholds: distinct values below the maximum, thinned to
    /// `max_bins - 1` quantiles
    fn thresholds(&self, sorted: &[(f64, usize)]) -> Vec<f64> {
        let mut distinct: Vec<f64> = sorted.iter().map(|(v, _)| *v).collect();
        distinct.dedup();
        distinct.pop();
        let bins = self.params.max_bins - 1;
        if distinct.len() <= bins {
            return distinct;
        }
        (1..=bins)
            .map(|b| distinct[b * distinct.len() / (bins + 1)])
            .collect()
    }

    fn best_split(
        &self,
        rng: &mut StdRng,
        rows: &[usize],
        stats: &NodeStats,
        impurity: f64,
    ) -> Option<Split> {
        let min_leaf = self.params.min_observations_leaf as u64;
        let n = rows.len() as f64;
        let mut best: Option<Split> = None;

        for feature in index::sample(rng, self.columns.len(), self.features_per_node) {
            let col = self.columns[feature];
            let mut sorted: Vec<(f64, usize)> = rows.iter().map(|&r| (col[r], r)).collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = NodeStats::empty(self.task);
            let mut right = stats.clone();
            let mut pos = 0;
            for t in self.thresholds(&sorted) {
                while pos < sorted.len() && sorted[pos].0 <= t {
                    let label = self.labels[sorted[pos].1];
                    left.add(label);
                    right.remove(label);
                    pos += 1;
                }
                if left.n < min_leaf || right.n < min_leaf {
                    continue;
                }
                let weighted =
                    (left.n as f64 * left.impurity() + right.n as f64 * right.impurity()) / n;
                let decrease = impurity - weighted;
                let improves = best.as_ref().map_or(true, |b| decrease > b.decrease);
                if decrease > self.params.min_impurity_decrease && improves {
                    best = Some(Split {
                        feature,
                        value: t,
                        decrease,
                    });
                }
            }
        }
        best
    }
}

/// Distributed random forest for classification or regression
#[derive(Debug, Clone)]
pub struct RandomForest {
    pub task: ForestTask,
    pub params: ForestParams,
    rank: usize,
    world_size: usize,
}

impl RandomForest {
    pub fn classifier(classes: usize, params: ForestParams) -> Self {
        Self {
            task: ForestTask::Classification { classes },
            params,
            rank: 0,
            world_size: 1,
        }
    }

    pub fn regressor(params: ForestParams) -> Self {
        Self {
            task: ForestTask::Regression,
            params,
            rank: 0,
            world_size: 1,
        }
    }

    /// Grow this rank's share of the forest
    pub fn for_rank(mut self, rank: usize, world_size: usize) -> Self {
        self.rank = rank;
        self.world_size = world_size.max(1);
        self
    }

    fn share(&self, rank: usize) -> usize {
        let base = self.params.tree_count / self.world_size;
        base + usize::from(rank < self.params.tree_count % self.world_size)
    }

    /// Trees this rank grows and the global id of its first tree
    pub fn local_trees(&self) -> (usize, usize) {
        let first = (0..self.rank).map(|r| self.share(r)).sum();
        (self.share(self.rank), first)
    }

    fn check_labels(&self, labels: &[f64]) -> SpmdResult<()> {
        for (i, &label) in labels.iter().enumerate() {
            let ok = match self.task {
                ForestTask::Classification { classes } => {
                    label.fract() == 0.0 && label >= 0.0 && label < classes as f64
                }
                ForestTask::Regression => label.is_finite(),
            };
            if !ok {
                return Err(SpmdError::Invalid(format!(
                    "row {} has invalid label {} for {:?}",
                    i, label, self.task
                )));
            }
        }
        Ok(())
    }
}

impl ReduceAlgorithm for RandomForest {
    type Input = Labeled;
    type Partial = ForestPartial;
    type Merged = ForestPartial;
    type Output = RandomForestModel;

    fn name(&self) -> &'static str {
        match self.task {
            ForestTask::Classification { .. } => "random_forest_classifier",
            ForestTask::Regression => "random_forest_regressor",
        }
    }

    fn compute_local_partial(&self, input: &Labeled) -> SpmdResult<ForestPartial> {
        self.params.validate()?;
        if let ForestTask::Classification { classes: 0 } = self.task {
            return Err(SpmdError::Invalid("classifier needs at least one class".to_string()));
        }
        if input.labels.num_columns() != 1 {
            return Err(SpmdError::Invalid(format!(
                "labels must be a single column, got {}",
                input.labels.num_columns()
            )));
        }
        let p = input.features.num_columns();
        let features_per_node = match (self.params.features_per_node, self.task) {
            (0, ForestTask::Classification { .. }) => ((p as f64).sqrt() as usize).max(1),
            (0, ForestTask::Regression) => (p / 3).max(1),
            (k, _) => k,
        };
        if features_per_node > p {
            return Err(SpmdError::Invalid(format!(
                "{} features per node but only {} features",
                features_per_node, p
            )));
        }

        let labels = input.labels.column(0)?;
        self.check_labels(labels)?;
        let columns = (0..p)
            .map(|j| input.features.column(j))
            .collect::<SpmdResult<Vec<_>>>()?;
        if let Some(j) = columns.iter().position(|c| c.iter().any(|v| !v.is_finite())) {
            return Err(SpmdError::Invalid(format!("feature {} has non-finite values", j)));
        }

        let (count, first) = self.local_trees();
        if labels.is_empty() {
            log::warn!("empty shard, growing none of its {} trees", count);
            return Ok(ForestPartial {
                feature_count: p,
                trees: Vec::new(),
            });
        }

        let grower = Grower {
            task: self.task,
            params: &self.params,
            columns,
            labels,
            features_per_node,
        };
        let seed = self.params.seed;
        let trees = (0..count)
            .into_par_iter()
            .map(|t| grower.grow(seed ^ ((first + t) as u64 + 1).wrapping_mul(TREE_SEED_STRIDE)))
            .collect();
        Ok(ForestPartial {
            feature_count: p,
            trees,
        })
    }

    fn merge(&self, partials: Vec<RankedPartial<ForestPartial>>) -> SpmdResult<ForestPartial> {
        let feature_count = check_widths(&partials, |f| f.feature_count)?;
        let trees = partials.into_iter().flat_map(|p| p.partial.trees).collect();
        Ok(ForestPartial {
            feature_count,
            trees,
        })
    }

    fn finalize(&self, merged: ForestPartial) -> SpmdResult<RandomForestModel> {
        if merged.trees.is_empty() {
            return Err(SpmdError::Invalid("forest over zero rows".to_string()));
        }
        Ok(RandomForestModel {
            task: self.task,
            feature_count: merged.feature_count,
            trees: merged.trees,
        })
    }

    fn merge_order(&self) -> MergeOrder {
        MergeOrder::RankOrdered
    }

    fn exchange_mode(&self) -> ExchangeMode {
        ExchangeMode::AllGatherV
    }
}
