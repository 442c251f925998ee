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

//! Training session
//!
//! A [`TrainingSession`] is the handle-based surface for embedding callers.
//! Input tables are registered once and referred to by [`Handle`]; every
//! training call returns its result tables as fresh handles, and only on the
//! root rank. All ranks must issue the same training calls in the same order.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::algorithms::{
    ColumnMean, Covariance, ForestParams, ForestTask, KMeans, Labeled, LinearRegression,
    MultinomialNaiveBayes, Pca, RandomForest, RandomForestModel, Summarizer,
};
use crate::ctx::TrainingContext;
use crate::error::SpmdResult;
use crate::handle::{Handle, HandleTable};
use crate::reduce::{distributed_reduce, run_iterative};
use crate::table::NumericTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationResult {
    pub correlation: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CovarianceResult {
    pub covariance: Handle,
    pub mean: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummarizerResult {
    pub mean: Handle,
    pub variance: Handle,
    pub minimum: Handle,
    pub maximum: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearRegressionResult {
    pub coefficients: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaiveBayesResult {
    /// `1 × classes` log priors
    pub pi: Handle,
    /// `classes × features` log likelihoods
    pub theta: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcaResult {
    pub principal_components: Handle,
    /// `1 × k` share of total variance per kept component
    pub explained_variance: Handle,
    /// `1 × features`, every covariance eigenvalue in descending order
    pub eigenvalues: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansResult {
    pub centroids: Handle,
    pub total_cost: f64,
    pub iteration_num: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomForestResult {
    /// Every tree as a depth-first node list, see [`RandomForestModel::tree_map`]
    pub model: RandomForestModel,
    /// `rows × 1` predictions for the root's own feature shard
    pub predictions: Handle,
    /// `rows × classes` probabilities for the same rows; classification only
    pub probabilities: Option<Handle>,
}

pub struct TrainingSession {
    ctx: Arc<TrainingContext>,
    tables: HandleTable<NumericTable>,
}

impl TrainingSession {
    pub fn new(ctx: Arc<TrainingContext>) -> Self {
        Self {
            ctx,
            tables: HandleTable::new(),
        }
    }

    pub fn context(&self) -> &Arc<TrainingContext> {
        &self.ctx
    }

    pub fn register_table(&mut self, table: NumericTable) -> Handle {
        self.tables.insert(table)
    }

    pub fn table(&self, handle: Handle) -> SpmdResult<&NumericTable> {
        self.tables.get(handle)
    }

    pub fn release_table(&mut self, handle: Handle) -> SpmdResult<NumericTable> {
        self.tables.remove(handle)
    }

    pub fn live_tables(&self) -> usize {
        self.tables.len()
    }

    fn register_matrix(&mut self, matrix: &Array2<f64>) -> SpmdResult<Handle> {
        Ok(self.register_table(NumericTable::from_array2(matrix)?))
    }

    /// Register a vector as a single-row table
    fn register_row(&mut self, values: &[f64]) -> SpmdResult<Handle> {
        Ok(self.register_table(NumericTable::from_rows(&[values.to_vec()])?))
    }

    fn labeled(&self, features: Handle, labels: Handle) -> SpmdResult<Labeled> {
        let features = self.tables.get(features)?.clone();
        let labels = self.tables.get(labels)?.clone();
        Labeled::new(features, labels)
    }

    pub fn train_column_mean(&mut self, data: Handle) -> SpmdResult<Option<Handle>> {
        let table = self.tables.get(data)?.clone();
        match distributed_reduce(&self.ctx, &ColumnMean, &table)? {
            Some(means) => Ok(Some(self.register_row(&means)?)),
            None => Ok(None),
        }
    }

    pub fn train_correlation(&mut self, data: Handle) -> SpmdResult<Option<CorrelationResult>> {
        let table = self.tables.get(data)?.clone();
        match distributed_reduce(&self.ctx, &Covariance::correlation(), &table)? {
            Some(out) => Ok(Some(CorrelationResult {
                correlation: self.register_matrix(&out.matrix)?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_covariance(&mut self, data: Handle) -> SpmdResult<Option<CovarianceResult>> {
        let table = self.tables.get(data)?.clone();
        match distributed_reduce(&self.ctx, &Covariance::covariance(), &table)? {
            Some(out) => Ok(Some(CovarianceResult {
                covariance: self.register_matrix(&out.matrix)?,
                mean: self.register_row(&out.means.to_vec())?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_summarizer(&mut self, data: Handle) -> SpmdResult<Option<SummarizerResult>> {
        let table = self.tables.get(data)?.clone();
        match distributed_reduce(&self.ctx, &Summarizer, &table)? {
            Some(summary) => Ok(Some(SummarizerResult {
                mean: self.register_row(&summary.mean)?,
                variance: self.register_row(&summary.variance)?,
                minimum: self.register_row(&summary.minimum)?,
                maximum: self.register_row(&summary.maximum)?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_linear_regression(
        &mut self,
        features: Handle,
        labels: Handle,
        fit_intercept: bool,
        reg_param: f64,
    ) -> SpmdResult<Option<LinearRegressionResult>> {
        let input = self.labeled(features, labels)?;
        let algo = LinearRegression::new(fit_intercept, reg_param);
        match distributed_reduce(&self.ctx, &algo, &input)? {
            Some(model) => Ok(Some(LinearRegressionResult {
                coefficients: self.register_matrix(&model.coefficients)?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_naive_bayes(
        &mut self,
        features: Handle,
        labels: Handle,
        classes: usize,
    ) -> SpmdResult<Option<NaiveBayesResult>> {
        let input = self.labeled(features, labels)?;
        let algo = MultinomialNaiveBayes::new(classes);
        match distributed_reduce(&self.ctx, &algo, &input)? {
            Some(model) => Ok(Some(NaiveBayesResult {
                pi: self.register_row(&model.log_prior.to_vec())?,
                theta: self.register_matrix(&model.log_likelihood)?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_pca(&mut self, data: Handle, k: usize) -> SpmdResult<Option<PcaResult>> {
        let table = self.tables.get(data)?.clone();
        match distributed_reduce(&self.ctx, &Pca::new(k), &table)? {
            Some(model) => Ok(Some(PcaResult {
                principal_components: self.register_matrix(&model.components)?,
                explained_variance: self.register_row(&model.explained_variance_ratio.to_vec())?,
                eigenvalues: self.register_row(&model.eigenvalues.to_vec())?,
            })),
            None => Ok(None),
        }
    }

    pub fn train_kmeans(
        &mut self,
        data: Handle,
        initial_centroids: Handle,
        tolerance: f64,
        max_iterations: usize,
    ) -> SpmdResult<Option<KMeansResult>> {
        let table = self.tables.get(data)?.clone();
        let initial = self.tables.get(initial_centroids)?.to_array2();
        let algo = KMeans::new(initial.nrows(), tolerance);

        match run_iterative(&self.ctx, &algo, &table, &initial, max_iterations)? {
            Some(outcome) => Ok(Some(KMeansResult {
                centroids: self.register_matrix(&outcome.model)?,
                total_cost: outcome.cost,
                iteration_num: outcome.iterations,
            })),
            None => Ok(None),
        }
    }

    /// Grow a forest across all ranks; the root also scores its own shard
    pub fn train_random_forest(
        &mut self,
        features: Handle,
        labels: Handle,
        task: ForestTask,
        params: ForestParams,
    ) -> SpmdResult<Option<RandomForestResult>> {
        let input = self.labeled(features, labels)?;
        let algo = match task {
            ForestTask::Classification { classes } => RandomForest::classifier(classes, params),
            ForestTask::Regression => RandomForest::regressor(params),
        }
        .for_rank(self.ctx.rank(), self.ctx.world_size());

        let model = match distributed_reduce(&self.ctx, &algo, &input)? {
            Some(model) => model,
            None => return Ok(None),
        };
        let predicted = model.predict(&input.features)?;
        let predictions =
            self.register_table(NumericTable::from_columns(vec![predicted.to_vec()])?);
        let probabilities = match task {
            ForestTask::Classification { .. } => {
                let proba = model.predict_proba(&input.features)?;
                Some(self.register_matrix(&proba)?)
            }
            ForestTask::Regression => None,
        };
        Ok(Some(RandomForestResult {
            model,
            predictions,
            probabilities,
        }))
    }
}

/// Copy a single-row result table back into a vector
pub fn row_vector(table: &NumericTable) -> SpmdResult<Array1<f64>> {
    Ok(Array1::from(table.row(0)?))
}
