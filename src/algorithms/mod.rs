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

//! Training algorithms expressed as reductions
//!
//! Each module provides one [`crate::reduce::ReduceAlgorithm`] (or, for
//! k-means, an [`crate::reduce::IterativeAlgorithm`]). Most partial results
//! are small sets of sufficient statistics; the random forest ships whole
//! trees.

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::table::NumericTable;

pub mod covariance;
pub mod forest;
pub mod kmeans;
pub mod linear_regression;
pub mod mean;
pub mod naive_bayes;
pub mod pca;
pub mod summarizer;

pub use covariance::{Covariance, CovarianceMatrix, CovarianceOutput, CrossProducts};
pub use forest::{
    DecisionTree, ForestParams, ForestTask, LearningNode, RandomForest, RandomForestModel,
};
pub use kmeans::{KMeans, KMeansPartial};
pub use linear_regression::{LinearRegression, RegressionModel};
pub use mean::{ColumnMean, SumCount};
pub use naive_bayes::{MultinomialNaiveBayes, NaiveBayesModel};
pub use pca::{Pca, PcaModel};
pub use summarizer::{Summarizer, Summary};

/// Feature table paired row-for-row with a label or response table
#[derive(Debug, Clone)]
pub struct Labeled {
    pub features: NumericTable,
    pub labels: NumericTable,
}

impl Labeled {
    pub fn new(features: NumericTable, labels: NumericTable) -> SpmdResult<Self> {
        if features.num_rows() != labels.num_rows() {
            return Err(SpmdError::Invalid(format!(
                "{} feature rows but {} label rows",
                features.num_rows(),
                labels.num_rows()
            )));
        }
        Ok(Self { features, labels })
    }
}

/// Fail unless every partial carries the same feature width
pub(crate) fn check_widths<P>(
    partials: &[RankedPartial<P>],
    width: impl Fn(&P) -> usize,
) -> SpmdResult<usize> {
    let first = match partials.first() {
        Some(p) => width(&p.partial),
        None => return Err(SpmdError::Invalid("no partial results to merge".to_string())),
    };
    for p in partials {
        let w = width(&p.partial);
        if w != first {
            return Err(SpmdError::Invalid(format!(
                "rank {} has {} columns, rank {} has {}",
                partials[0].rank, first, p.rank, w
            )));
        }
    }
    Ok(first)
}
