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

//! Principal component analysis over the covariance matrix

use ndarray::{s, Array1, Array2};

use crate::error::{SpmdError, SpmdResult};
use crate::linalg::symmetric_eigen;
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;
use crate::table::NumericTable;

use super::covariance::CrossProducts;

#[derive(Debug, Clone, PartialEq)]
pub struct PcaModel {
    /// Every eigenvalue of the covariance matrix, descending
    pub eigenvalues: Array1<f64>,
    /// `k × features`, one principal axis per row
    pub components: Array2<f64>,
    /// First `k` eigenvalues over the sum of all eigenvalues
    pub explained_variance_ratio: Array1<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pca {
    /// Number of components to keep; `None` keeps all of them
    pub components: Option<usize>,
}

impl Pca {
    pub fn new(components: usize) -> Self {
        Self {
            components: Some(components),
        }
    }
}

impl ReduceAlgorithm for Pca {
    type Input = NumericTable;
    type Partial = CrossProducts;
    type Merged = CrossProducts;
    type Output = PcaModel;

    fn name(&self) -> &'static str {
        "pca"
    }

    fn compute_local_partial(&self, input: &NumericTable) -> SpmdResult<CrossProducts> {
        Ok(CrossProducts::from_table(input))
    }

    fn merge(&self, partials: Vec<RankedPartial<CrossProducts>>) -> SpmdResult<CrossProducts> {
        CrossProducts::combine(partials)
    }

    fn finalize(&self, merged: CrossProducts) -> SpmdResult<PcaModel> {
        let p = merged.width();
        let k = self.components.unwrap_or(p);
        if k == 0 || k > p {
            return Err(SpmdError::Invalid(format!(
                "cannot keep {} components of {} features",
                k, p
            )));
        }

        let cov = merged.covariance()?;
        let (values, vectors) = symmetric_eigen(&cov)?;

        let total: f64 = values.iter().map(|v| v.max(0.0)).sum();
        let explained_variance_ratio = values.slice(s![..k]).mapv(|v| {
            if total > 0.0 {
                v.max(0.0) / total
            } else {
                0.0
            }
        });
        let components = vectors.slice(s![.., ..k]).t().to_owned();

        Ok(PcaModel {
            eigenvalues: values,
            components,
            explained_variance_ratio,
        })
    }
}
