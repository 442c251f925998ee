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

//! Sample covariance and correlation

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;
use crate::table::NumericTable;

use super::check_widths;

/// Raw cross-product statistics of one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossProducts {
    pub n: u64,
    pub sums: Array1<f64>,
    /// Uncentered `XᵀX`
    pub cross_products: Array2<f64>,
}

impl CrossProducts {
    pub fn from_table(table: &NumericTable) -> Self {
        let x = table.to_array2();
        Self {
            n: table.num_rows() as u64,
            sums: x.sum_axis(Axis(0)),
            cross_products: x.t().dot(&x),
        }
    }

    pub fn width(&self) -> usize {
        self.sums.len()
    }

    /// Elementwise sum of every rank's statistics
    pub fn combine(partials: Vec<RankedPartial<Self>>) -> SpmdResult<Self> {
        let p = check_widths(&partials, |c| c.width())?;
        let mut total = Self {
            n: 0,
            sums: Array1::zeros(p),
            cross_products: Array2::zeros((p, p)),
        };
        for part in partials {
            total.n += part.partial.n;
            total.sums += &part.partial.sums;
            total.cross_products += &part.partial.cross_products;
        }
        Ok(total)
    }

    pub fn means(&self) -> SpmdResult<Array1<f64>> {
        if self.n == 0 {
            return Err(SpmdError::Invalid("no rows to average".to_string()));
        }
        Ok(&self.sums / self.n as f64)
    }

    /// Unbiased covariance `(S − s sᵀ / n) / (n − 1)`
    pub fn covariance(&self) -> SpmdResult<Array2<f64>> {
        if self.n < 2 {
            return Err(SpmdError::Invalid(format!(
                "covariance needs at least 2 rows, got {}",
                self.n
            )));
        }
        let n = self.n as f64;
        let p = self.width();
        let mut cov = Array2::<f64>::zeros((p, p));
        for i in 0..p {
            for j in 0..p {
                cov[[i, j]] =
                    (self.cross_products[[i, j]] - self.sums[i] * self.sums[j] / n) / (n - 1.0);
            }
        }
        Ok(cov)
    }
}

/// Rescale a covariance matrix to correlations.
///
/// A variable with zero variance correlates 1 with itself and 0 with the rest.
pub fn correlation_from_covariance(cov: &Array2<f64>) -> Array2<f64> {
    let p = cov.nrows();
    let mut corr = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            corr[[i, j]] = if i == j {
                1.0
            } else {
                let denom = (cov[[i, i]] * cov[[j, j]]).sqrt();
                if denom > 0.0 {
                    cov[[i, j]] / denom
                } else {
                    0.0
                }
            };
        }
    }
    corr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CovarianceOutput {
    #[default]
    Covariance,
    Correlation,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Covariance {
    pub output: CovarianceOutput,
}

impl Covariance {
    pub fn covariance() -> Self {
        Self {
            output: CovarianceOutput::Covariance,
        }
    }

    pub fn correlation() -> Self {
        Self {
            output: CovarianceOutput::Correlation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    /// Covariance or correlation, depending on the requested output
    pub matrix: Array2<f64>,
    pub means: Array1<f64>,
}

impl ReduceAlgorithm for Covariance {
    type Input = NumericTable;
    type Partial = CrossProducts;
    type Merged = CrossProducts;
    type Output = CovarianceMatrix;

    fn name(&self) -> &'static str {
        match self.output {
            CovarianceOutput::Covariance => "covariance",
            CovarianceOutput::Correlation => "correlation",
        }
    }

    fn compute_local_partial(&self, input: &NumericTable) -> SpmdResult<CrossProducts> {
        Ok(CrossProducts::from_table(input))
    }

    fn merge(&self, partials: Vec<RankedPartial<CrossProducts>>) -> SpmdResult<CrossProducts> {
        CrossProducts::combine(partials)
    }

    fn finalize(&self, merged: CrossProducts) -> SpmdResult<CovarianceMatrix> {
        let cov = merged.covariance()?;
        let matrix = match self.output {
            CovarianceOutput::Covariance => cov,
            CovarianceOutput::Correlation => correlation_from_covariance(&cov),
        };
        Ok(CovarianceMatrix {
            matrix,
            means: merged.means()?,
        })
    }
}
