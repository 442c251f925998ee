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

//! Linear and ridge regression by normal equations

use ndarray::{concatenate, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::linalg::solve_symmetric;
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;

use super::{check_widths, Labeled};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalEquations {
    pub n: u64,
    /// `X̃ᵀX̃` over the (optionally intercept-augmented) design
    pub xtx: Array2<f64>,
    /// `X̃ᵀY`, one column per response
    pub xty: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionModel {
    /// `responses × (features + 1)`; column 0 holds the intercept
    pub coefficients: Array2<f64>,
}

impl RegressionModel {
    pub fn intercept(&self, response: usize) -> f64 {
        self.coefficients[[response, 0]]
    }

    /// Predict every response for each row of `features`
    pub fn predict(&self, features: &Array2<f64>) -> SpmdResult<Array2<f64>> {
        let p = self.coefficients.ncols() - 1;
        if features.ncols() != p {
            return Err(SpmdError::Invalid(format!(
                "model has {} features, input has {}",
                p,
                features.ncols()
            )));
        }
        let beta = self.coefficients.slice(ndarray::s![.., 1..]);
        let intercepts = self.coefficients.column(0);
        Ok(features.dot(&beta.t()) + &intercepts)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinearRegression {
    pub fit_intercept: bool,
    /// Ridge penalty; 0 gives ordinary least squares
    pub ridge: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self {
            fit_intercept: true,
            ridge: 0.0,
        }
    }
}

impl LinearRegression {
    pub fn new(fit_intercept: bool, ridge: f64) -> Self {
        Self {
            fit_intercept,
            ridge,
        }
    }
}

impl ReduceAlgorithm for LinearRegression {
    type Input = Labeled;
    type Partial = NormalEquations;
    type Merged = NormalEquations;
    type Output = RegressionModel;

    fn name(&self) -> &'static str {
        if self.ridge > 0.0 {
            "ridge_regression"
        } else {
            "linear_regression"
        }
    }

    fn compute_local_partial(&self, input: &Labeled) -> SpmdResult<NormalEquations> {
        if self.ridge.is_nan() || self.ridge < 0.0 {
            return Err(SpmdError::Invalid(format!(
                "ridge penalty must be non-negative, got {}",
                self.ridge
            )));
        }
        let x = input.features.to_array2();
        let y = input.labels.to_array2();
        let design = if self.fit_intercept {
            let ones = Array2::<f64>::ones((x.nrows(), 1));
            concatenate(Axis(1), &[ones.view(), x.view()])
                .map_err(|e| SpmdError::Invalid(e.to_string()))?
        } else {
            x
        };
        Ok(NormalEquations {
            n: design.nrows() as u64,
            xtx: design.t().dot(&design),
            xty: design.t().dot(&y),
        })
    }

    fn merge(&self, partials: Vec<RankedPartial<NormalEquations>>) -> SpmdResult<NormalEquations> {
        let d = check_widths(&partials, |p| p.xtx.nrows())?;
        let r = check_widths(&partials, |p| p.xty.ncols())?;
        let mut total = NormalEquations {
            n: 0,
            xtx: Array2::zeros((d, d)),
            xty: Array2::zeros((d, r)),
        };
        for p in partials {
            total.n += p.partial.n;
            total.xtx += &p.partial.xtx;
            total.xty += &p.partial.xty;
        }
        Ok(total)
    }

    fn finalize(&self, merged: NormalEquations) -> SpmdResult<RegressionModel> {
        if merged.n == 0 {
            return Err(SpmdError::Invalid("regression over zero rows".to_string()));
        }
        let d = merged.xtx.nrows();
        let mut a = merged.xtx;
        // the intercept is never penalized
        let first_penalized = usize::from(self.fit_intercept);
        for i in first_penalized..d {
            a[[i, i]] += self.ridge;
        }

        let beta = solve_symmetric(&a, &merged.xty)?;

        let responses = beta.ncols();
        let features = d - first_penalized;
        let mut coefficients = Array2::<f64>::zeros((responses, features + 1));
        for k in 0..responses {
            if self.fit_intercept {
                coefficients[[k, 0]] = beta[[0, k]];
            }
            for j in 0..features {
                coefficients[[k, j + 1]] = beta[[j + first_penalized, k]];
            }
        }
        Ok(RegressionModel { coefficients })
    }
}
