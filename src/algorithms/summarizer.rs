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

//! Low-order moments per column

use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;
use crate::table::NumericTable;

use super::check_widths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentPartial {
    pub n: u64,
    pub sum: Vec<f64>,
    pub sum_squares: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl MomentPartial {
    fn empty(width: usize) -> Self {
        Self {
            n: 0,
            sum: vec![0.0; width],
            sum_squares: vec![0.0; width],
            min: vec![f64::INFINITY; width],
            max: vec![f64::NEG_INFINITY; width],
        }
    }
}

/// Every estimate is one value per column
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub mean: Vec<f64>,
    /// Sample (n − 1) variance
    pub variance: Vec<f64>,
    pub standard_deviation: Vec<f64>,
    pub minimum: Vec<f64>,
    pub maximum: Vec<f64>,
    pub sum: Vec<f64>,
    pub sum_squares: Vec<f64>,
    pub sum_squares_centered: Vec<f64>,
    pub second_order_raw_moment: Vec<f64>,
    /// Standard deviation over mean
    pub variation: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Summarizer;

impl ReduceAlgorithm for Summarizer {
    type Input = NumericTable;
    type Partial = MomentPartial;
    type Merged = MomentPartial;
    type Output = Summary;

    fn name(&self) -> &'static str {
        "summarizer"
    }

    fn compute_local_partial(&self, input: &NumericTable) -> SpmdResult<MomentPartial> {
        let mut part = MomentPartial::empty(input.num_columns());
        part.n = input.num_rows() as u64;
        for j in 0..input.num_columns() {
            for &v in input.column(j)? {
                part.sum[j] += v;
                part.sum_squares[j] += v * v;
                part.min[j] = part.min[j].min(v);
                part.max[j] = part.max[j].max(v);
            }
        }
        Ok(part)
    }

    fn merge(&self, partials: Vec<RankedPartial<MomentPartial>>) -> SpmdResult<MomentPartial> {
        let width = check_widths(&partials, |p| p.sum.len())?;
        let mut total = MomentPartial::empty(width);
        for p in partials {
            let p = p.partial;
            total.n += p.n;
            for j in 0..width {
                total.sum[j] += p.sum[j];
                total.sum_squares[j] += p.sum_squares[j];
                total.min[j] = total.min[j].min(p.min[j]);
                total.max[j] = total.max[j].max(p.max[j]);
            }
        }
        Ok(total)
    }

    fn finalize(&self, merged: MomentPartial) -> SpmdResult<Summary> {
        if merged.n == 0 {
            return Err(SpmdError::Invalid("cannot summarize zero rows".to_string()));
        }
        let n = merged.n as f64;
        let width = merged.sum.len();

        let mean: Vec<f64> = merged.sum.iter().map(|s| s / n).collect();
        let sum_squares_centered: Vec<f64> = (0..width)
            .map(|j| merged.sum_squares[j] - merged.sum[j] * merged.sum[j] / n)
            .collect();
        let variance: Vec<f64> = sum_squares_centered
            .iter()
            .map(|c| if merged.n > 1 { c / (n - 1.0) } else { 0.0 })
            .collect();
        let standard_deviation: Vec<f64> = variance.iter().map(|v| v.max(0.0).sqrt()).collect();
        let second_order_raw_moment = merged.sum_squares.iter().map(|s| s / n).collect();
        let variation = standard_deviation
            .iter()
            .zip(&mean)
            .map(|(sd, m)| sd / m)
            .collect();

        Ok(Summary {
            mean,
            variance,
            standard_deviation,
            minimum: merged.min,
            maximum: merged.max,
            sum: merged.sum,
            sum_squares: merged.sum_squares,
            sum_squares_centered,
            second_order_raw_moment,
            variation,
        })
    }
}
