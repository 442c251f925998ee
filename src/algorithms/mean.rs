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

//! Per-column mean

use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;
use crate::table::NumericTable;

use super::check_widths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumCount {
    pub sums: Vec<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnMean;

impl ReduceAlgorithm for ColumnMean {
    type Input = NumericTable;
    type Partial = SumCount;
    type Merged = SumCount;
    type Output = Vec<f64>;

    fn name(&self) -> &'static str {
        "column_mean"
    }

    fn compute_local_partial(&self, input: &NumericTable) -> SpmdResult<SumCount> {
        let sums = (0..input.num_columns())
            .map(|j| input.column(j).map(|c| c.iter().sum()))
            .collect::<SpmdResult<Vec<f64>>>()?;
        Ok(SumCount {
            sums,
            count: input.num_rows() as u64,
        })
    }

    fn merge(&self, partials: Vec<RankedPartial<SumCount>>) -> SpmdResult<SumCount> {
        let width = check_widths(&partials, |p| p.sums.len())?;
        let mut total = SumCount {
            sums: vec![0.0; width],
            count: 0,
        };
        for p in partials {
            for (acc, v) in total.sums.iter_mut().zip(&p.partial.sums) {
                *acc += v;
            }
            total.count += p.partial.count;
        }
        Ok(total)
    }

    fn finalize(&self, merged: SumCount) -> SpmdResult<Vec<f64>> {
        if merged.count == 0 {
            return Err(SpmdError::Invalid("mean of zero rows".to_string()));
        }
        let n = merged.count as f64;
        Ok(merged.sums.into_iter().map(|s| s / n).collect())
    }
}
