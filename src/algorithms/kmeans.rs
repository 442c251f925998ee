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

//! Lloyd k-means
//!
//! One round assigns every row to its nearest centroid (ties go to the lowest
//! index) and moves each centroid to the mean of its rows. A centroid that
//! attracted no rows stays where it was.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::IterativeAlgorithm;
use crate::table::NumericTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansPartial {
    /// `clusters × features` sums of assigned rows
    pub sums: Array2<f64>,
    pub counts: Vec<u64>,
    /// Squared distance of each row to its nearest current centroid, summed
    pub cost: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    pub clusters: usize,
    pub tolerance: f64,
}

impl KMeans {
    pub fn new(clusters: usize, tolerance: f64) -> Self {
        Self {
            clusters,
            tolerance,
        }
    }

    fn check_model(&self, centroids: &Array2<f64>, features: usize) -> SpmdResult<()> {
        if centroids.nrows() != self.clusters || centroids.ncols() != features {
            return Err(SpmdError::Invalid(format!(
                "expected {}x{} centroids, got {}x{}",
                self.clusters,
                features,
                centroids.nrows(),
                centroids.ncols()
            )));
        }
        Ok(())
    }
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the nearest centroid and its squared distance
pub fn nearest_centroid(row: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(row, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

impl IterativeAlgorithm for KMeans {
    type Input = NumericTable;
    type Model = Array2<f64>;
    type Partial = KMeansPartial;

    fn name(&self) -> &'static str {
        "kmeans"
    }

    fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn compute_local_partial(
        &self,
        input: &NumericTable,
        centroids: &Array2<f64>,
    ) -> SpmdResult<KMeansPartial> {
        let p = input.num_columns();
        self.check_model(centroids, p)?;

        let x = input.to_array2();
        let mut part = KMeansPartial {
            sums: Array2::zeros((self.clusters, p)),
            counts: vec![0; self.clusters],
            cost: 0.0,
        };
        for row in x.rows() {
            let (c, d) = nearest_centroid(row, centroids);
            let mut acc = part.sums.row_mut(c);
            acc += &row;
            part.counts[c] += 1;
            part.cost += d;
        }
        Ok(part)
    }

    fn merge(
        &self,
        centroids: &Array2<f64>,
        partials: Vec<RankedPartial<KMeansPartial>>,
    ) -> SpmdResult<(Array2<f64>, f64)> {
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0u64; self.clusters];
        let mut cost = 0.0;

        // summed in rank order so every run produces identical bits
        for part in partials {
            let part_shape = part.partial.sums.dim();
            if part_shape != sums.dim() || part.partial.counts.len() != self.clusters {
                return Err(SpmdError::Invalid(format!(
                    "rank {} sent {:?} sums for {:?} centroids",
                    part.rank,
                    part_shape,
                    sums.dim()
                )));
            }
            sums += &part.partial.sums;
            for (acc, c) in counts.iter_mut().zip(&part.partial.counts) {
                *acc += c;
            }
            cost += part.partial.cost;
        }

        let mut next = centroids.clone();
        for (c, &count) in counts.iter().enumerate() {
            if count > 0 {
                let mean = &sums.row(c) / count as f64;
                next.row_mut(c).assign(&mean);
            }
        }
        Ok((next, cost))
    }

    /// Largest squared movement of any single centroid
    fn displacement(&self, old: &Array2<f64>, new: &Array2<f64>) -> f64 {
        old.rows()
            .into_iter()
            .zip(new.rows())
            .map(|(a, b)| squared_distance(a, b))
            .fold(0.0, f64::max)
    }
}
