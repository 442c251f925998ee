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

//! Multinomial naive Bayes

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::RankedPartial;
use crate::reduce::ReduceAlgorithm;

use super::{check_widths, Labeled};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub class_counts: Vec<u64>,
    /// `classes × features` sums of feature values per class
    pub feature_sums: Array2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NaiveBayesModel {
    /// `ln(n_c / n)` per class
    pub log_prior: Array1<f64>,
    /// `classes × features` smoothed log likelihoods
    pub log_likelihood: Array2<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct MultinomialNaiveBayes {
    pub classes: usize,
    /// Additive (Laplace) smoothing
    pub alpha: f64,
}

impl MultinomialNaiveBayes {
    pub fn new(classes: usize) -> Self {
        Self { classes, alpha: 1.0 }
    }

    fn class_of(&self, label: f64, row: usize) -> SpmdResult<usize> {
        if label.fract() != 0.0 || label < 0.0 || label >= self.classes as f64 {
            return Err(SpmdError::Invalid(format!(
                "row {} has label {}, expected an integer in [0, {})",
                row, label, self.classes
            )));
        }
        Ok(label as usize)
    }
}

impl ReduceAlgorithm for MultinomialNaiveBayes {
    type Input = Labeled;
    type Partial = ClassCounts;
    type Merged = ClassCounts;
    type Output = NaiveBayesModel;

    fn name(&self) -> &'static str {
        "naive_bayes"
    }

    fn compute_local_partial(&self, input: &Labeled) -> SpmdResult<ClassCounts> {
        if self.classes == 0 {
            return Err(SpmdError::Invalid("naive Bayes needs at least one class".to_string()));
        }
        if input.labels.num_columns() != 1 {
            return Err(SpmdError::Invalid(format!(
                "labels must be a single column, got {}",
                input.labels.num_columns()
            )));
        }
        let labels = input.labels.column(0)?;
        let p = input.features.num_columns();
        let mut counts = ClassCounts {
            class_counts: vec![0; self.classes],
            feature_sums: Array2::zeros((self.classes, p)),
        };
        for j in 0..p {
            let col = input.features.column(j)?;
            for (i, (&v, &label)) in col.iter().zip(labels).enumerate() {
                if v < 0.0 {
                    return Err(SpmdError::Invalid(format!(
                        "feature {} of row {} is negative",
                        j, i
                    )));
                }
                counts.feature_sums[[self.class_of(label, i)?, j]] += v;
            }
        }
        for (i, &label) in labels.iter().enumerate() {
            counts.class_counts[self.class_of(label, i)?] += 1;
        }
        Ok(counts)
    }

    fn merge(&self, partials: Vec<RankedPartial<ClassCounts>>) -> SpmdResult<ClassCounts> {
        let p = check_widths(&partials, |c| c.feature_sums.ncols())?;
        let mut total = ClassCounts {
            class_counts: vec![0; self.classes],
            feature_sums: Array2::zeros((self.classes, p)),
        };
        for part in partials {
            if part.partial.class_counts.len() != self.classes {
                return Err(SpmdError::Invalid(format!(
                    "rank {} counted {} classes, expected {}",
                    part.rank,
                    part.partial.class_counts.len(),
                    self.classes
                )));
            }
            for (acc, c) in total.class_counts.iter_mut().zip(&part.partial.class_counts) {
                *acc += c;
            }
            total.feature_sums += &part.partial.feature_sums;
        }
        Ok(total)
    }

    fn finalize(&self, merged: ClassCounts) -> SpmdResult<NaiveBayesModel> {
        let n: u64 = merged.class_counts.iter().sum();
        if n == 0 {
            return Err(SpmdError::Invalid("naive Bayes over zero rows".to_string()));
        }
        let p = merged.feature_sums.ncols();

        let log_prior = Array1::from_iter(
            merged
                .class_counts
                .iter()
                .map(|&c| (c as f64 / n as f64).ln()),
        );

        let mut log_likelihood = Array2::<f64>::zeros((self.classes, p));
        for c in 0..self.classes {
            let row = merged.feature_sums.row(c);
            let denom = row.sum() + self.alpha * p as f64;
            for j in 0..p {
                log_likelihood[[c, j]] = ((row[j] + self.alpha) / denom).ln();
            }
        }
        Ok(NaiveBayesModel {
            log_prior,
            log_likelihood,
        })
    }
}
