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

//! Dense numeric tables
//!
//! A [`NumericTable`] is the unit of data handed to training calls. It is an
//! immutable Arrow record batch whose columns are all non-nullable `Float64`,
//! so column access is a zero-copy slice and IPC serialization comes for free.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::Array2;

use crate::error::{SpmdError, SpmdResult};

/// Physical layout reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    RowMajor,
    ColumnMajor,
}

#[derive(Debug, Clone)]
pub struct NumericTable {
    batch: RecordBatch,
    columns: Vec<Float64Array>,
}

impl NumericTable {
    /// Wrap an existing record batch, validating its column types
    pub fn from_record_batch(batch: RecordBatch) -> SpmdResult<Self> {
        if batch.num_columns() == 0 {
            return Err(SpmdError::Invalid("table must have at least one column".to_string()));
        }

        let mut columns = Vec::with_capacity(batch.num_columns());
        for (idx, array) in batch.columns().iter().enumerate() {
            let col = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| {
                    SpmdError::Invalid(format!(
                        "column {} has type {:?}, expected Float64",
                        idx,
                        array.data_type()
                    ))
                })?;
            if col.null_count() > 0 {
                return Err(SpmdError::Invalid(format!("column {} contains nulls", idx)));
            }
            columns.push(col.clone());
        }

        Ok(Self { batch, columns })
    }

    /// Build from column vectors; all columns must share a length
    pub fn from_columns(columns: Vec<Vec<f64>>) -> SpmdResult<Self> {
        if columns.is_empty() {
            return Err(SpmdError::Invalid("table must have at least one column".to_string()));
        }
        let rows = columns[0].len();
        if let Some(bad) = columns.iter().position(|c| c.len() != rows) {
            return Err(SpmdError::Invalid(format!(
                "column {} has {} rows, expected {}",
                bad,
                columns[bad].len(),
                rows
            )));
        }

        let fields: Vec<Field> = (0..columns.len())
            .map(|i| Field::new(format!("c{}", i), DataType::Float64, false))
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|c| Arc::new(Float64Array::from(c)) as ArrayRef)
            .collect();

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Self::from_record_batch(batch)
    }

    /// Build from row vectors; ragged rows are rejected
    pub fn from_rows(rows: &[Vec<f64>]) -> SpmdResult<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if cols == 0 {
            return Err(SpmdError::Invalid("table must have at least one column".to_string()));
        }
        let mut columns = vec![Vec::with_capacity(rows.len()); cols];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(SpmdError::Invalid(format!(
                    "row {} has {} values, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            for (j, v) in row.iter().enumerate() {
                columns[j].push(*v);
            }
        }
        Self::from_columns(columns)
    }

    /// Build from a flat row-major buffer, the layout host arrays arrive in
    pub fn from_row_major(rows: usize, cols: usize, data: &[f64]) -> SpmdResult<Self> {
        if cols == 0 {
            return Err(SpmdError::Invalid("table must have at least one column".to_string()));
        }
        if rows * cols != data.len() {
            return Err(SpmdError::Invalid(format!(
                "{}x{} table needs {} values, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        let columns = (0..cols)
            .map(|j| (0..rows).map(|i| data[i * cols + j]).collect())
            .collect();
        Self::from_columns(columns)
    }

    pub fn from_array2(array: &Array2<f64>) -> SpmdResult<Self> {
        let columns = array.columns().into_iter().map(|c| c.to_vec()).collect();
        Self::from_columns(columns)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::ColumnMajor
    }

    pub fn column(&self, j: usize) -> SpmdResult<&[f64]> {
        self.columns
            .get(j)
            .map(|c| c.values().as_ref())
            .ok_or_else(|| SpmdError::Invalid(format!("column index {} out of range", j)))
    }

    pub fn value(&self, i: usize, j: usize) -> SpmdResult<f64> {
        let col = self.column(j)?;
        col.get(i)
            .copied()
            .ok_or_else(|| SpmdError::Invalid(format!("row index {} out of range", i)))
    }

    pub fn row(&self, i: usize) -> SpmdResult<Vec<f64>> {
        if i >= self.num_rows() {
            return Err(SpmdError::Invalid(format!("row index {} out of range", i)));
        }
        Ok(self.columns.iter().map(|c| c.value(i)).collect())
    }

    /// Copy into a dense row-major matrix for the linear algebra kernels
    pub fn to_array2(&self) -> Array2<f64> {
        let rows = self.num_rows();
        let cols = self.num_columns();
        let mut out = Array2::<f64>::zeros((rows, cols));
        for (j, col) in self.columns.iter().enumerate() {
            for (i, v) in col.values().iter().enumerate() {
                out[[i, j]] = *v;
            }
        }
        out
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Zero-copy slice of `len` rows starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> SpmdResult<Self> {
        if offset + len > self.num_rows() {
            return Err(SpmdError::Invalid(format!(
                "slice {}..{} exceeds {} rows",
                offset,
                offset + len,
                self.num_rows()
            )));
        }
        Self::from_record_batch(self.batch.slice(offset, len))
    }

    /// Partition rows into `parts` contiguous shards, one per rank.
    ///
    /// The first `rows % parts` shards receive one extra row.
    pub fn split_rows(&self, parts: usize) -> SpmdResult<Vec<Self>> {
        if parts == 0 {
            return Err(SpmdError::Invalid("cannot split into zero shards".to_string()));
        }
        let rows = self.num_rows();
        let base = rows / parts;
        let extra = rows % parts;

        let mut shards = Vec::with_capacity(parts);
        let mut offset = 0;
        for p in 0..parts {
            let len = base + usize::from(p < extra);
            shards.push(self.slice(offset, len)?);
            offset += len;
        }
        Ok(shards)
    }

    /// Fail unless both tables have the same column count
    pub fn ensure_same_width(&self, other: &NumericTable) -> SpmdResult<()> {
        if self.num_columns() != other.num_columns() {
            return Err(SpmdError::Invalid(format!(
                "column count mismatch: {} vs {}",
                self.num_columns(),
                other.num_columns()
            )));
        }
        Ok(())
    }
}

impl PartialEq for NumericTable {
    fn eq(&self, other: &Self) -> bool {
        self.num_rows() == other.num_rows()
            && self.num_columns() == other.num_columns()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| a.values().as_ref() == b.values().as_ref())
    }
}
