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

//! Tests for NumericTable construction, access and row sharding

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::array;

use mllib_spmd::error::Code;
use mllib_spmd::table::{DataLayout, NumericTable};

mod table_tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let table = NumericTable::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]])
            .unwrap();

        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.num_columns(), 2);
        assert_eq!(table.layout(), DataLayout::ColumnMajor);
        assert_eq!(table.column(1).unwrap(), &[2.0, 4.0, 6.0]);
        assert_eq!(table.row(2).unwrap(), vec![5.0, 6.0]);
        assert_eq!(table.value(1, 0).unwrap(), 3.0);

        println!("✓ Table built from rows");
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let err = NumericTable::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);

        let err = NumericTable::from_columns(vec![vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_zero_columns_rejected() {
        assert!(NumericTable::from_columns(vec![]).is_err());
        assert!(NumericTable::from_rows(&[]).is_err());
        assert!(NumericTable::from_row_major(3, 0, &[]).is_err());
    }

    #[test]
    fn test_from_row_major_matches_array2() {
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let a = NumericTable::from_row_major(2, 3, &flat).unwrap();
        let b = NumericTable::from_array2(&array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.to_array2(), array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert!(NumericTable::from_row_major(2, 2, &flat).is_err());
    }

    #[test]
    fn test_out_of_range_access() {
        let table = NumericTable::from_rows(&[vec![1.0]]).unwrap();
        assert!(table.column(1).is_err());
        assert!(table.value(1, 0).is_err());
        assert!(table.row(3).is_err());
    }

    #[test]
    fn test_non_float_batch_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef],
        )
        .unwrap();
        let err = NumericTable::from_record_batch(batch).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_nulls_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Float64, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Float64Array::from(vec![Some(1.0), None])) as ArrayRef],
        )
        .unwrap();
        assert!(NumericTable::from_record_batch(batch).is_err());
    }

    #[test]
    fn test_split_rows_uneven() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let table = NumericTable::from_rows(&rows).unwrap();

        let shards = table.split_rows(4).unwrap();
        let sizes: Vec<usize> = shards.iter().map(|s| s.num_rows()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_eq!(shards[2].column(0).unwrap(), &[6.0, 7.0]);

        let rejoined: Vec<f64> = shards
            .iter()
            .flat_map(|s| s.column(0).unwrap().to_vec())
            .collect();
        assert_eq!(rejoined, table.column(0).unwrap());

        println!("✓ split_rows distributes remainder to leading shards");
    }

    #[test]
    fn test_split_more_parts_than_rows() {
        let table = NumericTable::from_rows(&[vec![1.0], vec![2.0]]).unwrap();
        let shards = table.split_rows(3).unwrap();
        assert_eq!(shards.len(), 3);
        assert!(shards[2].is_empty());
        assert!(table.split_rows(0).is_err());
    }

    #[test]
    fn test_ensure_same_width() {
        let a = NumericTable::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let b = NumericTable::from_rows(&[vec![1.0]]).unwrap();
        assert!(a.ensure_same_width(&a).is_ok());
        assert_eq!(a.ensure_same_width(&b).unwrap_err().code(), Code::Invalid);
    }
}
