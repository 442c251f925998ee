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

//! Tests for the partial envelope, frame packing and table IPC serialization

use serde::{Deserialize, Serialize};

use mllib_spmd::error::Code;
use mllib_spmd::net::serialize::{
    decode_frames, decode_partial, deserialize_table, encode_frames, encode_partial,
    serialize_table, RankedPartial,
};
use mllib_spmd::table::NumericTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sums {
    values: Vec<f64>,
    count: u64,
}

mod envelope_tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let bytes = encode_partial(3, &7u64).unwrap();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..12], &8u64.to_le_bytes());
        assert_eq!(bytes.len(), 12 + 8);
    }

    #[test]
    fn test_floats_survive_bit_exact() {
        let partial = Sums {
            values: vec![0.1, -0.0, f64::MIN_POSITIVE / 2.0, 1e308, f64::EPSILON],
            count: 5,
        };
        let bytes = encode_partial(2, &partial).unwrap();
        let decoded: RankedPartial<Sums> = decode_partial(&bytes, 2).unwrap();

        assert_eq!(decoded.rank, 2);
        for (a, b) in decoded.partial.values.iter().zip(partial.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(decoded.partial.count, 5);

        println!("✓ Partial floats round trip bit-exact");
    }

    #[test]
    fn test_wrong_slot_rejected() {
        let bytes = encode_partial(1, &Sums { values: vec![1.0], count: 1 }).unwrap();
        let err = decode_partial::<Sums>(&bytes, 0).unwrap_err();
        assert_eq!(err.code(), Code::SerializationError);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let bytes = encode_partial(0, &Sums { values: vec![1.0, 2.0], count: 2 }).unwrap();
        assert!(decode_partial::<Sums>(&bytes[..6], 0).is_err());
        assert!(decode_partial::<Sums>(&bytes[..bytes.len() - 1], 0).is_err());
    }
}

mod frame_tests {
    use super::*;

    #[test]
    fn test_frames_round_trip() {
        let frames = vec![vec![1u8, 2, 3], vec![], vec![9u8; 100]];
        let packed = encode_frames(&frames);
        assert_eq!(decode_frames(&packed).unwrap(), frames);
        assert!(decode_frames(&encode_frames(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_frames_rejected() {
        let packed = encode_frames(&[vec![1u8, 2, 3]]);
        assert!(decode_frames(&packed[..packed.len() - 1]).is_err());
        assert!(decode_frames(&packed[..2]).is_err());

        let mut trailing = packed.clone();
        trailing.push(0);
        assert!(decode_frames(&trailing).is_err());

        let mut huge = 1u32.to_le_bytes().to_vec();
        huge.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_frames(&huge).is_err());
    }
}

mod table_ipc_tests {
    use super::*;

    #[test]
    fn test_table_round_trip() {
        let table =
            NumericTable::from_rows(&[vec![1.0, 2.5], vec![-3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let bytes = serialize_table(&table).unwrap();
        let back = deserialize_table(&bytes).unwrap();
        assert_eq!(back, table);

        println!("✓ Table IPC round trip");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(deserialize_table(&[1, 2, 3, 4]).is_err());
    }
}
