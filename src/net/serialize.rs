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

//! Wire formats
//!
//! Partial results travel in a small envelope:
//!
//! ```text
//! [owner rank: u32 LE][payload length: u64 LE][bincode payload]
//! ```
//!
//! Tables travel as an Arrow IPC stream holding a single record batch.

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Code, SpmdError, SpmdResult};
use crate::table::NumericTable;

const ENVELOPE_HEADER: usize = 4 + 8;

/// A decoded partial result together with the rank that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPartial<P> {
    pub rank: usize,
    pub partial: P,
}

impl<P> RankedPartial<P> {
    pub fn new(rank: usize, partial: P) -> Self {
        Self { rank, partial }
    }
}

pub fn encode_partial<P: Serialize>(rank: usize, partial: &P) -> SpmdResult<Vec<u8>> {
    let payload = bincode::serialize(partial)?;
    let mut out = Vec::with_capacity(ENVELOPE_HEADER + payload.len());
    out.extend_from_slice(&(rank as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode the envelope received from position `expected_rank`.
///
/// The owner recorded in the envelope must match the slot it arrived in;
/// anything else means the exchange delivered buffers out of rank order.
pub fn decode_partial<P: DeserializeOwned>(
    bytes: &[u8],
    expected_rank: usize,
) -> SpmdResult<RankedPartial<P>> {
    if bytes.len() < ENVELOPE_HEADER {
        return Err(SpmdError::Serialization(format!(
            "partial from rank {} is {} bytes, shorter than its header",
            expected_rank,
            bytes.len()
        )));
    }
    let rank = u32::from_le_bytes(read_array(&bytes[0..4])) as usize;
    let len = u64::from_le_bytes(read_array(&bytes[4..12])) as usize;

    if rank != expected_rank {
        return Err(SpmdError::Serialization(format!(
            "partial in slot {} claims rank {}",
            expected_rank, rank
        )));
    }
    if bytes.len() - ENVELOPE_HEADER != len {
        return Err(SpmdError::Serialization(format!(
            "partial from rank {} declares {} payload bytes but carries {}",
            rank,
            len,
            bytes.len() - ENVELOPE_HEADER
        )));
    }

    let partial = bincode::deserialize(&bytes[ENVELOPE_HEADER..])?;
    Ok(RankedPartial { rank, partial })
}

/// Pack several buffers as `[count u32][len u64, bytes]*`
pub fn encode_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| 8 + f.len()).sum();
    let mut out = Vec::with_capacity(4 + total);
    out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u64).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

pub fn decode_frames(bytes: &[u8]) -> SpmdResult<Vec<Vec<u8>>> {
    let truncated = || SpmdError::Serialization("truncated frame buffer".to_string());

    let count_bytes = bytes.get(0..4).ok_or_else(truncated)?;
    let count = u32::from_le_bytes(read_array(count_bytes)) as usize;
    let mut pos = 4;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len_bytes = bytes.get(pos..pos + 8).ok_or_else(truncated)?;
        let len = u64::from_le_bytes(read_array(len_bytes)) as usize;
        pos += 8;
        let end = pos.checked_add(len).ok_or_else(truncated)?;
        let frame = bytes.get(pos..end).ok_or_else(truncated)?;
        frames.push(frame.to_vec());
        pos = end;
    }
    if pos != bytes.len() {
        return Err(SpmdError::Serialization(format!(
            "{} trailing bytes after {} frames",
            bytes.len() - pos,
            count
        )));
    }
    Ok(frames)
}

/// Serialize a table using the Arrow IPC stream format
pub fn serialize_table(table: &NumericTable) -> SpmdResult<Vec<u8>> {
    let batch = table.record_batch();
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, &batch.schema()).map_err(|e| {
            SpmdError::new(Code::SerializationError, format!("Failed to create IPC writer: {}", e))
        })?;
        writer.write(batch).map_err(|e| {
            SpmdError::new(Code::IoError, format!("Failed to write batch: {}", e))
        })?;
        writer.finish().map_err(|e| {
            SpmdError::new(Code::IoError, format!("Failed to finish writing: {}", e))
        })?;
    }
    Ok(buffer)
}

pub fn deserialize_table(data: &[u8]) -> SpmdResult<NumericTable> {
    let cursor = std::io::Cursor::new(data);
    let mut reader = StreamReader::try_new(cursor, None).map_err(|e| {
        SpmdError::new(Code::SerializationError, format!("Failed to create IPC reader: {}", e))
    })?;
    let batch = reader
        .next()
        .ok_or_else(|| SpmdError::Serialization("No batch found in serialized data".to_string()))?
        .map_err(|e| SpmdError::new(Code::IoError, format!("Failed to read batch: {}", e)))?;
    NumericTable::from_record_batch(batch)
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
