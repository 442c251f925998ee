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

//! Communicator trait
//!
//! All collectives are blocking and must be called by every rank of the group
//! in the same order. Each call consumes one sequence number of the
//! communicator; a peer that issues a different collective for the same
//! sequence number produces a `CollectiveMismatch`, and a peer that never shows
//! up produces a `CollectiveTimeout` once [`Communicator::timeout`] elapses.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::device::MemoryAccess;
use crate::error::SpmdResult;

use super::CommType;

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn comm_type(&self) -> CommType;

    /// Whether collective buffers are staged in host or device memory.
    ///
    /// Transports without device support report `Host`.
    fn memory_access(&self) -> MemoryAccess {
        MemoryAccess::Host
    }

    /// Upper bound on any single blocking wait; `None` waits forever
    fn timeout(&self) -> Option<Duration>;

    fn barrier(&self) -> SpmdResult<()>;

    /// Gather equally sized buffers to `root`.
    ///
    /// On `root` the result holds one buffer per rank, in rank order. Other
    /// ranks receive an empty vector. Contributions of differing length fail
    /// with `SizeMismatch` on every rank.
    fn gather(&self, data: &[u8], root: usize) -> SpmdResult<Vec<Vec<u8>>>;

    /// Variable-size allgather.
    ///
    /// `recv_counts` must hold one byte count per rank and be identical on
    /// every rank. Every rank receives every buffer, in rank order.
    fn allgatherv(&self, data: &[u8], recv_counts: &[usize]) -> SpmdResult<Vec<Vec<u8>>>;

    /// Replace `data` on every rank with the bytes held by `root`
    fn broadcast(&self, data: &mut Vec<u8>, root: usize) -> SpmdResult<()>;

    /// Allgather where every rank contributes the same number of bytes
    fn allgather_fixed(&self, data: &[u8]) -> SpmdResult<Vec<Vec<u8>>> {
        let counts = vec![data.len(); self.world_size()];
        self.allgatherv(data, &counts)
    }
}

/// Broadcast a serde value from `root`; non-root inputs are ignored
pub fn broadcast_value<T>(comm: &dyn Communicator, value: &T, root: usize) -> SpmdResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut buf = if comm.rank() == root {
        bincode::serialize(value)?
    } else {
        Vec::new()
    };
    comm.broadcast(&mut buf, root)?;
    Ok(bincode::deserialize(&buf)?)
}
