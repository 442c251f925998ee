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

//! Networking and collective communication
//!
//! Every backend implements [`Communicator`]: a fixed, ranked group that
//! offers blocking `gather`, `allgatherv`, `broadcast` and `barrier`.

use std::fmt;

use crate::error::{SpmdError, SpmdResult};

pub mod comm_config;
pub mod communicator;
pub mod local;
pub mod rendezvous;
pub mod serialize;
pub mod tcp;
pub mod thread;

pub use comm_config::{CommConfig, LocalConfig, TcpConfig};
pub use communicator::{broadcast_value, Communicator};
pub use local::LocalCommunicator;
pub use rendezvous::{find_available_port, FileRendezvous, DEFAULT_PORT_START};
pub use tcp::TcpCommunicator;
pub use thread::{ThreadCommunicator, ThreadGroup};

/// Communication backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommType {
    Local,
    Thread,
    Tcp,
}

impl fmt::Display for CommType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommType::Local => write!(f, "local"),
            CommType::Thread => write!(f, "thread"),
            CommType::Tcp => write!(f, "tcp"),
        }
    }
}

/// Kind of collective carried by one sequence number.
///
/// Ranks compare this tag to detect peers that issued a different
/// collective at the same point of the call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CollectiveOp {
    Barrier = 1,
    Gather = 2,
    AllGatherV = 3,
    Broadcast = 4,
}

impl CollectiveOp {
    pub fn from_u8(value: u8) -> SpmdResult<Self> {
        match value {
            1 => Ok(CollectiveOp::Barrier),
            2 => Ok(CollectiveOp::Gather),
            3 => Ok(CollectiveOp::AllGatherV),
            4 => Ok(CollectiveOp::Broadcast),
            other => Err(SpmdError::CollectiveMismatch(format!(
                "unknown collective tag {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CollectiveOp::Barrier => "barrier",
            CollectiveOp::Gather => "gather",
            CollectiveOp::AllGatherV => "allgatherv",
            CollectiveOp::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fail with `Invalid` unless `root` names a rank of the group
pub(crate) fn check_root(root: usize, world_size: usize) -> SpmdResult<()> {
    if root >= world_size {
        return Err(SpmdError::Invalid(format!(
            "root rank {} outside world of size {}",
            root, world_size
        )));
    }
    Ok(())
}

/// Check every contribution of a fixed-size gather has the same length
pub(crate) fn check_uniform(contributions: &[Vec<u8>]) -> SpmdResult<()> {
    if let Some(first) = contributions.first() {
        if let Some((rank, bad)) = contributions
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != first.len())
        {
            return Err(SpmdError::SizeMismatch(format!(
                "gather expects identical sizes: rank 0 sent {} bytes, rank {} sent {}",
                first.len(),
                rank,
                bad.len()
            )));
        }
    }
    Ok(())
}

/// Check each rank sent exactly what `recv_counts` announced
pub(crate) fn check_counts(contributions: &[Vec<u8>], recv_counts: &[usize]) -> SpmdResult<()> {
    if contributions.len() != recv_counts.len() {
        return Err(SpmdError::SizeMismatch(format!(
            "{} receive counts for {} ranks",
            recv_counts.len(),
            contributions.len()
        )));
    }
    for (rank, (c, expected)) in contributions.iter().zip(recv_counts).enumerate() {
        if c.len() != *expected {
            return Err(SpmdError::SizeMismatch(format!(
                "rank {} sent {} bytes, receive count says {}",
                rank,
                c.len(),
                expected
            )));
        }
    }
    Ok(())
}
