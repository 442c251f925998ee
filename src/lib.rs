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

//! mllib-spmd: rank-coordinated distributed training
//!
//! Every rank of a fixed communicator computes a partial result over its own
//! shard of the data; the partials are exchanged to a root rank, which merges
//! and finalizes them. The crate provides the collectives (in-process and
//! TCP), the reduction protocol with its iterative variant, a set of training
//! algorithms built on it and a handle-based session for embedding callers.

pub mod algorithms;
pub mod config;
pub mod ctx;
pub mod device;
pub mod error;
pub mod handle;
pub mod linalg;
pub mod net;
pub mod reduce;
pub mod session;
pub mod table;
pub mod util;

// Re-export commonly used types
pub use crate::config::{ComputeDevice, TrainingConfig};
pub use crate::ctx::TrainingContext;
pub use crate::error::{Code, SpmdError, SpmdResult, Status};
pub use crate::handle::{Handle, HandleTable};
pub use crate::reduce::{distributed_reduce, local_reduce, ReduceAlgorithm};
pub use crate::session::TrainingSession;
pub use crate::table::NumericTable;

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
