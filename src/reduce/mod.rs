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

//! Rank-coordinated reduction
//!
//! Every algorithm follows the same two-phase shape: each rank computes a
//! partial result over its shard, the partials are exchanged to the root, and
//! the root merges and finalizes them. [`distributed_reduce`] runs that shape
//! for any [`ReduceAlgorithm`].
//!
//! All ranks must call [`distributed_reduce`] with the same algorithm; a rank
//! that fails before the exchange leaves its peers waiting until the
//! communicator timeout turns the wait into `CollectiveTimeout`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ctx::TrainingContext;
use crate::error::{SpmdError, SpmdResult};
use crate::net::serialize::{decode_partial, encode_partial, RankedPartial};
use crate::util::timing::Stopwatch;

pub mod iterative;

pub use iterative::{run_iterative, IterationOutcome, IterativeAlgorithm};

/// Whether `merge` may see partials in any order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrder {
    Commutative,
    /// Partials must reach `merge` sorted by rank
    RankOrdered,
}

/// Collective used to move partials to the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Fixed-size gather; every rank's encoded partial must have equal length
    FixedGather,
    /// Length allgather followed by a variable-size allgather
    AllGatherV,
}

/// One distributed algorithm expressed as local compute, merge and finalize.
///
/// `compute_local_partial` runs on the context's local thread pool, hence the
/// `Sync` bounds on the algorithm and its input.
pub trait ReduceAlgorithm: Sync {
    type Input: ?Sized + Sync;
    type Partial: Serialize + DeserializeOwned + Send;
    type Merged;
    type Output;

    fn name(&self) -> &'static str;

    fn compute_local_partial(&self, input: &Self::Input) -> SpmdResult<Self::Partial>;

    /// Combine every rank's partial; runs on the root only
    fn merge(&self, partials: Vec<RankedPartial<Self::Partial>>) -> SpmdResult<Self::Merged>;

    fn finalize(&self, merged: Self::Merged) -> SpmdResult<Self::Output>;

    fn merge_order(&self) -> MergeOrder {
        MergeOrder::Commutative
    }

    fn exchange_mode(&self) -> ExchangeMode {
        ExchangeMode::FixedGather
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceState {
    Idle,
    LocalComputeInProgress,
    AwaitingExchange,
    Merging,
    Finalizing,
    Done,
}

impl fmt::Display for ReduceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceState::Idle => "idle",
            ReduceState::LocalComputeInProgress => "local-compute",
            ReduceState::AwaitingExchange => "awaiting-exchange",
            ReduceState::Merging => "merging",
            ReduceState::Finalizing => "finalizing",
            ReduceState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Enforces the legal state transitions of one reduction on one rank
#[derive(Debug, Clone)]
pub struct ReduceTracker {
    algorithm: &'static str,
    rank: usize,
    is_root: bool,
    state: ReduceState,
    history: Vec<ReduceState>,
}

impl ReduceTracker {
    pub fn new(algorithm: &'static str, rank: usize, is_root: bool) -> Self {
        Self {
            algorithm,
            rank,
            is_root,
            state: ReduceState::Idle,
            history: vec![ReduceState::Idle],
        }
    }

    pub fn state(&self) -> ReduceState {
        self.state
    }

    pub fn history(&self) -> &[ReduceState] {
        &self.history
    }

    pub fn advance(&mut self, next: ReduceState) -> SpmdResult<()> {
        use ReduceState::*;
        let legal = matches!(
            (self.state, next, self.is_root),
            (Idle, LocalComputeInProgress, _)
                | (LocalComputeInProgress, AwaitingExchange, _)
                | (AwaitingExchange, Done, false)
                | (AwaitingExchange, Merging, true)
                | (Merging, Finalizing, true)
                | (Finalizing, Done, true)
        );
        if !legal {
            return Err(SpmdError::Invalid(format!(
                "{} on rank {}: illegal transition {} -> {}",
                self.algorithm, self.rank, self.state, next
            )));
        }
        crate::rank_debug!(self.rank, "{}: {} -> {}", self.algorithm, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Move every rank's encoded partial to the root.
///
/// Returns the buffers in rank order on the root and `None` elsewhere.
pub fn exchange_partials(
    ctx: &TrainingContext,
    mode: ExchangeMode,
    blob: &[u8],
) -> SpmdResult<Option<Vec<Vec<u8>>>> {
    let comm = ctx.communicator();
    let gathered = match mode {
        ExchangeMode::FixedGather => comm.gather(blob, ctx.root())?,
        ExchangeMode::AllGatherV => {
            let lengths = comm.allgather_fixed(&(blob.len() as u64).to_le_bytes())?;
            let counts = lengths
                .iter()
                .map(|b| {
                    let mut len = [0u8; 8];
                    if b.len() != len.len() {
                        return Err(SpmdError::SizeMismatch(format!(
                            "length exchange delivered {} bytes",
                            b.len()
                        )));
                    }
                    len.copy_from_slice(b);
                    Ok(u64::from_le_bytes(len) as usize)
                })
                .collect::<SpmdResult<Vec<usize>>>()?;
            comm.allgatherv(blob, &counts)?
        }
    };
    Ok(if ctx.is_root() { Some(gathered) } else { None })
}

/// Decode gathered envelopes, checking each arrived in its owner's slot
pub fn decode_all<P: DeserializeOwned>(gathered: &[Vec<u8>]) -> SpmdResult<Vec<RankedPartial<P>>> {
    gathered
        .iter()
        .enumerate()
        .map(|(rank, bytes)| decode_partial(bytes, rank))
        .collect()
}

/// Run `algo` across every rank of `ctx`.
///
/// Returns `Some(output)` on the root and `None` on every other rank.
pub fn distributed_reduce<A: ReduceAlgorithm>(
    ctx: &TrainingContext,
    algo: &A,
    input: &A::Input,
) -> SpmdResult<Option<A::Output>> {
    let rank = ctx.rank();
    let mut tracker = ReduceTracker::new(algo.name(), rank, ctx.is_root());
    let mut watch = Stopwatch::start();

    tracker.advance(ReduceState::LocalComputeInProgress)?;
    let partial = ctx.run_local(|| algo.compute_local_partial(input))?;
    let blob = encode_partial(rank, &partial)?;
    let local_secs = watch.lap();

    tracker.advance(ReduceState::AwaitingExchange)?;
    let gathered = exchange_partials(ctx, algo.exchange_mode(), &blob)?;
    let exchange_secs = watch.lap();

    let gathered = match gathered {
        Some(g) => g,
        None => {
            tracker.advance(ReduceState::Done)?;
            report(ctx, algo.name(), local_secs, exchange_secs, None);
            return Ok(None);
        }
    };

    tracker.advance(ReduceState::Merging)?;
    let partials = decode_all::<A::Partial>(&gathered)?;
    crate::rank_debug!(
        rank,
        "{} merging {} partials ({:?})",
        algo.name(),
        partials.len(),
        algo.merge_order()
    );
    let merged = algo.merge(partials)?;

    tracker.advance(ReduceState::Finalizing)?;
    let output = algo.finalize(merged)?;
    tracker.advance(ReduceState::Done)?;

    report(ctx, algo.name(), local_secs, exchange_secs, Some(watch.elapsed_secs()));
    Ok(Some(output))
}

/// Non-distributed path: one partial, merged and finalized in place
pub fn local_reduce<A: ReduceAlgorithm>(algo: &A, input: &A::Input) -> SpmdResult<A::Output> {
    let partial = algo.compute_local_partial(input)?;
    let merged = algo.merge(vec![RankedPartial::new(0, partial)])?;
    algo.finalize(merged)
}

fn report(
    ctx: &TrainingContext,
    name: &str,
    local_secs: f64,
    exchange_secs: f64,
    merge_secs: Option<f64>,
) {
    let rank = ctx.rank();
    crate::rank_info!(rank, "{} local compute took {:.6}s", name, local_secs);
    crate::rank_info!(rank, "{} exchange took {:.6}s", name, exchange_secs);
    ctx.record_timing(&format!("{} local compute {:.6}s", name, local_secs));
    ctx.record_timing(&format!("{} exchange {:.6}s", name, exchange_secs));
    if let Some(secs) = merge_secs {
        crate::rank_info!(rank, "{} merge and finalize took {:.6}s", name, secs);
        ctx.record_timing(&format!("{} merge and finalize {:.6}s", name, secs));
    }
}
