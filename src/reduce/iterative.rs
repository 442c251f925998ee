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

//! Iterative reduction
//!
//! Repeats the reduction until the model stops moving or the round budget is
//! spent. Each round issues the same four collectives on every rank, in this
//! order: model broadcast, length allgather, partial allgatherv, converged
//! flag broadcast. The root alone decides convergence, so every rank leaves
//! the loop after the same round.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ctx::TrainingContext;
use crate::error::{SpmdError, SpmdResult};
use crate::net::communicator::broadcast_value;
use crate::net::serialize::{encode_partial, RankedPartial};
use crate::util::timing::Stopwatch;

use super::{decode_all, exchange_partials, ExchangeMode};

pub trait IterativeAlgorithm: Sync {
    type Input: ?Sized + Sync;
    type Model: Serialize + DeserializeOwned + Clone + Sync;
    type Partial: Serialize + DeserializeOwned + Send;

    fn name(&self) -> &'static str;

    /// A round converges when its displacement is at most `tolerance²`
    fn tolerance(&self) -> f64;

    fn compute_local_partial(
        &self,
        input: &Self::Input,
        model: &Self::Model,
    ) -> SpmdResult<Self::Partial>;

    /// Produce the next model and the cost measured against `model`.
    ///
    /// Partials arrive in rank order.
    fn merge(
        &self,
        model: &Self::Model,
        partials: Vec<RankedPartial<Self::Partial>>,
    ) -> SpmdResult<(Self::Model, f64)>;

    /// Squared movement between two successive models
    fn displacement(&self, old: &Self::Model, new: &Self::Model) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome<M> {
    pub model: M,
    pub iterations: usize,
    pub converged: bool,
    /// Cost reported by the last merge; 0 when no round ran
    pub cost: f64,
    /// Displacement of every round, in order
    pub displacement_history: Vec<f64>,
}

/// Run rounds while `iterations < max_iterations` and not converged.
///
/// Only the root's `initial_model` matters; it is broadcast before the first
/// round. Returns the outcome on the root and `None` elsewhere.
pub fn run_iterative<A: IterativeAlgorithm>(
    ctx: &TrainingContext,
    algo: &A,
    input: &A::Input,
    initial_model: &A::Model,
    max_iterations: usize,
) -> SpmdResult<Option<IterationOutcome<A::Model>>> {
    let tolerance = algo.tolerance();
    if tolerance.is_nan() || tolerance < 0.0 {
        return Err(SpmdError::Invalid(format!(
            "{}: tolerance must be non-negative, got {}",
            algo.name(),
            tolerance
        )));
    }
    let threshold = tolerance * tolerance;

    let comm = ctx.communicator();
    let rank = ctx.rank();
    let root = ctx.root();

    let mut model = initial_model.clone();
    let mut iterations = 0;
    let mut converged = false;
    let mut cost = 0.0;
    let mut history = Vec::new();
    let watch = Stopwatch::start();

    while iterations < max_iterations && !converged {
        model = broadcast_value(comm.as_ref(), &model, root)?;

        let partial = ctx.run_local(|| algo.compute_local_partial(input, &model))?;
        let blob = encode_partial(rank, &partial)?;
        let gathered = exchange_partials(ctx, ExchangeMode::AllGatherV, &blob)?;

        let mut flag = vec![0u8];
        if let Some(gathered) = gathered {
            let partials = decode_all::<A::Partial>(&gathered)?;
            let (next, round_cost) = algo.merge(&model, partials)?;
            let displacement = algo.displacement(&model, &next);
            log::debug!(
                "rank {}: {} round {} displacement {:e} cost {:e}",
                rank,
                algo.name(),
                iterations + 1,
                displacement,
                round_cost
            );
            history.push(displacement);
            cost = round_cost;
            model = next;
            flag[0] = u8::from(displacement <= threshold);
        }

        comm.broadcast(&mut flag, root)?;
        converged = flag.first() == Some(&1);
        iterations += 1;
    }

    let secs = watch.elapsed_secs();
    crate::rank_info!(
        rank,
        "{} ran {} rounds in {:.6}s (converged: {})",
        algo.name(),
        iterations,
        secs,
        converged
    );
    ctx.record_timing(&format!(
        "{} {} rounds {:.6}s converged={}",
        algo.name(),
        iterations,
        secs,
        converged
    ));

    if !ctx.is_root() {
        return Ok(None);
    }
    Ok(Some(IterationOutcome {
        model,
        iterations,
        converged,
        cost,
        displacement_history: history,
    }))
}
