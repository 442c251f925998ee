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

//! Tests for the rank-coordinated reduction protocol

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mllib_spmd::algorithms::ColumnMean;
use mllib_spmd::config::TrainingConfig;
use mllib_spmd::ctx::TrainingContext;
use mllib_spmd::error::{Code, SpmdResult};
use mllib_spmd::net::serialize::{encode_partial, RankedPartial};
use mllib_spmd::net::ThreadGroup;
use mllib_spmd::reduce::{
    decode_all, distributed_reduce, local_reduce, ExchangeMode, MergeOrder, ReduceAlgorithm,
    ReduceState, ReduceTracker,
};
use mllib_spmd::table::NumericTable;

/// Run `f` on `world_size` in-process ranks and collect the results by rank
fn run_ranks<T, F>(world_size: usize, config: TrainingConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Arc<TrainingContext>) -> T + Sync,
{
    mllib_spmd::util::init_logging();
    let comms = ThreadGroup::create(world_size, Some(Duration::from_secs(10))).unwrap();
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                let config = config.clone();
                s.spawn(move || {
                    let ctx = TrainingContext::with_communicator(Arc::new(comm), config).unwrap();
                    f(ctx)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Column table of `lo..=hi`
fn range_table(lo: u32, hi: u32) -> NumericTable {
    NumericTable::from_columns(vec![(lo..=hi).map(f64::from).collect()]).unwrap()
}

/// Concatenates each rank's values; checks partials arrive in rank order
struct Concat {
    mode: ExchangeMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Values(Vec<u64>);

impl ReduceAlgorithm for Concat {
    type Input = Vec<u64>;
    type Partial = Values;
    type Merged = Vec<u64>;
    type Output = Vec<u64>;

    fn name(&self) -> &'static str {
        "concat"
    }

    fn compute_local_partial(&self, input: &Vec<u64>) -> SpmdResult<Values> {
        Ok(Values(input.clone()))
    }

    fn merge(&self, partials: Vec<RankedPartial<Values>>) -> SpmdResult<Vec<u64>> {
        for (i, p) in partials.iter().enumerate() {
            assert_eq!(p.rank, i, "partials must arrive in rank order");
        }
        Ok(partials.into_iter().flat_map(|p| p.partial.0).collect())
    }

    fn finalize(&self, merged: Vec<u64>) -> SpmdResult<Vec<u64>> {
        Ok(merged)
    }

    fn merge_order(&self) -> MergeOrder {
        MergeOrder::RankOrdered
    }

    fn exchange_mode(&self) -> ExchangeMode {
        self.mode
    }
}

mod distributed_reduce_tests {
    use super::*;

    #[test]
    fn test_mean_over_four_ranks() {
        let results = run_ranks(4, TrainingConfig::default(), |ctx| {
            let lo = ctx.rank() as u32 * 10 + 1;
            distributed_reduce(&ctx, &ColumnMean, &range_table(lo, lo + 9)).unwrap()
        });

        assert_eq!(results[0], Some(vec![20.5]));
        for r in &results[1..] {
            assert!(r.is_none());
        }
        println!("✓ Mean of 1..=40 over 4 ranks is 20.5");
    }

    #[test]
    fn test_non_zero_root_receives_result() {
        let config = TrainingConfig::default().with_root_rank(2);
        let results = run_ranks(3, config, |ctx| {
            distributed_reduce(&ctx, &ColumnMean, &range_table(1, 4)).unwrap()
        });
        assert!(results[0].is_none());
        assert!(results[1].is_none());
        assert_eq!(results[2], Some(vec![2.5]));
    }

    #[test]
    fn test_single_rank_matches_local_reduce() {
        let table = range_table(3, 17);
        let ctx = TrainingContext::init_local(TrainingConfig::default()).unwrap();

        let distributed = distributed_reduce(&ctx, &ColumnMean, &table).unwrap();
        let local = local_reduce(&ColumnMean, &table).unwrap();
        assert_eq!(distributed, Some(local));
    }

    #[test]
    fn test_rank_ordered_variable_partials() {
        let results = run_ranks(4, TrainingConfig::default(), |ctx| {
            let values: Vec<u64> = (0..=ctx.rank() as u64).collect();
            let algo = Concat {
                mode: ExchangeMode::AllGatherV,
            };
            distributed_reduce(&ctx, &algo, &values).unwrap()
        });
        assert_eq!(results[0], Some(vec![0, 0, 1, 0, 1, 2, 0, 1, 2, 3]));
        println!("✓ Variable-size partials merged in rank order");
    }

    #[test]
    fn test_fixed_gather_rejects_uneven_partials() {
        let results = run_ranks(3, TrainingConfig::default(), |ctx| {
            let values: Vec<u64> = vec![7; ctx.rank() + 1];
            let algo = Concat {
                mode: ExchangeMode::FixedGather,
            };
            distributed_reduce(&ctx, &algo, &values)
        });
        for r in results {
            assert_eq!(r.unwrap_err().code(), Code::CollectiveMismatch);
        }
    }

    #[test]
    fn test_local_failure_times_out_peers() {
        let config =
            TrainingConfig::default().with_collective_timeout(Some(Duration::from_millis(200)));
        let comms = ThreadGroup::create(2, Some(Duration::from_millis(200))).unwrap();
        let mut comms = comms.into_iter();
        let rank0 = comms.next().unwrap();
        let ctx = TrainingContext::with_communicator(Arc::new(rank0), config).unwrap();

        // rank 1 never computes its partial, so rank 0 waits out the timeout
        let err = distributed_reduce(&ctx, &ColumnMean, &range_table(1, 2)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_zero_rows_everywhere_is_invalid() {
        let results = run_ranks(2, TrainingConfig::default(), |ctx| {
            let empty = NumericTable::from_columns(vec![vec![]]).unwrap();
            distributed_reduce(&ctx, &ColumnMean, &empty)
        });
        assert_eq!(results[0].as_ref().unwrap_err().code(), Code::Invalid);
        assert!(results[1].as_ref().unwrap().is_none());
    }
}

mod merge_tests {
    use super::*;

    #[test]
    fn test_commutative_merge_ignores_order() {
        let partials: Vec<_> = (0..4u32)
            .map(|r| {
                let t = range_table(r * 10 + 1, r * 10 + 10);
                RankedPartial::new(r as usize, ColumnMean.compute_local_partial(&t).unwrap())
            })
            .collect();
        let mut reversed = partials.clone();
        reversed.reverse();

        let a = ColumnMean.finalize(ColumnMean.merge(partials).unwrap()).unwrap();
        let b = ColumnMean.finalize(ColumnMean.merge(reversed).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, vec![20.5]);
    }

    #[test]
    fn test_decode_all_checks_slots() {
        let good = vec![
            encode_partial(0, &Values(vec![1])).unwrap(),
            encode_partial(1, &Values(vec![2])).unwrap(),
        ];
        let decoded = decode_all::<Values>(&good).unwrap();
        assert_eq!(decoded[1].partial, Values(vec![2]));

        let swapped = vec![good[1].clone(), good[0].clone()];
        let err = decode_all::<Values>(&swapped).unwrap_err();
        assert_eq!(err.code(), Code::SerializationError);
    }

    #[test]
    fn test_mismatched_widths_rejected() {
        let partials = vec![
            RankedPartial::new(0, ColumnMean.compute_local_partial(&range_table(1, 3)).unwrap()),
            RankedPartial::new(
                1,
                ColumnMean
                    .compute_local_partial(
                        &NumericTable::from_rows(&[vec![1.0, 2.0]]).unwrap(),
                    )
                    .unwrap(),
            ),
        ];
        assert_eq!(ColumnMean.merge(partials).unwrap_err().code(), Code::Invalid);
    }
}

mod tracker_tests {
    use super::*;

    #[test]
    fn test_root_path() {
        let mut t = ReduceTracker::new("test", 0, true);
        for s in [
            ReduceState::LocalComputeInProgress,
            ReduceState::AwaitingExchange,
            ReduceState::Merging,
            ReduceState::Finalizing,
            ReduceState::Done,
        ] {
            t.advance(s).unwrap();
        }
        assert_eq!(t.state(), ReduceState::Done);
        assert_eq!(t.history().len(), 6);
    }

    #[test]
    fn test_worker_path() {
        let mut t = ReduceTracker::new("test", 1, false);
        t.advance(ReduceState::LocalComputeInProgress).unwrap();
        t.advance(ReduceState::AwaitingExchange).unwrap();
        assert!(t.advance(ReduceState::Merging).is_err());
        t.advance(ReduceState::Done).unwrap();
    }

    #[test]
    fn test_illegal_transitions() {
        let mut t = ReduceTracker::new("test", 0, true);
        assert!(t.advance(ReduceState::Merging).is_err());
        assert!(t.advance(ReduceState::Done).is_err());
        t.advance(ReduceState::LocalComputeInProgress).unwrap();
        t.advance(ReduceState::AwaitingExchange).unwrap();
        // the root may not skip merging
        let err = t.advance(ReduceState::Done).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
        assert_eq!(t.state(), ReduceState::AwaitingExchange);
    }
}
