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

//! Distributed training over TCP
//!
//! Each process is one rank. Rank 0 publishes its address into the shared
//! rendezvous directory; the others wait for it and connect. Every rank
//! generates its own shard of two well-separated blobs, then the group runs
//! summary statistics and k-means. Results are printed on rank 0 only.
//!
//! Usage:
//!   cargo run --example tcp_training -- <rendezvous_dir> <session_id> <rank> <world_size>

use std::env;
use std::process;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mllib_spmd::config::TrainingConfig;
use mllib_spmd::ctx::TrainingContext;
use mllib_spmd::error::SpmdResult;
use mllib_spmd::net::{FileRendezvous, TcpConfig};
use mllib_spmd::session::{row_vector, TrainingSession};
use mllib_spmd::table::NumericTable;
use mllib_spmd::util::init_logging;

const ROWS_PER_RANK: usize = 1000;

/// Deterministic points scattered around (0, 0) and (10, 10)
fn make_shard(rank: usize) -> SpmdResult<NumericTable> {
    let mut rng = StdRng::seed_from_u64(rank as u64 + 1);
    let rows: Vec<Vec<f64>> = (0..ROWS_PER_RANK)
        .map(|i| {
            let centre = if i % 2 == 0 { 0.0 } else { 10.0 };
            vec![
                centre + rng.gen_range(-0.5..0.5),
                centre + rng.gen_range(-0.5..0.5),
            ]
        })
        .collect();
    NumericTable::from_rows(&rows)
}

fn run(dir: &str, session_id: &str, rank: usize, world_size: usize) -> SpmdResult<()> {
    let config = TrainingConfig::from_env()?;
    let rendezvous = FileRendezvous::new(dir, session_id)?;
    let tcp = TcpConfig::new(world_size, rank, rendezvous);

    let ctx = TrainingContext::init_distributed(&tcp, config)?;
    let mut session = TrainingSession::new(ctx);

    let data = session.register_table(make_shard(rank)?);
    let initial = session.register_table(NumericTable::from_rows(&[
        vec![1.0, 1.0],
        vec![2.0, 2.0],
    ])?);

    if let Some(summary) = session.train_summarizer(data)? {
        println!("mean:     {:?}", row_vector(session.table(summary.mean)?)?);
        println!("variance: {:?}", row_vector(session.table(summary.variance)?)?);
    }

    if let Some(km) = session.train_kmeans(data, initial, 1e-4, 50)? {
        println!(
            "k-means finished after {} rounds, cost {:.4}",
            km.iteration_num, km.total_cost
        );
        println!("centroids:\n{}", session.table(km.centroids)?.to_array2());
    }

    session.context().barrier()
}

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!(
            "usage: {} <rendezvous_dir> <session_id> <rank> <world_size>",
            args[0]
        );
        process::exit(1);
    }
    let (rank, world_size) = match (args[3].parse(), args[4].parse()) {
        (Ok(r), Ok(w)) => (r, w),
        _ => {
            eprintln!("rank and world_size must be integers");
            process::exit(1);
        }
    };

    if let Err(e) = run(&args[1], &args[2], rank, world_size) {
        eprintln!("rank {}: training failed: {}", rank, e);
        process::exit(e.code() as i32);
    }
}
