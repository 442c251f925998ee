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

//! In-process communicator group
//!
//! [`ThreadGroup::create`] hands out one [`ThreadCommunicator`] per rank. Each
//! rank is driven from its own OS thread; collectives rendezvous through a
//! table of rounds keyed by sequence number, guarded by one mutex and condvar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{poisoned, SpmdError, SpmdResult};

use super::{check_counts, check_root, check_uniform, CollectiveOp, CommType, Communicator};

struct Round {
    op: CollectiveOp,
    root: usize,
    contributions: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
    mismatch: Option<String>,
}

impl Round {
    fn new(op: CollectiveOp, root: usize, world_size: usize) -> Self {
        Self {
            op,
            root,
            contributions: vec![None; world_size],
            arrived: 0,
            departed: 0,
            mismatch: None,
        }
    }
}

struct Shared {
    world_size: usize,
    rounds: Mutex<HashMap<u64, Round>>,
    arrivals: Condvar,
}

/// Factory for a group of in-process ranks
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create `world_size` communicators sharing one rendezvous table.
    ///
    /// The returned vector is indexed by rank.
    pub fn create(
        world_size: usize,
        timeout: Option<Duration>,
    ) -> SpmdResult<Vec<ThreadCommunicator>> {
        if world_size == 0 {
            return Err(SpmdError::Invalid("world size must be at least 1".to_string()));
        }
        let shared = Arc::new(Shared {
            world_size,
            rounds: Mutex::new(HashMap::new()),
            arrivals: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadCommunicator {
                rank,
                shared: shared.clone(),
                seq: AtomicU64::new(0),
                timeout,
            })
            .collect())
    }
}

pub struct ThreadCommunicator {
    rank: usize,
    shared: Arc<Shared>,
    seq: AtomicU64,
    timeout: Option<Duration>,
}

impl ThreadCommunicator {
    fn lock(&self) -> SpmdResult<MutexGuard<'_, HashMap<u64, Round>>> {
        self.shared.rounds.lock().map_err(|_| poisoned("collective round"))
    }

    /// Contribute `data` to the next round and wait for every rank's share
    fn exchange(&self, op: CollectiveOp, root: usize, data: &[u8]) -> SpmdResult<Vec<Vec<u8>>> {
        let n = self.shared.world_size;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let mut rounds = self.lock()?;
        {
            let round = rounds.entry(seq).or_insert_with(|| Round::new(op, root, n));
            if round.op != op || round.root != root {
                round.mismatch = Some(format!(
                    "seq {}: rank {} issued {} (root {}) but peers issued {} (root {})",
                    seq, self.rank, op, root, round.op, round.root
                ));
            }
            round.contributions[self.rank] = Some(data.to_vec());
            round.arrived += 1;
        }
        self.shared.arrivals.notify_all();

        let pending = |rounds: &mut HashMap<u64, Round>| {
            rounds.get(&seq).map(|r| r.arrived < n).unwrap_or(false)
        };

        let mut rounds = match self.timeout {
            None => self
                .shared
                .arrivals
                .wait_while(rounds, pending)
                .map_err(|_| poisoned("collective round"))?,
            Some(limit) => {
                let (mut guard, result) = self
                    .shared
                    .arrivals
                    .wait_timeout_while(rounds, limit, pending)
                    .map_err(|_| poisoned("collective round"))?;
                if result.timed_out() {
                    // withdraw so a late peer cannot complete a round nobody reads
                    if let Some(round) = guard.get_mut(&seq) {
                        round.arrived -= 1;
                        round.contributions[self.rank] = None;
                        if round.arrived == 0 {
                            guard.remove(&seq);
                        }
                    }
                    crate::rank_warn!(self.rank, "{} seq {} timed out waiting for peers", op, seq);
                    return Err(SpmdError::timeout(op.name(), seq, started.elapsed()));
                }
                guard
            }
        };

        let round = rounds
            .get_mut(&seq)
            .ok_or_else(|| SpmdError::Invalid(format!("round {} vanished", seq)))?;
        let mismatch = round.mismatch.clone();
        let all: Vec<Vec<u8>> = round
            .contributions
            .iter()
            .map(|c| c.clone().unwrap_or_default())
            .collect();
        round.departed += 1;
        if round.departed == n {
            rounds.remove(&seq);
        }
        drop(rounds);

        if let Some(msg) = mismatch {
            return Err(SpmdError::CollectiveMismatch(msg));
        }
        log::trace!("rank {}: {} seq {} complete", self.rank, op, seq);
        Ok(all)
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn comm_type(&self) -> CommType {
        CommType::Thread
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn barrier(&self) -> SpmdResult<()> {
        self.exchange(CollectiveOp::Barrier, 0, &[]).map(|_| ())
    }

    fn gather(&self, data: &[u8], root: usize) -> SpmdResult<Vec<Vec<u8>>> {
        check_root(root, self.world_size())?;
        let all = self.exchange(CollectiveOp::Gather, root, data)?;
        check_uniform(&all)?;
        if self.rank == root {
            Ok(all)
        } else {
            Ok(Vec::new())
        }
    }

    fn allgatherv(&self, data: &[u8], recv_counts: &[usize]) -> SpmdResult<Vec<Vec<u8>>> {
        let all = self.exchange(CollectiveOp::AllGatherV, 0, data)?;
        check_counts(&all, recv_counts)?;
        Ok(all)
    }

    fn broadcast(&self, data: &mut Vec<u8>, root: usize) -> SpmdResult<()> {
        check_root(root, self.world_size())?;
        let send: &[u8] = if self.rank == root { data.as_slice() } else { &[] };
        let mut all = self.exchange(CollectiveOp::Broadcast, root, send)?;
        if self.rank != root {
            *data = std::mem::take(&mut all[root]);
        }
        Ok(())
    }
}
