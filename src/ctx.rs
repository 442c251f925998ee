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

//! Training context
//!
//! A [`TrainingContext`] is created for one training invocation and passed by
//! reference through every step of it. It owns the communicator, the resolved
//! configuration and device, the local thread pool and the timing log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::TrainingConfig;
use crate::device::{select_device_from_env, DeviceAssignment, HostOnlyInventory};
use crate::error::{poisoned, Code, SpmdError, SpmdResult};
use crate::net::{CommConfig, CommType, Communicator, LocalCommunicator};
use crate::util::timing::BreakdownLog;

pub struct TrainingContext {
    config: TrainingConfig,
    settings: RwLock<HashMap<String, String>>,
    communicator: Arc<dyn Communicator>,
    device: DeviceAssignment,
    /// Bounds local kernels to `executor_cores` threads
    pool: ThreadPool,
    breakdown: BreakdownLog,
    sequence_no: AtomicU64,
}

impl TrainingContext {
    /// Single-rank context
    pub fn init_local(config: TrainingConfig) -> SpmdResult<Arc<Self>> {
        Self::with_communicator(Arc::new(LocalCommunicator::new()), config)
    }

    /// Context over an already constructed communicator
    pub fn with_communicator(
        communicator: Arc<dyn Communicator>,
        config: TrainingConfig,
    ) -> SpmdResult<Arc<Self>> {
        let device = select_device_from_env(config.compute_device, &HostOnlyInventory)?;
        Self::with_device(communicator, config, device)
    }

    /// Context with an explicit device assignment
    pub fn with_device(
        communicator: Arc<dyn Communicator>,
        config: TrainingConfig,
        device: DeviceAssignment,
    ) -> SpmdResult<Arc<Self>> {
        let world_size = communicator.world_size();
        if config.root_rank >= world_size {
            return Err(SpmdError::Invalid(format!(
                "root rank {} outside world of size {}",
                config.root_rank, world_size
            )));
        }

        let rank = communicator.rank();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.executor_cores.max(1))
            .thread_name(move |i| format!("spmd-r{}-w{}", rank, i))
            .build()
            .map_err(|e| {
                SpmdError::new(
                    Code::ExecutionError,
                    format!("failed to create local thread pool: {}", e),
                )
            })?;

        let breakdown = BreakdownLog::new(config.breakdown_dir.as_deref());
        log::debug!(
            "rank {}/{}: context over {} communicator, device {}, {} local threads",
            rank,
            world_size,
            communicator.comm_type(),
            device.device,
            pool.current_num_threads()
        );
        if communicator.memory_access() != device.memory_access {
            crate::rank_debug!(
                rank,
                "device wants {:?} buffers, communicator stages through {:?}",
                device.memory_access,
                communicator.memory_access()
            );
        }

        Ok(Arc::new(Self {
            config,
            settings: RwLock::new(HashMap::new()),
            communicator,
            device,
            pool,
            breakdown,
            sequence_no: AtomicU64::new(0),
        }))
    }

    /// Build the communicator described by `comm_config`, then the context.
    ///
    /// The communicator takes its timeouts from `config` and its buffer
    /// placement from the selected device.
    pub fn init_distributed(
        comm_config: &dyn CommConfig,
        config: TrainingConfig,
    ) -> SpmdResult<Arc<Self>> {
        if comm_config.comm_type() == CommType::Local {
            return Err(SpmdError::Invalid(
                "init_distributed called with a local configuration".to_string(),
            ));
        }
        let device = select_device_from_env(config.compute_device, &HostOnlyInventory)?;
        let communicator = comm_config.create_for_training(&config, &device)?;
        Self::with_device(communicator, config, device)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn add_config(&self, key: impl Into<String>, value: impl Into<String>) -> SpmdResult<()> {
        let mut settings = self.settings.write().map_err(|_| poisoned("context config"))?;
        settings.insert(key.into(), value.into());
        Ok(())
    }

    pub fn get_config(&self, key: &str, default: &str) -> SpmdResult<String> {
        let settings = self.settings.read().map_err(|_| poisoned("context config"))?;
        Ok(settings
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.communicator
    }

    pub fn device(&self) -> &DeviceAssignment {
        &self.device
    }

    /// Run `op` on the local thread pool; rayon work inside it is bounded by
    /// `executor_cores`
    pub fn run_local<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    pub fn local_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn breakdown(&self) -> &BreakdownLog {
        &self.breakdown
    }

    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn world_size(&self) -> usize {
        self.communicator.world_size()
    }

    pub fn root(&self) -> usize {
        self.config.root_rank
    }

    pub fn is_root(&self) -> bool {
        self.rank() == self.config.root_rank
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    pub fn comm_type(&self) -> CommType {
        self.communicator.comm_type()
    }

    pub fn get_neighbours(&self, include_self: bool) -> Vec<usize> {
        let rank = self.rank();
        (0..self.world_size())
            .filter(|i| include_self || *i != rank)
            .collect()
    }

    /// Monotonic per-context counter, starting at 1
    pub fn get_next_sequence(&self) -> u64 {
        self.sequence_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn barrier(&self) -> SpmdResult<()> {
        self.communicator.barrier()
    }

    /// Append a timing record; failures to write are logged, not raised
    pub fn record_timing(&self, message: &str) {
        if let Err(e) = self.breakdown.record(self.rank(), message) {
            log::warn!("rank {}: could not write timing log: {}", self.rank(), e);
        }
    }
}
