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

//! Training configuration
//!
//! A [`TrainingConfig`] is built once per training invocation and carried by the
//! [`crate::ctx::TrainingContext`]. Values can come from code (builder methods),
//! from a JSON file, or from environment variables via [`TrainingConfig::from_env`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SpmdError, SpmdResult};

pub const ENV_ROOT_RANK: &str = "SPMD_ROOT_RANK";
pub const ENV_COLLECTIVE_TIMEOUT_MS: &str = "SPMD_COLLECTIVE_TIMEOUT_MS";
pub const ENV_RENDEZVOUS_TIMEOUT_MS: &str = "SPMD_RENDEZVOUS_TIMEOUT_MS";
pub const ENV_COMPUTE_DEVICE: &str = "SPMD_COMPUTE_DEVICE";
pub const ENV_EXECUTOR_CORES: &str = "SPMD_EXECUTOR_CORES";
pub const ENV_BREAKDOWN_DIR: &str = "SPARKJOB_CONFIG_DIR";

const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(120);

/// Device a training call runs on.
///
/// Ordinals are part of the handle boundary and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ComputeDevice {
    #[default]
    Host,
    Cpu,
    Gpu,
}

impl ComputeDevice {
    pub fn from_ordinal(ordinal: i32) -> SpmdResult<Self> {
        match ordinal {
            0 => Ok(ComputeDevice::Host),
            1 => Ok(ComputeDevice::Cpu),
            2 => Ok(ComputeDevice::Gpu),
            other => Err(SpmdError::Device(format!(
                "invalid compute device ordinal {}",
                other
            ))),
        }
    }

    pub fn from_name(name: &str) -> SpmdResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "HOST" => Ok(ComputeDevice::Host),
            "CPU" => Ok(ComputeDevice::Cpu),
            "GPU" => Ok(ComputeDevice::Gpu),
            _ => Err(SpmdError::Device(format!("unknown compute device '{}'", name))),
        }
    }

    pub fn ordinal(&self) -> i32 {
        match self {
            ComputeDevice::Host => 0,
            ComputeDevice::Cpu => 1,
            ComputeDevice::Gpu => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ComputeDevice::Host => "HOST",
            ComputeDevice::Cpu => "CPU",
            ComputeDevice::Gpu => "GPU",
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-invocation training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Rank that merges and finalizes partial results
    pub root_rank: usize,
    /// Upper bound on any single collective wait; `None` waits forever
    pub collective_timeout: Option<Duration>,
    /// Upper bound on coordinator-address discovery
    pub rendezvous_timeout: Duration,
    pub compute_device: ComputeDevice,
    /// Threads a local kernel may use on this rank
    pub executor_cores: usize,
    /// Directory receiving the `training_breakdown` timing log
    pub breakdown_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            root_rank: 0,
            collective_timeout: Some(DEFAULT_COLLECTIVE_TIMEOUT),
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            compute_device: ComputeDevice::Host,
            executor_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            breakdown_dir: None,
        }
    }
}

impl TrainingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root_rank(mut self, root: usize) -> Self {
        self.root_rank = root;
        self
    }

    pub fn with_collective_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.collective_timeout = timeout;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub fn with_compute_device(mut self, device: ComputeDevice) -> Self {
        self.compute_device = device;
        self
    }

    pub fn with_executor_cores(mut self, cores: usize) -> Self {
        self.executor_cores = cores.max(1);
        self
    }

    pub fn with_breakdown_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.breakdown_dir = Some(dir.into());
        self
    }

    /// Defaults overlaid with whatever the process environment sets
    pub fn from_env() -> SpmdResult<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary key lookup.
    ///
    /// Separated from [`TrainingConfig::from_env`] so callers can feed a
    /// map instead of mutating the process environment.
    pub fn overlay<F>(mut self, lookup: F) -> SpmdResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_ROOT_RANK) {
            self.root_rank = parse_number(ENV_ROOT_RANK, &v)?;
        }
        if let Some(v) = lookup(ENV_COLLECTIVE_TIMEOUT_MS) {
            let ms: u64 = parse_number(ENV_COLLECTIVE_TIMEOUT_MS, &v)?;
            self.collective_timeout = if ms == 0 {
                None
            } else {
                Some(Duration::from_millis(ms))
            };
        }
        if let Some(v) = lookup(ENV_RENDEZVOUS_TIMEOUT_MS) {
            let ms: u64 = parse_number(ENV_RENDEZVOUS_TIMEOUT_MS, &v)?;
            self.rendezvous_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup(ENV_COMPUTE_DEVICE) {
            self.compute_device = match v.trim().parse::<i32>() {
                Ok(ordinal) => ComputeDevice::from_ordinal(ordinal)?,
                Err(_) => ComputeDevice::from_name(&v)?,
            };
        }
        if let Some(v) = lookup(ENV_EXECUTOR_CORES) {
            let cores: usize = parse_number(ENV_EXECUTOR_CORES, &v)?;
            self.executor_cores = cores.max(1);
        }
        if let Some(v) = lookup(ENV_BREAKDOWN_DIR) {
            if !v.trim().is_empty() {
                self.breakdown_dir = Some(PathBuf::from(v));
            }
        }
        Ok(self)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SpmdResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn to_json(&self) -> SpmdResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SpmdResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SpmdError::Invalid(format!("{} has non-numeric value '{}'", key, value)))
}
