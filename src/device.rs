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

//! Compute device selection
//!
//! Resolves a requested [`ComputeDevice`] into a concrete assignment: which
//! memory the communicator moves buffers through and, for GPUs, which device
//! index this rank owns.

use serde::{Deserialize, Serialize};

use crate::config::ComputeDevice;
use crate::error::{SpmdError, SpmdResult};

/// Environment variable that pins a rank to one GPU on multi-GPU hosts
pub const AFFINITY_MASK_ENV: &str = "ZE_AFFINITY_MASK";

/// Where collective buffers live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MemoryAccess {
    #[default]
    Host,
    Device,
}

/// Source of truth for how many accelerators a host exposes
pub trait DeviceInventory: Send + Sync {
    fn gpu_count(&self) -> usize;
}

/// Inventory for hosts without accelerator support
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOnlyInventory;

impl DeviceInventory for HostOnlyInventory {
    fn gpu_count(&self) -> usize {
        0
    }
}

/// Inventory with a caller-supplied GPU count
#[derive(Debug, Clone, Copy)]
pub struct FixedInventory(pub usize);

impl DeviceInventory for FixedInventory {
    fn gpu_count(&self) -> usize {
        self.0
    }
}

/// Result of device selection for one rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub device: ComputeDevice,
    pub gpu_index: Option<usize>,
    pub memory_access: MemoryAccess,
}

impl DeviceAssignment {
    pub fn host() -> Self {
        Self {
            device: ComputeDevice::Host,
            gpu_index: None,
            memory_access: MemoryAccess::Host,
        }
    }
}

impl Default for DeviceAssignment {
    fn default() -> Self {
        Self::host()
    }
}

/// Pick the device this rank trains on.
///
/// With several GPUs visible the affinity mask decides; without it the
/// choice would be ambiguous, so selection fails instead of guessing.
pub fn select_device(
    device: ComputeDevice,
    inventory: &dyn DeviceInventory,
    affinity_mask: Option<&str>,
) -> SpmdResult<DeviceAssignment> {
    match device {
        ComputeDevice::Host | ComputeDevice::Cpu => Ok(DeviceAssignment {
            device,
            gpu_index: None,
            memory_access: MemoryAccess::Host,
        }),
        ComputeDevice::Gpu => {
            let count = inventory.gpu_count();
            let index = match count {
                0 => {
                    return Err(SpmdError::Device(format!("Invalid GPU count {}", count)));
                }
                1 => 0,
                _ => {
                    let mask = affinity_mask.ok_or_else(|| {
                        SpmdError::Device(format!(
                            "{} GPUs visible but {} is not set",
                            count, AFFINITY_MASK_ENV
                        ))
                    })?;
                    let idx = mask.trim().parse::<usize>().map_err(|_| {
                        SpmdError::Device(format!(
                            "{} '{}' is not a device index",
                            AFFINITY_MASK_ENV, mask
                        ))
                    })?;
                    if idx >= count {
                        return Err(SpmdError::Device(format!(
                            "{} selects GPU {} but only {} are visible",
                            AFFINITY_MASK_ENV, idx, count
                        )));
                    }
                    idx
                }
            };
            log::info!("selected GPU {} of {}", index, count);
            Ok(DeviceAssignment {
                device,
                gpu_index: Some(index),
                memory_access: MemoryAccess::Device,
            })
        }
    }
}

/// [`select_device`] reading the affinity mask from the environment
pub fn select_device_from_env(
    device: ComputeDevice,
    inventory: &dyn DeviceInventory,
) -> SpmdResult<DeviceAssignment> {
    let mask = std::env::var(AFFINITY_MASK_ENV).ok();
    select_device(device, inventory, mask.as_deref())
}
