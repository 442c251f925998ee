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

//! Communication configuration

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TrainingConfig;
use crate::device::{DeviceAssignment, MemoryAccess};
use crate::error::SpmdResult;

use super::rendezvous::{FileRendezvous, DEFAULT_PORT_START};
use super::{CommType, Communicator, LocalCommunicator, TcpCommunicator};

/// Recipe for building a communicator
pub trait CommConfig: Send + Sync {
    fn comm_type(&self) -> CommType;
    fn create_communicator(&self) -> SpmdResult<Arc<dyn Communicator>>;

    /// Build the communicator for one training invocation; transports that
    /// can honor them take timeouts from `config` and buffer placement from
    /// `device`
    fn create_for_training(
        &self,
        _config: &TrainingConfig,
        _device: &DeviceAssignment,
    ) -> SpmdResult<Arc<dyn Communicator>> {
        self.create_communicator()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConfig;

impl CommConfig for LocalConfig {
    fn comm_type(&self) -> CommType {
        CommType::Local
    }

    fn create_communicator(&self) -> SpmdResult<Arc<dyn Communicator>> {
        Ok(Arc::new(LocalCommunicator::new()))
    }
}

/// Settings for a [`TcpCommunicator`] group
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub world_size: usize,
    pub rank: usize,
    pub rendezvous: FileRendezvous,
    /// Address rank 0 listens on and publishes; must be reachable by peers
    pub bind_ip: IpAddr,
    pub port_start: u16,
    pub collective_timeout: Option<Duration>,
    pub rendezvous_timeout: Duration,
    pub memory_access: MemoryAccess,
}

impl TcpConfig {
    pub fn new(world_size: usize, rank: usize, rendezvous: FileRendezvous) -> Self {
        let defaults = TrainingConfig::default();
        Self {
            world_size,
            rank,
            rendezvous,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_start: DEFAULT_PORT_START,
            collective_timeout: defaults.collective_timeout,
            rendezvous_timeout: defaults.rendezvous_timeout,
            memory_access: MemoryAccess::Host,
        }
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_port_start(mut self, port: u16) -> Self {
        self.port_start = port;
        self
    }

    pub fn with_memory_access(mut self, access: MemoryAccess) -> Self {
        self.memory_access = access;
        self
    }

    /// Take both timeouts from a training configuration
    pub fn with_timeouts_from(mut self, config: &TrainingConfig) -> Self {
        self.collective_timeout = config.collective_timeout;
        self.rendezvous_timeout = config.rendezvous_timeout;
        self
    }
}

impl CommConfig for TcpConfig {
    fn comm_type(&self) -> CommType {
        CommType::Tcp
    }

    fn create_communicator(&self) -> SpmdResult<Arc<dyn Communicator>> {
        Ok(Arc::new(TcpCommunicator::connect(self)?))
    }

    fn create_for_training(
        &self,
        config: &TrainingConfig,
        device: &DeviceAssignment,
    ) -> SpmdResult<Arc<dyn Communicator>> {
        let tuned = self
            .clone()
            .with_timeouts_from(config)
            .with_memory_access(device.memory_access);
        Ok(Arc::new(TcpCommunicator::connect(&tuned)?))
    }
}
