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

//! Tests for TrainingContext, TrainingConfig and device selection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mllib_spmd::config::{ComputeDevice, TrainingConfig};
use mllib_spmd::ctx::TrainingContext;
use mllib_spmd::device::{
    select_device, DeviceAssignment, FixedInventory, HostOnlyInventory, MemoryAccess,
};
use mllib_spmd::error::Code;
use mllib_spmd::net::{
    CommConfig, CommType, Communicator, FileRendezvous, LocalConfig, TcpConfig, ThreadGroup,
};

// ============================================================================
// Context
// ============================================================================

mod context_tests {
    use super::*;

    #[test]
    fn test_local_context_init() {
        let ctx = TrainingContext::init_local(TrainingConfig::default()).unwrap();

        assert!(!ctx.is_distributed());
        assert!(ctx.is_root());
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        assert_eq!(ctx.comm_type(), CommType::Local);
        ctx.barrier().unwrap();

        println!("✓ Local TrainingContext initialized successfully");
    }

    #[test]
    fn test_context_config_map() {
        let ctx = TrainingContext::init_local(TrainingConfig::default()).unwrap();

        ctx.add_config("test_key", "test_value").unwrap();
        assert_eq!(ctx.get_config("test_key", "default").unwrap(), "test_value");
        assert_eq!(ctx.get_config("missing_key", "default").unwrap(), "default");

        println!("✓ TrainingContext config works correctly");
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let ctx = TrainingContext::init_local(TrainingConfig::default()).unwrap();
        assert_eq!(ctx.get_next_sequence(), 1);
        assert_eq!(ctx.get_next_sequence(), 2);
        assert_eq!(ctx.get_next_sequence(), 3);
    }

    #[test]
    fn test_neighbours() {
        let comms = ThreadGroup::create(4, Some(Duration::from_secs(5))).unwrap();
        let comm = comms.into_iter().nth(2).unwrap();
        let ctx = TrainingContext::with_communicator(Arc::new(comm), TrainingConfig::default())
            .unwrap();

        assert_eq!(ctx.rank(), 2);
        assert!(ctx.is_distributed());
        assert!(!ctx.is_root());
        assert_eq!(ctx.get_neighbours(true), vec![0, 1, 2, 3]);
        assert_eq!(ctx.get_neighbours(false), vec![0, 1, 3]);
    }

    #[test]
    fn test_root_outside_world_is_rejected() {
        let config = TrainingConfig::default().with_root_rank(1);
        let err = TrainingContext::init_local(config).err().unwrap();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_non_zero_root() {
        let comms = ThreadGroup::create(3, Some(Duration::from_secs(5))).unwrap();
        let config = TrainingConfig::default().with_root_rank(2);
        let flags: Vec<bool> = comms
            .into_iter()
            .map(|c| {
                TrainingContext::with_communicator(Arc::new(c), config.clone())
                    .unwrap()
                    .is_root()
            })
            .collect();
        assert_eq!(flags, vec![false, false, true]);
    }

    #[test]
    fn test_init_distributed_rejects_local_config() {
        let err = TrainingContext::init_distributed(&LocalConfig, TrainingConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_init_distributed_applies_config_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = TcpConfig::new(1, 0, FileRendezvous::new_session(dir.path()));
        let config = TrainingConfig::default()
            .with_collective_timeout(Some(Duration::from_millis(250)))
            .with_rendezvous_timeout(Duration::from_secs(2));

        let ctx = TrainingContext::init_distributed(&tcp, config).unwrap();
        let comm = ctx.communicator();
        assert_eq!(comm.comm_type(), CommType::Tcp);
        assert_eq!(comm.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(comm.memory_access(), MemoryAccess::Host);
        ctx.barrier().unwrap();

        let unbounded = TrainingConfig::default().with_collective_timeout(None);
        let tcp = TcpConfig::new(1, 0, FileRendezvous::new_session(dir.path()));
        let ctx = TrainingContext::init_distributed(&tcp, unbounded).unwrap();
        assert_eq!(ctx.communicator().timeout(), None);
        println!("✓ init_distributed takes timeouts from TrainingConfig");
    }

    #[test]
    fn test_timeout_env_reaches_communicator() {
        let dir = tempfile::tempdir().unwrap();
        let env: HashMap<&str, &str> = [("SPMD_COLLECTIVE_TIMEOUT_MS", "1500")].into();
        let config = TrainingConfig::default()
            .overlay(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        let tcp = TcpConfig::new(1, 0, FileRendezvous::new_session(dir.path()));
        let ctx = TrainingContext::init_distributed(&tcp, config).unwrap();
        assert_eq!(ctx.communicator().timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_device_memory_reaches_tcp_communicator() {
        let dir = tempfile::tempdir().unwrap();
        let tcp = TcpConfig::new(1, 0, FileRendezvous::new_session(dir.path()));
        let device = DeviceAssignment {
            device: ComputeDevice::Gpu,
            gpu_index: Some(0),
            memory_access: MemoryAccess::Device,
        };
        let config = TrainingConfig::default().with_compute_device(ComputeDevice::Gpu);

        let comm = tcp.create_for_training(&config, &device).unwrap();
        assert_eq!(comm.memory_access(), MemoryAccess::Device);
        let ctx = TrainingContext::with_device(comm, config, device).unwrap();
        assert_eq!(ctx.device().memory_access, ctx.communicator().memory_access());

        let host_only = ThreadGroup::create(1, None).unwrap().remove(0);
        assert_eq!(host_only.memory_access(), MemoryAccess::Host);
    }

    #[test]
    fn test_executor_cores_bound_local_pool() {
        let config = TrainingConfig::default().with_executor_cores(2);
        let ctx = TrainingContext::init_local(config).unwrap();
        assert_eq!(ctx.local_threads(), 2);
        assert_eq!(ctx.run_local(rayon::current_num_threads), 2);

        let single = TrainingContext::init_local(TrainingConfig::default().with_executor_cores(1))
            .unwrap();
        assert_eq!(single.run_local(rayon::current_num_threads), 1);
        println!("✓ Local kernels run on an executor_cores-sized pool");
    }

    #[test]
    fn test_gpu_context_without_gpus_fails() {
        let config = TrainingConfig::default().with_compute_device(ComputeDevice::Gpu);
        let err = TrainingContext::init_local(config).err().unwrap();
        assert_eq!(err.code(), Code::DeviceError);
    }

    #[test]
    fn test_breakdown_log_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::default().with_breakdown_dir(dir.path());
        let ctx = TrainingContext::init_local(config).unwrap();

        ctx.record_timing("step one 0.5s");
        ctx.record_timing("step two 0.25s");

        let content =
            std::fs::read_to_string(dir.path().join(mllib_spmd::util::BREAKDOWN_FILE)).unwrap();
        assert_eq!(content, "rank 0: step one 0.5s\nrank 0: step two 0.25s\n");
    }
}

// ============================================================================
// Configuration
// ============================================================================

mod config_tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.root_rank, 0);
        assert_eq!(config.collective_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.compute_device, ComputeDevice::Host);
        assert!(config.executor_cores >= 1);
        assert!(config.breakdown_dir.is_none());
    }

    #[test]
    fn test_overlay_from_lookup() {
        let config = TrainingConfig::default()
            .overlay(lookup(&[
                ("SPMD_ROOT_RANK", "3"),
                ("SPMD_COLLECTIVE_TIMEOUT_MS", "1500"),
                ("SPMD_RENDEZVOUS_TIMEOUT_MS", "200"),
                ("SPMD_COMPUTE_DEVICE", "gpu"),
                ("SPMD_EXECUTOR_CORES", "8"),
                ("SPARKJOB_CONFIG_DIR", "/tmp/job"),
            ]))
            .unwrap();

        assert_eq!(config.root_rank, 3);
        assert_eq!(config.collective_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.rendezvous_timeout, Duration::from_millis(200));
        assert_eq!(config.compute_device, ComputeDevice::Gpu);
        assert_eq!(config.executor_cores, 8);
        assert_eq!(config.breakdown_dir.as_deref(), Some(std::path::Path::new("/tmp/job")));
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let config = TrainingConfig::default()
            .overlay(lookup(&[("SPMD_COLLECTIVE_TIMEOUT_MS", "0")]))
            .unwrap();
        assert_eq!(config.collective_timeout, None);
    }

    #[test]
    fn test_device_ordinal_in_env() {
        let config = TrainingConfig::default()
            .overlay(lookup(&[("SPMD_COMPUTE_DEVICE", "1")]))
            .unwrap();
        assert_eq!(config.compute_device, ComputeDevice::Cpu);
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = TrainingConfig::default()
            .overlay(lookup(&[("SPMD_ROOT_RANK", "first")]))
            .unwrap_err();
        assert_eq!(err.code(), Code::Invalid);

        let err = TrainingConfig::default()
            .overlay(lookup(&[("SPMD_COMPUTE_DEVICE", "7")]))
            .unwrap_err();
        assert_eq!(err.code(), Code::DeviceError);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::default()
            .with_root_rank(2)
            .with_collective_timeout(None)
            .with_executor_cores(4);

        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let loaded = TrainingConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_compute_device_names_and_ordinals() {
        for device in [ComputeDevice::Host, ComputeDevice::Cpu, ComputeDevice::Gpu] {
            assert_eq!(ComputeDevice::from_ordinal(device.ordinal()).unwrap(), device);
            assert_eq!(ComputeDevice::from_name(device.name()).unwrap(), device);
        }
        assert_eq!(ComputeDevice::Gpu.ordinal(), 2);
        assert_eq!(ComputeDevice::from_name("cpu").unwrap(), ComputeDevice::Cpu);
        assert!(ComputeDevice::from_ordinal(-1).is_err());
        assert!(ComputeDevice::from_name("tpu").is_err());
    }
}

// ============================================================================
// Device selection
// ============================================================================

mod device_tests {
    use super::*;

    #[test]
    fn test_host_devices_use_host_memory() {
        for device in [ComputeDevice::Host, ComputeDevice::Cpu] {
            let a = select_device(device, &HostOnlyInventory, None).unwrap();
            assert_eq!(a.memory_access, MemoryAccess::Host);
            assert_eq!(a.gpu_index, None);
        }
    }

    #[test]
    fn test_no_gpu_is_an_error() {
        let err = select_device(ComputeDevice::Gpu, &HostOnlyInventory, None).unwrap_err();
        assert_eq!(err.code(), Code::DeviceError);
        assert!(err.to_string().contains("Invalid GPU count 0"));
    }

    #[test]
    fn test_single_gpu_needs_no_mask() {
        let a = select_device(ComputeDevice::Gpu, &FixedInventory(1), None).unwrap();
        assert_eq!(a.gpu_index, Some(0));
        assert_eq!(a.memory_access, MemoryAccess::Device);
    }

    #[test]
    fn test_multi_gpu_uses_affinity_mask() {
        let a = select_device(ComputeDevice::Gpu, &FixedInventory(4), Some("2")).unwrap();
        assert_eq!(a.gpu_index, Some(2));

        assert!(select_device(ComputeDevice::Gpu, &FixedInventory(4), None).is_err());
        assert!(select_device(ComputeDevice::Gpu, &FixedInventory(4), Some("4")).is_err());
        assert!(select_device(ComputeDevice::Gpu, &FixedInventory(4), Some("x")).is_err());
    }
}
