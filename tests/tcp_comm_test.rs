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

//! Tests for the TCP communicator and file rendezvous over loopback

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use mllib_spmd::error::Code;
use mllib_spmd::net::{
    find_available_port, Communicator, FileRendezvous, TcpCommunicator, TcpConfig,
};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Spin up `world_size` TCP ranks on threads sharing one rendezvous session
fn run_tcp<T, F>(dir: &Path, world_size: usize, port_start: u16, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(TcpCommunicator) -> T + Sync,
{
    let rendezvous = FileRendezvous::new_session(dir);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let f = &f;
                let mut config = TcpConfig::new(world_size, rank, rendezvous.clone())
                    .with_port_start(port_start);
                config.collective_timeout = Some(Duration::from_secs(10));
                config.rendezvous_timeout = Duration::from_secs(10);
                s.spawn(move || f(TcpCommunicator::connect(&config).unwrap()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

mod rendezvous_tests {
    use super::*;

    #[test]
    fn test_publish_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let rv = FileRendezvous::new_session(dir.path());
        assert_eq!(rv.try_read().unwrap(), None);

        let addr: SocketAddr = "127.0.0.1:4321".parse().unwrap();
        rv.publish(addr).unwrap();
        assert_eq!(rv.try_read().unwrap(), Some(addr));
        assert_eq!(rv.wait_for_address(Duration::from_millis(10)).unwrap(), addr);

        rv.clear().unwrap();
        assert_eq!(rv.try_read().unwrap(), None);
        rv.clear().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let rv = FileRendezvous::new_session(dir.path());
        let err = rv.wait_for_address(Duration::from_millis(120)).unwrap_err();
        assert_eq!(err.code(), Code::RendezvousError);
    }

    #[test]
    fn test_invalid_session_id() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileRendezvous::new(dir.path(), "../escape").is_err());
        assert!(FileRendezvous::new(dir.path(), "").is_err());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileRendezvous::new_session(dir.path());
        let b = FileRendezvous::new_session(dir.path());
        assert_ne!(a.path(), b.path());

        a.publish("127.0.0.1:5000".parse().unwrap()).unwrap();
        assert_eq!(b.try_read().unwrap(), None);
    }

    #[test]
    fn test_find_available_port() {
        let port = find_available_port(LOOPBACK, 4600).unwrap();
        assert!(port >= 4600);

        let held = std::net::TcpListener::bind(SocketAddr::new(LOOPBACK, port)).unwrap();
        let next = find_available_port(LOOPBACK, port).unwrap();
        assert!(next > port);
        drop(held);
    }
}

mod tcp_collective_tests {
    use super::*;

    #[test]
    fn test_single_rank_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = TcpConfig::new(1, 0, FileRendezvous::new_session(dir.path()));
        let comm = TcpCommunicator::connect(&config).unwrap();
        assert!(comm.coordinator_addr().is_none());
        assert_eq!(comm.gather(&[1, 2], 0).unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_rank_outside_world_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = TcpConfig::new(2, 2, FileRendezvous::new_session(dir.path()));
        assert_eq!(TcpCommunicator::connect(&config).err().unwrap().code(), Code::Invalid);
    }

    #[test]
    fn test_collectives_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let results = run_tcp(dir.path(), 3, 4100, |comm| {
            let rank = comm.rank();
            comm.barrier().unwrap();

            let gathered = comm.gather(&[rank as u8; 2], 1).unwrap();

            let counts = vec![1, 2, 3];
            let everyone = comm.allgatherv(&vec![rank as u8; rank + 1], &counts).unwrap();

            let mut data = if rank == 2 { b"hello".to_vec() } else { Vec::new() };
            comm.broadcast(&mut data, 2).unwrap();

            (rank, gathered, everyone, data)
        });

        for (rank, gathered, everyone, data) in results {
            if rank == 1 {
                assert_eq!(gathered, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
            } else {
                assert!(gathered.is_empty());
            }
            assert_eq!(everyone, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
            assert_eq!(data, b"hello".to_vec());
        }
        println!("✓ TCP collectives over loopback");
    }

    #[test]
    fn test_size_mismatch_reaches_workers() {
        let dir = tempfile::tempdir().unwrap();
        let results = run_tcp(dir.path(), 3, 4200, |comm| {
            let len = if comm.rank() == 2 { 3 } else { 2 };
            comm.gather(&vec![0u8; len], 0)
        });
        for r in results {
            assert_eq!(r.unwrap_err().code(), Code::CollectiveMismatch);
        }
    }

    #[test]
    fn test_op_mismatch_reaches_workers() {
        let dir = tempfile::tempdir().unwrap();
        let results = run_tcp(dir.path(), 2, 4300, |comm| {
            if comm.rank() == 0 {
                comm.barrier()
            } else {
                comm.gather(&[1], 0).map(|_| ())
            }
        });
        for r in results {
            assert_eq!(r.unwrap_err().code(), Code::CollectiveMismatch);
        }
    }

    #[test]
    fn test_missing_peer_fails_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TcpConfig::new(2, 0, FileRendezvous::new_session(dir.path()))
            .with_port_start(4400);
        config.rendezvous_timeout = Duration::from_millis(200);
        let err = TcpCommunicator::connect(&config).err().unwrap();
        assert_eq!(err.code(), Code::RendezvousError);
        assert_eq!(config.rendezvous.try_read().unwrap(), None);
    }
}
