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

//! Multi-process communicator over TCP
//!
//! The group is a star: rank 0 listens, publishes its address through the
//! rendezvous directory and accepts one connection per peer. For every
//! collective each peer sends its contribution to rank 0 as a frame
//!
//! ```text
//! [op u8][seq u64][rank u32][root u32][len u64][payload]
//! ```
//!
//! and rank 0 answers each peer with the buffers that peer is entitled to,
//! packed with [`encode_frames`]. Rank 0 validates that every peer issued the
//! same collective for the same sequence number and reports failures back as
//! error frames so that all ranks fail together.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::device::MemoryAccess;
use crate::error::{SpmdError, SpmdResult};

use super::comm_config::TcpConfig;
use super::rendezvous::find_available_port;
use super::serialize::{decode_frames, encode_frames};
use super::{check_counts, check_root, check_uniform, CollectiveOp, CommType, Communicator};

const OP_HELLO: u8 = 0;
const OP_ERROR: u8 = 0xFF;

const ERR_OTHER: u8 = 0;
const ERR_SIZE: u8 = 1;
const ERR_MISMATCH: u8 = 2;
const ERR_TIMEOUT: u8 = 3;

const HEADER_LEN: usize = 1 + 8 + 4 + 4 + 8;
const MAX_PAYLOAD: u64 = 1 << 34;
const ACCEPT_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Frame {
    op: u8,
    seq: u64,
    rank: u32,
    root: u32,
    payload: Vec<u8>,
}

fn write_frame(mut stream: &TcpStream, frame: &Frame) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = frame.op;
    header[1..9].copy_from_slice(&frame.seq.to_le_bytes());
    header[9..13].copy_from_slice(&frame.rank.to_le_bytes());
    header[13..17].copy_from_slice(&frame.root.to_le_bytes());
    header[17..25].copy_from_slice(&(frame.payload.len() as u64).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(&frame.payload)?;
    stream.flush()
}

fn read_frame(mut stream: &TcpStream) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;

    let mut seq = [0u8; 8];
    seq.copy_from_slice(&header[1..9]);
    let mut rank = [0u8; 4];
    rank.copy_from_slice(&header[9..13]);
    let mut root = [0u8; 4];
    root.copy_from_slice(&header[13..17]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[17..25]);

    let len = u64::from_le_bytes(len);
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame payload of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;

    Ok(Frame {
        op: header[0],
        seq: u64::from_le_bytes(seq),
        rank: u32::from_le_bytes(rank),
        root: u32::from_le_bytes(root),
        payload,
    })
}

/// Set the read timeout to whatever is left before `deadline`
fn arm(stream: &TcpStream, deadline: Option<Instant>) -> io::Result<()> {
    let timeout = match deadline {
        None => None,
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(io::Error::new(ErrorKind::TimedOut, "deadline passed"));
            }
            Some(left)
        }
    };
    stream.set_read_timeout(timeout)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn configure_socket_reuse(socket: &Socket) -> SpmdResult<()> {
    socket.set_reuse_address(true).map_err(|e| {
        SpmdError::Rendezvous(format!("Failed to set SO_REUSEADDR: {}", e))
    })
}

/// Buffers rank `rank` receives from a collective, given every contribution
fn view_for(op: CollectiveOp, root: usize, rank: usize, all: &[Vec<u8>]) -> Vec<Vec<u8>> {
    match op {
        CollectiveOp::Barrier => Vec::new(),
        CollectiveOp::Gather if rank == root => all.to_vec(),
        CollectiveOp::Gather => Vec::new(),
        CollectiveOp::AllGatherV => all.to_vec(),
        CollectiveOp::Broadcast => vec![all[root].clone()],
    }
}

fn error_payload(err: &SpmdError) -> Vec<u8> {
    let kind = match err {
        SpmdError::SizeMismatch(_) => ERR_SIZE,
        SpmdError::CollectiveMismatch(_) => ERR_MISMATCH,
        SpmdError::CollectiveTimeout { .. } => ERR_TIMEOUT,
        _ => ERR_OTHER,
    };
    let mut out = vec![kind];
    out.extend_from_slice(err.to_string().as_bytes());
    out
}

fn error_from_payload(payload: &[u8], op: CollectiveOp, seq: u64, waited: Duration) -> SpmdError {
    let msg = String::from_utf8_lossy(payload.get(1..).unwrap_or_default()).into_owned();
    match payload.first().copied().unwrap_or(ERR_OTHER) {
        ERR_SIZE => SpmdError::SizeMismatch(format!("reported by rank 0: {}", msg)),
        ERR_MISMATCH => SpmdError::CollectiveMismatch(format!("reported by rank 0: {}", msg)),
        ERR_TIMEOUT => SpmdError::timeout(op.name(), seq, waited),
        _ => SpmdError::new(
            crate::error::Code::ExecutionError,
            format!("rank 0 aborted {} seq {}: {}", op, seq, msg),
        ),
    }
}

enum Role {
    /// Rank 0, holding one stream per peer indexed by `rank - 1`
    Coordinator { peers: Vec<TcpStream> },
    Worker { coordinator: TcpStream },
}

pub struct TcpCommunicator {
    rank: usize,
    world_size: usize,
    role: Role,
    seq: AtomicU64,
    timeout: Option<Duration>,
    memory_access: MemoryAccess,
    coordinator_addr: Option<SocketAddr>,
}

impl TcpCommunicator {
    /// Join the group described by `config`, blocking until it is complete
    pub fn connect(config: &TcpConfig) -> SpmdResult<Self> {
        if config.world_size == 0 || config.rank >= config.world_size {
            return Err(SpmdError::Invalid(format!(
                "rank {} outside world of size {}",
                config.rank, config.world_size
            )));
        }

        let (role, coordinator_addr) = if config.world_size == 1 {
            (Role::Coordinator { peers: Vec::new() }, None)
        } else if config.rank == 0 {
            let (peers, addr) = Self::accept_peers(config)?;
            (Role::Coordinator { peers }, Some(addr))
        } else {
            let (stream, addr) = Self::join_coordinator(config)?;
            (Role::Worker { coordinator: stream }, Some(addr))
        };

        log::info!(
            "rank {}/{}: tcp communicator ready (session {})",
            config.rank,
            config.world_size,
            config.rendezvous.session_id()
        );

        Ok(Self {
            rank: config.rank,
            world_size: config.world_size,
            role,
            seq: AtomicU64::new(0),
            timeout: config.collective_timeout,
            memory_access: config.memory_access,
            coordinator_addr,
        })
    }

    /// Address rank 0 listens on, if the group has more than one rank
    pub fn coordinator_addr(&self) -> Option<SocketAddr> {
        self.coordinator_addr
    }

    fn bind_listener(config: &TcpConfig) -> SpmdResult<(TcpListener, SocketAddr)> {
        let port = find_available_port(config.bind_ip, config.port_start)?;
        let addr = SocketAddr::new(config.bind_ip, port);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| SpmdError::Rendezvous(format!("Socket creation failed: {}", e)))?;
        configure_socket_reuse(&socket)?;
        socket
            .bind(&addr.into())
            .map_err(|e| SpmdError::Rendezvous(format!("Could not bind {}: {}", addr, e)))?;
        socket
            .listen(config.world_size as i32)
            .map_err(|e| SpmdError::Rendezvous(format!("Listen failed: {}", e)))?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok((listener, addr))
    }

    fn accept_peers(config: &TcpConfig) -> SpmdResult<(Vec<TcpStream>, SocketAddr)> {
        let (listener, addr) = Self::bind_listener(config)?;
        config.rendezvous.publish(addr)?;

        let deadline = Instant::now() + config.rendezvous_timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..config.world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < slots.len() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    arm(&stream, Some(deadline))?;
                    let hello = read_frame(&stream).map_err(|e| {
                        SpmdError::Rendezvous(format!("handshake with {} failed: {}", peer, e))
                    })?;
                    let rank = Self::check_hello(&hello, config.world_size)?;
                    let slot = &mut slots[rank - 1];
                    if slot.is_some() {
                        return Err(SpmdError::Rendezvous(format!(
                            "rank {} joined twice",
                            rank
                        )));
                    }
                    log::debug!("rank {} joined from {}", rank, peer);
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        let _ = config.rendezvous.clear();
                        return Err(SpmdError::Rendezvous(format!(
                            "only {} of {} peers joined within {:?}",
                            joined,
                            slots.len(),
                            config.rendezvous_timeout
                        )));
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(SpmdError::Io(e)),
            }
        }

        config.rendezvous.clear()?;
        let peers = slots.into_iter().flatten().collect::<Vec<_>>();
        for peer in &peers {
            peer.set_read_timeout(config.collective_timeout)?;
        }
        Ok((peers, addr))
    }

    fn check_hello(hello: &Frame, world_size: usize) -> SpmdResult<usize> {
        if hello.op != OP_HELLO {
            return Err(SpmdError::Rendezvous(format!(
                "expected hello, got frame tag {}",
                hello.op
            )));
        }
        let rank = hello.rank as usize;
        if rank == 0 || rank >= world_size {
            return Err(SpmdError::Rendezvous(format!(
                "peer announced rank {} in world of size {}",
                rank, world_size
            )));
        }
        let mut size = [0u8; 4];
        match hello.payload.get(0..4) {
            Some(bytes) => size.copy_from_slice(bytes),
            None => {
                return Err(SpmdError::Rendezvous("hello without world size".to_string()));
            }
        }
        let theirs = u32::from_le_bytes(size) as usize;
        if theirs != world_size {
            return Err(SpmdError::Rendezvous(format!(
                "rank {} expects world size {}, coordinator has {}",
                rank, theirs, world_size
            )));
        }
        Ok(rank)
    }

    fn join_coordinator(config: &TcpConfig) -> SpmdResult<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + config.rendezvous_timeout;
        let addr = config.rendezvous.wait_for_address(config.rendezvous_timeout)?;

        let stream = loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match TcpStream::connect_timeout(&addr, left.max(CONNECT_RETRY)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    log::debug!("connect to {} failed ({}), retrying", addr, e);
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(SpmdError::Rendezvous(format!(
                        "could not reach coordinator at {}: {}",
                        addr, e
                    )));
                }
            }
        };
        stream.set_nodelay(true)?;

        let hello = Frame {
            op: OP_HELLO,
            seq: 0,
            rank: config.rank as u32,
            root: 0,
            payload: (config.world_size as u32).to_le_bytes().to_vec(),
        };
        write_frame(&stream, &hello)?;
        stream.set_read_timeout(config.collective_timeout)?;
        Ok((stream, addr))
    }

    fn io_error(e: io::Error, op: CollectiveOp, seq: u64, started: Instant) -> SpmdError {
        if is_timeout(&e) {
            SpmdError::timeout(op.name(), seq, started.elapsed())
        } else {
            SpmdError::Io(e)
        }
    }

    /// Run one collective and return the buffers this rank is entitled to
    fn exchange(&self, op: CollectiveOp, root: usize, data: &[u8]) -> SpmdResult<Vec<Vec<u8>>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        match &self.role {
            Role::Coordinator { peers } => self.coordinate(peers, op, root, seq, started, data),
            Role::Worker { coordinator } => {
                let frame = Frame {
                    op: op as u8,
                    seq,
                    rank: self.rank as u32,
                    root: root as u32,
                    payload: data.to_vec(),
                };
                write_frame(coordinator, &frame)
                    .map_err(|e| Self::io_error(e, op, seq, started))?;

                let reply =
                    read_frame(coordinator).map_err(|e| Self::io_error(e, op, seq, started))?;
                if reply.op == OP_ERROR {
                    return Err(error_from_payload(&reply.payload, op, seq, started.elapsed()));
                }
                if reply.op != op as u8 || reply.seq != seq {
                    return Err(SpmdError::CollectiveMismatch(format!(
                        "rank {} issued {} seq {} but rank 0 answered tag {} seq {}",
                        self.rank, op, seq, reply.op, reply.seq
                    )));
                }
                decode_frames(&reply.payload)
            }
        }
    }

    fn coordinate(
        &self,
        peers: &[TcpStream],
        op: CollectiveOp,
        root: usize,
        seq: u64,
        started: Instant,
        data: &[u8],
    ) -> SpmdResult<Vec<Vec<u8>>> {
        let deadline = self.timeout.map(|t| started + t);
        let mut all = Vec::with_capacity(self.world_size);
        all.push(data.to_vec());

        for (idx, peer) in peers.iter().enumerate() {
            let rank = idx + 1;
            let frame = match arm(peer, deadline).and_then(|_| read_frame(peer)) {
                Ok(frame) => frame,
                Err(e) => {
                    let err = Self::io_error(e, op, seq, started);
                    if err.is_timeout() {
                        crate::rank_warn!(0, "{} seq {} timed out waiting for rank {}", op, seq, rank);
                    }
                    return Err(self.abort(peers, seq, err));
                }
            };

            if frame.op != op as u8
                || frame.seq != seq
                || frame.root as usize != root
                || frame.rank as usize != rank
            {
                let err = SpmdError::CollectiveMismatch(format!(
                    "seq {}: rank 0 issued {} (root {}) but rank {} sent tag {} seq {} (root {})",
                    seq, op, root, frame.rank, frame.op, frame.seq, frame.root
                ));
                return Err(self.abort(peers, seq, err));
            }
            all.push(frame.payload);
        }

        if op == CollectiveOp::Gather {
            if let Err(err) = check_uniform(&all) {
                return Err(self.abort(peers, seq, err));
            }
        }

        for (idx, peer) in peers.iter().enumerate() {
            let reply = Frame {
                op: op as u8,
                seq,
                rank: 0,
                root: root as u32,
                payload: encode_frames(&view_for(op, root, idx + 1, &all)),
            };
            write_frame(peer, &reply).map_err(|e| Self::io_error(e, op, seq, started))?;
        }

        Ok(view_for(op, root, 0, &all))
    }

    /// Tell every peer the collective failed, then hand the error back
    fn abort(&self, peers: &[TcpStream], seq: u64, err: SpmdError) -> SpmdError {
        let frame = Frame {
            op: OP_ERROR,
            seq,
            rank: 0,
            root: 0,
            payload: error_payload(&err),
        };
        for peer in peers {
            if let Err(e) = write_frame(peer, &frame) {
                log::debug!("could not deliver abort for seq {}: {}", seq, e);
            }
        }
        err
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn comm_type(&self) -> CommType {
        CommType::Tcp
    }

    fn memory_access(&self) -> MemoryAccess {
        self.memory_access
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn barrier(&self) -> SpmdResult<()> {
        self.exchange(CollectiveOp::Barrier, 0, &[]).map(|_| ())
    }

    fn gather(&self, data: &[u8], root: usize) -> SpmdResult<Vec<Vec<u8>>> {
        check_root(root, self.world_size)?;
        self.exchange(CollectiveOp::Gather, root, data)
    }

    fn allgatherv(&self, data: &[u8], recv_counts: &[usize]) -> SpmdResult<Vec<Vec<u8>>> {
        let all = self.exchange(CollectiveOp::AllGatherV, 0, data)?;
        check_counts(&all, recv_counts)?;
        Ok(all)
    }

    fn broadcast(&self, data: &mut Vec<u8>, root: usize) -> SpmdResult<()> {
        check_root(root, self.world_size)?;
        let send: &[u8] = if self.rank == root { data.as_slice() } else { &[] };
        let mut view = self.exchange(CollectiveOp::Broadcast, root, send)?;
        if self.rank != root {
            *data = view.pop().ok_or_else(|| {
                SpmdError::Serialization("broadcast reply carried no buffer".to_string())
            })?;
        }
        Ok(())
    }
}
