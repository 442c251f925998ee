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

//! Coordinator address exchange
//!
//! Rank 0 publishes the address it listens on into a shared directory; every
//! other rank polls for it. The directory only needs to be visible to all
//! ranks (a local tmp dir for single-host runs, a shared mount otherwise).

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{SpmdError, SpmdResult};
use crate::util::uuid::{generate_session_id, is_valid_session_id};

/// First port tried by [`find_available_port`]
pub const DEFAULT_PORT_START: u16 = 3000;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRendezvous {
    dir: PathBuf,
    session_id: String,
}

impl FileRendezvous {
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> SpmdResult<Self> {
        let session_id = session_id.into();
        if !is_valid_session_id(&session_id) {
            return Err(SpmdError::Rendezvous(format!(
                "invalid session id '{}'",
                session_id
            )));
        }
        Ok(Self {
            dir: dir.into(),
            session_id,
        })
    }

    /// Rendezvous under a freshly generated session id
    pub fn new_session(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session_id: generate_session_id(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.addr", self.session_id))
    }

    /// Publish the coordinator address.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// readers never observe a partial address.
    pub fn publish(&self, addr: SocketAddr) -> SpmdResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            SpmdError::Rendezvous(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        let tmp = self
            .dir
            .join(format!(".{}.addr.{}", self.session_id, std::process::id()));
        std::fs::write(&tmp, addr.to_string())
            .and_then(|_| std::fs::rename(&tmp, self.path()))
            .map_err(|e| {
                SpmdError::Rendezvous(format!("cannot publish {}: {}", self.path().display(), e))
            })?;
        log::info!("published coordinator address {} to {}", addr, self.path().display());
        Ok(())
    }

    /// Read the address if it has been published
    pub fn try_read(&self) -> SpmdResult<Option<SocketAddr>> {
        match std::fs::read_to_string(self.path()) {
            Ok(content) => Ok(content.trim().parse::<SocketAddr>().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpmdError::Rendezvous(format!(
                "cannot read {}: {}",
                self.path().display(),
                e
            ))),
        }
    }

    /// Poll until the coordinator address appears or `timeout` elapses
    pub fn wait_for_address(&self, timeout: Duration) -> SpmdResult<SocketAddr> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(addr) = self.try_read()? {
                log::debug!("found coordinator address {}", addr);
                return Ok(addr);
            }
            if Instant::now() >= deadline {
                return Err(SpmdError::Rendezvous(format!(
                    "no coordinator address at {} after {:?}",
                    self.path().display(),
                    timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn clear(&self) -> SpmdResult<()> {
        match std::fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpmdError::Rendezvous(format!(
                "cannot remove {}: {}",
                self.path().display(),
                e
            ))),
        }
    }
}

/// Scan upward from `start` for a TCP port that can be bound on `ip`
pub fn find_available_port(ip: IpAddr, start: u16) -> SpmdResult<u16> {
    for port in start..=u16::MAX {
        match TcpListener::bind(SocketAddr::new(ip, port)) {
            Ok(_) => return Ok(port),
            Err(e) if e.kind() == ErrorKind::AddrNotAvailable => {
                return Err(SpmdError::Rendezvous(format!(
                    "{} is not a local address: {}",
                    ip, e
                )));
            }
            Err(_) => continue,
        }
    }
    Err(SpmdError::Rendezvous(format!(
        "no free port on {} at or above {}",
        ip, start
    )))
}
