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

//! Step timing diagnostics

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{poisoned, SpmdResult};

/// Name of the per-directory timing log
pub const BREAKDOWN_FILE: &str = "training_breakdown";

#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Elapsed seconds, restarting the watch
    pub fn lap(&mut self) -> f64 {
        let secs = self.elapsed_secs();
        self.started = Instant::now();
        secs
    }
}

/// Append-only timing log shared by all steps of a training call.
///
/// A log without a directory silently drops records.
#[derive(Debug, Default)]
pub struct BreakdownLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl BreakdownLog {
    pub fn new(dir: Option<&Path>) -> Self {
        Self {
            path: dir.map(|d| d.join(BREAKDOWN_FILE)),
            lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn record(&self, rank: usize, message: &str) -> SpmdResult<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let _guard = self.lock.lock().map_err(|_| poisoned("breakdown log"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "rank {}: {}", rank, message)?;
        Ok(())
    }
}
