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

//! Single-rank communicator

use std::time::Duration;

use crate::error::SpmdResult;

use super::{check_counts, check_root, CommType, Communicator};

/// World of size one; every collective completes immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommunicator;

impl LocalCommunicator {
    pub fn new() -> Self {
        LocalCommunicator
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn comm_type(&self) -> CommType {
        CommType::Local
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn barrier(&self) -> SpmdResult<()> {
        Ok(())
    }

    fn gather(&self, data: &[u8], root: usize) -> SpmdResult<Vec<Vec<u8>>> {
        check_root(root, 1)?;
        Ok(vec![data.to_vec()])
    }

    fn allgatherv(&self, data: &[u8], recv_counts: &[usize]) -> SpmdResult<Vec<Vec<u8>>> {
        let all = vec![data.to_vec()];
        check_counts(&all, recv_counts)?;
        Ok(all)
    }

    fn broadcast(&self, _data: &mut Vec<u8>, root: usize) -> SpmdResult<()> {
        check_root(root, 1)
    }
}
