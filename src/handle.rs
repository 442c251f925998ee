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

//! Generation-checked handle table
//!
//! Objects that cross an external boundary are parked in a [`HandleTable`] and
//! referred to by an opaque [`Handle`]. A handle packs the slot index in its
//! low 32 bits and the slot generation in its high 32 bits. Removing an object
//! bumps the slot generation, so a stale or double-released token is rejected
//! instead of silently reaching whatever object reused the slot.

use std::fmt;

use crate::error::{SpmdError, SpmdResult};

/// Opaque integer token for an object held in a [`HandleTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    fn index(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(Debug)]
struct Slot<T> {
    // starts at 1 so that no live handle encodes to 0
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            return Handle::new(index as u32, slot.generation);
        }

        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(index as u32, 1)
    }

    pub fn get(&self, handle: Handle) -> SpmdResult<&T> {
        let index = self.check(handle)?;
        self.slots[index]
            .value
            .as_ref()
            .ok_or_else(|| stale(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> SpmdResult<&mut T> {
        let index = self.check(handle)?;
        self.slots[index]
            .value
            .as_mut()
            .ok_or_else(|| stale(handle))
    }

    /// Take the object out, invalidating every copy of `handle`
    pub fn remove(&mut self, handle: Handle) -> SpmdResult<T> {
        let index = self.check(handle)?;
        let slot = &mut self.slots[index];
        let value = slot.value.take().ok_or_else(|| stale(handle))?;

        // a slot whose generation would wrap is retired rather than reused
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(index);
            }
            None => log::warn!("retiring handle slot {} after generation overflow", index),
        }
        self.live -= 1;
        Ok(value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every object; all outstanding handles become stale
    pub fn clear(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.value.take().is_some() {
                if let Some(next) = slot.generation.checked_add(1) {
                    slot.generation = next;
                    self.free.push(index);
                }
            }
        }
        self.live = 0;
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| Handle::new(i as u32, s.generation))
            .collect()
    }

    fn check(&self, handle: Handle) -> SpmdResult<usize> {
        if handle.0 == 0 {
            return Err(SpmdError::Handle("null handle".to_string()));
        }
        let index = handle.index();
        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation() => Ok(index),
            Some(_) => Err(stale(handle)),
            None => Err(SpmdError::Handle(format!("unknown handle {}", handle))),
        }
    }
}

fn stale(handle: Handle) -> SpmdError {
    SpmdError::Handle(format!("stale handle {}", handle))
}
