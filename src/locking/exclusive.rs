// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::Result;
use crate::locking::lock::{Contention, LockBackend, TrackedResourceLock};
use crate::locking::thread::{ThreadHandle, lock_unpoisoned};
use std::sync::{Arc, Mutex};

/// Exclusive lock guarding mutable state such as a project or a whole build.
pub type ExclusiveLock = TrackedResourceLock<ExclusiveAccess>;

/// Single-owner backend, optionally gated by a broader exclusive lock that must be free
/// (or held by the caller) before this one can be taken.
#[derive(Debug)]
pub struct ExclusiveAccess {
    owner: Mutex<Option<ThreadHandle>>,
    gate: Option<Arc<ExclusiveLock>>,
}

impl ExclusiveAccess {
    pub fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            gate: None,
        }
    }

    pub fn gated_by(gate: Arc<ExclusiveLock>) -> Self {
        Self {
            owner: Mutex::new(None),
            gate: Some(gate),
        }
    }

    fn gate_owner(&self) -> Option<ThreadHandle> {
        self.gate.as_ref().and_then(|gate| gate.backend().owner())
    }

    fn can_acquire(&self, thread: &ThreadHandle) -> bool {
        // An ungated lock (the all-projects lock) does not block on the narrower locks it
        // covers.
        self.gate_owner().is_none_or(|owner| owner == *thread)
    }
}

impl Default for ExclusiveAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl LockBackend for ExclusiveAccess {
    fn acquire_lock(&self, thread: &ThreadHandle) -> Result<bool> {
        let mut owner = lock_unpoisoned(&self.owner);
        if owner.is_some() || !self.can_acquire(thread) {
            return Ok(false);
        }
        *owner = Some(thread.clone());
        Ok(true)
    }

    fn release_lock(&self, _thread: &ThreadHandle) -> Result<()> {
        *lock_unpoisoned(&self.owner) = None;
        Ok(())
    }

    fn owner(&self) -> Option<ThreadHandle> {
        lock_unpoisoned(&self.owner).clone()
    }

    fn contention(&self) -> Contention {
        Contention::Exclusive {
            owner: self.owner().or_else(|| self.gate_owner()),
        }
    }
}
