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

//! Named shared resources with a fixed number of permits.

use crate::error::{LockError, Result};
use crate::locking::lock::{Contention, LockBackend, PoolId, PoolRef, TrackedResourceLock};
use crate::locking::registry::{ResourceLockRegistry, ThreadLockBook};
use crate::locking::thread::{ThreadHandle, lock_unpoisoned};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Capacity counter for one named resource.
#[derive(Debug)]
pub struct SharedResource {
    id: PoolId,
    name: String,
    capacity: usize,
    available: Mutex<usize>,
}

impl SharedResource {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: PoolId::next(),
            name: name.into(),
            capacity,
            available: Mutex::new(capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        *lock_unpoisoned(&self.available)
    }

    /// Takes `permits` atomically. Requests larger than the capacity can never succeed
    /// and are rejected before the counter is touched.
    pub fn try_acquire(&self, permits: usize) -> Result<bool> {
        if permits > self.capacity {
            return Err(LockError::InvalidPermitCount {
                resource: self.name.clone(),
                requested: permits,
                capacity: self.capacity,
            });
        }

        let mut available = lock_unpoisoned(&self.available);
        if *available < permits {
            return Ok(false);
        }
        *available -= permits;
        Ok(true)
    }

    pub fn release(&self, permits: usize) {
        let mut available = lock_unpoisoned(&self.available);
        let restored = *available + permits;
        if restored > self.capacity {
            warn!(
                "Releasing {permits} permits of '{}' would exceed its capacity of {}",
                self.name, self.capacity
            );
        }
        *available = restored.min(self.capacity);
    }

    pub fn pool_ref(&self) -> PoolRef {
        PoolRef {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }
}

/// A lock holding some permits of a shared resource.
pub type SharedResourceLock = TrackedResourceLock<SharedResourcePermits>;

#[derive(Debug)]
pub struct SharedResourcePermits {
    resource: Arc<SharedResource>,
    permits: usize,
    owner: Mutex<Option<ThreadHandle>>,
}

impl SharedResourcePermits {
    pub fn new(resource: Arc<SharedResource>, permits: usize) -> Self {
        Self {
            resource,
            permits,
            owner: Mutex::new(None),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn resource(&self) -> &Arc<SharedResource> {
        &self.resource
    }
}

impl LockBackend for SharedResourcePermits {
    fn acquire_lock(&self, thread: &ThreadHandle) -> Result<bool> {
        let mut owner = lock_unpoisoned(&self.owner);
        if owner.is_some() {
            return Ok(false);
        }
        if !self.resource.try_acquire(self.permits)? {
            return Ok(false);
        }
        *owner = Some(thread.clone());
        Ok(true)
    }

    fn release_lock(&self, thread: &ThreadHandle) -> Result<()> {
        let mut owner = lock_unpoisoned(&self.owner);
        match owner.take() {
            Some(current) if current == *thread => {
                self.resource.release(self.permits);
                Ok(())
            }
            Some(current) => {
                let err = LockError::UnsupportedOperation(format!(
                    "permits of '{}' must be released by their owner thread '{current}', not '{thread}'",
                    self.resource.name()
                ));
                *owner = Some(current);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn owner(&self) -> Option<ThreadHandle> {
        lock_unpoisoned(&self.owner).clone()
    }

    fn contention(&self) -> Contention {
        Contention::Pooled {
            pool: self.resource.pool_ref(),
            units: self.permits,
            holder: self.owner(),
        }
    }
}

/// Registry of named shared resources and the leases drawn from them.
#[derive(Debug)]
pub struct SharedResourceLeaseRegistry {
    resources: Mutex<HashMap<String, Arc<SharedResource>>>,
    book: Arc<ThreadLockBook>,
}

impl SharedResourceLeaseRegistry {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            book: Arc::new(ThreadLockBook::new("shared resources")),
        }
    }

    pub fn register_shared_resource(&self, name: &str, capacity: usize) -> Result<()> {
        let mut resources = lock_unpoisoned(&self.resources);
        if resources.contains_key(name) {
            return Err(LockError::DuplicateSharedResource(name.to_string()));
        }
        debug!("Registered shared resource '{name}' with {capacity} permits");
        resources.insert(
            name.to_string(),
            Arc::new(SharedResource::new(name, capacity)),
        );
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<Arc<SharedResource>> {
        lock_unpoisoned(&self.resources).get(name).cloned()
    }

    /// Creates a lock that takes `permits` permits of `name` when acquired.
    pub fn resource_lock(&self, name: &str, permits: usize) -> Result<Arc<SharedResourceLock>> {
        let resource = self
            .resource(name)
            .ok_or_else(|| LockError::UnknownSharedResource(name.to_string()))?;
        let display_name = if permits == 1 {
            format!("lease of shared resource {name}")
        } else {
            format!("{permits} leases of shared resource {name}")
        };
        Ok(SharedResourceLock::new(
            display_name,
            SharedResourcePermits::new(resource, permits),
            self.book.clone(),
        ))
    }
}

impl Default for SharedResourceLeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLockRegistry for SharedResourceLeaseRegistry {
    fn book(&self) -> &ThreadLockBook {
        &self.book
    }
}
