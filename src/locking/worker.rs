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

//! Bounded worker leases drawn from a fixed-size [`LeaseHolder`].

use crate::error::{LockError, Result};
use crate::locking::lock::{Contention, LockBackend, PoolId, PoolRef, TrackedResourceLock};
use crate::locking::registry::{ResourceLockRegistry, ThreadLockBook};
use crate::locking::thread::{ThreadHandle, lock_unpoisoned};
use log::debug;
use std::sync::{Arc, Mutex};

/// One token of a [`LeaseHolder`]. Not clonable: a token is either in the pool or with
/// exactly one lock.
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    index: usize,
}

impl Lease {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-size pool of interchangeable leases.
#[derive(Debug)]
pub struct LeaseHolder {
    id: PoolId,
    name: String,
    granted: Mutex<Vec<bool>>,
}

impl LeaseHolder {
    pub fn new(name: impl Into<String>, max_leases: usize) -> Self {
        Self {
            id: PoolId::next(),
            name: name.into(),
            granted: Mutex::new(vec![false; max_leases]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_leases(&self) -> usize {
        lock_unpoisoned(&self.granted).len()
    }

    /// Hands out the lowest free lease, or `None` when every lease is granted.
    pub fn grant(&self) -> Option<Lease> {
        let mut granted = lock_unpoisoned(&self.granted);
        let index = granted.iter().position(|taken| !taken)?;
        granted[index] = true;
        Some(Lease { index })
    }

    pub fn give_back(&self, lease: Lease) {
        let mut granted = lock_unpoisoned(&self.granted);
        if let Some(slot) = granted.get_mut(lease.index) {
            *slot = false;
        }
    }

    pub fn outstanding(&self) -> usize {
        lock_unpoisoned(&self.granted)
            .iter()
            .filter(|taken| **taken)
            .count()
    }

    pub fn available(&self) -> usize {
        self.max_leases() - self.outstanding()
    }

    pub fn pool_ref(&self) -> PoolRef {
        PoolRef {
            id: self.id,
            name: self.name.clone(),
            capacity: self.max_leases(),
        }
    }
}

/// A worker lease lock.
pub type WorkerLease = TrackedResourceLock<PooledLease>;

/// Backend holding at most one lease from a shared pool.
#[derive(Debug)]
pub struct PooledLease {
    pool: Arc<LeaseHolder>,
    grant: Mutex<Option<(ThreadHandle, Lease)>>,
}

impl PooledLease {
    pub fn new(pool: Arc<LeaseHolder>) -> Self {
        Self {
            pool,
            grant: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<LeaseHolder> {
        &self.pool
    }
}

impl LockBackend for PooledLease {
    fn acquire_lock(&self, thread: &ThreadHandle) -> Result<bool> {
        let mut grant = lock_unpoisoned(&self.grant);
        if grant.is_some() {
            return Ok(false);
        }
        match self.pool.grant() {
            Some(lease) => {
                *grant = Some((thread.clone(), lease));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release_lock(&self, thread: &ThreadHandle) -> Result<()> {
        let mut grant = lock_unpoisoned(&self.grant);
        match grant.take() {
            Some((owner, lease)) if owner == *thread => {
                self.pool.give_back(lease);
                Ok(())
            }
            Some(other) => {
                let owner = other.0.name().to_string();
                *grant = Some(other);
                Err(LockError::UnsupportedOperation(format!(
                    "lease from {} must be released by its owner thread '{owner}', not '{thread}'",
                    self.pool.name()
                )))
            }
            None => Ok(()),
        }
    }

    fn owner(&self) -> Option<ThreadHandle> {
        lock_unpoisoned(&self.grant)
            .as_ref()
            .map(|(owner, _)| owner.clone())
    }

    fn contention(&self) -> Contention {
        Contention::Pooled {
            pool: self.pool.pool_ref(),
            units: 1,
            holder: self.owner(),
        }
    }
}

/// Hands out worker leases backed by a single pool.
#[derive(Debug)]
pub struct WorkerLeaseRegistry {
    pool: Arc<LeaseHolder>,
    book: Arc<ThreadLockBook>,
}

impl WorkerLeaseRegistry {
    pub fn new(max_workers: usize) -> Self {
        debug!("Worker lease pool sized to {max_workers}");
        Self {
            pool: Arc::new(LeaseHolder::new("worker leases", max_workers)),
            book: Arc::new(ThreadLockBook::new("worker leases")),
        }
    }

    /// Creates a new, unlocked worker lease drawing from this registry's pool.
    pub fn new_worker_lease(&self) -> Arc<WorkerLease> {
        WorkerLease::new(
            "worker lease",
            PooledLease::new(self.pool.clone()),
            self.book.clone(),
        )
    }

    pub fn pool(&self) -> &Arc<LeaseHolder> {
        &self.pool
    }
}

impl ResourceLockRegistry for WorkerLeaseRegistry {
    fn book(&self) -> &ThreadLockBook {
        &self.book
    }
}
