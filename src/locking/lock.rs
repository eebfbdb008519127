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

//! The resource lock contract and the tracked lock template shared by every lock kind.
//!
//! A [`TrackedResourceLock`] owns the bookkeeping half of a lock (reentrancy, registry
//! callbacks, transform state) and delegates the kind-specific half to a [`LockBackend`].
//! Every operation takes the active [`ResourceLockState`], so lock state can only be
//! inspected or changed from inside a coordination service transform.

use crate::error::{LockError, Result};
use crate::locking::coordination::ResourceLockState;
use crate::locking::registry::ThreadLockBook;
use crate::locking::thread::ThreadHandle;
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A named lock over an abstract resource.
pub trait ResourceLock: Send + Sync + fmt::Debug {
    fn display_name(&self) -> &str;

    fn is_locked(&self, state: &ResourceLockState<'_>) -> bool;

    fn is_locked_by_current_thread(&self, state: &ResourceLockState<'_>) -> bool;

    /// Attempts to acquire the lock without blocking. Returns `Ok(false)` on contention.
    fn try_lock(&self, state: &mut ResourceLockState<'_>) -> Result<bool>;

    /// Releases the lock if the calling thread holds it; otherwise does nothing.
    fn unlock(&self, state: &mut ResourceLockState<'_>) -> Result<()>;

    /// Describes what currently stands between a caller and this lock.
    fn contention(&self, state: &ResourceLockState<'_>) -> Contention;
}

/// Returns true when both references point at the same lock instance.
pub fn same_lock(a: &dyn ResourceLock, b: &dyn ResourceLock) -> bool {
    std::ptr::addr_eq(a, b)
}

/// Identity of a capacity pool (lease holder or shared resource).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRef {
    pub id: PoolId,
    pub name: String,
    pub capacity: usize,
}

/// Wait-for information a lock exposes to the deadlock detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contention {
    /// A single-owner lock and the thread currently standing in the way, if any.
    Exclusive { owner: Option<ThreadHandle> },
    /// A lock drawing `units` from a shared pool. `holder` is the thread this lock
    /// instance currently holds those units for.
    Pooled {
        pool: PoolRef,
        units: usize,
        holder: Option<ThreadHandle>,
    },
}

/// Kind-specific half of a tracked lock.
///
/// Every kind in this crate is single-owner per lock instance: pooled kinds hand out one
/// instance per consumer and draw their capacity from a shared pool.
pub trait LockBackend: Send + Sync + fmt::Debug + 'static {
    fn acquire_lock(&self, thread: &ThreadHandle) -> Result<bool>;

    fn release_lock(&self, thread: &ThreadHandle) -> Result<()>;

    fn owner(&self) -> Option<ThreadHandle>;

    fn contention(&self) -> Contention;
}

/// Lock template combining a backend with registry bookkeeping.
pub struct TrackedResourceLock<B: LockBackend> {
    display_name: String,
    backend: B,
    book: Arc<ThreadLockBook>,
    this: Weak<TrackedResourceLock<B>>,
}

impl<B: LockBackend> TrackedResourceLock<B> {
    pub(crate) fn new(
        display_name: impl Into<String>,
        backend: B,
        book: Arc<ThreadLockBook>,
    ) -> Arc<Self> {
        let display_name = display_name.into();
        Arc::new_cyclic(|this| Self {
            display_name,
            backend,
            book,
            this: this.clone(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn handle(&self) -> Result<Arc<dyn ResourceLock>> {
        match self.this.upgrade() {
            Some(lock) => Ok(lock as Arc<dyn ResourceLock>),
            None => Err(LockError::LockDropped(self.display_name.clone())),
        }
    }

    fn is_held_by(&self, thread: &ThreadHandle) -> bool {
        self.backend.owner().is_some_and(|owner| owner == *thread)
    }
}

impl<B: LockBackend> ResourceLock for TrackedResourceLock<B> {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn is_locked(&self, _state: &ResourceLockState<'_>) -> bool {
        self.backend.owner().is_some()
    }

    fn is_locked_by_current_thread(&self, _state: &ResourceLockState<'_>) -> bool {
        self.backend.owner().is_some_and(|owner| owner.is_current())
    }

    fn try_lock(&self, state: &mut ResourceLockState<'_>) -> Result<bool> {
        let thread = ThreadHandle::current();
        if self.is_held_by(&thread) {
            return Ok(true);
        }

        let lock = self.handle()?;
        if !self.backend.acquire_lock(&thread)? {
            state.register_failed(lock);
            return Ok(false);
        }

        if let Err(err) = self.book.lock_acquired(&thread, lock.clone()) {
            if let Err(release_err) = self.backend.release_lock(&thread) {
                warn!(
                    "Failed to roll back {} after registration error: {release_err}",
                    self.display_name
                );
            }
            return Err(err);
        }

        debug!("{thread} acquired {}", self.display_name);
        state.register_locked(lock);
        Ok(true)
    }

    fn unlock(&self, state: &mut ResourceLockState<'_>) -> Result<()> {
        let thread = ThreadHandle::current();
        if !self.is_held_by(&thread) {
            return Ok(());
        }

        self.book.ensure_may_change(&thread, self)?;
        self.backend.release_lock(&thread)?;
        self.book.lock_released(&thread, self);
        state.register_unlocked(self);

        debug!("{thread} released {}", self.display_name);
        state.notify_state_change();
        Ok(())
    }

    fn contention(&self, _state: &ResourceLockState<'_>) -> Contention {
        self.backend.contention()
    }
}

impl<B: LockBackend> fmt::Debug for TrackedResourceLock<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedResourceLock")
            .field("display_name", &self.display_name)
            .field("backend", &self.backend)
            .finish()
    }
}

impl<B: LockBackend> fmt::Display for TrackedResourceLock<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}
