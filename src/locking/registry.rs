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

//! Per-thread bookkeeping shared by every lock registry.

use crate::error::{LockError, Result};
use crate::locking::lock::{ResourceLock, same_lock};
use crate::locking::thread::{ThreadHandle, lock_unpoisoned};
use log::trace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Lock state a registry tracks for one thread.
#[derive(Debug, Clone)]
pub struct ThreadLockDetails {
    /// Whether the thread may acquire or release locks of this registry.
    pub may_change: bool,
    /// Escape hatch for trusted code that must touch any resource.
    pub can_access_anything: bool,
    /// Locks currently held, in acquisition order.
    pub locks: Vec<Arc<dyn ResourceLock>>,
}

impl Default for ThreadLockDetails {
    fn default() -> Self {
        Self {
            may_change: true,
            can_access_anything: false,
            locks: Vec::new(),
        }
    }
}

impl ThreadLockDetails {
    fn is_idle(&self) -> bool {
        self.locks.is_empty() && self.may_change && !self.can_access_anything
    }

    fn flag(&self, flag: ThreadFlag) -> bool {
        match flag {
            ThreadFlag::MayChange => self.may_change,
            ThreadFlag::CanAccessAnything => self.can_access_anything,
        }
    }

    fn set_flag(&mut self, flag: ThreadFlag, value: bool) {
        match flag {
            ThreadFlag::MayChange => self.may_change = value,
            ThreadFlag::CanAccessAnything => self.can_access_anything = value,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ThreadFlag {
    MayChange,
    CanAccessAnything,
}

/// Tracks which locks each thread holds for one registry.
///
/// Entries are created on first access. An entry that holds no locks and carries default
/// flags is indistinguishable from a missing one, so such entries are retired.
#[derive(Debug)]
pub struct ThreadLockBook {
    name: String,
    threads: Mutex<HashMap<ThreadId, ThreadLockDetails>>,
}

impl ThreadLockBook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records `lock` as held by `thread`.
    pub fn lock_acquired(&self, thread: &ThreadHandle, lock: Arc<dyn ResourceLock>) -> Result<()> {
        self.with_details(thread.id(), |details| {
            if !details.may_change {
                return Err(disallowed(thread, "to acquire", lock.as_ref()));
            }
            if !details.locks.iter().any(|held| same_lock(held.as_ref(), lock.as_ref())) {
                details.locks.push(lock);
            }
            Ok(())
        })
    }

    pub fn ensure_may_change(&self, thread: &ThreadHandle, lock: &dyn ResourceLock) -> Result<()> {
        if self.may_change(thread.id()) {
            Ok(())
        } else {
            Err(disallowed(thread, "to release", lock))
        }
    }

    /// Forgets `lock` for `thread`. Callers check [`Self::ensure_may_change`] first.
    pub fn lock_released(&self, thread: &ThreadHandle, lock: &dyn ResourceLock) {
        self.with_details(thread.id(), |details| {
            details.locks.retain(|held| !same_lock(held.as_ref(), lock));
        });
    }

    pub fn locks_for(&self, thread: ThreadId) -> Vec<Arc<dyn ResourceLock>> {
        lock_unpoisoned(&self.threads)
            .get(&thread)
            .map(|details| details.locks.clone())
            .unwrap_or_default()
    }

    pub fn details_for(&self, thread: ThreadId) -> ThreadLockDetails {
        lock_unpoisoned(&self.threads)
            .get(&thread)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_open_locks(&self) -> bool {
        lock_unpoisoned(&self.threads)
            .values()
            .any(|details| !details.locks.is_empty())
    }

    pub fn may_change(&self, thread: ThreadId) -> bool {
        self.details_for(thread).may_change
    }

    pub fn can_access_anything(&self, thread: ThreadId) -> bool {
        self.details_for(thread).can_access_anything
    }

    /// Number of threads with a live entry.
    pub fn tracked_threads(&self) -> usize {
        lock_unpoisoned(&self.threads).len()
    }

    /// Runs `action` while the calling thread may not acquire or release locks of this
    /// registry. The previous setting is restored however `action` exits.
    pub fn while_disallowing_lock_changes<T>(&self, action: impl FnOnce() -> T) -> T {
        let _restore = self.override_flag(ThreadFlag::MayChange, false);
        action()
    }

    /// Runs `action` with the calling thread allowed to access any resource of this
    /// registry. Mutual exclusion is unaffected.
    pub fn allow_uncontrolled_access_to_any_resource<T>(&self, action: impl FnOnce() -> T) -> T {
        let _restore = self.override_flag(ThreadFlag::CanAccessAnything, true);
        action()
    }

    fn override_flag(&self, flag: ThreadFlag, value: bool) -> FlagRestore<'_> {
        let thread = thread::current().id();
        let previous = self.with_details(thread, |details| {
            let previous = details.flag(flag);
            details.set_flag(flag, value);
            previous
        });
        trace!("{}: {flag:?} set to {value} for {thread:?}", self.name);
        FlagRestore {
            book: self,
            thread,
            flag,
            previous,
        }
    }

    fn with_details<R>(&self, thread: ThreadId, f: impl FnOnce(&mut ThreadLockDetails) -> R) -> R {
        let mut threads = lock_unpoisoned(&self.threads);
        let details = threads.entry(thread).or_default();
        let result = f(details);
        if details.is_idle() {
            threads.remove(&thread);
        }
        result
    }
}

struct FlagRestore<'a> {
    book: &'a ThreadLockBook,
    thread: ThreadId,
    flag: ThreadFlag,
    previous: bool,
}

impl Drop for FlagRestore<'_> {
    fn drop(&mut self) {
        let (flag, previous) = (self.flag, self.previous);
        self.book
            .with_details(self.thread, |details| details.set_flag(flag, previous));
    }
}

fn disallowed(thread: &ThreadHandle, action: &str, lock: &dyn ResourceLock) -> LockError {
    LockError::LockChangesDisallowed {
        thread: thread.name().to_string(),
        lock: format!("{action} {}", lock.display_name()),
    }
}

/// A category of locks whose per-thread state the coordination service can inspect.
pub trait ResourceLockRegistry: Send + Sync {
    fn book(&self) -> &ThreadLockBook;

    fn resource_locks_by_thread(&self, thread: ThreadId) -> Vec<Arc<dyn ResourceLock>> {
        self.book().locks_for(thread)
    }

    fn resource_locks_by_current_thread(&self) -> Vec<Arc<dyn ResourceLock>> {
        self.resource_locks_by_thread(thread::current().id())
    }

    fn has_open_locks(&self) -> bool {
        self.book().has_open_locks()
    }

    fn may_attempt_to_change_locks(&self) -> bool {
        self.book().may_change(thread::current().id())
    }

    fn is_allowed_uncontrolled_access_to_any_resource(&self) -> bool {
        self.book().can_access_anything(thread::current().id())
    }
}
