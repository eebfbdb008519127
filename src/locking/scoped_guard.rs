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
use crate::locking::coordination::{ResourceLockCoordinationService, describe_locks};
use crate::locking::lock::ResourceLock;
use crate::locking::operations;
use log::warn;
use std::marker::PhantomData;
use std::sync::Arc;

/// RAII guard that releases a set of locks when dropped.
///
/// Locks belong to the thread that acquired them, so the guard is not `Send`.
pub struct ScopedLocks<'a> {
    coordinator: &'a ResourceLockCoordinationService,
    locks: Vec<Arc<dyn ResourceLock>>,
    _owner_thread: PhantomData<*const ()>,
}

impl<'a> ScopedLocks<'a> {
    /// Wraps locks the calling thread already holds.
    pub fn new(
        coordinator: &'a ResourceLockCoordinationService,
        locks: Vec<Arc<dyn ResourceLock>>,
    ) -> Self {
        Self {
            coordinator,
            locks,
            _owner_thread: PhantomData,
        }
    }

    pub fn locks(&self) -> &[Arc<dyn ResourceLock>] {
        &self.locks
    }

    pub fn release(mut self) -> Result<()> {
        let locks = std::mem::take(&mut self.locks);
        self.coordinator
            .with_state_lock(operations::unlock(&locks))
            .map(|_| ())
    }
}

impl Drop for ScopedLocks<'_> {
    fn drop(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let locks = std::mem::take(&mut self.locks);
        if let Err(err) = self.coordinator.with_state_lock(operations::unlock(&locks)) {
            warn!("Failed to release {}: {err}", describe_locks(&locks));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::project::{BuildIdentifier, ProjectLockRegistry, ProjectPath};
    use crate::locking::registry::ResourceLockRegistry;

    fn acquire<'a>(
        service: &'a ResourceLockCoordinationService,
        registry: &ProjectLockRegistry,
    ) -> ScopedLocks<'a> {
        let locks: Vec<Arc<dyn ResourceLock>> =
            vec![registry.project_lock(&BuildIdentifier::root(), &ProjectPath::new(":app"))];
        assert!(service.with_state_lock(operations::lock(&locks)).unwrap());
        ScopedLocks::new(service, locks)
    }

    #[test]
    fn guard_drop_releases_locks() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        {
            let guard = acquire(&service, &registry);
            assert_eq!(guard.locks().len(), 1);
            assert_eq!(registry.resource_locks_by_current_thread().len(), 1);
        }
        assert!(registry.resource_locks_by_current_thread().is_empty());
    }

    #[test]
    fn explicit_release_returns_ok() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let guard = acquire(&service, &registry);
        guard.release().unwrap();
        assert!(registry.resource_locks_by_current_thread().is_empty());
    }

    #[test]
    fn failed_release_on_drop_keeps_locks() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let guard = acquire(&service, &registry);
        registry
            .book()
            .while_disallowing_lock_changes(|| drop(guard));
        assert_eq!(registry.resource_locks_by_current_thread().len(), 1);
    }
}
