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

//! Scheduler-facing entry point tying the registries to one coordination service.

use crate::config::LockingConfig;
use crate::error::{LockError, Result};
use crate::locking::coordination::{Disposition, ResourceLockCoordinationService, describe_locks};
use crate::locking::lock::{ResourceLock, same_lock};
use crate::locking::operations;
use crate::locking::project::{BuildIdentifier, ProjectLockRegistry, ProjectPath};
use crate::locking::registry::ResourceLockRegistry;
use crate::locking::scoped_guard::ScopedLocks;
use crate::locking::shared_resource::SharedResourceLeaseRegistry;
use crate::locking::thread::ThreadHandle;
use crate::locking::wait_observer::LockWaitObserver;
use crate::locking::worker::WorkerLeaseRegistry;
use crate::locking::workers::MaxWorkersResolution;
use log::{debug, warn};
use std::sync::Arc;

type Locks = Vec<Arc<dyn ResourceLock>>;

/// Project locks, worker leases and shared resources behind one coordination service.
pub struct WorkerLeaseService {
    coordinator: ResourceLockCoordinationService,
    projects: Arc<ProjectLockRegistry>,
    workers: Arc<WorkerLeaseRegistry>,
    shared_resources: Arc<SharedResourceLeaseRegistry>,
    max_workers: MaxWorkersResolution,
}

impl WorkerLeaseService {
    /// Builds a service sized by the configuration and `WORKLEASE_MAX_WORKERS`.
    pub fn new(config: &LockingConfig) -> Result<Self> {
        let max_workers = config.resolve_max_workers()?;
        Ok(Self::with_worker_pool(config, max_workers))
    }

    /// Builds a service with an already resolved worker pool size.
    pub fn with_worker_pool(config: &LockingConfig, max_workers: MaxWorkersResolution) -> Self {
        let coordinator = ResourceLockCoordinationService::new(config.deadlock_detection);
        let projects = Arc::new(ProjectLockRegistry::new(config.parallel_projects));
        let workers = Arc::new(WorkerLeaseRegistry::new(max_workers.worker_count()));
        let shared_resources = Arc::new(SharedResourceLeaseRegistry::new());

        coordinator.register_registry(projects.clone());
        coordinator.register_registry(workers.clone());
        coordinator.register_registry(shared_resources.clone());

        debug!(
            "Worker lease service: {} workers ({}), parallel projects {}, deadlock detection {}",
            max_workers.worker_count(),
            max_workers.source,
            config.parallel_projects,
            config.deadlock_detection
        );

        Self {
            coordinator,
            projects,
            workers,
            shared_resources,
            max_workers,
        }
    }

    pub fn with_observer(self, observer: Arc<dyn LockWaitObserver>) -> Self {
        Self {
            coordinator: self.coordinator.with_observer(observer),
            ..self
        }
    }

    pub fn coordinator(&self) -> &ResourceLockCoordinationService {
        &self.coordinator
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.worker_count()
    }

    pub fn max_workers_resolution(&self) -> MaxWorkersResolution {
        self.max_workers
    }

    pub fn project_lock(&self, build: &BuildIdentifier, path: &ProjectPath) -> Arc<dyn ResourceLock> {
        self.projects.project_lock(build, path)
    }

    pub fn all_projects_lock(&self, build: &BuildIdentifier) -> Arc<dyn ResourceLock> {
        self.projects.all_projects_lock(build)
    }

    /// A fresh, unlocked lease on the worker pool.
    pub fn worker_lease(&self) -> Arc<dyn ResourceLock> {
        self.workers.new_worker_lease()
    }

    pub fn shared_resources(&self) -> &SharedResourceLeaseRegistry {
        &self.shared_resources
    }

    pub fn register_shared_resource(&self, name: &str, capacity: usize) -> Result<()> {
        self.shared_resources.register_shared_resource(name, capacity)
    }

    pub fn shared_resource_lock(&self, name: &str, permits: usize) -> Result<Arc<dyn ResourceLock>> {
        let lock = self.shared_resources.resource_lock(name, permits)?;
        Ok(lock as Arc<dyn ResourceLock>)
    }

    /// Blocks until every lock is held by the calling thread.
    pub fn acquire_locks(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<()> {
        self.coordinator
            .with_state_lock(operations::lock(locks))
            .map(|_| ())
    }

    /// Acquires every lock or none without blocking.
    pub fn try_acquire_locks(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<bool> {
        self.coordinator.with_state_lock(operations::try_lock(locks))
    }

    pub fn release_locks(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<()> {
        self.coordinator
            .with_state_lock(operations::unlock(locks))
            .map(|_| ())
    }

    /// Acquires `locks` and returns a guard releasing them on drop.
    pub fn acquire_scoped(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<ScopedLocks<'_>> {
        self.acquire_locks(locks)?;
        Ok(ScopedLocks::new(&self.coordinator, locks.to_vec()))
    }

    /// Runs `action` holding `locks`. Locks already held stay held afterwards.
    pub fn with_locks<T>(
        &self,
        locks: &[Arc<dyn ResourceLock>],
        action: impl FnOnce() -> T,
    ) -> Result<T> {
        let missing = self.locks_not_held(locks)?;
        if missing.is_empty() {
            return Ok(action());
        }

        let scoped = self.acquire_scoped(&missing)?;
        let value = action();
        scoped.release()?;
        Ok(value)
    }

    /// Runs `action` with `locks` temporarily released, then takes them back.
    ///
    /// If the locks are contended on the way back, the caller's worker leases are given up
    /// while waiting and reacquired together with `locks`.
    pub fn without_locks<T>(
        &self,
        locks: &[Arc<dyn ResourceLock>],
        action: impl FnOnce() -> T,
    ) -> Result<T> {
        if locks.is_empty() {
            return Ok(action());
        }

        let missing = self.locks_not_held(locks)?;
        if !missing.is_empty() {
            return Err(LockError::NotHeldByCurrentThread {
                locks: describe_locks(&missing),
            });
        }

        self.release_locks(locks)?;
        let mut pending = Reacquire {
            service: self,
            locks,
            armed: true,
        };
        let value = action();
        pending.finish()?;
        Ok(value)
    }

    /// Runs `action` without the calling thread's project locks.
    pub fn without_project_lock<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        let locks = self.current_project_locks();
        self.without_locks(&locks, action)
    }

    /// Runs `action` holding a worker lease, reusing one the caller already holds.
    pub fn run_as_worker_thread<T>(&self, action: impl FnOnce() -> T) -> Result<T> {
        if !self.current_worker_leases().is_empty() {
            return Ok(action());
        }
        let lease = [self.worker_lease()];
        self.with_locks(&lease, action)
    }

    pub fn current_project_locks(&self) -> Locks {
        self.projects.current_project_locks()
    }

    pub fn current_worker_leases(&self) -> Locks {
        self.workers.resource_locks_by_current_thread()
    }

    /// Every lock the calling thread holds, across all registries.
    pub fn resource_locks_by_current_thread(&self) -> Locks {
        let mut locks = self.projects.resource_locks_by_current_thread();
        locks.extend(self.workers.resource_locks_by_current_thread());
        locks.extend(self.shared_resources.resource_locks_by_current_thread());
        locks
    }

    /// Runs `action` with project lock changes forbidden on the calling thread.
    pub fn while_disallowing_project_lock_changes<T>(&self, action: impl FnOnce() -> T) -> T {
        self.projects.book().while_disallowing_lock_changes(action)
    }

    /// Runs `action` with access to every project granted without holding its lock.
    pub fn allow_uncontrolled_access_to_any_project<T>(&self, action: impl FnOnce() -> T) -> T {
        self.projects
            .book()
            .allow_uncontrolled_access_to_any_resource(action)
    }

    pub fn is_allowed_uncontrolled_access_to_any_project(&self) -> bool {
        self.projects
            .is_allowed_uncontrolled_access_to_any_resource()
    }

    /// Fails unless the calling thread may touch the project's mutable state.
    pub fn assert_has_project_access(
        &self,
        build: &BuildIdentifier,
        path: &ProjectPath,
    ) -> Result<()> {
        if self.is_allowed_uncontrolled_access_to_any_project() {
            return Ok(());
        }

        let project = self.project_lock(build, path);
        let all_projects = self.all_projects_lock(build);
        let held = self.current_project_locks();
        let has_access = held.iter().any(|lock| {
            same_lock(lock.as_ref(), project.as_ref())
                || same_lock(lock.as_ref(), all_projects.as_ref())
        });
        if has_access {
            return Ok(());
        }

        Err(LockError::ProjectAccessDenied {
            thread: ThreadHandle::current().name().to_string(),
            project: project.display_name().to_string(),
        })
    }

    pub fn blocked_thread_count(&self) -> usize {
        self.coordinator.blocked_thread_count()
    }

    /// The subset of `locks` the calling thread does not hold.
    fn locks_not_held(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<Locks> {
        let mut missing = Vec::new();
        self.coordinator.with_state_lock(|state| {
            missing = locks
                .iter()
                .filter(|lock| !lock.is_locked_by_current_thread(state))
                .cloned()
                .collect();
            Ok(Disposition::Finished)
        })?;
        Ok(missing)
    }

    fn reacquire(&self, locks: &[Arc<dyn ResourceLock>]) -> Result<()> {
        if self.try_acquire_locks(locks)? {
            return Ok(());
        }

        let leases: Locks = self
            .current_worker_leases()
            .into_iter()
            .filter(|lease| !locks.iter().any(|lock| same_lock(lock.as_ref(), lease.as_ref())))
            .collect();
        if leases.is_empty() {
            return self.acquire_locks(locks);
        }

        debug!(
            "{} gives up {} worker lease(s) while waiting for {}",
            ThreadHandle::current(),
            leases.len(),
            describe_locks(locks)
        );
        self.release_locks(&leases)?;
        let mut all = locks.to_vec();
        all.extend(leases);
        self.acquire_locks(&all)
    }
}

/// Takes released locks back, also when the action in between panics.
struct Reacquire<'s, 'l> {
    service: &'s WorkerLeaseService,
    locks: &'l [Arc<dyn ResourceLock>],
    armed: bool,
}

impl Reacquire<'_, '_> {
    fn finish(&mut self) -> Result<()> {
        self.armed = false;
        self.service.reacquire(self.locks)
    }
}

impl Drop for Reacquire<'_, '_> {
    fn drop(&mut self) {
        if self.armed
            && let Err(err) = self.service.reacquire(self.locks)
        {
            warn!("Failed to reacquire {}: {err}", describe_locks(self.locks));
        }
    }
}
