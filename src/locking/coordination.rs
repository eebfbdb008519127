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

//! Serializes every lock state transition behind one critical section.
//!
//! Callers submit transforms through [`ResourceLockCoordinationService::with_state_lock`].
//! A transform tries and releases locks, then reports a [`Disposition`]. Locks newly
//! acquired by an attempt that does not finish are rolled back. A `Retry` attempt blocks
//! until some lock anywhere is released and then runs again from scratch, after the
//! deadlock detector has confirmed the wait can end.

use crate::error::{LockError, Result};
use crate::locking::deadlock::{BlockedThread, DeadlockDetector};
use crate::locking::lock::{ResourceLock, same_lock};
use crate::locking::registry::ResourceLockRegistry;
use crate::locking::thread::{ThreadHandle, lock_unpoisoned};
use crate::locking::wait_observer::{LockWaitObserver, NoopLockWaitObserver};
use log::{debug, info, warn};
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;

/// Outcome a transform reports for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep every lock change and return `true`.
    Finished,
    /// Roll back and return `false`.
    Failed,
    /// Roll back, wait for a lock to be released anywhere, then run again.
    Retry,
}

/// Locks touched by one transform attempt.
///
/// Only the coordination service creates states, so holding one proves the caller is
/// inside the critical section.
pub struct ResourceLockState<'a> {
    service: &'a ResourceLockCoordinationService,
    locked: Vec<Arc<dyn ResourceLock>>,
    failures: Vec<Arc<dyn ResourceLock>>,
}

impl<'a> ResourceLockState<'a> {
    fn new(service: &'a ResourceLockCoordinationService) -> Self {
        Self {
            service,
            locked: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn register_locked(&mut self, lock: Arc<dyn ResourceLock>) {
        self.locked.push(lock);
    }

    pub fn register_failed(&mut self, lock: Arc<dyn ResourceLock>) {
        if !self
            .failures
            .iter()
            .any(|failed| same_lock(failed.as_ref(), lock.as_ref()))
        {
            self.failures.push(lock);
        }
    }

    pub(crate) fn register_unlocked(&mut self, lock: &dyn ResourceLock) {
        self.locked.retain(|held| !same_lock(held.as_ref(), lock));
    }

    /// Locks acquired during this attempt that would be rolled back.
    pub fn newly_locked(&self) -> &[Arc<dyn ResourceLock>] {
        &self.locked
    }

    /// Locks this attempt failed to acquire.
    pub fn failures(&self) -> &[Arc<dyn ResourceLock>] {
        &self.failures
    }

    pub fn notify_state_change(&self) {
        self.service.notify_state_change();
    }

    fn release_locks(&mut self) -> Result<()> {
        let locked = std::mem::take(&mut self.locked);
        for lock in locked.iter().rev() {
            lock.unlock(self)?;
        }
        Ok(())
    }
}

thread_local! {
    static IN_TRANSFORM: Cell<bool> = const { Cell::new(false) };
}

struct TransformScope;

impl TransformScope {
    fn enter() -> Self {
        IN_TRANSFORM.with(|flag| flag.set(true));
        TransformScope
    }
}

impl Drop for TransformScope {
    fn drop(&mut self) {
        IN_TRANSFORM.with(|flag| flag.set(false));
    }
}

struct CoordinationState {
    registries: Vec<Arc<dyn ResourceLockRegistry>>,
    blocked: HashMap<ThreadId, BlockedThread>,
}

impl CoordinationState {
    fn locks_held_by(&self, thread: &ThreadHandle) -> Vec<Arc<dyn ResourceLock>> {
        self.registries
            .iter()
            .flat_map(|registry| registry.resource_locks_by_thread(thread.id()))
            .collect()
    }
}

/// Runs lock transforms one at a time and parks threads whose transforms must retry.
pub struct ResourceLockCoordinationService {
    state: Mutex<CoordinationState>,
    state_changed: Condvar,
    deadlock_detection: bool,
    observer: Arc<dyn LockWaitObserver>,
}

impl ResourceLockCoordinationService {
    pub fn new(deadlock_detection: bool) -> Self {
        Self {
            state: Mutex::new(CoordinationState {
                registries: Vec::new(),
                blocked: HashMap::new(),
            }),
            state_changed: Condvar::new(),
            deadlock_detection,
            observer: Arc::new(NoopLockWaitObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LockWaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Makes the per-thread state of `registry` visible to deadlock detection.
    pub fn register_registry(&self, registry: Arc<dyn ResourceLockRegistry>) {
        lock_unpoisoned(&self.state).registries.push(registry);
    }

    /// Whether the calling thread is currently running a transform.
    pub fn is_within_transform() -> bool {
        IN_TRANSFORM.with(Cell::get)
    }

    /// Number of threads parked waiting for a lock.
    pub fn blocked_thread_count(&self) -> usize {
        lock_unpoisoned(&self.state).blocked.len()
    }

    /// Wakes every thread parked in a retrying transform.
    pub fn notify_state_change(&self) {
        self.state_changed.notify_all();
    }

    /// Runs `transform` with exclusive access to all lock state.
    ///
    /// Returns `Ok(true)` when the transform finishes and `Ok(false)` when it fails. A
    /// transform error or panic rolls back the attempt before propagating. A detected
    /// deadlock ends the wait with [`LockError::Deadlock`].
    pub fn with_state_lock<F>(&self, mut transform: F) -> Result<bool>
    where
        F: FnMut(&mut ResourceLockState<'_>) -> Result<Disposition>,
    {
        let thread = ThreadHandle::current();
        if Self::is_within_transform() {
            return Err(LockError::NestedStateLock(thread.name().to_string()));
        }

        let mut guard = lock_unpoisoned(&self.state);
        let mut attempts = 0usize;

        let result = loop {
            let mut state = ResourceLockState::new(self);
            let outcome = {
                let _scope = TransformScope::enter();
                panic::catch_unwind(AssertUnwindSafe(|| transform(&mut state)))
            };

            let disposition = match outcome {
                Ok(Ok(disposition)) => disposition,
                Ok(Err(err)) => {
                    if let Err(rollback) = state.release_locks() {
                        warn!("Failed to roll back locks after transform error: {rollback}");
                    }
                    break Err(err);
                }
                Err(payload) => {
                    if let Err(rollback) = state.release_locks() {
                        warn!("Failed to roll back locks after transform panic: {rollback}");
                    }
                    guard.blocked.remove(&thread.id());
                    drop(guard);
                    panic::resume_unwind(payload);
                }
            };

            match disposition {
                Disposition::Finished => {
                    if attempts > 0 {
                        self.observer.on_acquired(&thread, attempts);
                    }
                    break Ok(true);
                }
                Disposition::Failed => break state.release_locks().map(|()| false),
                Disposition::Retry => {
                    if let Err(err) = state.release_locks() {
                        break Err(err);
                    }

                    let waiting = BlockedThread::new(
                        thread.clone(),
                        guard.locks_held_by(&thread),
                        state.failures().to_vec(),
                    );
                    guard.blocked.insert(thread.id(), waiting.clone());

                    if self.deadlock_detection && !waiting.failures().is_empty() {
                        let detector = DeadlockDetector::new(&guard.blocked);
                        if let Some(report) = detector.check_for_deadlocks(&state, &waiting) {
                            info!("Deadlock detected for {thread}:\n{report}");
                            self.observer.on_deadlock(&thread, &report);
                            break Err(LockError::Deadlock(report));
                        }
                    }

                    if attempts == 0 {
                        debug!(
                            "{thread} waiting for {}",
                            describe_locks(waiting.failures())
                        );
                        self.observer.on_wait_start(&thread, waiting.failures());
                    } else {
                        self.observer.on_retry(&thread, attempts);
                    }
                    attempts += 1;

                    drop(state);
                    guard = self
                        .state_changed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        };

        guard.blocked.remove(&thread.id());
        result
    }
}

impl Default for ResourceLockCoordinationService {
    fn default() -> Self {
        Self::new(true)
    }
}

pub(crate) fn describe_locks(locks: &[Arc<dyn ResourceLock>]) -> String {
    locks
        .iter()
        .map(|lock| lock.display_name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::operations;
    use crate::locking::project::{BuildIdentifier, ProjectLockRegistry, ProjectPath};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn project(registry: &ProjectLockRegistry, path: &str) -> Arc<dyn ResourceLock> {
        registry.project_lock(&BuildIdentifier::root(), &ProjectPath::new(path))
    }

    fn is_locked(service: &ResourceLockCoordinationService, lock: &Arc<dyn ResourceLock>) -> bool {
        service
            .with_state_lock(|state| {
                Ok(if lock.is_locked(state) {
                    Disposition::Finished
                } else {
                    Disposition::Failed
                })
            })
            .unwrap()
    }

    fn wait_for_blocked(service: &ResourceLockCoordinationService, count: usize) {
        while service.blocked_thread_count() < count {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn finished_keeps_locks() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let app = project(&registry, ":app");

        let finished = service
            .with_state_lock(|state| {
                assert!(ResourceLockCoordinationService::is_within_transform());
                assert!(app.try_lock(state)?);
                assert!(app.is_locked_by_current_thread(state));
                Ok(Disposition::Finished)
            })
            .unwrap();
        assert!(finished);
        assert!(!ResourceLockCoordinationService::is_within_transform());
        assert!(is_locked(&service, &app));
    }

    #[test]
    fn failed_rolls_back_new_locks_only() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let app = project(&registry, ":app");
        let lib = project(&registry, ":lib");
        service
            .with_state_lock(operations::lock(std::slice::from_ref(&app)))
            .unwrap();

        let finished = service
            .with_state_lock(|state| {
                assert!(app.try_lock(state)?);
                assert!(lib.try_lock(state)?);
                assert_eq!(state.newly_locked().len(), 1);
                Ok(Disposition::Failed)
            })
            .unwrap();
        assert!(!finished);
        assert!(is_locked(&service, &app));
        assert!(!is_locked(&service, &lib));
    }

    #[test]
    fn transform_error_rolls_back_and_propagates() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let app = project(&registry, ":app");

        let err = service
            .with_state_lock(|state| {
                app.try_lock(state)?;
                Err(LockError::UnsupportedOperation("boom".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, LockError::UnsupportedOperation(_)));
        assert!(!is_locked(&service, &app));
    }

    #[test]
    fn transform_panic_rolls_back_and_resumes() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let app = project(&registry, ":app");

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            service.with_state_lock(|state| {
                app.try_lock(state)?;
                panic!("transform exploded");
            })
        }));
        assert!(result.is_err());
        assert!(!ResourceLockCoordinationService::is_within_transform());
        assert!(!is_locked(&service, &app));
        assert!(registry.current_project_locks().is_empty());
    }

    #[test]
    fn nested_transforms_are_rejected() {
        let service = ResourceLockCoordinationService::new(true);
        let err = service
            .with_state_lock(|_| {
                service.with_state_lock(|_| Ok(Disposition::Finished))?;
                Ok(Disposition::Finished)
            })
            .unwrap_err();
        assert!(matches!(err, LockError::NestedStateLock(_)));
    }

    #[test]
    fn retry_waits_until_lock_is_released() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = Arc::new(ProjectLockRegistry::new(true));
        service.register_registry(registry.clone());
        let app = project(&registry, ":app");
        let locks = [app.clone()];
        let acquired = AtomicBool::new(false);

        service.with_state_lock(operations::lock(&locks)).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                service.with_state_lock(operations::lock(&locks)).unwrap();
                acquired.store(true, Ordering::SeqCst);
                service.with_state_lock(operations::unlock(&locks)).unwrap();
            });

            wait_for_blocked(&service, 1);
            assert!(!acquired.load(Ordering::SeqCst));
            service.with_state_lock(operations::unlock(&locks)).unwrap();
            waiter.join().unwrap();
        });

        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(service.blocked_thread_count(), 0);
        assert!(!is_locked(&service, &app));
    }

    #[test]
    fn concurrent_try_lock_has_single_winner() {
        let service = ResourceLockCoordinationService::new(true);
        let registry = ProjectLockRegistry::new(true);
        let app = project(&registry, ":app");
        let locks = [app];
        let winners = AtomicUsize::new(0);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if service.with_state_lock(operations::try_lock(&locks)).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
