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

//! Observer interfaces for lock wait instrumentation.
//!
//! Lock wait observers decouple the coordination service from whatever reports
//! contention, so callers can surface waits without polling lock state themselves.

use crate::locking::coordination::describe_locks;
use crate::locking::deadlock::DeadlockReport;
use crate::locking::lock::ResourceLock;
use crate::locking::thread::ThreadHandle;
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Observer hooks for lock wait events.
///
/// Hooks run inside the coordination critical section and must not call back into the
/// service.
pub trait LockWaitObserver: Send + Sync {
    /// A thread started waiting for `locks`.
    fn on_wait_start(&self, _thread: &ThreadHandle, _locks: &[Arc<dyn ResourceLock>]) {}

    /// A waiting thread was woken and failed again.
    fn on_retry(&self, _thread: &ThreadHandle, _attempt: usize) {}

    /// A thread that had to wait finally acquired its locks.
    fn on_acquired(&self, _thread: &ThreadHandle, _attempts: usize) {}

    /// Waiting would never end.
    fn on_deadlock(&self, _thread: &ThreadHandle, _report: &DeadlockReport) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Reports waits through the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingLockWaitObserver {
    notified_contention: AtomicBool,
}

impl LoggingLockWaitObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockWaitObserver for LoggingLockWaitObserver {
    fn on_wait_start(&self, thread: &ThreadHandle, locks: &[Arc<dyn ResourceLock>]) {
        let labels = describe_locks(locks);
        if !self.notified_contention.swap(true, Ordering::Relaxed) {
            info!("Lock contention detected: {thread} is waiting for {labels}");
        } else {
            info!("{thread} is waiting for {labels}");
        }
    }

    fn on_retry(&self, thread: &ThreadHandle, attempt: usize) {
        if attempt % 10 == 0 {
            info!("{thread} is still waiting for locks (attempt {attempt})");
        }
    }

    fn on_acquired(&self, thread: &ThreadHandle, attempts: usize) {
        info!("{thread} acquired its locks after {attempts} wait(s)");
    }

    fn on_deadlock(&self, thread: &ThreadHandle, report: &DeadlockReport) {
        warn!("{thread} would wait forever:\n{report}");
    }
}
