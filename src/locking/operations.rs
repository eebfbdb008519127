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

//! Ready-made transforms for [`ResourceLockCoordinationService::with_state_lock`].
//!
//! [`ResourceLockCoordinationService::with_state_lock`]:
//!     crate::locking::ResourceLockCoordinationService::with_state_lock

use crate::error::Result;
use crate::locking::coordination::{Disposition, ResourceLockState};
use crate::locking::lock::ResourceLock;
use std::sync::Arc;

/// Acquires every lock or none, waiting until all are available.
pub fn lock(
    locks: &[Arc<dyn ResourceLock>],
) -> impl FnMut(&mut ResourceLockState<'_>) -> Result<Disposition> + '_ {
    move |state| {
        Ok(if try_all(locks, state)? {
            Disposition::Finished
        } else {
            Disposition::Retry
        })
    }
}

/// Acquires every lock or none without waiting.
pub fn try_lock(
    locks: &[Arc<dyn ResourceLock>],
) -> impl FnMut(&mut ResourceLockState<'_>) -> Result<Disposition> + '_ {
    move |state| {
        Ok(if try_all(locks, state)? {
            Disposition::Finished
        } else {
            Disposition::Failed
        })
    }
}

/// Releases every lock the calling thread holds among `locks`.
pub fn unlock(
    locks: &[Arc<dyn ResourceLock>],
) -> impl FnMut(&mut ResourceLockState<'_>) -> Result<Disposition> + '_ {
    move |state| {
        for lock in locks {
            lock.unlock(state)?;
        }
        Ok(Disposition::Finished)
    }
}

// Every lock is attempted so a waiting attempt reports all of its failures.
fn try_all(locks: &[Arc<dyn ResourceLock>], state: &mut ResourceLockState<'_>) -> Result<bool> {
    let mut acquired = true;
    for lock in locks {
        acquired &= lock.try_lock(state)?;
    }
    Ok(acquired)
}
