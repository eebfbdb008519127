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

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Stable identity of a thread, carrying its name for diagnostics.
///
/// Equality and hashing only consider the thread id.
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    id: ThreadId,
    name: Arc<str>,
}

impl ThreadHandle {
    pub fn current() -> Self {
        let current = thread::current();
        let name = match current.name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("{:?}", current.id())),
        };
        Self {
            id: current.id(),
            name,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        self.id == thread::current().id()
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadHandle {}

impl Hash for ThreadHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Locks a mutex, recovering the data if a panicking transform poisoned it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_threads_report_their_name() {
        let handle = thread::Builder::new()
            .name("worker-7".to_string())
            .spawn(ThreadHandle::current)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(handle.name(), "worker-7");
        assert!(!handle.is_current());
    }

    #[test]
    fn equality_ignores_name() {
        let here = ThreadHandle::current();
        let again = ThreadHandle::current();
        assert_eq!(here, again);
        assert!(here.is_current());
    }
}
