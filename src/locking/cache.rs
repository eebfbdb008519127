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

use crate::locking::thread::lock_unpoisoned;
use log::trace;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

/// Weakly-referenced cache handing out one lock instance per key.
///
/// An instance lives as long as someone (a caller or a registry tracking it as held)
/// keeps a strong reference; afterwards the next lookup builds a fresh, unlocked one.
#[derive(Debug)]
pub struct LockCache<K, L> {
    entries: Mutex<HashMap<K, Weak<L>>>,
}

impl<K, L> LockCache<K, L>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &K, producer: impl FnOnce(&K) -> Arc<L>) -> Arc<L> {
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        entries.retain(|_, lock| lock.strong_count() > 0);
        trace!("Creating lock for {key:?}");
        let lock = producer(key);
        entries.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    pub fn get(&self, key: &K) -> Option<Arc<L>> {
        lock_unpoisoned(&self.entries)
            .get(key)
            .and_then(Weak::upgrade)
    }

    /// Live lock instances.
    pub fn values(&self) -> Vec<Arc<L>> {
        lock_unpoisoned(&self.entries)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl<K, L> Default for LockCache<K, L>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_same_instance_per_key() {
        let cache: LockCache<String, String> = LockCache::new();
        let first = cache.get_or_create(&"a".to_string(), |key| Arc::new(key.clone()));
        let second = cache.get_or_create(&"a".to_string(), |_| Arc::new("other".to_string()));
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.get_or_create(&"b".to_string(), |key| Arc::new(key.clone()));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.values().len(), 2);
    }

    #[test]
    fn recreates_dropped_entries() {
        let cache: LockCache<u32, String> = LockCache::new();
        let first = cache.get_or_create(&1, |_| Arc::new("first".to_string()));
        drop(first);
        assert!(cache.get(&1).is_none());

        let second = cache.get_or_create(&1, |_| Arc::new("second".to_string()));
        assert_eq!(second.as_str(), "second");
        assert_eq!(cache.values().len(), 1);
    }
}
