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

/// Shared fixtures for driving a lease service from several threads
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use worklease::config::LockingConfig;
use worklease::locking::{
    MaxWorkersResolution, MaxWorkersSource, MaxWorkersValue, ResourceLock, WorkerLeaseService,
};

/// Creates a service with a fixed worker pool, independent of the environment.
#[allow(dead_code)]
pub fn service(max_workers: usize) -> WorkerLeaseService {
    service_with(max_workers, LockingConfig::default())
}

#[allow(dead_code)]
pub fn service_with(max_workers: usize, config: LockingConfig) -> WorkerLeaseService {
    let resolution = MaxWorkersResolution {
        value: MaxWorkersValue::fixed(max_workers).expect("pool size must be positive"),
        source: MaxWorkersSource::Config,
    };
    WorkerLeaseService::with_worker_pool(&config, resolution)
}

/// Collects locks into the slice shape the service operations take.
#[allow(dead_code)]
pub fn locks<const N: usize>(locks: [&Arc<dyn ResourceLock>; N]) -> Vec<Arc<dyn ResourceLock>> {
    locks.into_iter().cloned().collect()
}

/// Waits until `count` threads are parked waiting for locks.
///
/// # Panics
/// Panics after ten seconds, which means a waiter never blocked.
#[allow(dead_code)]
pub fn wait_for_blocked(service: &WorkerLeaseService, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.blocked_thread_count() < count {
        assert!(
            Instant::now() < deadline,
            "expected {count} blocked thread(s), found {}",
            service.blocked_thread_count()
        );
        thread::sleep(Duration::from_millis(5));
    }
}
