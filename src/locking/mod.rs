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

pub mod cache;
pub mod coordination;
pub mod deadlock;
pub mod exclusive;
pub mod lock;
pub mod operations;
pub mod project;
pub mod registry;
pub mod scoped_guard;
pub mod service;
pub mod shared_resource;
pub mod thread;
pub mod wait_observer;
pub mod worker;
pub mod workers;

pub use cache::LockCache;
pub use coordination::{Disposition, ResourceLockCoordinationService, ResourceLockState};
pub use deadlock::{BlockedThread, DeadlockDetector, DeadlockReport, WaitEdge};
pub use exclusive::{ExclusiveAccess, ExclusiveLock};
pub use lock::{Contention, LockBackend, PoolId, PoolRef, ResourceLock, TrackedResourceLock, same_lock};
pub use project::{BuildIdentifier, ProjectLockRegistry, ProjectPath};
pub use registry::{ResourceLockRegistry, ThreadLockBook, ThreadLockDetails};
pub use scoped_guard::ScopedLocks;
pub use service::WorkerLeaseService;
pub use shared_resource::{
    SharedResource, SharedResourceLeaseRegistry, SharedResourceLock, SharedResourcePermits,
};
pub use thread::ThreadHandle;
pub use wait_observer::{LockWaitObserver, LoggingLockWaitObserver, NoopLockWaitObserver};
pub use worker::{Lease, LeaseHolder, PooledLease, WorkerLease, WorkerLeaseRegistry};
pub use workers::{
    MaxWorkersParseError, MaxWorkersResolution, MaxWorkersResolver, MaxWorkersSource,
    MaxWorkersValue, parse_max_workers,
};
