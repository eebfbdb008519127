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

use crate::locking::cache::LockCache;
use crate::locking::exclusive::{ExclusiveAccess, ExclusiveLock};
use crate::locking::lock::ResourceLock;
use crate::locking::registry::{ResourceLockRegistry, ThreadLockBook};
use std::fmt;
use std::sync::Arc;

/// Identifies a build whose projects are locked together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildIdentifier(String);

impl BuildIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn root() -> Self {
        Self::new(":")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of a project within its build, e.g. `:app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectPath(String);

impl ProjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Project and all-projects locks of every build.
///
/// With parallel project execution disabled, every project of a build shares the build's
/// all-projects lock.
#[derive(Debug)]
pub struct ProjectLockRegistry {
    parallel: bool,
    projects: LockCache<(BuildIdentifier, ProjectPath), ExclusiveLock>,
    builds: LockCache<BuildIdentifier, ExclusiveLock>,
    book: Arc<ThreadLockBook>,
}

impl ProjectLockRegistry {
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            projects: LockCache::new(),
            builds: LockCache::new(),
            book: Arc::new(ThreadLockBook::new("project locks")),
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn all_projects_lock(&self, build: &BuildIdentifier) -> Arc<ExclusiveLock> {
        self.builds.get_or_create(build, |build| {
            ExclusiveLock::new(
                format!("state of build {build}"),
                ExclusiveAccess::new(),
                self.book.clone(),
            )
        })
    }

    pub fn project_lock(&self, build: &BuildIdentifier, path: &ProjectPath) -> Arc<ExclusiveLock> {
        if !self.parallel {
            return self.all_projects_lock(build);
        }

        let key = (build.clone(), path.clone());
        self.projects.get_or_create(&key, |(build, path)| {
            let gate = self.all_projects_lock(build);
            ExclusiveLock::new(
                format!("state of project {path} in build {build}"),
                ExclusiveAccess::gated_by(gate),
                self.book.clone(),
            )
        })
    }

    /// Project and all-projects locks held by the calling thread.
    pub fn current_project_locks(&self) -> Vec<Arc<dyn ResourceLock>> {
        self.resource_locks_by_current_thread()
    }
}

impl ResourceLockRegistry for ProjectLockRegistry {
    fn book(&self) -> &ThreadLockBook {
        &self.book
    }
}
