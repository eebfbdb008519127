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

//! Wait-for cycle detection across exclusive locks and capacity pools.
//!
//! Edges run from a blocked thread to whatever stands in the way of a lock it failed to
//! acquire. For an exclusive lock that is its owner. For a pooled lock it is the set of
//! blocked threads holding units of the same pool, but only once the pool is stuck: the
//! units held by blocked threads leave too few for the request even after every running
//! holder finishes.

use crate::locking::coordination::ResourceLockState;
use crate::locking::lock::{Contention, PoolRef, ResourceLock};
use crate::locking::thread::ThreadHandle;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

/// Snapshot of a thread parked in a retrying transform.
#[derive(Debug, Clone)]
pub struct BlockedThread {
    thread: ThreadHandle,
    held: Vec<Arc<dyn ResourceLock>>,
    failures: Vec<Arc<dyn ResourceLock>>,
}

impl BlockedThread {
    pub fn new(
        thread: ThreadHandle,
        held: Vec<Arc<dyn ResourceLock>>,
        failures: Vec<Arc<dyn ResourceLock>>,
    ) -> Self {
        Self {
            thread,
            held,
            failures,
        }
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn held(&self) -> &[Arc<dyn ResourceLock>] {
        &self.held
    }

    pub fn failures(&self) -> &[Arc<dyn ResourceLock>] {
        &self.failures
    }
}

/// One step of a wait-for cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEdge {
    pub thread: ThreadHandle,
    pub lock: String,
    pub holders: Vec<ThreadHandle>,
}

/// A confirmed wait-for cycle, starting at the thread that detected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockReport {
    edges: Vec<WaitEdge>,
}

impl DeadlockReport {
    pub fn new(edges: Vec<WaitEdge>) -> Self {
        Self { edges }
    }

    pub fn edges(&self) -> &[WaitEdge] {
        &self.edges
    }

    /// Threads taking part in the cycle, in walk order and without repeats.
    pub fn threads(&self) -> Vec<ThreadHandle> {
        let mut threads: Vec<ThreadHandle> = Vec::new();
        for edge in &self.edges {
            for thread in std::iter::once(&edge.thread).chain(&edge.holders) {
                if !threads.contains(thread) {
                    threads.push(thread.clone());
                }
            }
        }
        threads
    }
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, edge) in self.edges.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            let holders = edge
                .holders
                .iter()
                .map(|holder| format!("thread '{holder}'"))
                .collect::<Vec<_>>()
                .join(", ");
            write!(
                f,
                "Thread '{}' is trying to get a lock on {} which is held by {holders}",
                edge.thread, edge.lock
            )?;
        }
        Ok(())
    }
}

/// Searches the wait-for graph formed by the currently blocked threads.
pub struct DeadlockDetector<'a> {
    blocked: &'a HashMap<ThreadId, BlockedThread>,
}

impl<'a> DeadlockDetector<'a> {
    pub fn new(blocked: &'a HashMap<ThreadId, BlockedThread>) -> Self {
        Self { blocked }
    }

    /// Returns the cycle through `current` if waiting on its failed locks can never end.
    ///
    /// `current` must already be part of the blocked set, since the pool checks count
    /// its held units.
    pub fn check_for_deadlocks(
        &self,
        state: &ResourceLockState<'_>,
        current: &BlockedThread,
    ) -> Option<DeadlockReport> {
        let stuck = StuckThreads::settle(self.blocked, state);
        if !stuck.contains(current.thread.id()) {
            return None;
        }
        Some(
            stuck
                .cycle_from(current)
                .unwrap_or_else(|| stuck.chain_from(current)),
        )
    }
}

/// The largest set of blocked threads that keep each other blocked.
///
/// A thread stays in the set while at least one of its failed locks is kept from it by
/// members of the set: an exclusive lock owned by a member, or a pool whose units held
/// by members leave too few for the request. Starting from every blocked thread and
/// dropping the ones that can still proceed converges to the same set whichever thread
/// blocked last.
struct StuckThreads<'s, 'a> {
    blocked: &'s HashMap<ThreadId, BlockedThread>,
    state: &'s ResourceLockState<'a>,
    members: HashSet<ThreadId>,
}

impl<'s, 'a> StuckThreads<'s, 'a> {
    fn settle(
        blocked: &'s HashMap<ThreadId, BlockedThread>,
        state: &'s ResourceLockState<'a>,
    ) -> Self {
        let mut stuck = Self {
            blocked,
            state,
            members: blocked.keys().copied().collect(),
        };
        loop {
            let free: Vec<ThreadId> = blocked
                .values()
                .filter(|waiter| stuck.contains(waiter.thread.id()) && !stuck.is_stuck(waiter))
                .map(|waiter| waiter.thread.id())
                .collect();
            if free.is_empty() {
                return stuck;
            }
            for id in free {
                stuck.members.remove(&id);
            }
        }
    }

    fn contains(&self, id: ThreadId) -> bool {
        self.members.contains(&id)
    }

    fn is_stuck(&self, waiter: &BlockedThread) -> bool {
        waiter
            .failures()
            .iter()
            .any(|lock| self.blockers(lock.as_ref()).is_some())
    }

    fn member(&self, id: ThreadId) -> Option<&'s BlockedThread> {
        let blocked: &'s HashMap<ThreadId, BlockedThread> = self.blocked;
        blocked.get(&id).filter(|_| self.contains(id))
    }

    /// Members that keep `lock` from ever being granted, or `None` if it still can be.
    fn blockers(&self, lock: &dyn ResourceLock) -> Option<Vec<&'s BlockedThread>> {
        match lock.contention(self.state) {
            Contention::Exclusive { owner } => self.member(owner?.id()).map(|owner| vec![owner]),
            Contention::Pooled { pool, units, .. } => {
                let holders = self.pool_holders(&pool);
                let held: usize = holders.iter().map(|(_, units)| units).sum();
                (pool.capacity.saturating_sub(held) < units)
                    .then(|| holders.into_iter().map(|(holder, _)| holder).collect())
            }
        }
    }

    /// Members holding units of `pool`, with the units each holds, ordered by name.
    fn pool_holders(&self, pool: &PoolRef) -> Vec<(&'s BlockedThread, usize)> {
        let blocked: &'s HashMap<ThreadId, BlockedThread> = self.blocked;
        let mut holders: Vec<(&'s BlockedThread, usize)> = blocked
            .values()
            .filter(|holder| self.contains(holder.thread.id()))
            .filter_map(|holder| {
                let units: usize = holder
                    .held()
                    .iter()
                    .filter_map(|lock| match lock.contention(self.state) {
                        Contention::Pooled {
                            pool: held_pool,
                            units,
                            holder: Some(_),
                        } if held_pool.id == pool.id => Some(units),
                        _ => None,
                    })
                    .sum();
                (units > 0).then_some((holder, units))
            })
            .collect();
        holders.sort_by(|a, b| a.0.thread.name().cmp(b.0.thread.name()));
        holders
    }

    fn edge(
        &self,
        waiter: &BlockedThread,
        lock: &dyn ResourceLock,
    ) -> Option<(WaitEdge, Vec<&'s BlockedThread>)> {
        let blockers = self.blockers(lock)?;
        let edge = WaitEdge {
            thread: waiter.thread.clone(),
            lock: lock.display_name().to_string(),
            holders: blockers.iter().map(|holder| holder.thread.clone()).collect(),
        };
        Some((edge, blockers))
    }

    /// Shortest wait-for cycle leading from `current` back to itself.
    fn cycle_from(&self, current: &BlockedThread) -> Option<DeadlockReport> {
        let origin = current.thread.id();
        // Edge through which each thread was first reached.
        let mut reached: HashMap<ThreadId, WaitEdge> = HashMap::new();
        let mut queue: VecDeque<&BlockedThread> = VecDeque::from([current]);

        while let Some(waiter) = queue.pop_front() {
            for lock in waiter.failures() {
                let Some((edge, blockers)) = self.edge(waiter, lock.as_ref()) else {
                    continue;
                };
                for next in blockers {
                    let id = next.thread.id();
                    if reached.contains_key(&id) {
                        continue;
                    }
                    reached.insert(id, edge.clone());
                    if id == origin {
                        return Some(Self::unwind(reached, origin));
                    }
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn unwind(mut reached: HashMap<ThreadId, WaitEdge>, origin: ThreadId) -> DeadlockReport {
        let mut edges = Vec::new();
        let mut target = origin;
        while let Some(edge) = reached.remove(&target) {
            target = edge.thread.id();
            edges.push(edge);
            if target == origin {
                break;
            }
        }
        edges.reverse();
        DeadlockReport::new(edges)
    }

    /// Walk from `current` into a stuck group it is not part of, until a thread repeats.
    fn chain_from(&self, current: &BlockedThread) -> DeadlockReport {
        let mut edges = Vec::new();
        let mut visited = HashSet::new();
        let mut waiter = current;
        while visited.insert(waiter.thread.id()) {
            let next = waiter
                .failures()
                .iter()
                .find_map(|lock| self.edge(waiter, lock.as_ref()));
            let Some((edge, blockers)) = next else {
                break;
            };
            edges.push(edge);
            match blockers.first() {
                Some(holder) => waiter = *holder,
                None => break,
            }
        }
        DeadlockReport::new(edges)
    }
}
