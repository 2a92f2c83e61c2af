// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Application-level executor and node blacklisting.
//!
//! The tracker accumulates task failures per executor across successful task
//! sets. When an executor crosses the failure threshold it is blacklisted
//! for a while; when enough executors on one node are blacklisted, the node
//! is blacklisted too. The scheduler consults the blacklist at placement
//! time and periodically sweeps out expired entries.
//!
//! All operations run under the scheduler's own lock, with one exception:
//! the blacklisted-node set is published as an immutable snapshot behind an
//! atomic handle, so the resource-negotiation path can read it from any
//! thread without taking that lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, info, warn};

use quarry_core::config::{
    parse_time_string_ms, QuarryConfig, QUARRY_BLACKLIST_MAX_FAILED_EXECUTORS_PER_NODE,
    QUARRY_BLACKLIST_MAX_FAILED_TASKS_PER_EXECUTOR, QUARRY_BLACKLIST_TIMEOUT,
    QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME,
};
use quarry_core::error::{QuarryError, Result};
use quarry_core::utils::Clock;

use crate::state::task_failures::ExecutorFailuresInTaskSet;

/// Timeout applied when neither the timeout key nor the legacy key is set.
const DEFAULT_BLACKLIST_TIMEOUT: &str = "1h";

/// Identity of a single task failure event within the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub stage_id: usize,
    pub stage_attempt_id: usize,
    pub task_index: usize,
}

/// Unexpired failures attributed to one executor across successful task
/// sets, ordered by expiry time.
///
/// The list stays small: an executor that keeps failing crosses the
/// blacklist threshold quickly, and blacklisting drops its list.
#[derive(Debug, Default)]
pub(crate) struct ExecutorFailureList {
    /// `(task, absolute expiry in ms)`, sorted ascending by expiry.
    failures_and_expiry_times: Vec<(TaskId, u64)>,
}

impl ExecutorFailureList {
    /// Folds one task set's failures on this executor into the list.
    fn add_failures(
        &mut self,
        stage_id: usize,
        stage_attempt_id: usize,
        failures_in_task_set: &ExecutorFailuresInTaskSet,
    ) {
        for (task_index, (_, failure_expiry_time)) in
            failures_in_task_set.task_failures()
        {
            self.failures_and_expiry_times.push((
                TaskId {
                    stage_id,
                    stage_attempt_id,
                    task_index: *task_index,
                },
                *failure_expiry_time,
            ));
        }
        // Failures from a fresh task set can interleave with retained older
        // ones by wall-time; the prefix drop and the minimum query both
        // rely on expiry order.
        self.failures_and_expiry_times.sort_by_key(|(_, expiry)| *expiry);
    }

    /// Expiry of the oldest retained failure.
    fn min_expiry_time(&self) -> Option<u64> {
        self.failures_and_expiry_times
            .first()
            .map(|(_, expiry)| *expiry)
    }

    fn num_unique_task_failures(&self) -> usize {
        self.failures_and_expiry_times.len()
    }

    /// Drops every failure whose expiry is before `drop_before`.
    fn drop_failures_with_timeout_before(&mut self, drop_before: u64) {
        if self.min_expiry_time().is_some_and(|min| min < drop_before) {
            let min_index_to_keep = self
                .failures_and_expiry_times
                .partition_point(|(_, expiry)| *expiry < drop_before);
            self.failures_and_expiry_times.drain(..min_index_to_keep);
        }
    }
}

/// A currently blacklisted executor and when its entry lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlacklistedExecutor {
    node: String,
    expiry_time: u64,
}

/// Read-only handle to the blacklisted-node snapshot.
///
/// Cheap to clone and usable from any thread without the scheduler lock.
/// Every load observes a complete, immutable set; a reader may see a set
/// that is one or more publications old, never a partial one.
#[derive(Clone)]
pub struct NodeBlacklistView {
    inner: Arc<ArcSwap<HashSet<String>>>,
}

impl NodeBlacklistView {
    /// The blacklisted-node set as of the latest publication.
    pub fn load(&self) -> Arc<HashSet<String>> {
        self.inner.load_full()
    }
}

/// Tracks failing executors and nodes across the whole application.
///
/// Everything except [`BlacklistTracker::node_blacklist`] (and views
/// obtained from [`BlacklistTracker::node_blacklist_view`]) must be called
/// with the scheduler's lock held.
pub struct BlacklistTracker {
    /// Distinct task failures after which an executor is blacklisted.
    max_failures_per_exec: usize,
    /// Blacklisted executors after which their node is blacklisted.
    max_failed_exec_per_node: usize,
    /// Lifetime of a blacklist entry (and of each recorded failure), in ms.
    blacklist_timeout_ms: u64,
    clock: Arc<dyn Clock>,
    /// Pending failures for executors that are not currently blacklisted.
    executor_id_to_failure_list: HashMap<String, ExecutorFailureList>,
    /// Currently blacklisted executors.
    executor_id_to_blacklist_status: HashMap<String, BlacklistedExecutor>,
    /// Currently blacklisted nodes.
    node_id_to_blacklist_expiry_time: HashMap<String, u64>,
    /// Executors blacklisted on each node. Entries persist while the
    /// executors' blacklists are active, even if an executor leaves the
    /// cluster, so a bad node keeps counting toward node promotion.
    node_to_blacklisted_execs: HashMap<String, HashSet<String>>,
    /// Immutable snapshot of the blacklisted-node set, republished on every
    /// change to the key set of `node_id_to_blacklist_expiry_time`.
    node_blacklist: Arc<ArcSwap<HashSet<String>>>,
    /// Lower bound on every expiry the next sweep may need to apply;
    /// `u64::MAX` when nothing is tracked. Lets the sweep return early.
    next_expiry_time: u64,
}

impl BlacklistTracker {
    pub fn new(conf: &QuarryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::validate_blacklist_confs(conf)?;
        Ok(Self {
            max_failures_per_exec: conf.blacklist_max_failed_tasks_per_executor()
                as usize,
            max_failed_exec_per_node: conf.blacklist_max_failed_executors_per_node()
                as usize,
            blacklist_timeout_ms: Self::get_blacklist_timeout(conf),
            clock,
            executor_id_to_failure_list: HashMap::new(),
            executor_id_to_blacklist_status: HashMap::new(),
            node_id_to_blacklist_expiry_time: HashMap::new(),
            node_to_blacklisted_execs: HashMap::new(),
            node_blacklist: Arc::new(ArcSwap::from_pointee(HashSet::new())),
            next_expiry_time: u64::MAX,
        })
    }

    /// Whether application-level blacklisting is switched on.
    ///
    /// An explicit `quarry.blacklist.enabled` always wins. Otherwise a set
    /// legacy timeout enables blacklisting iff it is non-zero. With neither
    /// key set, blacklisting is off.
    pub fn is_blacklist_enabled(conf: &QuarryConfig) -> bool {
        match conf.blacklist_enabled() {
            Some(enabled) => enabled,
            None => match conf.legacy_executor_task_blacklist_time() {
                Some(0) => {
                    warn!(
                        "Turning off blacklisting due to legacy configuration: \
                         {QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME} == 0"
                    );
                    false
                }
                Some(_) => {
                    warn!(
                        "Turning on blacklisting due to legacy configuration: \
                         {QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME} > 0; set \
                         {QUARRY_BLACKLIST_TIMEOUT} instead"
                    );
                    true
                }
                None => false,
            },
        }
    }

    /// Resolves the blacklist timeout in milliseconds: the timeout key if
    /// set, else the legacy key, else [`DEFAULT_BLACKLIST_TIMEOUT`].
    pub fn get_blacklist_timeout(conf: &QuarryConfig) -> u64 {
        conf.blacklist_timeout_ms()
            .or_else(|| conf.legacy_executor_task_blacklist_time())
            .unwrap_or_else(|| {
                // infallible: the default is a literal in the accepted grammar
                parse_time_string_ms(DEFAULT_BLACKLIST_TIMEOUT).unwrap()
            })
    }

    /// Rejects blacklist settings the tracker cannot run with.
    fn validate_blacklist_confs(conf: &QuarryConfig) -> Result<()> {
        if conf.blacklist_max_failed_tasks_per_executor() == 0 {
            return Err(QuarryError::Configuration(format!(
                "{QUARRY_BLACKLIST_MAX_FAILED_TASKS_PER_EXECUTOR} was 0, but must be > 0"
            )));
        }
        if conf.blacklist_max_failed_executors_per_node() == 0 {
            return Err(QuarryError::Configuration(format!(
                "{QUARRY_BLACKLIST_MAX_FAILED_EXECUTORS_PER_NODE} was 0, but must be > 0"
            )));
        }
        if Self::get_blacklist_timeout(conf) == 0 {
            return Err(QuarryError::Configuration(format!(
                "{QUARRY_BLACKLIST_TIMEOUT} was 0, but must be > 0"
            )));
        }
        Ok(())
    }

    /// Lifetime of a blacklist entry in milliseconds.
    pub fn blacklist_timeout_ms(&self) -> u64 {
        self.blacklist_timeout_ms
    }

    /// Folds the failures observed during one successfully completed task
    /// set into the per-executor accounting and applies the promotion rules.
    ///
    /// Only task sets that ultimately succeeded report here; permanently
    /// failing task sets are handled by task-set-level blacklisting.
    pub fn update_blacklist_for_successful_task_set(
        &mut self,
        stage_id: usize,
        stage_attempt_id: usize,
        failures_by_exec: &HashMap<String, ExecutorFailuresInTaskSet>,
    ) {
        for (exec, failures_in_task_set) in failures_by_exec {
            debug!(
                "Post-task-set failure accounting for executor {exec}: {failures_in_task_set}"
            );
            let failure_list = self
                .executor_id_to_failure_list
                .entry(exec.clone())
                .or_default();
            failure_list.add_failures(stage_id, stage_attempt_id, failures_in_task_set);
            if let Some(min_expiry) = failure_list.min_expiry_time() {
                if min_expiry < self.next_expiry_time {
                    self.next_expiry_time = min_expiry;
                }
            }

            let new_total = failure_list.num_unique_task_failures();
            if new_total >= self.max_failures_per_exec {
                let now = self.clock.time_millis();
                let expiry_time = now + self.blacklist_timeout_ms;
                info!(
                    "Blacklisting executor {exec} because it has {new_total} task \
                     failures in successful task sets"
                );
                let node = failures_in_task_set.node().to_string();
                self.executor_id_to_blacklist_status.insert(
                    exec.clone(),
                    BlacklistedExecutor {
                        node: node.clone(),
                        expiry_time,
                    },
                );
                self.executor_id_to_failure_list.remove(exec);
                if expiry_time < self.next_expiry_time {
                    self.next_expiry_time = expiry_time;
                }

                // Count the executor toward its node; enough blacklisted
                // executors blacklist the whole node.
                let blacklisted_execs_on_node = self
                    .node_to_blacklisted_execs
                    .entry(node.clone())
                    .or_default();
                blacklisted_execs_on_node.insert(exec.clone());
                if blacklisted_execs_on_node.len() >= self.max_failed_exec_per_node {
                    info!(
                        "Blacklisting node {node} because it has {} executors \
                         blacklisted: {blacklisted_execs_on_node:?}",
                        blacklisted_execs_on_node.len()
                    );
                    self.node_id_to_blacklist_expiry_time
                        .insert(node, expiry_time);
                    self.publish_node_blacklist();
                }
            }
        }
    }

    /// Drops expired failure records and blacklist entries.
    ///
    /// The scheduler calls this periodically; it is cheap whenever nothing
    /// can have expired yet.
    pub fn apply_blacklist_timeout(&mut self) {
        let now = self.clock.time_millis();
        if now <= self.next_expiry_time {
            return;
        }

        // Age out pending failures for executors below the threshold.
        // Emptied lists are left in place; they are harmless and are
        // cleaned up when the executor is removed from the cluster.
        for failure_list in self.executor_id_to_failure_list.values_mut() {
            failure_list.drop_failures_with_timeout_before(now);
        }

        let execs_to_unblacklist: Vec<String> = self
            .executor_id_to_blacklist_status
            .iter()
            .filter(|(_, status)| status.expiry_time < now)
            .map(|(exec, _)| exec.clone())
            .collect();
        if !execs_to_unblacklist.is_empty() {
            info!(
                "Removing executors {execs_to_unblacklist:?} from blacklist because \
                 the blacklist for those executors has timed out"
            );
            for exec in execs_to_unblacklist {
                let status = self
                    .executor_id_to_blacklist_status
                    .remove(&exec)
                    .expect("executor selected for un-blacklisting disappeared");
                let blacklisted_execs_on_node = self
                    .node_to_blacklisted_execs
                    .get_mut(&status.node)
                    .expect("blacklisted executor has no node entry");
                blacklisted_execs_on_node.remove(&exec);
                if blacklisted_execs_on_node.is_empty() {
                    self.node_to_blacklisted_execs.remove(&status.node);
                }
            }
        }
        self.update_next_expiry_time();

        let nodes_to_unblacklist: Vec<String> = self
            .node_id_to_blacklist_expiry_time
            .iter()
            .filter(|(_, expiry)| **expiry < now)
            .map(|(node, _)| node.clone())
            .collect();
        if !nodes_to_unblacklist.is_empty() {
            info!(
                "Removing nodes {nodes_to_unblacklist:?} from blacklist because the \
                 blacklist has timed out"
            );
            for node in &nodes_to_unblacklist {
                self.node_id_to_blacklist_expiry_time.remove(node);
            }
            self.publish_node_blacklist();
        }
    }

    pub fn is_executor_blacklisted(&self, executor_id: &str) -> bool {
        self.executor_id_to_blacklist_status
            .contains_key(executor_id)
    }

    pub fn is_node_blacklisted(&self, node: &str) -> bool {
        self.node_id_to_blacklist_expiry_time.contains_key(node)
    }

    /// The current immutable snapshot of the blacklisted-node set.
    ///
    /// Safe to call without the scheduler lock.
    pub fn node_blacklist(&self) -> Arc<HashSet<String>> {
        self.node_blacklist.load_full()
    }

    /// A handle for reading the blacklisted-node set from other threads,
    /// typically the resource-negotiation path.
    pub fn node_blacklist_view(&self) -> NodeBlacklistView {
        NodeBlacklistView {
            inner: self.node_blacklist.clone(),
        }
    }

    /// Forgets pending failures of an executor that left the cluster.
    ///
    /// Its blacklist entry, if any, is deliberately left to expire
    /// naturally, and it keeps counting toward its node's blacklisting, so
    /// a replacement executor on the same bad node can still tip the node
    /// over the threshold.
    pub fn handle_removed_executor(&mut self, executor_id: &str) {
        self.executor_id_to_failure_list.remove(executor_id);
    }

    /// Rebuilds the node snapshot from the current key set and publishes it
    /// with a single atomic store.
    fn publish_node_blacklist(&self) {
        let snapshot: HashSet<String> = self
            .node_id_to_blacklist_expiry_time
            .keys()
            .cloned()
            .collect();
        self.node_blacklist.store(Arc::new(snapshot));
    }

    /// Recomputes the sweep lower bound from executor blacklist expiries and
    /// from pending failures that have not promoted their executor yet; a
    /// pending entry left out here would survive its own expiry, because
    /// every later sweep would short-circuit before dropping it. Node
    /// expiries are copied from executor expiries at promotion time, so they
    /// never lie below this bound.
    fn update_next_expiry_time(&mut self) {
        self.next_expiry_time = self
            .executor_id_to_blacklist_status
            .values()
            .map(|status| status.expiry_time)
            .chain(
                self.executor_id_to_failure_list
                    .values()
                    .filter_map(ExecutorFailureList::min_expiry_time),
            )
            .min()
            .unwrap_or(u64::MAX);
    }
}
