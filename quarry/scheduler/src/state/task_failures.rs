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

//! Per-task-set failure accounting for a single executor.

use std::collections::HashMap;
use std::fmt;

/// Failures observed on one executor while a single task set was running.
///
/// The scheduler assembles one of these per executor over the lifetime of a
/// task set and hands the whole mapping to the blacklist tracker when the
/// task set completes successfully.
#[derive(Debug, Clone)]
pub struct ExecutorFailuresInTaskSet {
    /// Node hosting the executor; fixed for the lifetime of the record.
    node: String,
    /// For each task index: how often it failed on this executor, and the
    /// expiry time of the most recent failure.
    task_to_failure_count_and_expiry: HashMap<usize, (u32, u64)>,
}

impl ExecutorFailuresInTaskSet {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            task_to_failure_count_and_expiry: HashMap::new(),
        }
    }

    /// The node the executor runs on.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Records one more failure of `task_index`.
    ///
    /// Expiry times are computed on the scheduler's own clock, so for a
    /// given task they never move backwards; a regression is a caller bug.
    pub fn update_with_failure(&mut self, task_index: usize, failure_expiry_time: u64) {
        let (prev_failure_count, prev_failure_expiry_time) = self
            .task_to_failure_count_and_expiry
            .get(&task_index)
            .copied()
            .unwrap_or((0, 0));
        assert!(
            failure_expiry_time >= prev_failure_expiry_time,
            "failure expiry time for task {task_index} moved backwards: \
             {failure_expiry_time} < {prev_failure_expiry_time}"
        );
        self.task_to_failure_count_and_expiry
            .insert(task_index, (prev_failure_count + 1, failure_expiry_time));
    }

    /// The number of distinct tasks that failed at least once.
    pub fn num_unique_tasks_with_failures(&self) -> usize {
        self.task_to_failure_count_and_expiry.len()
    }

    /// Failure count and latest failure expiry, keyed by task index.
    pub fn task_failures(&self) -> &HashMap<usize, (u32, u64)> {
        &self.task_to_failure_count_and_expiry
    }
}

impl fmt::Display for ExecutorFailuresInTaskSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unique failed tasks on node {}: {:?}",
            self.num_unique_tasks_with_failures(),
            self.node,
            self.task_to_failure_count_and_expiry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_failures_per_task() {
        let mut failures = ExecutorFailuresInTaskSet::new("host-1");
        failures.update_with_failure(0, 10);
        failures.update_with_failure(0, 12);
        failures.update_with_failure(3, 11);

        assert_eq!(2, failures.num_unique_tasks_with_failures());
        assert_eq!(Some(&(2, 12)), failures.task_failures().get(&0));
        assert_eq!(Some(&(1, 11)), failures.task_failures().get(&3));
        assert_eq!("host-1", failures.node());
    }

    #[test]
    fn keeps_latest_expiry_for_repeated_failures() {
        let mut failures = ExecutorFailuresInTaskSet::new("host-1");
        failures.update_with_failure(7, 100);
        failures.update_with_failure(7, 100);
        failures.update_with_failure(7, 250);

        assert_eq!(Some(&(3, 250)), failures.task_failures().get(&7));
    }

    #[test]
    #[should_panic(expected = "moved backwards")]
    fn rejects_expiry_regression() {
        let mut failures = ExecutorFailuresInTaskSet::new("host-1");
        failures.update_with_failure(0, 100);
        failures.update_with_failure(0, 99);
    }

    #[test]
    fn display_summarizes_failures() {
        let mut failures = ExecutorFailuresInTaskSet::new("host-9");
        failures.update_with_failure(1, 42);
        let rendered = failures.to_string();
        assert!(rendered.contains("1 unique failed tasks"));
        assert!(rendered.contains("host-9"));
    }
}
