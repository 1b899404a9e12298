// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Routing plan of a task-level shuffle edge
//!
//! A plan names the logical tasks that send and receive on an edge, the
//! workers taking part in each role, and the worker every task lives on.
//! It is built once by whoever schedules the round and then shared
//! read-only, usually as an `Arc<LogicalTaskPlan>`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CylonError, CylonResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTaskPlan {
    task_sources: Vec<i32>,
    task_targets: Vec<i32>,
    worker_sources: Vec<i32>,
    worker_targets: Vec<i32>,
    task_to_worker: HashMap<i32, i32>,
}

impl LogicalTaskPlan {
    /// Build a plan without checking it. A task missing from
    /// `task_to_worker` shows up as `MalformedPlan` when it is routed.
    pub fn new(
        task_sources: Vec<i32>,
        task_targets: Vec<i32>,
        worker_sources: Vec<i32>,
        worker_targets: Vec<i32>,
        task_to_worker: HashMap<i32, i32>,
    ) -> Self {
        Self {
            task_sources,
            task_targets,
            worker_sources,
            worker_targets,
            task_to_worker,
        }
    }

    /// Build a plan and [`validate`](Self::validate) it
    pub fn try_new(
        task_sources: Vec<i32>,
        task_targets: Vec<i32>,
        worker_sources: Vec<i32>,
        worker_targets: Vec<i32>,
        task_to_worker: HashMap<i32, i32>,
    ) -> CylonResult<Self> {
        let plan = Self::new(task_sources, task_targets, worker_sources, worker_targets, task_to_worker);
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a JSON plan. The plan is not validated.
    pub fn from_json(json: &str) -> CylonResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON plan from a file. The plan is not validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> CylonResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn to_json(&self) -> CylonResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn get_task_sources(&self) -> &[i32] {
        &self.task_sources
    }

    pub fn get_task_targets(&self) -> &[i32] {
        &self.task_targets
    }

    pub fn get_worker_sources(&self) -> &[i32] {
        &self.worker_sources
    }

    pub fn get_worker_targets(&self) -> &[i32] {
        &self.worker_targets
    }

    pub fn get_task_to_worker(&self) -> &HashMap<i32, i32> {
        &self.task_to_worker
    }

    /// The worker that owns `task`
    pub fn worker_of(&self, task: i32) -> CylonResult<i32> {
        self.task_to_worker.get(&task).copied().ok_or_else(|| {
            CylonError::MalformedPlan(format!("task {} has no owning worker", task))
        })
    }

    pub fn is_source_task(&self, task: i32) -> bool {
        self.task_sources.contains(&task)
    }

    pub fn is_target_task(&self, task: i32) -> bool {
        self.task_targets.contains(&task)
    }

    pub fn is_source_worker(&self, worker: i32) -> bool {
        self.worker_sources.contains(&worker)
    }

    pub fn is_target_worker(&self, worker: i32) -> bool {
        self.worker_targets.contains(&worker)
    }

    /// Source tasks bound to `worker`, in plan order. An unmapped source
    /// task is `MalformedPlan`.
    pub fn source_tasks_of(&self, worker: i32) -> CylonResult<Vec<i32>> {
        self.tasks_of(&self.task_sources, worker)
    }

    /// Target tasks bound to `worker`, in plan order. An unmapped target
    /// task is `MalformedPlan`.
    pub fn target_tasks_of(&self, worker: i32) -> CylonResult<Vec<i32>> {
        self.tasks_of(&self.task_targets, worker)
    }

    fn tasks_of(&self, tasks: &[i32], worker: i32) -> CylonResult<Vec<i32>> {
        let mut owned = Vec::new();
        for &task in tasks {
            if self.worker_of(task)? == worker {
                owned.push(task);
            }
        }
        Ok(owned)
    }

    /// Check that every source and target task has an owner, and that the
    /// owner is declared as a worker of the matching role.
    pub fn validate(&self) -> CylonResult<()> {
        let worker_sources: HashSet<i32> = self.worker_sources.iter().copied().collect();
        let worker_targets: HashSet<i32> = self.worker_targets.iter().copied().collect();

        for &task in &self.task_sources {
            let worker = self.worker_of(task)?;
            if !worker_sources.contains(&worker) {
                return Err(CylonError::MalformedPlan(format!(
                    "source task {} is bound to worker {} which is not a source worker",
                    task, worker
                )));
            }
        }
        for &task in &self.task_targets {
            let worker = self.worker_of(task)?;
            if !worker_targets.contains(&worker) {
                return Err(CylonError::MalformedPlan(format!(
                    "target task {} is bound to worker {} which is not a target worker",
                    task, worker
                )));
            }
        }
        Ok(())
    }
}
