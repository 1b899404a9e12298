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

//! Bookkeeping of a task shuffle's deliveries

use serde::Serialize;

use crate::error::{Code, CylonError};

/// Counters of one shuffle round on one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShuffleStats {
    /// Tables accepted by `insert_table`
    pub tables_inserted: u64,
    /// Serialized bytes accepted by `insert_table`
    pub bytes_inserted: u64,
    /// Tables that arrived from any source worker, decodable or not
    pub tables_received: u64,
    /// Tables the callback accepted
    pub tables_delivered: u64,
    pub tables_rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// The callback returned false
    Callback,
    /// The tag is not a target task owned by this worker
    UnknownTask,
    MalformedPlan(String),
    SchemaMismatch { expected: String, actual: String },
    /// The buffer could not be decoded into a table
    Decode(String),
    /// The callback panicked, now or on an earlier table
    Panicked(String),
}

/// A received table that did not reach its task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryRejection {
    pub source_worker: i32,
    pub target_task: i32,
    pub reason: RejectReason,
}

impl DeliveryRejection {
    /// The error describing this rejection on `edge`
    pub fn to_error(&self, edge: i32) -> CylonError {
        match &self.reason {
            RejectReason::Callback => CylonError::CallbackRejected {
                worker: self.source_worker,
                task: self.target_task,
            },
            RejectReason::UnknownTask => CylonError::UnknownTask {
                task: self.target_task,
                edge,
            },
            RejectReason::MalformedPlan(msg) => CylonError::MalformedPlan(msg.clone()),
            RejectReason::SchemaMismatch { expected, actual } => CylonError::SchemaMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            RejectReason::Decode(msg) => CylonError::Serialization(msg.clone()),
            RejectReason::Panicked(msg) => {
                CylonError::new(Code::ExecutionError, format!("callback panicked: {}", msg))
            }
        }
    }
}
