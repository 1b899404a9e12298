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

//! Arrow table shuffles
//!
//! [`ArrowAllToAll`] moves tables between workers. [`ArrowTaskAllToAll`]
//! builds on it to move tables between logical tasks placed on workers by a
//! [`LogicalTaskPlan`].

pub mod arrow_all_to_all;
pub mod arrow_task_all_to_all;
pub mod config;
pub mod delivery;
pub mod task_plan;

pub use arrow_all_to_all::{ArrowAllToAll, ArrowCallback, ReceiveFailure, NO_REFERENCE};
pub use arrow_task_all_to_all::{ArrowTaskAllToAll, ArrowTaskCallback};
pub use config::ShuffleConfig;
pub use delivery::{DeliveryRejection, RejectReason, ShuffleStats};
pub use task_plan::LogicalTaskPlan;
