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

//! Communicator trait
//!
//! Every communication backend implements this trait. The context hands it
//! to the operations that need to talk to other workers.

use crate::error::CylonResult;

use super::{Channel, CommType};

/// Main interface to the worker group
pub trait Communicator: Send + Sync {
    fn get_rank(&self) -> i32;
    fn get_world_size(&self) -> i32;
    fn get_comm_type(&self) -> CommType;
    fn is_finalized(&self) -> bool;

    /// Mark this worker as done with the group. Channels can no longer be
    /// created afterwards.
    fn finalize(&self) -> CylonResult<()>;

    /// Block until every worker of the group reached the barrier
    fn barrier(&self) -> CylonResult<()>;

    /// Create an uninitialized channel riding on this communicator
    fn create_channel(&self) -> CylonResult<Box<dyn Channel>>;
}
