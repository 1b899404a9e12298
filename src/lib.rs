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

//! Cylon task shuffle: moving Arrow tables between logical tasks
//!
//! Logical tasks produce and consume table partitions and several of them
//! share one worker. [`arrow::ArrowTaskAllToAll`] routes every partition to
//! the worker owning its target task over a worker-level all-to-all, hands it
//! to a callback there and tells each worker when the round is complete.
//!
//! Workers talk through a [`net::Communicator`]. The crate ships an
//! in-process one, [`net::local::LocalFabric`], running a whole world of
//! workers as threads of one process.

pub mod arrow;
pub mod ctx;
pub mod error;
pub mod net;
pub mod table;
pub mod util;

// Re-export commonly used types
pub use crate::arrow::{ArrowTaskAllToAll, LogicalTaskPlan, ShuffleConfig};
pub use crate::ctx::CylonContext;
pub use crate::error::{CylonError, CylonResult};
pub use crate::table::Table;

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
