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

//! Logging utilities
//!
//! The crate logs through the `log` facade. These helpers install
//! `env_logger` as the backend; `RUST_LOG` overrides the level.

use log::LevelFilter;

/// Initialize logging with default configuration.
/// Does nothing if a logger is already installed.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Initialize logging with specific level
pub fn init_logging_with_level(level: LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

/// Logging for tests, captured by the test harness
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
