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

//! Configuration of task shuffles

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ctx::CylonContext;
use crate::error::{CylonError, CylonResult};
use crate::net::serialize::IpcCompression;

pub const MAX_PENDING_TABLES_KEY: &str = "shuffle.max_pending_tables";
pub const BLOCK_ON_BACKPRESSURE_KEY: &str = "shuffle.block_on_backpressure";
pub const POLL_INTERVAL_US_KEY: &str = "shuffle.poll_interval_us";
pub const COMPRESSION_KEY: &str = "shuffle.compression";

/// Tunables of an [`ArrowTaskAllToAll`](super::ArrowTaskAllToAll)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Tables handed to the transport and not yet picked up by the delivery
    /// thread. Inserts beyond this block or are rejected.
    pub max_pending_tables: usize,
    /// Block producers on a full queue instead of failing the insert
    pub block_on_backpressure: bool,
    /// Idle sleep of the delivery thread between progress rounds
    pub poll_interval: Duration,
    /// Compression of tables on the wire
    pub compression: IpcCompression,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            max_pending_tables: 64,
            block_on_backpressure: true,
            poll_interval: Duration::from_micros(100),
            compression: IpcCompression::None,
        }
    }
}

impl ShuffleConfig {
    /// Defaults overridden by the `shuffle.*` keys of the context
    pub fn from_context(ctx: &CylonContext) -> CylonResult<Self> {
        let mut config = Self::default();
        if let Some(v) = ctx.find_config(MAX_PENDING_TABLES_KEY) {
            config.max_pending_tables = parse(MAX_PENDING_TABLES_KEY, &v)?;
        }
        if let Some(v) = ctx.find_config(BLOCK_ON_BACKPRESSURE_KEY) {
            config.block_on_backpressure = parse(BLOCK_ON_BACKPRESSURE_KEY, &v)?;
        }
        if let Some(v) = ctx.find_config(POLL_INTERVAL_US_KEY) {
            config.poll_interval = Duration::from_micros(parse(POLL_INTERVAL_US_KEY, &v)?);
        }
        if let Some(v) = ctx.find_config(COMPRESSION_KEY) {
            config.compression = v.parse()?;
        }
        Ok(config)
    }

    pub fn with_max_pending_tables(mut self, max_pending_tables: usize) -> Self {
        self.max_pending_tables = max_pending_tables;
        self
    }

    pub fn with_block_on_backpressure(mut self, block: bool) -> Self {
        self.block_on_backpressure = block;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_compression(mut self, compression: IpcCompression) -> Self {
        self.compression = compression;
        self
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> CylonResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CylonError::Invalid(format!("invalid value '{}' for {}", value, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_overrides() {
        let ctx = CylonContext::init().unwrap();
        ctx.add_config(MAX_PENDING_TABLES_KEY, "8");
        ctx.add_config(BLOCK_ON_BACKPRESSURE_KEY, "false");
        ctx.add_config(POLL_INTERVAL_US_KEY, "250");
        ctx.add_config(COMPRESSION_KEY, "zstd");

        let config = ShuffleConfig::from_context(&ctx).unwrap();
        assert_eq!(config.max_pending_tables, 8);
        assert!(!config.block_on_backpressure);
        assert_eq!(config.poll_interval, Duration::from_micros(250));
        assert_eq!(config.compression, IpcCompression::Zstd);
    }

    #[test]
    fn test_bad_override_is_invalid() {
        let ctx = CylonContext::init().unwrap();
        ctx.add_config(MAX_PENDING_TABLES_KEY, "many");
        assert!(ShuffleConfig::from_context(&ctx).is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: ShuffleConfig = serde_json::from_str(r#"{"compression": "lz4"}"#).unwrap();
        assert_eq!(config.compression, IpcCompression::Lz4);
        assert_eq!(config.max_pending_tables, ShuffleConfig::default().max_pending_tables);
    }
}
