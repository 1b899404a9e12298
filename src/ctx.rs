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

//! Cylon context and configuration
//!
//! The context is always passed explicitly. Several independent contexts can
//! live in one process, one per simulated worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{CylonError, CylonResult};
use crate::net::local::LocalFabric;
use crate::net::{Channel, CommType, Communicator};

/// The entry point to cylon operations
pub struct CylonContext {
    config: RwLock<HashMap<String, String>>,
    is_distributed: bool,
    communicator: Option<Arc<dyn Communicator>>,
    sequence_no: Mutex<i32>,
}

impl CylonContext {
    /// Context without a communicator
    pub fn new(distributed: bool) -> Self {
        Self {
            config: RwLock::new(HashMap::new()),
            is_distributed: distributed,
            communicator: None,
            sequence_no: Mutex::new(0),
        }
    }

    /// Single worker context backed by an in-process world of one
    pub fn init() -> CylonResult<Arc<Self>> {
        let fabric = LocalFabric::new(1)?;
        let comm: Arc<dyn Communicator> = fabric.communicator(0)?;
        let mut ctx = Self::new(false);
        ctx.communicator = Some(comm);
        Ok(Arc::new(ctx))
    }

    /// Distributed context riding on `communicator`
    pub fn init_distributed(communicator: Arc<dyn Communicator>) -> Arc<Self> {
        let mut ctx = Self::new(true);
        ctx.communicator = Some(communicator);
        Arc::new(ctx)
    }

    /// One context per worker of a fresh in-process world, in rank order
    pub fn init_local_world(world_size: i32) -> CylonResult<(Arc<LocalFabric>, Vec<Arc<Self>>)> {
        let fabric = LocalFabric::new(world_size)?;
        let contexts = fabric
            .communicators()
            .into_iter()
            .map(|comm| Self::init_distributed(comm as Arc<dyn Communicator>))
            .collect();
        Ok((fabric, contexts))
    }

    /// Finalize the communicator, if any
    pub fn finalize(&self) -> CylonResult<()> {
        if let Some(ref comm) = self.communicator {
            comm.finalize()?;
        }
        Ok(())
    }

    /// Adds a configuration
    pub fn add_config(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut config) = self.config.write() {
            config.insert(key.into(), value.into());
        }
    }

    /// Returns a configuration value, or `default` if the key is unset
    pub fn get_config(&self, key: &str, default: &str) -> String {
        self.find_config(key).unwrap_or_else(|| default.to_string())
    }

    /// Returns a configuration value if set
    pub fn find_config(&self, key: &str) -> Option<String> {
        self.config.read().ok().and_then(|c| c.get(key).cloned())
    }

    pub fn get_communicator(&self) -> Option<Arc<dyn Communicator>> {
        self.communicator.clone()
    }

    pub fn set_communicator(&mut self, communicator: Arc<dyn Communicator>) {
        self.communicator = Some(communicator);
    }

    pub fn is_distributed(&self) -> bool {
        self.is_distributed
    }

    /// Returns the local rank
    pub fn get_rank(&self) -> i32 {
        self.communicator.as_ref().map_or(0, |c| c.get_rank())
    }

    /// Returns the world size
    pub fn get_world_size(&self) -> i32 {
        self.communicator.as_ref().map_or(1, |c| c.get_world_size())
    }

    /// Returns the neighbors in the world
    pub fn get_neighbours(&self, include_self: bool) -> Vec<i32> {
        let rank = self.get_rank();
        (0..self.get_world_size())
            .filter(|&i| include_self || i != rank)
            .collect()
    }

    /// Returns the next sequence number. Used to allocate edge ids; every
    /// worker that calls it in the same order gets the same ids.
    pub fn get_next_sequence(&self) -> i32 {
        match self.sequence_no.lock() {
            Ok(mut seq) => {
                *seq += 1;
                *seq
            }
            Err(poisoned) => {
                let mut seq = poisoned.into_inner();
                *seq += 1;
                *seq
            }
        }
    }

    pub fn get_comm_type(&self) -> CommType {
        self.communicator
            .as_ref()
            .map_or(CommType::Local, |c| c.get_comm_type())
    }

    /// Create an uninitialized channel on this context's communicator
    pub fn create_channel(&self) -> CylonResult<Box<dyn Channel>> {
        let comm = self
            .communicator
            .as_ref()
            .ok_or_else(|| CylonError::Invalid("context has no communicator".into()))?;
        comm.create_channel()
    }

    /// Performs a barrier operation
    pub fn barrier(&self) -> CylonResult<()> {
        if let Some(ref comm) = self.communicator {
            comm.barrier()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_world_ranks() {
        let (fabric, contexts) = CylonContext::init_local_world(3).unwrap();
        assert_eq!(fabric.world_size(), 3);
        for (i, ctx) in contexts.iter().enumerate() {
            assert_eq!(ctx.get_rank(), i as i32);
            assert_eq!(ctx.get_world_size(), 3);
            assert!(ctx.is_distributed());
        }
        assert_eq!(contexts[1].get_neighbours(false), vec![0, 2]);
        assert_eq!(contexts[1].get_neighbours(true), vec![0, 1, 2]);
    }

    #[test]
    fn test_config_and_sequence() {
        let ctx = CylonContext::init().unwrap();
        assert_eq!(ctx.get_config("missing", "dflt"), "dflt");
        ctx.add_config("shuffle.compression", "lz4");
        assert_eq!(ctx.find_config("shuffle.compression").as_deref(), Some("lz4"));

        assert_eq!(ctx.get_next_sequence(), 1);
        assert_eq!(ctx.get_next_sequence(), 2);
        assert_eq!(ctx.get_rank(), 0);
        assert_eq!(ctx.get_world_size(), 1);
    }

    #[test]
    fn test_finalized_context_cannot_create_channels() {
        let ctx = CylonContext::init().unwrap();
        assert!(ctx.create_channel().is_ok());
        ctx.finalize().unwrap();
        assert!(ctx.create_channel().is_err());

        let bare = CylonContext::new(false);
        assert!(bare.create_channel().is_err());
    }
}
