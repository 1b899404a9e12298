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

//! Networking and communication components
//!
//! Layers, bottom up: a [`Channel`] moves byte buffers between workers,
//! [`ops::AllToAll`] adds per-edge queuing and the finish protocol, and the
//! arrow layer moves whole tables on top of it.

pub mod buffer;
pub mod channel;
pub mod communicator;
pub mod local;
pub mod ops;
pub mod request;
pub mod serialize;

pub use channel::{Channel, ChannelReceiveCallback, ChannelSendCallback};
pub use communicator::Communicator;

/// Maximum number of caller supplied header words per request
pub const CYLON_MAX_USER_HEADER: usize = 6;

/// Default bound on buffers a channel holds in flight per target
pub const MAX_PENDING: usize = 1000;

/// Communication backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    /// Workers are threads of one process
    Local,
}

/// Buffer trait for network communication
pub trait Buffer: Send + Sync {
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
