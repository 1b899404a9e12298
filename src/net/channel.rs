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

//! Point-to-point channel between workers
//!
//! A channel is progressed by its owner. Completed sends and arrived messages
//! are reported to the callbacks passed to [`Channel::progress_sends`] and
//! [`Channel::progress_receives`], so the owner never has to hand out a
//! pointer to itself.

use crate::error::CylonResult;

use super::request::CylonRequest;
use super::Buffer;

/// Receives messages that arrived on a channel
pub trait ChannelReceiveCallback {
    /// Data of a message from `receive_id`. Always follows its header.
    fn received_data(&mut self, receive_id: i32, buffer: Box<dyn Buffer>, length: usize);

    /// Header of a message from `receive_id`. When `finished` is set the
    /// source will send nothing more on this edge and no data follows.
    fn received_header(&mut self, receive_id: i32, finished: bool, header: Option<Vec<i32>>);
}

/// Notified when the channel is done with a request
pub trait ChannelSendCallback {
    fn send_complete(&mut self, request: Box<CylonRequest>);

    fn send_finish_complete(&mut self, request: Box<CylonRequest>);
}

/// Worker to worker transport for one edge
pub trait Channel: Send {
    /// Bind the channel to an edge, the workers it receives from and the
    /// workers it sends to.
    fn init(&mut self, edge: i32, receives: &[i32], sends: &[i32]) -> CylonResult<()>;

    /// Queue a request. When the channel is at capacity for the target the
    /// request is handed back as `Ok(Some(request))` and should be offered
    /// again later.
    fn send(&mut self, request: Box<CylonRequest>) -> CylonResult<Option<Box<CylonRequest>>>;

    /// Queue the finish announcement for `request.target`. It is transmitted
    /// after every data request already queued for that target and reported
    /// through `send_finish_complete` once the target acknowledged it.
    /// Returns false if a finish for the target was already accepted.
    fn send_fin(&mut self, request: Box<CylonRequest>) -> CylonResult<bool>;

    fn progress_sends(&mut self, callback: &mut dyn ChannelSendCallback) -> CylonResult<()>;

    fn progress_receives(&mut self, callback: &mut dyn ChannelReceiveCallback) -> CylonResult<()>;

    /// Data requests accepted by the channel that no receiver has taken yet
    fn in_flight(&self) -> usize {
        0
    }

    /// Called once the owning operation has completed
    fn notify_completed(&mut self) {}

    /// Release the resources held for the edge
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
