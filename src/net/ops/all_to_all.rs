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

//! All-to-all communication pattern between workers

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, trace};

use crate::error::{CylonError, CylonResult};
use crate::net::request::CylonRequest;
use crate::net::{Buffer, Channel, ChannelReceiveCallback, ChannelSendCallback, CYLON_MAX_USER_HEADER};

/// Callback for data arriving through an [`AllToAll`]
pub trait ReceiveCallback {
    /// Called when data is received.
    /// Returns true if we accept this buffer
    fn on_receive(&mut self, source: i32, buffer: Box<dyn Buffer>, length: usize) -> bool;

    /// Called when a header is received, before its data.
    /// Returns true if we accept the header
    fn on_receive_header(&mut self, source: i32, finished: bool, header: Option<Vec<i32>>) -> bool;

    /// Called after a buffer of `length` bytes left for `target`
    fn on_send_complete(&mut self, target: i32, length: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllToAllSendStatus {
    Sending,
    FinishSent,
    Finished,
}

/// Tracks sends to a specific target
struct AllToAllSends {
    target: i32,
    request_queue: VecDeque<Box<CylonRequest>>,
    /// lengths of requests handed to the channel and not yet completed
    pending_queue: VecDeque<usize>,
    message_sizes: usize,
    send_status: AllToAllSendStatus,
}

impl AllToAllSends {
    fn new(target: i32) -> Self {
        Self {
            target,
            request_queue: VecDeque::new(),
            pending_queue: VecDeque::new(),
            message_sizes: 0,
            send_status: AllToAllSendStatus::Sending,
        }
    }
}

/// All-to-all communication pattern
///
/// Every worker sends buffers to a set of target workers and receives from a
/// set of source workers over one edge. It:
/// - queues buffers per target and offers them to the channel
/// - progresses the channel
/// - runs the finish protocol once [`AllToAll::finish`] was called
/// - forwards arrivals to the caller's [`ReceiveCallback`]
pub struct AllToAll {
    worker_id: i32,
    sources: Vec<i32>,
    targets: Vec<i32>,
    edge: i32,
    sends: Vec<AllToAllSends>,
    send_index: HashMap<i32, usize>,
    finished_sources: HashSet<i32>,
    finished_targets: HashSet<i32>,
    finish_flag: bool,
    completed: bool,
    closed: bool,
    channel: Box<dyn Channel>,
}

impl AllToAll {
    /// Create a new AllToAll operation
    ///
    /// # Arguments
    /// * `worker_id` - This process's rank
    /// * `sources` - Ranks to receive from
    /// * `targets` - Ranks to send to
    /// * `edge_id` - Edge ID for this communication pattern
    /// * `channel` - An uninitialized channel, bound to the edge here
    pub fn new(
        worker_id: i32,
        sources: Vec<i32>,
        targets: Vec<i32>,
        edge_id: i32,
        mut channel: Box<dyn Channel>,
    ) -> CylonResult<Self> {
        channel.init(edge_id, &sources, &targets)?;

        // start at a different peer on every worker so they do not all
        // hit the same target first
        let n = targets.len();
        let offset = if n == 0 { 0 } else { worker_id.rem_euclid(n as i32) as usize };
        let sends: Vec<AllToAllSends> = (0..n)
            .map(|i| AllToAllSends::new(targets[(i + offset) % n]))
            .collect();
        let send_index = sends
            .iter()
            .enumerate()
            .map(|(i, s)| (s.target, i))
            .collect();

        debug!(
            "worker {} all-to-all on edge {}: {} sources, {} targets",
            worker_id,
            edge_id,
            sources.len(),
            targets.len()
        );

        Ok(Self {
            worker_id,
            sources,
            targets,
            edge: edge_id,
            sends,
            send_index,
            finished_sources: HashSet::new(),
            finished_targets: HashSet::new(),
            finish_flag: false,
            completed: false,
            closed: false,
            channel,
        })
    }

    /// Insert a buffer to be sent to a target
    pub fn insert(&mut self, buffer: Vec<u8>, target: i32) -> CylonResult<()> {
        self.insert_with_header(buffer, target, &[])
    }

    /// Insert a buffer with up to six header words to be sent to a target
    pub fn insert_with_header(&mut self, buffer: Vec<u8>, target: i32, header: &[i32]) -> CylonResult<()> {
        if self.closed {
            return Err(CylonError::TransportClosed { edge: self.edge });
        }
        if self.finish_flag {
            return Err(CylonError::Invalid(format!(
                "insert after finish on edge {}",
                self.edge
            )));
        }
        if header.len() > CYLON_MAX_USER_HEADER {
            return Err(CylonError::Invalid(format!(
                "header of {} words exceeds {}",
                header.len(),
                CYLON_MAX_USER_HEADER
            )));
        }
        let idx = *self.send_index.get(&target).ok_or_else(|| {
            CylonError::Invalid(format!(
                "worker {} is not a target of edge {}",
                target, self.edge
            ))
        })?;

        let s = &mut self.sends[idx];
        s.message_sizes += buffer.len();
        s.request_queue
            .push_back(Box::new(CylonRequest::new_with_header(target, buffer, header)));
        Ok(())
    }

    /// Progress the operation and report whether it is complete.
    ///
    /// Should be called repeatedly until it returns true. Complete means
    /// every queued buffer left this worker, every target acknowledged our
    /// finish announcement and every source announced its finish.
    pub fn is_complete<C>(&mut self, callback: &mut C) -> CylonResult<bool>
    where
        C: ReceiveCallback + ?Sized,
    {
        if self.closed {
            return Err(CylonError::TransportClosed { edge: self.edge });
        }

        let mut all_queues_empty = true;

        for s in &mut self.sends {
            while let Some(request) = s.request_queue.pop_front() {
                let length = request.len();
                match self.channel.send(request)? {
                    None => s.pending_queue.push_back(length),
                    Some(refused) => {
                        s.request_queue.push_front(refused);
                        break;
                    }
                }
            }

            if s.request_queue.is_empty() && s.pending_queue.is_empty() {
                if self.finish_flag && s.send_status == AllToAllSendStatus::Sending {
                    let fin = Box::new(CylonRequest::new_finish(s.target));
                    if self.channel.send_fin(fin)? {
                        s.send_status = AllToAllSendStatus::FinishSent;
                    }
                }
            } else {
                all_queues_empty = false;
            }
        }

        let mut on_send = SendDispatch {
            sends: &mut self.sends,
            send_index: &self.send_index,
            finished_targets: &mut self.finished_targets,
            callback: &mut *callback,
        };
        self.channel.progress_sends(&mut on_send)?;

        let mut on_receive = ReceiveDispatch {
            finished_sources: &mut self.finished_sources,
            callback: &mut *callback,
        };
        self.channel.progress_receives(&mut on_receive)?;

        let completed = all_queues_empty
            && self.finished_targets.len() == self.targets.len()
            && self.finished_sources.len() == self.sources.len();

        if completed && !self.completed {
            trace!("worker {} completed edge {}", self.worker_id, self.edge);
            self.completed = true;
            self.channel.notify_completed();
        }

        Ok(completed)
    }

    /// Signal that no more inserts will be made
    ///
    /// After calling this, is_complete() will send finish messages
    /// once all queued data is sent.
    pub fn finish(&mut self) {
        self.finish_flag = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finish_flag
    }

    /// Sources whose finish announcement arrived
    pub fn finished_sources(&self) -> &HashSet<i32> {
        &self.finished_sources
    }

    /// Buffers inserted that no receiver has taken yet
    pub fn in_flight(&self) -> usize {
        let queued: usize = self.sends.iter().map(|s| s.request_queue.len()).sum();
        queued + self.channel.in_flight()
    }

    /// Bytes inserted and not yet completed by the channel
    pub fn queued_bytes(&self) -> usize {
        self.sends.iter().map(|s| s.message_sizes).sum()
    }

    pub fn sources(&self) -> &[i32] {
        &self.sources
    }

    pub fn targets(&self) -> &[i32] {
        &self.targets
    }

    pub fn edge(&self) -> i32 {
        self.edge
    }

    /// Close the all-to-all operation
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sends.clear();
        self.send_index.clear();
        self.channel.close();
    }
}

struct SendDispatch<'a, C: ?Sized> {
    sends: &'a mut Vec<AllToAllSends>,
    send_index: &'a HashMap<i32, usize>,
    finished_targets: &'a mut HashSet<i32>,
    callback: &'a mut C,
}

impl<C: ReceiveCallback + ?Sized> ChannelSendCallback for SendDispatch<'_, C> {
    fn send_complete(&mut self, request: Box<CylonRequest>) {
        let target = request.target;
        if let Some(&idx) = self.send_index.get(&target) {
            let s = &mut self.sends[idx];
            let length = s.pending_queue.pop_front().unwrap_or(0);
            s.message_sizes = s.message_sizes.saturating_sub(length);
            self.callback.on_send_complete(target, length);
        }
    }

    fn send_finish_complete(&mut self, request: Box<CylonRequest>) {
        let target = request.target;
        self.finished_targets.insert(target);
        if let Some(&idx) = self.send_index.get(&target) {
            self.sends[idx].send_status = AllToAllSendStatus::Finished;
        }
    }
}

struct ReceiveDispatch<'a, C: ?Sized> {
    finished_sources: &'a mut HashSet<i32>,
    callback: &'a mut C,
}

impl<C: ReceiveCallback + ?Sized> ChannelReceiveCallback for ReceiveDispatch<'_, C> {
    fn received_data(&mut self, receive_id: i32, buffer: Box<dyn Buffer>, length: usize) {
        self.callback.on_receive(receive_id, buffer, length);
    }

    fn received_header(&mut self, receive_id: i32, finished: bool, header: Option<Vec<i32>>) {
        if finished {
            self.finished_sources.insert(receive_id);
        }
        self.callback.on_receive_header(receive_id, finished, header);
    }
}
