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

//! In-process communication backend
//!
//! A [`LocalFabric`] is a world of workers living in one process, typically
//! one thread per worker. Every worker gets a [`LocalCommunicator`] and the
//! channels it creates exchange messages through mailboxes keyed by
//! `(edge, destination)`. Messages from one source reach a destination in the
//! order they were sent, and traffic of different edges never mixes.
//!
//! A finish announcement counts as sent only once the receiver drained it and
//! acknowledged it back to the sender.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use log::{debug, warn};

use crate::error::{CylonError, CylonResult};

use super::buffer::VecBuffer;
use super::request::CylonRequest;
use super::{
    Channel, ChannelReceiveCallback, ChannelSendCallback, CommType, Communicator, MAX_PENDING,
};

/// A message in flight between two local workers
struct Envelope {
    source: i32,
    header: Vec<i32>,
    data: Vec<u8>,
    fin: bool,
}

/// Shared medium of an in-process worker group
pub struct LocalFabric {
    world_size: i32,
    mailboxes: Mutex<HashMap<(i32, i32), VecDeque<Envelope>>>,
    /// `(edge, sender)` -> receivers that drained the sender's finish
    acks: Mutex<HashMap<(i32, i32), Vec<i32>>>,
    barrier: Barrier,
    shutdown: AtomicBool,
}

impl LocalFabric {
    /// Create a world of `world_size` workers
    pub fn new(world_size: i32) -> CylonResult<Arc<Self>> {
        if world_size < 1 {
            return Err(CylonError::Invalid(format!(
                "world size must be positive, got {}",
                world_size
            )));
        }
        Ok(Arc::new(Self {
            world_size,
            mailboxes: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            barrier: Barrier::new(world_size as usize),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn world_size(&self) -> i32 {
        self.world_size
    }

    /// The communicator of worker `rank`
    pub fn communicator(self: &Arc<Self>, rank: i32) -> CylonResult<Arc<LocalCommunicator>> {
        if rank < 0 || rank >= self.world_size {
            return Err(CylonError::Invalid(format!(
                "rank {} outside world of size {}",
                rank, self.world_size
            )));
        }
        Ok(Arc::new(LocalCommunicator {
            rank,
            fabric: Arc::clone(self),
            finalized: AtomicBool::new(false),
        }))
    }

    /// One communicator per rank, in rank order
    pub fn communicators(self: &Arc<Self>) -> Vec<Arc<LocalCommunicator>> {
        (0..self.world_size)
            .map(|rank| Arc::new(LocalCommunicator {
                rank,
                fabric: Arc::clone(self),
                finalized: AtomicBool::new(false),
            }))
            .collect()
    }

    /// Tear the world down. Undelivered messages are dropped and every
    /// channel operation fails with `TransportClosed` from now on.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Ok(mut mailboxes) = self.mailboxes.lock() {
            mailboxes.clear();
        }
        if let Ok(mut acks) = self.acks.lock() {
            acks.clear();
        }
        debug!("local fabric of {} workers shut down", self.world_size);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Messages waiting to be picked up by `rank` on `edge`
    pub fn pending_messages(&self, edge: i32, rank: i32) -> usize {
        self.mailboxes
            .lock()
            .map(|m| m.get(&(edge, rank)).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Data messages `source` posted on `edge` that no receiver took yet
    pub fn in_flight(&self, edge: i32, source: i32) -> usize {
        self.mailboxes
            .lock()
            .map(|m| {
                m.iter()
                    .filter(|((e, _), _)| *e == edge)
                    .flat_map(|(_, q)| q.iter())
                    .filter(|env| env.source == source && !env.fin)
                    .count()
            })
            .unwrap_or(0)
    }

    fn post(&self, edge: i32, target: i32, envelope: Envelope) -> CylonResult<()> {
        if self.is_shutdown() {
            return Err(CylonError::TransportClosed { edge });
        }
        let mut mailboxes = self.mailboxes.lock()?;
        mailboxes
            .entry((edge, target))
            .or_default()
            .push_back(envelope);
        Ok(())
    }

    fn drain(&self, edge: i32, target: i32) -> CylonResult<Vec<Envelope>> {
        if self.is_shutdown() {
            return Err(CylonError::TransportClosed { edge });
        }
        let mut mailboxes = self.mailboxes.lock()?;
        Ok(mailboxes
            .get_mut(&(edge, target))
            .map(|q| q.drain(..).collect())
            .unwrap_or_default())
    }

    fn acknowledge(&self, edge: i32, sender: i32, receiver: i32) -> CylonResult<()> {
        if self.is_shutdown() {
            return Err(CylonError::TransportClosed { edge });
        }
        self.acks.lock()?.entry((edge, sender)).or_default().push(receiver);
        Ok(())
    }

    fn take_acks(&self, edge: i32, sender: i32) -> CylonResult<Vec<i32>> {
        if self.is_shutdown() {
            return Err(CylonError::TransportClosed { edge });
        }
        Ok(self.acks.lock()?.remove(&(edge, sender)).unwrap_or_default())
    }

    fn release(&self, edge: i32, rank: i32) {
        if let Ok(mut acks) = self.acks.lock() {
            acks.remove(&(edge, rank));
        }
        if let Ok(mut mailboxes) = self.mailboxes.lock() {
            if let Some(left) = mailboxes.remove(&(edge, rank)) {
                if !left.is_empty() {
                    warn!(
                        "worker {} dropped {} undelivered messages on edge {}",
                        rank,
                        left.len(),
                        edge
                    );
                }
            }
        }
    }
}

/// Communicator of one worker of a [`LocalFabric`]
pub struct LocalCommunicator {
    rank: i32,
    fabric: Arc<LocalFabric>,
    finalized: AtomicBool,
}

impl LocalCommunicator {
    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }
}

impl Communicator for LocalCommunicator {
    fn get_rank(&self) -> i32 {
        self.rank
    }

    fn get_world_size(&self) -> i32 {
        self.fabric.world_size
    }

    fn get_comm_type(&self) -> CommType {
        CommType::Local
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn finalize(&self) -> CylonResult<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn barrier(&self) -> CylonResult<()> {
        if self.fabric.is_shutdown() {
            return Err(CylonError::Communication("barrier on a shut down fabric".into()));
        }
        self.fabric.barrier.wait();
        Ok(())
    }

    fn create_channel(&self) -> CylonResult<Box<dyn Channel>> {
        if self.is_finalized() {
            return Err(CylonError::Invalid(format!(
                "communicator of worker {} is finalized",
                self.rank
            )));
        }
        Ok(Box::new(LocalChannel::new(self.rank, Arc::clone(&self.fabric))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStatus {
    Sending,
    /// finish posted, waiting for the receiver's acknowledgement
    FinishPosted,
    Done,
}

struct PendingSend {
    pending_data: VecDeque<Box<CylonRequest>>,
    finish: Option<Box<CylonRequest>>,
    status: SendStatus,
}

impl PendingSend {
    fn new() -> Self {
        Self {
            pending_data: VecDeque::new(),
            finish: None,
            status: SendStatus::Sending,
        }
    }
}

/// Channel between workers of a [`LocalFabric`]
pub struct LocalChannel {
    rank: i32,
    edge: i32,
    fabric: Arc<LocalFabric>,
    sends: HashMap<i32, PendingSend>,
    receives: HashSet<i32>,
    max_pending: usize,
    initialized: bool,
    closed: bool,
}

impl LocalChannel {
    pub fn new(rank: i32, fabric: Arc<LocalFabric>) -> Self {
        Self::with_max_pending(rank, fabric, MAX_PENDING)
    }

    /// A channel that holds at most `max_pending` unsent buffers per target
    pub fn with_max_pending(rank: i32, fabric: Arc<LocalFabric>, max_pending: usize) -> Self {
        Self {
            rank,
            edge: 0,
            fabric,
            sends: HashMap::new(),
            receives: HashSet::new(),
            max_pending: max_pending.max(1),
            initialized: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> CylonResult<()> {
        if self.closed || self.fabric.is_shutdown() {
            return Err(CylonError::TransportClosed { edge: self.edge });
        }
        Ok(())
    }
}

impl Channel for LocalChannel {
    fn init(&mut self, edge: i32, receives: &[i32], sends: &[i32]) -> CylonResult<()> {
        self.edge = edge;
        self.ensure_open()?;
        for &target in sends {
            if target < 0 || target >= self.fabric.world_size {
                return Err(CylonError::Invalid(format!(
                    "send target {} outside world of size {}",
                    target, self.fabric.world_size
                )));
            }
            self.sends.insert(target, PendingSend::new());
        }
        self.receives = receives.iter().copied().collect();
        self.initialized = true;
        Ok(())
    }

    fn send(&mut self, request: Box<CylonRequest>) -> CylonResult<Option<Box<CylonRequest>>> {
        self.ensure_open()?;
        let target = request.target;
        let ps = self.sends.get_mut(&target).ok_or_else(|| {
            CylonError::Invalid(format!("worker {} is not a send target", target))
        })?;
        if ps.finish.is_some() || ps.status != SendStatus::Sending {
            return Err(CylonError::Invalid(format!(
                "send to worker {} after finish on edge {}",
                target, self.edge
            )));
        }
        if ps.pending_data.len() >= self.max_pending {
            return Ok(Some(request));
        }
        ps.pending_data.push_back(request);
        Ok(None)
    }

    fn send_fin(&mut self, request: Box<CylonRequest>) -> CylonResult<bool> {
        self.ensure_open()?;
        let target = request.target;
        let ps = self.sends.get_mut(&target).ok_or_else(|| {
            CylonError::Invalid(format!("worker {} is not a send target", target))
        })?;
        if ps.finish.is_some() || ps.status != SendStatus::Sending {
            return Ok(false);
        }
        ps.finish = Some(request);
        Ok(true)
    }

    fn progress_sends(&mut self, callback: &mut dyn ChannelSendCallback) -> CylonResult<()> {
        self.ensure_open()?;
        for (&target, ps) in self.sends.iter_mut() {
            while let Some(mut request) = ps.pending_data.pop_front() {
                let envelope = Envelope {
                    source: self.rank,
                    header: request.header().to_vec(),
                    data: std::mem::take(&mut request.buffer),
                    fin: false,
                };
                self.fabric.post(self.edge, target, envelope)?;
                callback.send_complete(request);
            }

            if ps.status == SendStatus::Sending && ps.finish.is_some() {
                let envelope = Envelope {
                    source: self.rank,
                    header: Vec::new(),
                    data: Vec::new(),
                    fin: true,
                };
                self.fabric.post(self.edge, target, envelope)?;
                ps.status = SendStatus::FinishPosted;
            }
        }

        for receiver in self.fabric.take_acks(self.edge, self.rank)? {
            match self.sends.get_mut(&receiver) {
                Some(ps) if ps.status == SendStatus::FinishPosted => {
                    ps.status = SendStatus::Done;
                    if let Some(fin) = ps.finish.take() {
                        callback.send_finish_complete(fin);
                    }
                }
                _ => warn!(
                    "worker {} got an unexpected finish acknowledgement from {} on edge {}",
                    self.rank, receiver, self.edge
                ),
            }
        }
        Ok(())
    }

    fn progress_receives(&mut self, callback: &mut dyn ChannelReceiveCallback) -> CylonResult<()> {
        self.ensure_open()?;
        for envelope in self.fabric.drain(self.edge, self.rank)? {
            if !self.receives.contains(&envelope.source) {
                warn!(
                    "worker {} dropped message from unexpected source {} on edge {}",
                    self.rank, envelope.source, self.edge
                );
                continue;
            }
            if envelope.fin {
                self.fabric.acknowledge(self.edge, envelope.source, self.rank)?;
                callback.received_header(envelope.source, true, None);
            } else {
                let length = envelope.data.len();
                callback.received_header(envelope.source, false, Some(envelope.header));
                callback.received_data(
                    envelope.source,
                    Box::new(VecBuffer::with_data(envelope.data)),
                    length,
                );
            }
        }
        Ok(())
    }

    fn in_flight(&self) -> usize {
        let queued: usize = self.sends.values().map(|ps| ps.pending_data.len()).sum();
        queued + self.fabric.in_flight(self.edge, self.rank)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sends.clear();
        if self.initialized {
            self.fabric.release(self.edge, self.rank);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed || self.fabric.is_shutdown()
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}
