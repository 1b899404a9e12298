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

//! Tests for the in-process channel

use std::collections::HashMap;

use cylon_tasks::error::{CylonError, CylonResult};
use cylon_tasks::net::local::{LocalChannel, LocalFabric};
use cylon_tasks::net::request::CylonRequest;
use cylon_tasks::net::{Buffer, Channel, ChannelReceiveCallback, ChannelSendCallback, Communicator};

#[derive(Default)]
struct Recorder {
    data: Vec<(i32, Vec<u8>)>,
    headers: Vec<(i32, Vec<i32>)>,
    finished: Vec<i32>,
    sent: usize,
    fins_sent: usize,
}

impl ChannelReceiveCallback for Recorder {
    fn received_data(&mut self, receive_id: i32, buffer: Box<dyn Buffer>, length: usize) {
        self.data.push((receive_id, buffer.data()[..length].to_vec()));
    }

    fn received_header(&mut self, receive_id: i32, finished: bool, header: Option<Vec<i32>>) {
        if finished {
            self.finished.push(receive_id);
        } else {
            self.headers.push((receive_id, header.unwrap_or_default()));
        }
    }
}

impl ChannelSendCallback for Recorder {
    fn send_complete(&mut self, _request: Box<CylonRequest>) {
        self.sent += 1;
    }

    fn send_finish_complete(&mut self, _request: Box<CylonRequest>) {
        self.fins_sent += 1;
    }
}

#[test]
fn test_fifo_per_source_and_finish() -> CylonResult<()> {
    let fabric = LocalFabric::new(2)?;
    let mut sender = LocalChannel::new(0, fabric.clone());
    let mut receiver = LocalChannel::new(1, fabric.clone());
    sender.init(5, &[], &[1])?;
    receiver.init(5, &[0], &[])?;

    let mut send_log = Recorder::default();
    for i in 0..10u8 {
        let request = CylonRequest::new_with_header(1, vec![i; 3], &[i as i32, 42]);
        assert!(sender.send(Box::new(request))?.is_none());
    }
    assert!(sender.send_fin(Box::new(CylonRequest::new_finish(1)))?);
    assert!(!sender.send_fin(Box::new(CylonRequest::new_finish(1)))?, "second finish is refused");
    sender.progress_sends(&mut send_log)?;
    assert_eq!(send_log.sent, 10);
    assert_eq!(send_log.fins_sent, 0, "finish counts once the receiver acknowledged it");
    assert_eq!(fabric.pending_messages(5, 1), 11);
    assert_eq!(sender.in_flight(), 10);

    let mut recv_log = Recorder::default();
    receiver.progress_receives(&mut recv_log)?;
    let order: Vec<u8> = recv_log.data.iter().map(|(_, d)| d[0]).collect();
    assert_eq!(order, (0..10).collect::<Vec<u8>>());
    assert_eq!(recv_log.headers[3], (0, vec![3, 42]));
    assert_eq!(recv_log.finished, vec![0]);
    assert_eq!(sender.in_flight(), 0);

    sender.progress_sends(&mut send_log)?;
    assert_eq!(send_log.fins_sent, 1);
    sender.progress_sends(&mut send_log)?;
    assert_eq!(send_log.fins_sent, 1, "one acknowledgement completes one finish");

    let late = sender.send(Box::new(CylonRequest::new(1, vec![1])));
    assert!(matches!(late, Err(CylonError::Invalid(_))), "no sends after finish");
    Ok(())
}

#[test]
fn test_backpressure_hands_request_back() -> CylonResult<()> {
    let fabric = LocalFabric::new(2)?;
    let mut channel = LocalChannel::with_max_pending(0, fabric, 2);
    channel.init(1, &[], &[1])?;

    assert!(channel.send(Box::new(CylonRequest::new(1, vec![1])))?.is_none());
    assert!(channel.send(Box::new(CylonRequest::new(1, vec![2])))?.is_none());
    let refused = channel.send(Box::new(CylonRequest::new(1, vec![3])))?;
    assert_eq!(refused.map(|r| r.buffer), Some(vec![3]));

    channel.progress_sends(&mut Recorder::default())?;
    assert!(channel.send(Box::new(CylonRequest::new(1, vec![3])))?.is_none());
    Ok(())
}

#[test]
fn test_edges_are_isolated() -> CylonResult<()> {
    let fabric = LocalFabric::new(2)?;
    let comms = fabric.communicators();
    let mut channels = HashMap::new();
    for edge in [1, 2] {
        let mut tx = comms[0].create_channel()?;
        let mut rx = comms[1].create_channel()?;
        tx.init(edge, &[], &[1])?;
        rx.init(edge, &[0], &[])?;
        tx.send(Box::new(CylonRequest::new(1, vec![edge as u8])))?;
        tx.progress_sends(&mut Recorder::default())?;
        channels.insert(edge, (tx, rx));
    }

    for (edge, (_, rx)) in channels.iter_mut() {
        let mut log = Recorder::default();
        rx.progress_receives(&mut log)?;
        assert_eq!(log.data, vec![(0, vec![*edge as u8])]);
    }
    Ok(())
}

#[test]
fn test_unexpected_source_is_dropped() -> CylonResult<()> {
    let fabric = LocalFabric::new(3)?;
    let mut stranger = LocalChannel::new(2, fabric.clone());
    let mut receiver = LocalChannel::new(1, fabric);
    stranger.init(9, &[], &[1])?;
    receiver.init(9, &[0], &[])?;

    stranger.send(Box::new(CylonRequest::new(1, vec![7])))?;
    stranger.progress_sends(&mut Recorder::default())?;

    let mut log = Recorder::default();
    receiver.progress_receives(&mut log)?;
    assert!(log.data.is_empty());
    Ok(())
}

#[test]
fn test_shutdown_closes_channels() -> CylonResult<()> {
    let fabric = LocalFabric::new(2)?;
    let mut channel = LocalChannel::new(0, fabric.clone());
    channel.init(3, &[1], &[1])?;
    fabric.shutdown();

    assert!(channel.is_closed());
    let err = channel.send(Box::new(CylonRequest::new(1, vec![1]))).unwrap_err();
    assert!(err.is_transport_closed());
    assert!(channel
        .progress_receives(&mut Recorder::default())
        .unwrap_err()
        .is_transport_closed());
    Ok(())
}
