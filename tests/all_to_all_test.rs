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

//! Tests for the worker-level AllToAll and ArrowAllToAll

use std::sync::{Arc, Mutex};

use arrow::array::{Array, Int32Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use cylon_tasks::arrow::{ArrowAllToAll, ArrowCallback};
use cylon_tasks::ctx::CylonContext;
use cylon_tasks::error::CylonResult;
use cylon_tasks::net::ops::{AllToAll, ReceiveCallback};
use cylon_tasks::net::Buffer;
use cylon_tasks::table::Table;

#[derive(Default)]
struct Collector {
    headers: Vec<(i32, Vec<i32>)>,
    data: Vec<(i32, Vec<u8>)>,
    finished: Vec<i32>,
    bytes_sent: usize,
}

impl ReceiveCallback for Collector {
    fn on_receive(&mut self, source: i32, buffer: Box<dyn Buffer>, length: usize) -> bool {
        self.data.push((source, buffer.data()[..length].to_vec()));
        true
    }

    fn on_receive_header(&mut self, source: i32, finished: bool, header: Option<Vec<i32>>) -> bool {
        if finished {
            self.finished.push(source);
        } else {
            self.headers.push((source, header.unwrap_or_default()));
        }
        true
    }

    fn on_send_complete(&mut self, _target: i32, length: usize) -> bool {
        self.bytes_sent += length;
        true
    }
}

#[test]
fn test_all_to_all_between_three_workers() -> CylonResult<()> {
    let (_fabric, contexts) = CylonContext::init_local_world(3)?;

    let results: Vec<(i32, Collector)> = std::thread::scope(|s| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                s.spawn(move || -> CylonResult<(i32, Collector)> {
                    let rank = ctx.get_rank();
                    let workers = ctx.get_neighbours(true);
                    let mut all = AllToAll::new(rank, workers.clone(), workers.clone(), 1, ctx.create_channel()?)?;

                    for &target in &workers {
                        for seq in 0..5 {
                            all.insert_with_header(vec![rank as u8, seq as u8], target, &[rank, seq])?;
                        }
                    }
                    all.finish();

                    let mut collector = Collector::default();
                    while !all.is_complete(&mut collector)? {
                        std::thread::yield_now();
                    }
                    assert_eq!(all.queued_bytes(), 0);
                    all.close();
                    Ok((rank, collector))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<CylonResult<Vec<_>>>()
    })?;

    for (rank, collector) in results {
        assert_eq!(collector.data.len(), 15, "worker {} receives 5 buffers from each worker", rank);
        assert_eq!(collector.bytes_sent, 30);
        let mut finished = collector.finished.clone();
        finished.sort();
        assert_eq!(finished, vec![0, 1, 2]);

        for source in 0..3 {
            let seqs: Vec<u8> = collector
                .data
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, d)| d[1])
                .collect();
            assert_eq!(seqs, vec![0, 1, 2, 3, 4], "buffers from {} arrive in order", source);
        }
        assert!(collector.headers.iter().all(|(s, h)| h[0] == *s && h.len() == 2));
    }
    Ok(())
}

#[test]
fn test_insert_rules() -> CylonResult<()> {
    let ctx = CylonContext::init()?;
    let mut all = AllToAll::new(0, vec![0], vec![0], 4, ctx.create_channel()?)?;

    assert!(all.insert(vec![1], 3).is_err(), "3 is not a target");
    assert!(all.insert_with_header(vec![1], 0, &[0; 7]).is_err(), "header too long");

    all.finish();
    assert!(all.insert(vec![1], 0).is_err(), "insert after finish");

    all.close();
    assert!(all.insert(vec![1], 0).unwrap_err().is_transport_closed());
    Ok(())
}

#[test]
fn test_worker_without_peers_completes_after_finish() -> CylonResult<()> {
    let ctx = CylonContext::init()?;
    let mut all = AllToAll::new(0, vec![], vec![], 6, ctx.create_channel()?)?;
    all.finish();
    assert!(all.is_complete(&mut Collector::default())?);
    Ok(())
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]))
}

#[test]
fn test_arrow_all_to_all_references() -> CylonResult<()> {
    let (_fabric, contexts) = CylonContext::init_local_world(2)?;

    let received: Vec<Vec<(i32, i32, Vec<i32>)>> = std::thread::scope(|s| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                s.spawn(move || -> CylonResult<Vec<(i32, i32, Vec<i32>)>> {
                    let rank = ctx.get_rank();
                    let got = Arc::new(Mutex::new(Vec::<(i32, i32, Vec<i32>)>::new()));
                    let sink = got.clone();
                    let callback: ArrowCallback = Box::new(move |source, table: Table, reference| {
                        let values = table
                            .batches()
                            .iter()
                            .flat_map(|b| {
                                let col = b.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
                                col.values().to_vec()
                            })
                            .collect::<Vec<i32>>();
                        sink.lock().unwrap().push((source, reference, values));
                        true
                    });

                    let mut all = ArrowAllToAll::new(ctx.clone(), vec![0, 1], vec![0, 1], 2, callback, schema())?;
                    let peer = 1 - rank;
                    let batch = RecordBatch::try_new(schema(), vec![Arc::new(Int32Array::from(vec![rank, rank + 10]))])?;
                    all.insert_with_reference(&Table::from_record_batch(ctx.clone(), batch)?, peer, 100 + peer)?;
                    all.finish();
                    while !all.is_complete()? {
                        std::thread::yield_now();
                    }
                    all.close();
                    let result = got.lock().unwrap().clone();
                    Ok(result)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<CylonResult<Vec<_>>>()
    })?;

    assert_eq!(received[0], vec![(1, 100, vec![1, 11])]);
    assert_eq!(received[1], vec![(0, 101, vec![0, 10])]);
    Ok(())
}
