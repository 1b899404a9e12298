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

//! Arrow table all-to-all between workers
//!
//! Every table travels as one Arrow IPC stream in a single buffer. The
//! buffer header carries `[reference, num_batches]`, where the reference is
//! an opaque caller value handed back on the receiving side.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use log::{trace, warn};

use crate::ctx::CylonContext;
use crate::error::{CylonError, CylonResult};
use crate::net::ops::{AllToAll, ReceiveCallback};
use crate::net::serialize::{deserialize_table, serialize_table_with_compression, IpcCompression};
use crate::net::Buffer;
use crate::table::Table;

/// Callback for receiving Arrow tables: `(source_worker, table, reference)`.
/// Returns true if the table was accepted.
pub type ArrowCallback = Box<dyn FnMut(i32, Table, i32) -> bool + Send>;

/// Reference of tables inserted without one
pub const NO_REFERENCE: i32 = -1;

const HEADER_REFERENCE: usize = 0;
const HEADER_BATCHES: usize = 1;

/// A buffer that arrived but could not be turned into a table
#[derive(Debug)]
pub struct ReceiveFailure {
    pub source: i32,
    pub reference: i32,
    pub error: CylonError,
}

struct ReceivedTable {
    source: i32,
    reference: i32,
    table: Table,
}

/// Pairs headers with their data and decodes tables
struct TableReceiver {
    ctx: Arc<CylonContext>,
    headers: HashMap<i32, VecDeque<Vec<i32>>>,
    received: VecDeque<ReceivedTable>,
    failures: Vec<ReceiveFailure>,
}

impl TableReceiver {
    fn decode(&self, header: &[i32], data: &[u8]) -> CylonResult<Table> {
        let table = deserialize_table(self.ctx.clone(), data)?;
        let expected = header.get(HEADER_BATCHES).copied().unwrap_or(-1);
        if table.num_batches() as i32 != expected {
            return Err(CylonError::Serialization(format!(
                "expected {} batches, decoded {}",
                expected,
                table.num_batches()
            )));
        }
        Ok(table)
    }
}

impl ReceiveCallback for TableReceiver {
    fn on_receive(&mut self, source: i32, buffer: Box<dyn Buffer>, length: usize) -> bool {
        let header = self
            .headers
            .get_mut(&source)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        let reference = header.get(HEADER_REFERENCE).copied().unwrap_or(NO_REFERENCE);
        let data = &buffer.data()[..length.min(buffer.len())];

        match self.decode(&header, data) {
            Ok(table) => {
                self.received.push_back(ReceivedTable {
                    source,
                    reference,
                    table,
                });
                true
            }
            Err(error) => {
                warn!(
                    "failed to decode table from worker {} with reference {}: {}",
                    source, reference, error
                );
                self.failures.push(ReceiveFailure {
                    source,
                    reference,
                    error,
                });
                false
            }
        }
    }

    fn on_receive_header(&mut self, source: i32, finished: bool, header: Option<Vec<i32>>) -> bool {
        if finished {
            trace!("worker {} finished sending", source);
            return true;
        }
        self.headers
            .entry(source)
            .or_default()
            .push_back(header.unwrap_or_default());
        true
    }

    fn on_send_complete(&mut self, _target: i32, _length: usize) -> bool {
        true
    }
}

/// Arrow table all-to-all communication
///
/// Tables inserted for a target are delivered in insertion order. Received
/// tables are handed to the callback from [`is_complete`](Self::is_complete),
/// on the thread that drives the operation.
pub struct ArrowAllToAll {
    all: AllToAll,
    receiver: TableReceiver,
    recv_callback: ArrowCallback,
    schema: SchemaRef,
    compression: IpcCompression,
    completed: bool,
}

impl ArrowAllToAll {
    /// Create a new ArrowAllToAll operation on a fresh channel of the
    /// context's communicator
    pub fn new(
        ctx: Arc<CylonContext>,
        sources: Vec<i32>,
        targets: Vec<i32>,
        edge_id: i32,
        callback: ArrowCallback,
        schema: SchemaRef,
    ) -> CylonResult<Self> {
        let channel = ctx.create_channel()?;
        let all = AllToAll::new(ctx.get_rank(), sources, targets, edge_id, channel)?;

        Ok(Self {
            all,
            receiver: TableReceiver {
                ctx,
                headers: HashMap::new(),
                received: VecDeque::new(),
                failures: Vec::new(),
            },
            recv_callback: callback,
            schema,
            compression: IpcCompression::None,
            completed: false,
        })
    }

    /// Compress tables inserted from now on
    pub fn with_compression(mut self, compression: IpcCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Insert a table to be sent to a target
    pub fn insert(&mut self, table: &Table, target: i32) -> CylonResult<usize> {
        self.insert_with_reference(table, target, NO_REFERENCE)
    }

    /// Insert a table with a reference value to be sent to a target.
    /// Returns the number of bytes queued.
    pub fn insert_with_reference(&mut self, table: &Table, target: i32, reference: i32) -> CylonResult<usize> {
        if table.schema().fields() != self.schema.fields() {
            return Err(CylonError::SchemaMismatch {
                expected: self.schema.to_string(),
                actual: table.schema().to_string(),
            });
        }
        let data = serialize_table_with_compression(table, self.compression)?;
        let length = data.len();
        self.insert_serialized(data, table.num_batches(), target, reference)?;
        Ok(length)
    }

    /// Insert a table already encoded as an Arrow IPC stream
    pub fn insert_serialized(
        &mut self,
        data: Vec<u8>,
        num_batches: usize,
        target: i32,
        reference: i32,
    ) -> CylonResult<()> {
        let header = [reference, num_batches as i32];
        self.all.insert_with_header(data, target, &header)
    }

    /// Progress the operation and hand received tables to the callback.
    ///
    /// Complete once every source finished, every target acknowledged this
    /// worker's finish and every received table was handed over.
    pub fn is_complete(&mut self) -> CylonResult<bool> {
        if self.completed {
            return Ok(true);
        }

        let transport_done = self.all.is_complete(&mut self.receiver)?;

        while let Some(received) = self.receiver.received.pop_front() {
            if !(self.recv_callback)(received.source, received.table, received.reference) {
                trace!(
                    "table from worker {} with reference {} was not accepted",
                    received.source,
                    received.reference
                );
            }
        }

        self.completed = transport_done && self.all.is_finished();
        Ok(self.completed)
    }

    /// Tables inserted that no receiver has taken yet
    pub fn in_flight(&self) -> usize {
        self.all.in_flight()
    }

    /// Buffers that could not be decoded since the last call
    pub fn take_failures(&mut self) -> Vec<ReceiveFailure> {
        std::mem::take(&mut self.receiver.failures)
    }

    /// Signal that no more tables will be inserted
    pub fn finish(&mut self) {
        self.all.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.all.is_finished()
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn edge(&self) -> i32 {
        self.all.edge()
    }

    pub fn sources(&self) -> &[i32] {
        self.all.sources()
    }

    pub fn targets(&self) -> &[i32] {
        self.all.targets()
    }

    /// Close the operation and release its channel
    pub fn close(&mut self) {
        self.receiver.received.clear();
        self.receiver.headers.clear();
        self.all.close();
    }
}
