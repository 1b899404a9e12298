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

//! Task-granularity all-to-all of Arrow tables
//!
//! Logical tasks live on workers as described by a [`LogicalTaskPlan`].
//! A table inserted for a target task is sent to the worker owning that task,
//! tagged with the task id, and handed to the callback on that worker as
//! `callback(table, task)`.
//!
//! Producers only serialize and enqueue. A delivery thread owned by the
//! engine drives the worker-level [`ArrowAllToAll`]: it forwards queued
//! tables, runs the finish protocol, decodes arrivals and calls the
//! callback. It stops taking queued tables while `max_pending_tables` of
//! them are still unread by their receivers, so a slow consumer pushes back
//! on `insert_table`.
//!
//! ```ignore
//! let shuffle = ArrowTaskAllToAll::new(ctx, plan, edge, callback, schema)?;
//! shuffle.insert_table(&partition, 2)?;
//! shuffle.close_sends()?;
//! shuffle.wait_for_completion()?;
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;
use log::{debug, error, info, warn};

use crate::ctx::CylonContext;
use crate::error::{Code, CylonError, CylonResult};
use crate::net::serialize::serialize_table_with_compression;
use crate::table::Table;

use super::arrow_all_to_all::{ArrowAllToAll, ArrowCallback};
use super::config::ShuffleConfig;
use super::delivery::{DeliveryRejection, RejectReason, ShuffleStats};
use super::task_plan::LogicalTaskPlan;

/// Delivery callback: `(table, target_task) -> accepted`.
///
/// Runs on the engine's delivery thread and must not insert into the same
/// engine.
pub type ArrowTaskCallback = Box<dyn FnMut(Table, i32) -> bool + Send>;

enum Command {
    Insert {
        data: Vec<u8>,
        num_batches: usize,
        worker: i32,
        task: i32,
    },
    Finish,
}

/// Send side, guarded by the engine's mutex
struct SendHandle {
    commands: SyncSender<Command>,
    open_tasks: BTreeSet<i32>,
    finished: bool,
}

#[derive(Debug, Clone)]
enum TransportFailure {
    Closed,
    Rejected(String),
    /// The callback or the delivery thread panicked
    Panicked(String),
}

impl TransportFailure {
    fn to_error(&self, edge: i32) -> CylonError {
        match self {
            TransportFailure::Closed => CylonError::TransportClosed { edge },
            TransportFailure::Rejected(msg) => CylonError::TransportRejected(msg.clone()),
            TransportFailure::Panicked(msg) => CylonError::new(
                Code::ExecutionError,
                format!("delivery on edge {} panicked: {}", edge, msg),
            ),
        }
    }
}

#[derive(Default)]
struct ShuffleState {
    completed: bool,
    failure: Option<TransportFailure>,
    stats: ShuffleStats,
    rejections: Vec<DeliveryRejection>,
}

struct Shared {
    state: Mutex<ShuffleState>,
    changed: Condvar,
}

impl Shared {
    fn record_rejection(&self, rejection: DeliveryRejection, edge: i32) {
        warn!(
            "edge {}: dropped table from worker {} for task {}: {}",
            edge,
            rejection.source_worker,
            rejection.target_task,
            rejection.to_error(edge)
        );
        if let Ok(mut state) = self.state.lock() {
            state.stats.tables_received += 1;
            state.stats.tables_rejected += 1;
            state.rejections.push(rejection);
        }
    }

    fn record_delivery(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stats.tables_received += 1;
            state.stats.tables_delivered += 1;
        }
    }

    /// Keep the first failure of the round and wake every waiter
    fn record_failure(&self, failure: TransportFailure) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.failure.is_none() {
            state.failure = Some(failure);
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// All-to-all of Arrow tables between logical tasks
pub struct ArrowTaskAllToAll {
    plan: Arc<LogicalTaskPlan>,
    edge_id: i32,
    worker: i32,
    schema: SchemaRef,
    config: ShuffleConfig,
    send: Mutex<SendHandle>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    delivery: Option<JoinHandle<()>>,
}

impl ArrowTaskAllToAll {
    /// Create the engine with the configuration found in the context
    pub fn new(
        ctx: Arc<CylonContext>,
        plan: Arc<LogicalTaskPlan>,
        edge_id: i32,
        callback: ArrowTaskCallback,
        schema: SchemaRef,
    ) -> CylonResult<Self> {
        let config = ShuffleConfig::from_context(&ctx)?;
        Self::with_config(ctx, plan, edge_id, callback, schema, config)
    }

    pub fn with_config(
        ctx: Arc<CylonContext>,
        plan: Arc<LogicalTaskPlan>,
        edge_id: i32,
        callback: ArrowTaskCallback,
        schema: SchemaRef,
        config: ShuffleConfig,
    ) -> CylonResult<Self> {
        let worker = ctx.get_rank();
        let open_tasks: BTreeSet<i32> = plan.source_tasks_of(worker)?.into_iter().collect();
        let target_tasks = plan.target_tasks_of(worker)?.len();
        let sources = if plan.is_target_worker(worker) {
            plan.get_worker_sources().to_vec()
        } else {
            Vec::new()
        };
        let targets = if plan.is_source_worker(worker) {
            plan.get_worker_targets().to_vec()
        } else {
            Vec::new()
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(ShuffleState::default()),
            changed: Condvar::new(),
        });
        let dispatch = demultiplexer(
            callback,
            plan.clone(),
            worker,
            edge_id,
            schema.clone(),
            shared.clone(),
        );

        let mut all = ArrowAllToAll::new(ctx, sources, targets, edge_id, dispatch, schema.clone())?
            .with_compression(config.compression);

        let finished = open_tasks.is_empty();
        if finished {
            all.finish();
        }

        info!(
            "worker {} task all-to-all on edge {}: {} source tasks, {} target tasks, {} worker sources, {} worker targets",
            worker,
            edge_id,
            open_tasks.len(),
            target_tasks,
            all.sources().len(),
            all.targets().len()
        );

        let (commands, inbox) = mpsc::sync_channel(config.max_pending_tables.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let delivery = DeliveryLoop {
            all,
            inbox,
            shared: shared.clone(),
            shutdown: shutdown.clone(),
            poll_interval: config.poll_interval,
            max_in_flight: config.max_pending_tables.max(1),
            edge: edge_id,
        };
        let handle = std::thread::Builder::new()
            .name(format!("cylon-shuffle-{}-{}", edge_id, worker))
            .spawn(move || delivery.run())?;

        Ok(Self {
            plan,
            edge_id,
            worker,
            schema,
            config,
            send: Mutex::new(SendHandle {
                commands,
                open_tasks,
                finished,
            }),
            shared,
            shutdown,
            delivery: Some(handle),
        })
    }

    /// Queue `table` for `target_task`. Returns the number of serialized
    /// bytes queued. Success means queued, not delivered.
    pub fn insert_table(&self, table: &Table, target_task: i32) -> CylonResult<usize> {
        if !self.plan.is_target_task(target_task) {
            return Err(CylonError::UnknownTask {
                task: target_task,
                edge: self.edge_id,
            });
        }
        let worker = self.plan.worker_of(target_task)?;
        if !self.plan.is_target_worker(worker) || !self.plan.is_source_worker(self.worker) {
            return Err(CylonError::MalformedPlan(format!(
                "no route from worker {} to worker {} owning task {}",
                self.worker, worker, target_task
            )));
        }
        if table.schema().fields() != self.schema.fields() {
            return Err(CylonError::SchemaMismatch {
                expected: self.schema.to_string(),
                actual: table.schema().to_string(),
            });
        }
        self.check_transport()?;

        let data = serialize_table_with_compression(table, self.config.compression)?;
        let length = data.len();
        let command = Command::Insert {
            data,
            num_batches: table.num_batches(),
            worker,
            task: target_task,
        };

        {
            let handle = self.send.lock()?;
            if handle.finished {
                return Err(CylonError::Invalid(format!(
                    "worker {} already closed its sends on edge {}",
                    self.worker, self.edge_id
                )));
            }
            if self.config.block_on_backpressure {
                handle
                    .commands
                    .send(command)
                    .map_err(|_| self.closed_error())?;
            } else {
                handle.commands.try_send(command).map_err(|e| match e {
                    TrySendError::Full(_) => CylonError::TransportRejected(format!(
                        "{} tables already pending on edge {}",
                        self.config.max_pending_tables, self.edge_id
                    )),
                    TrySendError::Disconnected(_) => self.closed_error(),
                })?;
            }
        }

        let mut state = self.shared.state.lock()?;
        state.stats.tables_inserted += 1;
        state.stats.bytes_inserted += length as u64;
        Ok(length)
    }

    /// Declare that `source_task` inserts no more tables. Once every source
    /// task of this worker is closed the worker announces its finish, behind
    /// everything it inserted.
    pub fn close_task(&self, source_task: i32) -> CylonResult<()> {
        let unknown = CylonError::UnknownTask {
            task: source_task,
            edge: self.edge_id,
        };
        if !self.plan.is_source_task(source_task) {
            return Err(unknown);
        }
        if self.plan.worker_of(source_task)? != self.worker {
            return Err(unknown);
        }
        let mut handle = self.send.lock()?;
        handle.open_tasks.remove(&source_task);
        if handle.open_tasks.is_empty() {
            self.announce_finish(&mut handle)?;
        }
        Ok(())
    }

    /// Close every source task of this worker
    pub fn close_sends(&self) -> CylonResult<()> {
        let mut handle = self.send.lock()?;
        handle.open_tasks.clear();
        self.announce_finish(&mut handle)
    }

    fn announce_finish(&self, handle: &mut SendHandle) -> CylonResult<()> {
        if handle.finished {
            return Ok(());
        }
        handle
            .commands
            .send(Command::Finish)
            .map_err(|_| self.closed_error())?;
        handle.finished = true;
        debug!("worker {} closed its sends on edge {}", self.worker, self.edge_id);
        Ok(())
    }

    /// Whether every source finished, every target acknowledged this worker's
    /// finish and every received table was dispatched
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().map(|s| s.completed).unwrap_or(false)
    }

    /// Block until the round is complete
    pub fn wait_for_completion(&self) -> CylonResult<()> {
        let mut state = self.shared.state.lock()?;
        loop {
            if self.outcome(&state)? {
                return Ok(());
            }
            state = self.shared.changed.wait(state)?;
        }
    }

    /// Block until the round is complete or `timeout` passed. Returns whether
    /// the round completed.
    pub fn wait_for_completion_timeout(&self, timeout: Duration) -> CylonResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock()?;
        loop {
            if self.outcome(&state)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self.shared.changed.wait_timeout(state, deadline - now)?.0;
        }
    }

    /// Wait for completion without blocking an async runtime
    pub async fn wait_for_completion_async(&self) -> CylonResult<()> {
        loop {
            {
                let state = self.shared.state.lock()?;
                if self.outcome(&state)? {
                    return Ok(());
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Whether the round completed, or the failure that ended it
    fn outcome(&self, state: &ShuffleState) -> CylonResult<bool> {
        if state.completed {
            return Ok(true);
        }
        match &state.failure {
            Some(failure) => Err(failure.to_error(self.edge_id)),
            None => Ok(false),
        }
    }

    fn check_transport(&self) -> CylonResult<()> {
        match &self.shared.state.lock()?.failure {
            Some(failure) => Err(failure.to_error(self.edge_id)),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> CylonError {
        match self.check_transport() {
            Err(e) => e,
            Ok(()) => CylonError::TransportClosed { edge: self.edge_id },
        }
    }

    pub fn stats(&self) -> ShuffleStats {
        self.shared
            .state
            .lock()
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    /// Every received table that did not reach its task so far
    pub fn rejections(&self) -> Vec<DeliveryRejection> {
        self.shared
            .state
            .lock()
            .map(|s| s.rejections.clone())
            .unwrap_or_default()
    }

    pub fn edge_id(&self) -> i32 {
        self.edge_id
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn plan(&self) -> &Arc<LogicalTaskPlan> {
        &self.plan
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.config
    }
}

impl Drop for ArrowTaskAllToAll {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.delivery.take() {
            if handle.join().is_err() {
                error!("delivery thread of edge {} panicked", self.edge_id);
            }
        }
    }
}

/// Wrap the user callback with the checks every arrival goes through
fn demultiplexer(
    mut callback: ArrowTaskCallback,
    plan: Arc<LogicalTaskPlan>,
    worker: i32,
    edge: i32,
    schema: SchemaRef,
    shared: Arc<Shared>,
) -> ArrowCallback {
    let mut panicked = false;
    Box::new(move |source, table: Table, task| {
        let reason = check_arrival(&plan, worker, &schema, &table, task).or_else(|| {
            if panicked {
                return Some(RejectReason::Panicked("callback panicked earlier".to_string()));
            }
            match panic::catch_unwind(AssertUnwindSafe(|| callback(table, task))) {
                Ok(true) => None,
                Ok(false) => Some(RejectReason::Callback),
                Err(payload) => {
                    panicked = true;
                    let msg = panic_message(payload.as_ref());
                    error!("edge {}: callback panicked on a table for task {}: {}", edge, task, msg);
                    Some(RejectReason::Panicked(msg))
                }
            }
        });

        match reason {
            None => {
                shared.record_delivery();
                true
            }
            Some(reason) => {
                let failure = match &reason {
                    RejectReason::Panicked(msg) => Some(TransportFailure::Panicked(msg.clone())),
                    _ => None,
                };
                shared.record_rejection(
                    DeliveryRejection {
                        source_worker: source,
                        target_task: task,
                        reason,
                    },
                    edge,
                );
                if let Some(failure) = failure {
                    shared.record_failure(failure);
                }
                false
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// The reason an arrival tagged `task` cannot be delivered on `worker`
fn check_arrival(
    plan: &LogicalTaskPlan,
    worker: i32,
    schema: &SchemaRef,
    table: &Table,
    task: i32,
) -> Option<RejectReason> {
    if !plan.is_target_task(task) {
        return Some(RejectReason::UnknownTask);
    }
    match plan.worker_of(task) {
        Err(e) => Some(RejectReason::MalformedPlan(e.to_string())),
        Ok(owner) if owner != worker => Some(RejectReason::UnknownTask),
        Ok(_) if table.schema().fields() != schema.fields() => Some(RejectReason::SchemaMismatch {
            expected: schema.to_string(),
            actual: table.schema().to_string(),
        }),
        Ok(_) => None,
    }
}

struct DeliveryLoop {
    all: ArrowAllToAll,
    inbox: Receiver<Command>,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    max_in_flight: usize,
    edge: i32,
}

/// Fails the round if the delivery thread unwinds
struct PanicGuard {
    shared: Arc<Shared>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .record_failure(TransportFailure::Panicked("delivery thread panicked".to_string()));
        }
    }
}

impl DeliveryLoop {
    fn run(mut self) {
        let _guard = PanicGuard {
            shared: self.shared.clone(),
        };
        while !self.shutdown.load(Ordering::SeqCst) {
            let result = self.drain_commands().and_then(|_| self.all.is_complete());

            for failure in self.all.take_failures() {
                self.shared.record_rejection(
                    DeliveryRejection {
                        source_worker: failure.source,
                        target_task: failure.reference,
                        reason: RejectReason::Decode(failure.error.to_string()),
                    },
                    self.edge,
                );
            }

            let stop = match self.shared.state.lock() {
                Ok(mut state) => {
                    if let Err(e) = &result {
                        error!("edge {}: transport failed: {}", self.edge, e);
                        if state.failure.is_none() {
                            state.failure = Some(if e.is_transport_closed() {
                                TransportFailure::Closed
                            } else {
                                TransportFailure::Rejected(e.to_string())
                            });
                        }
                    }
                    match result {
                        Ok(done) if state.failure.is_none() => {
                            state.completed = done;
                            done
                        }
                        _ => true,
                    }
                }
                Err(_) => true,
            };
            self.shared.changed.notify_all();

            if stop {
                break;
            }
            std::thread::sleep(self.poll_interval);
        }

        if let Ok(state) = self.shared.state.lock() {
            if state.completed {
                info!(
                    "edge {} complete: {} tables delivered, {} rejected",
                    self.edge, state.stats.tables_delivered, state.stats.tables_rejected
                );
            }
        }
        self.all.close();
    }

    /// Move queued commands to the transport while fewer than
    /// `max_in_flight` tables wait for their receivers
    fn drain_commands(&mut self) -> CylonResult<()> {
        while self.all.in_flight() < self.max_in_flight {
            match self.inbox.try_recv() {
                Ok(Command::Insert {
                    data,
                    num_batches,
                    worker,
                    task,
                }) => self.all.insert_serialized(data, num_batches, worker, task)?,
                Ok(Command::Finish) => self.all.finish(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(())
    }
}
