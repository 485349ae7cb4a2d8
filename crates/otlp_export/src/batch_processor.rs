//! Batch processor: the record queue in front of an exporter.
//!
//! Producers call [`BatchProcessor::enqueue`], which never blocks and never
//! waits on the network. One background worker task owns the export side:
//!
//! - a full batch (`max_export_batch_size` queued records) is exported as soon
//!   as the worker sees it,
//! - every `scheduled_delay` whatever is queued is exported,
//! - at most `concurrency_limit` exports run at once; further ready batches
//!   wait for a slot and go out as exports complete,
//! - [`BatchProcessor::force_flush`] and [`BatchProcessor::shutdown`] export
//!   the records queued when they are called and wait for exports in flight,
//!   up to a deadline.
//!
//! The worker never waits for a slot outside a flush, so commands, timer
//! ticks and completions are handled while producers keep the queue full.
//!
//! Records dequeued into a batch are never put back. A full queue drops the
//! incoming record.
//!
//! ```rust,ignore
//! let exporter = ExportDelegate::<Span>::from_config(&config, &resource)?;
//! let processor = BatchProcessor::new(exporter, BatchConfig::default());
//!
//! processor.enqueue(span)?;
//! processor.force_flush(Duration::from_secs(5)).await?;
//! processor.shutdown().await?;
//! ```

use crate::delegate::RecordExporter;
use crate::diag::Diagnostics;
use crate::error::{ProcessorError, SubmitError};
use crate::record::{Batch, Record};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Configuration for batching behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Records held before new ones are dropped
    pub max_queue_size: usize,
    /// Maximum records per export; also the size trigger
    pub max_export_batch_size: usize,
    /// Interval between timer-driven exports
    pub scheduled_delay: Duration,
    /// Deadline for the final flush during shutdown
    pub export_timeout: Duration,
    /// Maximum exports in flight at once
    pub concurrency_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
            concurrency_limit: 30,
        }
    }
}

impl BatchConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_scheduled_delay(mut self, delay: Duration) -> Self {
        self.scheduled_delay = delay;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Repairs inconsistent values, warning once per repair.
    ///
    /// Zero sizes fall back to the defaults and the batch size is clamped to
    /// the queue size.
    pub fn normalized(mut self, diag: &Diagnostics) -> Self {
        let defaults = Self::default();
        if self.max_queue_size == 0 {
            diag.warn("batch", "max_queue_size must be positive, using the default");
            self.max_queue_size = defaults.max_queue_size;
        }
        if self.max_export_batch_size == 0 {
            diag.warn("batch", "max_export_batch_size must be positive, using the default");
            self.max_export_batch_size = defaults.max_export_batch_size;
        }
        if self.max_export_batch_size > self.max_queue_size {
            diag.warn(
                "batch",
                format_args!(
                    "max_export_batch_size {} exceeds max_queue_size {}, clamping",
                    self.max_export_batch_size, self.max_queue_size
                ),
            );
            self.max_export_batch_size = self.max_queue_size;
        }
        if self.scheduled_delay.is_zero() {
            diag.warn("batch", "scheduled_delay must be positive, using the default");
            self.scheduled_delay = defaults.scheduled_delay;
        }
        self.concurrency_limit = self.concurrency_limit.max(1);
        self
    }
}

// =============================================================================
// METRICS AND REPORTS
// =============================================================================

/// Thread-safe processor counters.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    pub records_enqueued: AtomicU64,
    /// Records refused because the queue was full (or left over at shutdown)
    pub dropped_records: AtomicU64,
    pub rejected_after_shutdown: AtomicU64,
    pub records_exported: AtomicU64,
    pub batches_exported: AtomicU64,
    pub export_failures: AtomicU64,
    /// Current in-flight exports
    pub inflight_exports: AtomicU64,
}

impl ProcessorMetrics {
    pub fn records_enqueued(&self) -> u64 {
        self.records_enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    pub fn rejected_after_shutdown(&self) -> u64 {
        self.rejected_after_shutdown.load(Ordering::Relaxed)
    }

    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    pub fn inflight_exports(&self) -> u64 {
        self.inflight_exports.load(Ordering::Relaxed)
    }

    fn record_success(&self, record_count: u64) {
        self.records_exported.fetch_add(record_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Batches whose export succeeded before the deadline
    pub exported_batches: usize,
    /// Batches whose export failed before the deadline
    pub failed_batches: usize,
    /// Exports still running at the deadline; they were left to finish on
    /// their own
    pub abandoned_batches: usize,
    /// The deadline passed before the flush finished
    pub deadline_exceeded: bool,
}

impl FlushReport {
    /// `true` if the flush finished before its deadline.
    pub fn is_complete(&self) -> bool {
        self.abandoned_batches == 0 && !self.deadline_exceeded
    }

    fn timed_out() -> Self {
        Self {
            deadline_exceeded: true,
            ..Self::default()
        }
    }
}

/// How long a caller waits past its deadline for the worker's own report.
const REPLY_GRACE: Duration = Duration::from_millis(50);

// =============================================================================
// SHARED STATE
// =============================================================================

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Running,
    ShuttingDown,
    Shutdown,
}

struct Shared<R> {
    queue: Mutex<VecDeque<R>>,
    state: AtomicU8,
    config: BatchConfig,
    batch_ready: Notify,
    metrics: ProcessorMetrics,
    diag: Diagnostics,
}

impl<R> Shared<R> {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<R>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Takes up to `max` of the oldest records.
    fn take_batch(&self, max: usize) -> Option<Batch<R>> {
        let mut queue = self.lock_queue();
        if queue.is_empty() || max == 0 {
            return None;
        }
        let n = queue.len().min(max);
        Some(Batch::with_records(queue.drain(..n).collect()))
    }
}

enum Command {
    Flush {
        deadline: Instant,
        reply: oneshot::Sender<FlushReport>,
    },
    Shutdown {
        deadline: Instant,
        reply: oneshot::Sender<FlushReport>,
    },
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker<R, E> {
    shared: Arc<Shared<R>>,
    exporter: Arc<E>,
    slots: Arc<Semaphore>,
    exports: JoinSet<bool>,
    /// A timer tick asked for the whole queue but ran out of slots.
    drain_pending: bool,
}

impl<R: Record, E: RecordExporter<R> + 'static> Worker<R, E> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let shared = Arc::clone(&self.shared);
        let delay = shared.config.scheduled_delay;
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Reap completed export tasks
                Some(joined) = self.exports.join_next(), if !self.exports.is_empty() => {
                    self.reap(joined);
                    self.export_ready();
                }

                () = shared.batch_ready.notified() => {
                    self.export_ready();
                }

                _ = ticker.tick() => {
                    self.drain_pending = true;
                    self.export_ready();
                }

                command = commands.recv() => match command {
                    Some(Command::Flush { deadline, reply }) => {
                        // Skip flushes whose caller already gave up.
                        if !reply.is_closed() {
                            let report = self.flush(deadline).await;
                            let _ = reply.send(report);
                        }
                    }
                    Some(Command::Shutdown { deadline, reply }) => {
                        let report = self.flush(deadline).await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        // Processor dropped without shutdown; let exports finish.
                        self.exports.detach_all();
                        break;
                    }
                },
            }
        }
        tracing::debug!("batch processor worker stopped");
    }

    /// Starts exports for the batches queued right now, as far as free slots
    /// allow. Full batches always qualify; after a timer tick a trailing
    /// partial batch does too. Never waits for a slot.
    fn export_ready(&mut self) {
        let size = self.shared.config.max_export_batch_size;
        let queued = self.shared.queue_len();
        let ready = if self.drain_pending {
            queued.div_ceil(size)
        } else {
            queued / size
        };

        for _ in 0..ready {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                return;
            };
            let Some(batch) = self.shared.take_batch(size) else {
                break;
            };
            self.spawn_export(batch, permit);
        }
        self.drain_pending = false;
    }

    fn spawn_export(&mut self, batch: Batch<R>, permit: OwnedSemaphorePermit) {
        let exporter = Arc::clone(&self.exporter);
        let shared = Arc::clone(&self.shared);
        let record_count = batch.len() as u64;
        shared.metrics.inflight_exports.fetch_add(1, Ordering::Relaxed);

        self.exports.spawn(async move {
            let result = exporter.export(batch).await;
            shared.metrics.inflight_exports.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
            match result {
                Ok(()) => {
                    shared.metrics.record_success(record_count);
                    true
                }
                Err(err) => {
                    shared.metrics.record_error();
                    shared.diag.error(
                        "batch",
                        format_args!("export of {record_count} record(s) failed: {err}"),
                    );
                    false
                }
            }
        });
    }

    /// Returns `true` for a successful export.
    fn reap(&self, joined: Result<bool, JoinError>) -> bool {
        match joined {
            Ok(ok) => ok,
            Err(err) => {
                self.shared.metrics.record_error();
                self.shared.diag.error("batch", format_args!("export task failed: {err}"));
                false
            }
        }
    }

    /// Exports the records queued at the start of the flush and waits for
    /// all exports in flight. Records enqueued meanwhile are left to the
    /// regular triggers.
    async fn flush(&mut self, deadline: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        let size = self.shared.config.max_export_batch_size;
        let mut remaining = self.shared.queue_len();

        while remaining > 0 {
            let permit = match timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => break,
            };
            let Some(batch) = self.shared.take_batch(remaining.min(size)) else {
                break;
            };
            remaining -= batch.len();
            self.spawn_export(batch, permit);
        }

        loop {
            match timeout_at(deadline, self.exports.join_next()).await {
                Ok(Some(joined)) => {
                    if self.reap(joined) {
                        report.exported_batches += 1;
                    } else {
                        report.failed_batches += 1;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    report.abandoned_batches = self.exports.len();
                    report.deadline_exceeded = true;
                    self.exports.detach_all();
                    self.shared.diag.warn(
                        "batch",
                        format_args!(
                            "flush deadline passed with {} export(s) still running",
                            report.abandoned_batches
                        ),
                    );
                    break;
                }
            }
        }

        if remaining > 0 {
            report.deadline_exceeded = true;
            self.shared.diag.warn(
                "batch",
                format_args!("flush deadline passed with {remaining} record(s) still queued"),
            );
        }
        report
    }
}

// =============================================================================
// BATCH PROCESSOR
// =============================================================================

/// Queue, triggers and export concurrency for one signal.
pub struct BatchProcessor<R: Record, E: RecordExporter<R>> {
    shared: Arc<Shared<R>>,
    exporter: Arc<E>,
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_result: OnceCell<Result<FlushReport, ProcessorError>>,
    _records: PhantomData<fn(R)>,
}

impl<R: Record, E: RecordExporter<R> + 'static> BatchProcessor<R, E> {
    /// Starts the worker task. Must be called inside a tokio runtime.
    pub fn new(exporter: E, config: BatchConfig) -> Self {
        Self::with_diagnostics(exporter, config, Diagnostics::default())
    }

    pub fn with_diagnostics(exporter: E, config: BatchConfig, diag: Diagnostics) -> Self {
        let config = config.normalized(&diag);
        let slots = Arc::new(Semaphore::new(config.concurrency_limit));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.max_queue_size)),
            state: AtomicU8::new(RUNNING),
            config,
            batch_ready: Notify::new(),
            metrics: ProcessorMetrics::default(),
            diag,
        });
        let exporter = Arc::new(exporter);

        let (commands, rx) = mpsc::channel(16);
        let worker = Worker {
            shared: Arc::clone(&shared),
            exporter: Arc::clone(&exporter),
            slots,
            exports: JoinSet::new(),
            drain_pending: false,
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            shared,
            exporter,
            commands,
            worker: Mutex::new(Some(handle)),
            shutdown_result: OnceCell::new(),
            _records: PhantomData,
        }
    }

    /// Queues `record` for export. Never blocks on the network.
    pub fn enqueue(&self, record: R) -> Result<(), SubmitError> {
        let queued = {
            let mut queue = self.shared.lock_queue();
            // Checked under the queue lock so shutdown stops intake atomically.
            if self.shared.state.load(Ordering::Acquire) != RUNNING {
                drop(queue);
                self.shared
                    .metrics
                    .rejected_after_shutdown
                    .fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::Shutdown);
            }
            if queue.len() >= self.shared.config.max_queue_size {
                drop(queue);
                self.shared.metrics.dropped_records.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::Full);
            }
            queue.push_back(record);
            queue.len()
        };

        self.shared.metrics.records_enqueued.fetch_add(1, Ordering::Relaxed);
        if queued >= self.shared.config.max_export_batch_size {
            self.shared.batch_ready.notify_one();
        }
        Ok(())
    }

    /// Exports the records queued now and waits for them, and for exports
    /// already running, until `timeout` passes.
    ///
    /// Exports still running at the deadline are abandoned, not cancelled,
    /// and counted in the report. The call itself returns shortly after the
    /// deadline even if the worker is still busy with an earlier flush.
    pub async fn force_flush(&self, timeout: Duration) -> Result<FlushReport, ProcessorError> {
        if self.state() != ProcessorState::Running {
            return Err(ProcessorError::Shutdown);
        }
        let deadline = Instant::now() + timeout;
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(Command::Flush { deadline, reply })
                .await
                .map_err(|_| ProcessorError::WorkerGone)?;
            rx.await.map_err(|_| ProcessorError::WorkerGone)
        };

        match timeout_at(deadline + REPLY_GRACE, exchange).await {
            Ok(result) => result,
            Err(_) => {
                self.shared
                    .diag
                    .warn("batch", "flush deadline passed before the worker answered");
                Ok(FlushReport::timed_out())
            }
        }
    }

    /// Stops intake, flushes within `export_timeout`, then shuts the
    /// exporter down without waiting past that deadline.
    ///
    /// Idempotent: every call resolves to the outcome of the first.
    pub async fn shutdown(&self) -> Result<FlushReport, ProcessorError> {
        self.shutdown_result
            .get_or_init(|| self.shutdown_once())
            .await
            .clone()
    }

    async fn shutdown_once(&self) -> Result<FlushReport, ProcessorError> {
        let deadline = Instant::now() + self.shared.config.export_timeout;
        {
            let _queue = self.shared.lock_queue();
            self.shared.state.store(SHUTTING_DOWN, Ordering::Release);
        }

        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(Command::Shutdown { deadline, reply })
                .await
                .map_err(|_| ProcessorError::WorkerGone)?;
            rx.await.map_err(|_| ProcessorError::WorkerGone)
        };
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let report = match timeout_at(deadline + REPLY_GRACE, exchange).await {
            Ok(report) => {
                // The worker exits right after answering.
                if let Some(worker) = worker {
                    if let Err(err) = worker.await {
                        self.shared.diag.error("batch", format_args!("worker task failed: {err}"));
                    }
                }
                report
            }
            Err(_) => {
                self.shared
                    .diag
                    .warn("batch", "shutdown deadline passed before the worker answered");
                Ok(FlushReport::timed_out())
            }
        };

        let leftover = {
            let mut queue = self.shared.lock_queue();
            let n = queue.len();
            queue.clear();
            n
        };
        if leftover > 0 {
            self.shared
                .metrics
                .dropped_records
                .fetch_add(leftover as u64, Ordering::Relaxed);
        }

        self.shared.state.store(SHUTDOWN, Ordering::Release);
        self.exporter.shutdown_by(deadline).await;
        tracing::debug!(?report, leftover, "batch processor shut down");
        report
    }

    pub fn state(&self) -> ProcessorState {
        match self.shared.state.load(Ordering::Acquire) {
            RUNNING => ProcessorState::Running,
            SHUTTING_DOWN => ProcessorState::ShuttingDown,
            _ => ProcessorState::Shutdown,
        }
    }

    /// Records currently queued.
    pub fn queue_len(&self) -> usize {
        self.shared.queue_len()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.shared.metrics
    }

    pub fn exporter(&self) -> &E {
        &self.exporter
    }
}
