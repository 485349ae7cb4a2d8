//! Export delegate: serializer plus transport behind one export call.
//!
//! Each export runs on its own tokio task so that a caller dropping the
//! returned future never interrupts a request that is already on the wire.
//! The task holds an in-flight guard; [`ExportDelegate::force_flush`] waits
//! on the guards that exist when it is called.

use crate::config::ExporterConfig;
use crate::diag::Diagnostics;
use crate::error::{ConfigError, ExportError, ExportResult};
use crate::record::{Batch, MetricPoint, Record};
use crate::resource::Resource;
use crate::retry::RetryingTransport;
use crate::serializer::{JsonSerializer, ProtoRecord, ProtobufSerializer, RecordSerializer};
use crate::temporality::{
    Aggregation, AggregationSelector, AggregationTemporality, InstrumentKind,
    TemporalityPreference, TemporalitySelector,
};
use crate::transport::{Transport, TransportBoxed, TransportStrategy, TransportVariant};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

/// Exports batches of one record type.
///
/// Uses native async fn in traits; implementations must be shareable across
/// the processor's export tasks.
pub trait RecordExporter<R: Record>: Send + Sync {
    /// Exports one batch. Resolves exactly once.
    fn export(&self, batch: Batch<R>) -> impl Future<Output = ExportResult> + Send;

    /// Waits for exports in flight when called.
    fn force_flush(&self) -> impl Future<Output = ()> + Send;

    /// Waits for exports in flight until `deadline`, then releases the
    /// transport even if some are still running. Idempotent.
    fn shutdown_by(&self, deadline: Instant) -> impl Future<Output = ()> + Send;
}

// =============================================================================
// IN-FLIGHT TRACKING
// =============================================================================

/// Exports currently on the wire, each with a completion signal.
struct InflightRegistry {
    entries: Mutex<HashMap<u64, watch::Receiver<bool>>>,
    next_id: AtomicU64,
    limit: usize,
}

impl InflightRegistry {
    fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    /// Registers a new export, or refuses if `limit` are already running.
    fn begin(self: &Arc<Self>) -> ExportResult<InflightGuard> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.limit {
            return Err(ExportError::ConcurrencyLimit { limit: self.limit });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, rx) = watch::channel(false);
        entries.insert(id, rx);
        Ok(InflightGuard {
            registry: Arc::clone(self),
            id,
            done,
        })
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn snapshot(&self) -> Vec<watch::Receiver<bool>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Unregisters its export when dropped, including on panic.
struct InflightGuard {
    registry: Arc<InflightRegistry>,
    id: u64,
    done: watch::Sender<bool>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.done.send_replace(true);
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

// =============================================================================
// EXPORT DELEGATE
// =============================================================================

struct DelegateInner<R> {
    serializer: Box<dyn RecordSerializer<R>>,
    transport: Arc<dyn TransportBoxed>,
    timeout: Duration,
    inflight: Arc<InflightRegistry>,
    is_shutdown: AtomicBool,
    diag: Diagnostics,
}

impl<R> DelegateInner<R> {
    /// Turns a transport outcome into the export outcome.
    fn complete(&self, sent: ExportResult<Bytes>) -> ExportResult {
        let body = sent?;
        match self.serializer.deserialize_response(&body) {
            Ok(response) => {
                if let Some(partial) = response.rejection() {
                    self.diag.warn(
                        "export",
                        format_args!(
                            "collector rejected {} record(s): {}",
                            partial.rejected, partial.error_message
                        ),
                    );
                }
            }
            Err(err) => self.diag.warn(
                "export",
                format_args!("export succeeded but the response could not be decoded: {err}"),
            ),
        }
        Ok(())
    }
}

/// Serializer plus transport for one signal.
///
/// Cheap to clone; clones share the transport and in-flight state.
pub struct ExportDelegate<R> {
    inner: Arc<DelegateInner<R>>,
}

impl<R> Clone for ExportDelegate<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Record> ExportDelegate<R> {
    /// Uses the timeout, concurrency limit and diagnostics of `config`.
    pub fn new(
        serializer: Box<dyn RecordSerializer<R>>,
        transport: Arc<dyn TransportBoxed>,
        config: &ExporterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DelegateInner {
                serializer,
                transport,
                timeout: config.timeout,
                inflight: Arc::new(InflightRegistry::new(config.concurrency_limit)),
                is_shutdown: AtomicBool::new(false),
                diag: config.diagnostics.clone(),
            }),
        }
    }

    /// Wraps any concrete transport, without retries.
    pub fn with_transport(
        serializer: impl RecordSerializer<R> + 'static,
        transport: impl Transport + 'static,
        config: &ExporterConfig,
    ) -> Self {
        Self::new(Box::new(serializer), Arc::new(transport), config)
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Content type of the request bodies this delegate produces.
    pub fn content_type(&self) -> &'static str {
        self.inner.serializer.content_type()
    }

    /// Number of exports currently on the wire.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }

    /// Serializes and sends `records`.
    ///
    /// Fails with [`ExportError::Shutdown`] after shutdown and with
    /// [`ExportError::ConcurrencyLimit`] when the limit is reached; neither
    /// touches the network.
    pub async fn export_records(&self, records: Vec<R>) -> ExportResult {
        if self.is_shutdown() {
            return Err(ExportError::Shutdown);
        }
        let guard = self.inner.inflight.begin()?;
        let payload = self.inner.serializer.serialize_request(&records)?;
        drop(records);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let sent = inner.transport.send_boxed(Bytes::from(payload), inner.timeout).await;
            inner.complete(sent)
        });

        match task.await {
            Ok(result) => result,
            Err(join) => Err(ExportError::Network(format!("export task failed: {join}"))),
        }
    }

    /// Exports in the background and hands the outcome to `callback`.
    pub fn export_with_callback<F>(&self, records: Vec<R>, callback: F)
    where
        F: FnOnce(ExportResult) + Send + 'static,
    {
        let delegate = self.clone();
        tokio::spawn(async move {
            callback(delegate.export_records(records).await);
        });
    }

    /// Waits for every export that is in flight now. Exports started later
    /// are not awaited.
    pub async fn force_flush(&self) {
        for mut done in self.inner.inflight.snapshot() {
            // A closed channel means the guard is gone, which is completion too.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Flushes, then shuts the transport down. Later calls return at once.
    pub async fn shutdown(&self) {
        self.shutdown_inner(None).await;
    }

    /// Like [`shutdown`](Self::shutdown), but stops waiting for exports in
    /// flight at `deadline`. Those exports are not cancelled; once the
    /// transport is shut down their later attempts fail locally.
    pub async fn shutdown_by(&self, deadline: Instant) {
        self.shutdown_inner(Some(deadline)).await;
    }

    async fn shutdown_inner(&self, deadline: Option<Instant>) {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        match deadline {
            None => self.force_flush().await,
            Some(deadline) => {
                if timeout_at(deadline, self.force_flush()).await.is_err() {
                    self.inner.diag.warn(
                        "export",
                        format_args!(
                            "shutdown deadline passed with {} export(s) in flight",
                            self.inflight()
                        ),
                    );
                }
            }
        }
        self.inner.transport.shutdown_boxed();
        tracing::debug!(transport = self.transport_name(), "export delegate shut down");
    }
}

impl<R: ProtoRecord> ExportDelegate<R> {
    /// Serializer and transport named by `config`: OTLP/protobuf for gRPC,
    /// OTLP/JSON otherwise. The transport is wrapped in the retry layer
    /// unless it is a beacon.
    ///
    /// `resource` should be resolved (see
    /// [`Resource::wait_for_async_attributes`]). Must be called inside a
    /// tokio runtime when the gRPC transport is configured.
    pub fn from_config(config: &ExporterConfig, resource: &Resource) -> Result<Self, ConfigError> {
        let serializer: Box<dyn RecordSerializer<R>> = match config.transport {
            TransportStrategy::StreamingRpc => Box::new(ProtobufSerializer::<R>::new(resource)),
            TransportStrategy::BufferedRequest | TransportStrategy::Beacon => {
                Box::new(JsonSerializer::<R>::new(resource))
            }
        };
        let variant = TransportVariant::from_config(config, R::SIGNAL, serializer.content_type())?;
        let transport: Arc<dyn TransportBoxed> = match variant.strategy() {
            TransportStrategy::Beacon => Arc::new(variant),
            _ => Arc::new(
                RetryingTransport::new(variant, config.retry.clone())
                    .with_diagnostics(config.diagnostics.clone()),
            ),
        };
        Ok(Self::new(serializer, transport, config))
    }
}

impl<R: Record> RecordExporter<R> for ExportDelegate<R> {
    async fn export(&self, batch: Batch<R>) -> ExportResult {
        self.export_records(batch.records).await
    }

    async fn force_flush(&self) {
        ExportDelegate::force_flush(self).await;
    }

    async fn shutdown_by(&self, deadline: Instant) {
        ExportDelegate::shutdown_by(self, deadline).await;
    }
}

// =============================================================================
// METRIC EXPORTER
// =============================================================================

/// Metrics delegate carrying the temporality and aggregation selectors
/// fixed at construction.
#[derive(Clone)]
pub struct MetricExporter {
    delegate: ExportDelegate<MetricPoint>,
    temporality: TemporalitySelector,
    aggregation: AggregationSelector,
}

impl MetricExporter {
    pub fn new(
        delegate: ExportDelegate<MetricPoint>,
        temporality: TemporalitySelector,
        aggregation: AggregationSelector,
    ) -> Self {
        Self {
            delegate,
            temporality,
            aggregation,
        }
    }

    /// Builds the delegate from `config`. `explicit` wins over the
    /// configured temporality preference.
    pub fn from_config(
        config: &ExporterConfig,
        resource: &Resource,
        explicit: Option<TemporalityPreference>,
    ) -> Result<Self, ConfigError> {
        let temporality = TemporalitySelector::resolve(
            explicit,
            config.temporality_preference.as_deref(),
            &config.diagnostics,
        );
        Ok(Self::new(
            ExportDelegate::from_config(config, resource)?,
            temporality,
            AggregationSelector::default(),
        ))
    }

    pub fn with_aggregation(mut self, aggregation: AggregationSelector) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn temporality(&self, kind: InstrumentKind) -> AggregationTemporality {
        self.temporality.select(kind)
    }

    pub fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self.aggregation.select(kind)
    }

    pub fn delegate(&self) -> &ExportDelegate<MetricPoint> {
        &self.delegate
    }
}

impl RecordExporter<MetricPoint> for MetricExporter {
    async fn export(&self, batch: Batch<MetricPoint>) -> ExportResult {
        self.delegate.export_records(batch.records).await
    }

    async fn force_flush(&self) {
        self.delegate.force_flush().await;
    }

    async fn shutdown_by(&self, deadline: Instant) {
        self.delegate.shutdown_by(deadline).await;
    }
}
