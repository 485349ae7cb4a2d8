use bytes::Bytes;
use otlp_export::{
    AggregationSelector, AggregationTemporality, Batch, BatchConfig, BatchProcessor, ExportDelegate, ExportError,
    ExportResult, ExporterConfig, InstrumentKind, JsonSerializer, LogRecord, MetricExporter, MetricPoint,
    MetricValue, RecordExporter, Resource, RetryPolicy, RetryingTransport, Severity, Span, SpanKind, SubmitError,
    TemporalityPreference, TemporalitySelector, Transport,
};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Captures payloads; replays scripted failures first.
#[derive(Clone, Default)]
struct CapturingTransport {
    state: Arc<CaptureState>,
}

#[derive(Default)]
struct CaptureState {
    payloads: Mutex<Vec<Bytes>>,
    script: Mutex<VecDeque<ExportError>>,
    attempts: Mutex<usize>,
}

impl CapturingTransport {
    fn failing_with(errors: impl IntoIterator<Item = ExportError>) -> Self {
        let transport = Self::default();
        transport.state.script.lock().unwrap().extend(errors);
        transport
    }

    fn payloads(&self) -> Vec<Value> {
        self.state
            .payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    fn attempts(&self) -> usize {
        *self.state.attempts.lock().unwrap()
    }
}

// Rust 2024: Use native async fn in traits
impl Transport for CapturingTransport {
    async fn send(&self, payload: Bytes, _timeout: Duration) -> ExportResult<Bytes> {
        *self.state.attempts.lock().unwrap() += 1;
        if let Some(err) = self.state.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.state.payloads.lock().unwrap().push(payload);
        Ok(Bytes::new())
    }

    fn shutdown(&self) {}

    fn name(&self) -> &str {
        "capturing"
    }
}

fn span_delegate(transport: CapturingTransport, resource: &Resource) -> ExportDelegate<Span> {
    let policy = RetryPolicy::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(100))
        .with_jitter(0.0);
    ExportDelegate::new(
        Box::new(JsonSerializer::<Span>::new(resource)),
        Arc::new(RetryingTransport::new(transport, policy)),
        &ExporterConfig::default(),
    )
}

fn exported_span_ids(payloads: &[Value]) -> Vec<String> {
    payloads
        .iter()
        .flat_map(|p| p["resourceSpans"][0]["scopeSpans"][0]["spans"].as_array().unwrap().clone())
        .map(|s| s["spanId"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_producer_spans_reach_collector() {
    let transport = CapturingTransport::default();
    let resource = Resource::new([("service.name", "checkout")]);
    let processor = Arc::new(BatchProcessor::new(
        span_delegate(transport.clone(), &resource),
        BatchConfig::default()
            .with_max_export_batch_size(16)
            .with_scheduled_delay(Duration::from_millis(20)),
    ));

    let mut producers = Vec::new();
    for producer in 0..4u64 {
        let processor = Arc::clone(&processor);
        producers.push(tokio::spawn(async move {
            for i in 0..50u64 {
                let span = Span::new(1, (producer << 32) | (i + 1), 0, "op", SpanKind::Internal);
                processor.enqueue(span).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let report = processor.shutdown().await.unwrap();
    assert!(report.is_complete());

    let payloads = transport.payloads();
    let ids = exported_span_ids(&payloads);
    assert_eq!(ids.len(), 200);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 200, "duplicate spans exported");
    assert_eq!(
        payloads[0]["resourceSpans"][0]["resource"]["attributes"][0]["value"]["stringValue"],
        "checkout"
    );
    assert_eq!(processor.metrics().records_exported(), 200);
    assert_eq!(processor.metrics().dropped_records(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_through_pipeline() {
    let transport = CapturingTransport::failing_with([
        ExportError::RetryableStatus {
            status: 503,
            retry_after: None,
        },
        ExportError::Network("connection reset".into()),
    ]);
    let processor = BatchProcessor::new(
        span_delegate(transport.clone(), &Resource::empty()),
        BatchConfig::default().with_max_export_batch_size(10),
    );
    for i in 0..10 {
        processor.enqueue(Span::new(7, i + 1, 0, "retry", SpanKind::Client)).unwrap();
    }

    let report = processor.force_flush(Duration::from_secs(30)).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(transport.attempts(), 3);
    assert_eq!(exported_span_ids(&transport.payloads()).len(), 10);
    assert_eq!(processor.metrics().export_failures(), 0);
}

#[tokio::test]
async fn test_terminal_failure_is_counted_not_retried() {
    let transport = CapturingTransport::failing_with([ExportError::NonRetryableStatus {
        status: 400,
        message: "malformed".into(),
    }]);
    let processor = BatchProcessor::new(
        span_delegate(transport.clone(), &Resource::empty()),
        BatchConfig::default(),
    );
    processor.enqueue(Span::new(1, 1, 0, "bad", SpanKind::Internal)).unwrap();

    let report = processor.force_flush(Duration::from_secs(5)).await.unwrap();

    assert_eq!(report.failed_batches, 1);
    assert_eq!(transport.attempts(), 1);
    assert_eq!(processor.metrics().export_failures(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_all_network_io() {
    let transport = CapturingTransport::default();
    let delegate = span_delegate(transport.clone(), &Resource::empty());
    let processor = BatchProcessor::new(delegate.clone(), BatchConfig::default());
    processor.enqueue(Span::new(1, 1, 0, "last", SpanKind::Internal)).unwrap();

    processor.shutdown().await.unwrap();
    let attempts = transport.attempts();
    assert_eq!(attempts, 1);

    assert_eq!(
        processor.enqueue(Span::new(1, 2, 0, "late", SpanKind::Internal)),
        Err(SubmitError::Shutdown)
    );
    assert_eq!(
        delegate.export_records(vec![Span::new(1, 3, 0, "late", SpanKind::Internal)]).await,
        Err(ExportError::Shutdown)
    );
    assert_eq!(transport.attempts(), attempts);
}

#[tokio::test]
async fn test_async_resource_attributes_reach_payload() {
    let mut resource = Resource::new([("service.name", "billing")]).with_pending("host.id", async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok("i-0abc".into())
    });
    assert!(resource.async_attributes_pending());
    resource.wait_for_async_attributes().await;
    assert!(!resource.async_attributes_pending());

    let transport = CapturingTransport::default();
    let delegate = ExportDelegate::with_transport(
        JsonSerializer::<LogRecord>::new(&resource),
        transport.clone(),
        &ExporterConfig::default(),
    );
    delegate
        .export_records(vec![LogRecord::new(Severity::Warn, "disk almost full")])
        .await
        .unwrap();

    let payloads = transport.payloads();
    let payload = &payloads[0];
    let attributes = payload["resourceLogs"][0]["resource"]["attributes"].as_array().unwrap();
    assert!(attributes
        .iter()
        .any(|kv| kv["key"] == "host.id" && kv["value"]["stringValue"] == "i-0abc"));
}

#[tokio::test]
async fn test_metrics_pipeline_uses_selected_temporality() {
    let transport = CapturingTransport::default();
    let delegate = ExportDelegate::with_transport(
        JsonSerializer::<MetricPoint>::new(&Resource::empty()),
        transport.clone(),
        &ExporterConfig::default(),
    );
    let exporter = MetricExporter::new(
        delegate,
        TemporalitySelector::from_preference(TemporalityPreference::Delta),
        AggregationSelector::default(),
    );

    let points = [InstrumentKind::Counter, InstrumentKind::UpDownCounter]
        .into_iter()
        .map(|kind| MetricPoint::new("requests", kind, exporter.temporality(kind), MetricValue::AsInt(1)))
        .collect::<Vec<_>>();
    assert_eq!(points[0].temporality, AggregationTemporality::Delta);
    assert_eq!(points[1].temporality, AggregationTemporality::Cumulative);

    let processor = BatchProcessor::new(exporter, BatchConfig::default());
    for point in points {
        processor.enqueue(point).unwrap();
    }
    processor.shutdown().await.unwrap();

    let payloads = transport.payloads();
    let metrics = payloads[0]["resourceMetrics"][0]["scopeMetrics"][0]["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 2);
    assert!(processor.exporter().delegate().is_shutdown());
}

#[tokio::test]
async fn test_exporter_trait_object_free_use() {
    // Generic helpers over RecordExporter work for both delegate kinds.
    async fn export_one<E: RecordExporter<Span>>(exporter: &E) -> ExportResult {
        exporter
            .export(Batch::with_records(vec![Span::new(9, 9, 0, "generic", SpanKind::Internal)]))
            .await
    }

    let transport = CapturingTransport::default();
    let delegate = span_delegate(transport.clone(), &Resource::empty());
    export_one(&delegate).await.unwrap();
    delegate.shutdown().await;

    assert_eq!(transport.attempts(), 1);
    assert_eq!(export_one(&delegate).await, Err(ExportError::Shutdown));
}
