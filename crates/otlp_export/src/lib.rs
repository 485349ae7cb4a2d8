//! OTLP Telemetry Export Pipeline
//!
//! Ships spans, log records and metric points to an OpenTelemetry collector
//! over an unreliable network, with bounded memory, bounded concurrency and a
//! graceful shutdown.
//!
//! ```text
//! record -> BatchProcessor -> ExportDelegate -> RecordSerializer
//!                                            -> RetryingTransport -> Transport
//! ```
//!
//! - [`BatchProcessor`] owns the queue and decides when to export.
//! - [`ExportDelegate`] serializes a batch and sends it, as OTLP/JSON over
//!   HTTP and beacon, or OTLP/protobuf over gRPC.
//! - [`RetryingTransport`] re-sends retryable failures with backoff.
//! - [`TransportVariant`] is the HTTP, gRPC or beacon transport picked from
//!   [`ExporterConfig`].
//! - [`Resource`] describes the emitting entity, with attributes that may
//!   resolve asynchronously.
//!
//! # Rust 2024 Edition Features
//!
//! Exporter and transport traits use native async fn in traits (no
//! `#[async_trait]` macro), with boxed variants for dynamic dispatch.

pub mod batch_processor;
pub mod config;
pub mod delegate;
pub mod diag;
pub mod error;
pub mod record;
pub mod resource;
pub mod retry;
pub mod serializer;
pub mod temporality;
pub mod transport;

// Re-export main types
pub use batch_processor::{BatchConfig, BatchProcessor, FlushReport, ProcessorMetrics, ProcessorState};
pub use config::{Compression, ExporterConfig, HeaderProvider};
pub use delegate::{ExportDelegate, MetricExporter, RecordExporter};
pub use diag::{DiagLevel, DiagnosticObserver, Diagnostics};
pub use error::{ConfigError, ExportError, ExportResult, ProcessorError, ResourceError, SubmitError};
pub use record::{
    AttributeValue, Attributes, Batch, LogRecord, MetricPoint, MetricValue, Record, Severity, Signal, Span,
    SpanKind, SpanStatus,
};
pub use resource::{
    detect_resources, EnvResourceDetector, ProcessResourceDetector, Resource, ResourceDetector,
    SdkResourceDetector,
};
pub use retry::{backoff_delay, RetryPolicy, RetryingTransport};
pub use serializer::{
    ExportResponse, JsonSerializer, PartialSuccess, ProtoRecord, ProtobufSerializer, RecordSerializer, RequestEnvelope,
};
pub use temporality::{
    Aggregation, AggregationSelector, AggregationTemporality, InstrumentKind, TemporalityPreference,
    TemporalitySelector,
};
pub use transport::{
    NullTransport, StdoutTransport, Transport, TransportBoxed, TransportRequirements, TransportStrategy,
    TransportVariant,
};
