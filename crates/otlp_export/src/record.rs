//! Telemetry record types and the batch container handed to exporters.

use crate::temporality::{AggregationTemporality, InstrumentKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// The three OTLP signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// Path appended to a base HTTP endpoint.
    pub fn http_path(self) -> &'static str {
        match self {
            Self::Traces => "/v1/traces",
            Self::Metrics => "/v1/metrics",
            Self::Logs => "/v1/logs",
        }
    }

    /// Fully-qualified gRPC method for the signal's export service.
    pub fn grpc_method(self) -> &'static str {
        match self {
            Self::Traces => "/opentelemetry.proto.collector.trace.v1.TraceService/Export",
            Self::Metrics => "/opentelemetry.proto.collector.metrics.v1.MetricsService/Export",
            Self::Logs => "/opentelemetry.proto.collector.logs.v1.LogsService/Export",
        }
    }

    /// Upper-case name used in `OTEL_EXPORTER_OTLP_<SIGNAL>_*` variables.
    pub fn env_name(self) -> &'static str {
        match self {
            Self::Traces => "TRACES",
            Self::Metrics => "METRICS",
            Self::Logs => "LOGS",
        }
    }
}

/// A record of one signal type that can be queued and exported.
pub trait Record: Serialize + Send + Sync + 'static {
    const SIGNAL: Signal;

    /// Creation time in Unix nanoseconds.
    fn timestamp_nanos(&self) -> u64;
}

/// Attribute value types for record and resource metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Array(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Sorted attribute map; sorted so encoding is deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

pub(crate) fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// A finished distributed tracing span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(with = "hex_u128")]
    pub trace_id: u128,
    #[serde(with = "hex_u64")]
    pub span_id: u64,
    /// 0 for root spans
    #[serde(with = "hex_u64")]
    pub parent_span_id: u64,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub attributes: Attributes,
    pub status: SpanStatus,
}

impl Span {
    pub fn new(trace_id: u128, span_id: u64, parent_span_id: u64, name: impl Into<String>, kind: SpanKind) -> Self {
        let now = unix_nanos(SystemTime::now());
        Self {
            trace_id,
            span_id,
            parent_span_id,
            name: name.into(),
            kind,
            start_time_unix_nano: now,
            end_time_unix_nano: now,
            attributes: Attributes::new(),
            status: SpanStatus::Unset,
        }
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time_unix_nano = unix_nanos(SystemTime::now());
        self.status = status;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano.saturating_sub(self.start_time_unix_nano)
    }
}

impl Record for Span {
    const SIGNAL: Signal = Signal::Traces;

    fn timestamp_nanos(&self) -> u64 {
        self.start_time_unix_nano
    }
}

/// Log severity, numbered as in the OpenTelemetry log data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Trace = 1,
    Debug = 5,
    Info = 9,
    Warn = 13,
    Error = 17,
    Fatal = 21,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub severity: Severity,
    pub body: String,
    pub attributes: Attributes,
    /// Correlates the log with a span when set.
    #[serde(skip_serializing_if = "Option::is_none", with = "hex_u128_opt", default)]
    pub trace_id: Option<u128>,
}

impl LogRecord {
    pub fn new(severity: Severity, body: impl Into<String>) -> Self {
        Self {
            time_unix_nano: unix_nanos(SystemTime::now()),
            severity,
            body: body.into(),
            attributes: Attributes::new(),
            trace_id: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Record for LogRecord {
    const SIGNAL: Signal = Signal::Logs;

    fn timestamp_nanos(&self) -> u64 {
        self.time_unix_nano
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricValue {
    AsInt(i64),
    AsDouble(f64),
}

/// One aggregated data point of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub name: String,
    pub unit: String,
    pub kind: InstrumentKind,
    pub temporality: AggregationTemporality,
    pub start_time_unix_nano: u64,
    pub time_unix_nano: u64,
    pub value: MetricValue,
    pub attributes: Attributes,
}

impl MetricPoint {
    pub fn new(
        name: impl Into<String>,
        kind: InstrumentKind,
        temporality: AggregationTemporality,
        value: MetricValue,
    ) -> Self {
        let now = unix_nanos(SystemTime::now());
        Self {
            name: name.into(),
            unit: String::new(),
            kind,
            temporality,
            start_time_unix_nano: now,
            time_unix_nano: now,
            value,
            attributes: Attributes::new(),
        }
    }
}

impl Record for MetricPoint {
    const SIGNAL: Signal = Signal::Metrics;

    fn timestamp_nanos(&self) -> u64 {
        self.time_unix_nano
    }
}

/// An ordered group of records exported in one call.
#[derive(Debug)]
pub struct Batch<R> {
    pub records: Vec<R>,
    /// Batch creation timestamp
    pub created: SystemTime,
}

impl<R> Batch<R> {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    pub fn with_records(records: Vec<R>) -> Self {
        Self {
            records,
            created: SystemTime::now(),
        }
    }

    pub fn add(&mut self, record: R) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<R> Default for Batch<R> {
    fn default() -> Self {
        Self::new()
    }
}

// OTLP/JSON encodes trace and span ids as lowercase hex strings.
mod hex_u128 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{value:032x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        u128::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
    }
}

mod hex_u128_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u128>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&format!("{v:032x}")),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u128>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| u128::from_str_radix(&r, 16).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{value:016x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        u64::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
    }
}
