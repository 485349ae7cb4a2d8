//! OTLP/protobuf encoding, the wire format gRPC collectors expect.
//!
//! Records map onto the generated `opentelemetry-proto` messages; the
//! request and response envelopes differ per signal, so each record type
//! supplies its own through [`ProtoRecord`].

use super::{ExportResponse, PartialSuccess, RecordSerializer, SCOPE_NAME, SCOPE_VERSION};
use crate::error::ExportError;
use crate::record::{AttributeValue, Attributes, LogRecord, MetricPoint, MetricValue, Record, Span, SpanKind, SpanStatus};
use crate::resource::Resource;
use crate::temporality::{AggregationTemporality, InstrumentKind};
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, ArrayValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1 as logs;
use opentelemetry_proto::tonic::metrics::v1 as metrics;
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_proto::tonic::trace::v1 as trace;
use prost::Message;
use std::marker::PhantomData;

/// Content type of OTLP/protobuf requests.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Resource and scope shared by every request of one serializer.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    resource: ProtoResource,
    scope: InstrumentationScope,
    schema_url: String,
}

/// A record type with an OTLP/protobuf request and response message.
pub trait ProtoRecord: Record + Sized {
    /// Encodes `records` as one export request.
    fn encode_request(records: &[Self], envelope: &RequestEnvelope) -> Vec<u8>;

    /// Decodes the signal's export response.
    fn decode_response(body: &[u8]) -> Result<ExportResponse, prost::DecodeError>;
}

/// OTLP/protobuf encoder for any [`ProtoRecord`].
pub struct ProtobufSerializer<R> {
    envelope: RequestEnvelope,
    _records: PhantomData<fn(&R)>,
}

impl<R: ProtoRecord> ProtobufSerializer<R> {
    /// Captures the resource attributes once, like the JSON serializer.
    pub fn new(resource: &Resource) -> Self {
        let attributes = resource
            .attributes()
            .iter()
            .map(|(k, v)| key_value(k, v))
            .collect();
        Self {
            envelope: RequestEnvelope {
                resource: ProtoResource {
                    attributes,
                    ..Default::default()
                },
                scope: InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    version: SCOPE_VERSION.to_string(),
                    ..Default::default()
                },
                schema_url: resource.schema_url().unwrap_or_default().to_string(),
            },
            _records: PhantomData,
        }
    }
}

impl<R: ProtoRecord> RecordSerializer<R> for ProtobufSerializer<R> {
    fn serialize_request(&self, records: &[R]) -> Result<Vec<u8>, ExportError> {
        Ok(R::encode_request(records, &self.envelope))
    }

    fn deserialize_response(&self, body: &[u8]) -> Result<ExportResponse, ExportError> {
        if body.is_empty() {
            return Ok(ExportResponse::default());
        }
        R::decode_response(body).map_err(|e| ExportError::Serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        PROTOBUF_CONTENT_TYPE
    }
}

fn partial_success(rejected: i64, error_message: String) -> PartialSuccess {
    PartialSuccess {
        rejected: rejected.max(0) as u64,
        error_message,
    }
}

// =============================================================================
// TRACES
// =============================================================================

impl ProtoRecord for Span {
    fn encode_request(records: &[Self], envelope: &RequestEnvelope) -> Vec<u8> {
        let spans = records.iter().map(proto_span).collect();
        ExportTraceServiceRequest {
            resource_spans: vec![trace::ResourceSpans {
                resource: Some(envelope.resource.clone()),
                scope_spans: vec![trace::ScopeSpans {
                    scope: Some(envelope.scope.clone()),
                    spans,
                    ..Default::default()
                }],
                schema_url: envelope.schema_url.clone(),
            }],
        }
        .encode_to_vec()
    }

    fn decode_response(body: &[u8]) -> Result<ExportResponse, prost::DecodeError> {
        let response = ExportTraceServiceResponse::decode(body)?;
        Ok(ExportResponse {
            partial_success: response
                .partial_success
                .map(|p| partial_success(p.rejected_spans, p.error_message)),
        })
    }
}

fn proto_span(span: &Span) -> trace::Span {
    let kind = match span.kind {
        SpanKind::Internal => trace::span::SpanKind::Internal,
        SpanKind::Server => trace::span::SpanKind::Server,
        SpanKind::Client => trace::span::SpanKind::Client,
        SpanKind::Producer => trace::span::SpanKind::Producer,
        SpanKind::Consumer => trace::span::SpanKind::Consumer,
    };
    let code = match span.status {
        SpanStatus::Unset => trace::status::StatusCode::Unset,
        SpanStatus::Ok => trace::status::StatusCode::Ok,
        SpanStatus::Error => trace::status::StatusCode::Error,
    };
    // Root spans carry an empty parent id.
    let parent_span_id = if span.parent_span_id == 0 {
        Vec::new()
    } else {
        span.parent_span_id.to_be_bytes().to_vec()
    };

    trace::Span {
        trace_id: span.trace_id.to_be_bytes().to_vec(),
        span_id: span.span_id.to_be_bytes().to_vec(),
        parent_span_id,
        name: span.name.clone(),
        kind: kind as i32,
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: key_values(&span.attributes),
        status: Some(trace::Status {
            code: code as i32,
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// LOGS
// =============================================================================

impl ProtoRecord for LogRecord {
    fn encode_request(records: &[Self], envelope: &RequestEnvelope) -> Vec<u8> {
        let log_records = records.iter().map(proto_log).collect();
        ExportLogsServiceRequest {
            resource_logs: vec![logs::ResourceLogs {
                resource: Some(envelope.resource.clone()),
                scope_logs: vec![logs::ScopeLogs {
                    scope: Some(envelope.scope.clone()),
                    log_records,
                    ..Default::default()
                }],
                schema_url: envelope.schema_url.clone(),
            }],
        }
        .encode_to_vec()
    }

    fn decode_response(body: &[u8]) -> Result<ExportResponse, prost::DecodeError> {
        let response = ExportLogsServiceResponse::decode(body)?;
        Ok(ExportResponse {
            partial_success: response
                .partial_success
                .map(|p| partial_success(p.rejected_log_records, p.error_message)),
        })
    }
}

fn proto_log(log: &LogRecord) -> logs::LogRecord {
    logs::LogRecord {
        time_unix_nano: log.time_unix_nano,
        observed_time_unix_nano: log.time_unix_nano,
        severity_number: log.severity as i32,
        severity_text: format!("{:?}", log.severity).to_uppercase(),
        body: Some(any_string(&log.body)),
        attributes: key_values(&log.attributes),
        trace_id: log
            .trace_id
            .map(|id| id.to_be_bytes().to_vec())
            .unwrap_or_default(),
        ..Default::default()
    }
}

// =============================================================================
// METRICS
// =============================================================================

impl ProtoRecord for MetricPoint {
    fn encode_request(records: &[Self], envelope: &RequestEnvelope) -> Vec<u8> {
        let metrics = records.iter().map(proto_metric).collect();
        ExportMetricsServiceRequest {
            resource_metrics: vec![metrics::ResourceMetrics {
                resource: Some(envelope.resource.clone()),
                scope_metrics: vec![metrics::ScopeMetrics {
                    scope: Some(envelope.scope.clone()),
                    metrics,
                    ..Default::default()
                }],
                schema_url: envelope.schema_url.clone(),
            }],
        }
        .encode_to_vec()
    }

    fn decode_response(body: &[u8]) -> Result<ExportResponse, prost::DecodeError> {
        let response = ExportMetricsServiceResponse::decode(body)?;
        Ok(ExportResponse {
            partial_success: response
                .partial_success
                .map(|p| partial_success(p.rejected_data_points, p.error_message)),
        })
    }
}

fn proto_metric(point: &MetricPoint) -> metrics::Metric {
    let temporality = match point.temporality {
        AggregationTemporality::Delta => metrics::AggregationTemporality::Delta,
        AggregationTemporality::Cumulative => metrics::AggregationTemporality::Cumulative,
    } as i32;
    let number = || metrics::NumberDataPoint {
        attributes: key_values(&point.attributes),
        start_time_unix_nano: point.start_time_unix_nano,
        time_unix_nano: point.time_unix_nano,
        value: Some(match point.value {
            MetricValue::AsInt(v) => metrics::number_data_point::Value::AsInt(v),
            MetricValue::AsDouble(v) => metrics::number_data_point::Value::AsDouble(v),
        }),
        ..Default::default()
    };
    let sum = |is_monotonic| {
        metrics::metric::Data::Sum(metrics::Sum {
            data_points: vec![number()],
            aggregation_temporality: temporality,
            is_monotonic,
        })
    };

    let data = match point.kind {
        InstrumentKind::Counter | InstrumentKind::ObservableCounter => sum(true),
        InstrumentKind::UpDownCounter | InstrumentKind::ObservableUpDownCounter => sum(false),
        InstrumentKind::Gauge | InstrumentKind::ObservableGauge => {
            metrics::metric::Data::Gauge(metrics::Gauge {
                data_points: vec![number()],
            })
        }
        InstrumentKind::Histogram => {
            // A single measurement: one observation with no explicit buckets.
            let value = match point.value {
                MetricValue::AsInt(v) => v as f64,
                MetricValue::AsDouble(v) => v,
            };
            metrics::metric::Data::Histogram(metrics::Histogram {
                data_points: vec![metrics::HistogramDataPoint {
                    attributes: key_values(&point.attributes),
                    start_time_unix_nano: point.start_time_unix_nano,
                    time_unix_nano: point.time_unix_nano,
                    count: 1,
                    sum: Some(value),
                    bucket_counts: vec![1],
                    min: Some(value),
                    max: Some(value),
                    ..Default::default()
                }],
                aggregation_temporality: temporality,
            })
        }
    };

    metrics::Metric {
        name: point.name.clone(),
        unit: point.unit.clone(),
        data: Some(data),
        ..Default::default()
    }
}

// =============================================================================
// ATTRIBUTES
// =============================================================================

fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes.iter().map(|(k, v)| key_value(k, v)).collect()
}

fn key_value(key: &str, value: &AttributeValue) -> KeyValue {
    let value = match value {
        AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Float(f) => any_value::Value::DoubleValue(*f),
        AttributeValue::Array(items) => any_value::Value::ArrayValue(ArrayValue {
            values: items.iter().map(|s| any_string(s)).collect(),
        }),
    };
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

fn any_string(value: &str) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(value.to_string())),
    }
}
