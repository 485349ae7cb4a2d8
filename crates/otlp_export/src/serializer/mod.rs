//! Request serializers and response decoders.
//!
//! A serializer is picked once per (signal, wire format) when an exporter is
//! built. It is stateless apart from the resource it stamps on every request.

use crate::error::ExportError;
use crate::record::{AttributeValue, Record, Signal};
use crate::resource::Resource;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::marker::PhantomData;

mod protobuf;

pub use protobuf::{ProtoRecord, ProtobufSerializer, RequestEnvelope, PROTOBUF_CONTENT_TYPE};

/// Content type of OTLP/JSON requests.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Name and version stamped on every request as the instrumentation scope.
pub(crate) const SCOPE_NAME: &str = "otlp_export";
pub(crate) const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Partial acceptance reported by the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSuccess {
    /// Number of records the collector refused.
    #[serde(default, alias = "rejectedSpans", alias = "rejectedLogRecords", alias = "rejectedDataPoints")]
    pub rejected: u64,
    #[serde(default)]
    pub error_message: String,
}

/// Decoded export response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_success: Option<PartialSuccess>,
}

impl ExportResponse {
    /// Partial success that actually rejected something or carried a message.
    pub fn rejection(&self) -> Option<&PartialSuccess> {
        self.partial_success
            .as_ref()
            .filter(|p| p.rejected > 0 || !p.error_message.is_empty())
    }
}

/// Encodes a batch of records into a request body and decodes the reply.
pub trait RecordSerializer<R>: Send + Sync {
    /// Encodes `records` into a request body. Deterministic for equal input.
    fn serialize_request(&self, records: &[R]) -> Result<Vec<u8>, ExportError>;

    /// Decodes a response body. A zero-length body is an empty success.
    fn deserialize_response(&self, body: &[u8]) -> Result<ExportResponse, ExportError>;

    /// Value of the `Content-Type` request header.
    fn content_type(&self) -> &'static str;
}

/// OTLP/JSON-shaped encoder for any record type.
pub struct JsonSerializer<R> {
    resource: Value,
    schema_url: Option<String>,
    _records: PhantomData<fn(&R)>,
}

impl<R: Record> JsonSerializer<R> {
    /// Captures the resource attributes once; the resource should be fully
    /// resolved at this point.
    pub fn new(resource: &Resource) -> Self {
        let attributes = resource
            .attributes()
            .iter()
            .map(|(k, v)| key_value(k, v))
            .collect::<Vec<_>>();
        Self {
            resource: json!({ "attributes": attributes }),
            schema_url: resource.schema_url().map(str::to_string),
            _records: PhantomData,
        }
    }

    fn envelope(&self, records: Value) -> Value {
        let (outer, scope, inner) = match R::SIGNAL {
            Signal::Traces => ("resourceSpans", "scopeSpans", "spans"),
            Signal::Metrics => ("resourceMetrics", "scopeMetrics", "metrics"),
            Signal::Logs => ("resourceLogs", "scopeLogs", "logRecords"),
        };

        let mut resource_entry = Map::new();
        resource_entry.insert("resource".into(), self.resource.clone());
        if let Some(url) = &self.schema_url {
            resource_entry.insert("schemaUrl".into(), Value::String(url.clone()));
        }
        resource_entry.insert(
            scope.into(),
            json!([{
                "scope": { "name": SCOPE_NAME, "version": SCOPE_VERSION },
                inner: records,
            }]),
        );

        json!({ outer: [Value::Object(resource_entry)] })
    }
}

impl<R: Record> RecordSerializer<R> for JsonSerializer<R> {
    fn serialize_request(&self, records: &[R]) -> Result<Vec<u8>, ExportError> {
        let records = serde_json::to_value(records)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        serde_json::to_vec(&self.envelope(records))
            .map_err(|e| ExportError::Serialization(e.to_string()))
    }

    fn deserialize_response(&self, body: &[u8]) -> Result<ExportResponse, ExportError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ExportResponse::default());
        }
        serde_json::from_slice(body).map_err(|e| ExportError::Serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

fn key_value(key: &str, value: &AttributeValue) -> Value {
    let any = match value {
        AttributeValue::String(s) => json!({ "stringValue": s }),
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
        // OTLP/JSON carries 64-bit integers as strings.
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Float(f) => json!({ "doubleValue": f }),
        AttributeValue::Array(items) => json!({
            "arrayValue": {
                "values": items.iter().map(|s| json!({ "stringValue": s })).collect::<Vec<_>>()
            }
        }),
    };
    json!({ "key": key, "value": any })
}
