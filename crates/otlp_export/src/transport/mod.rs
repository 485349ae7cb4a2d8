//! Transports: move an encoded payload to the collector.
//!
//! Every transport implements [`Transport`]. A send never panics; each
//! failure mode comes back as an [`ExportError`]. Which transport an exporter
//! uses is decided once, at configuration time, by [`TransportStrategy`]:
//!
//! - [`HttpTransport`]: buffered request/response over a keep-alive pool.
//! - [`GrpcTransport`]: unary calls multiplexed over one HTTP/2 channel.
//! - [`BeaconTransport`]: fire-and-forget, for callers about to terminate.
//!
//! Uses native async fn in traits, like the exporter traits; the boxed
//! variant exists for `Arc<dyn TransportBoxed>`.

mod beacon;
mod grpc;
mod http;

pub use beacon::{BeaconTransport, MAX_BEACON_PAYLOAD};
pub use grpc::GrpcTransport;
pub use http::{classify_status, parse_retry_after, HttpTransport};

use crate::config::{Compression, ExporterConfig};
use crate::error::{ConfigError, ExportError, ExportResult};
use crate::record::Signal;
use bytes::Bytes;
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

/// Sends encoded payloads to a collector.
pub trait Transport: Send + Sync {
    /// Sends one payload, resolving to the raw response body on success.
    fn send(&self, payload: Bytes, timeout: Duration) -> impl Future<Output = ExportResult<Bytes>> + Send;

    /// Releases connections. Idempotent; later sends fail with
    /// [`ExportError::Shutdown`] or a local rejection.
    fn shutdown(&self);

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait TransportBoxed: Send + Sync {
    fn send_boxed(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ExportResult<Bytes>> + Send + '_>>;

    fn shutdown_boxed(&self);

    fn name(&self) -> &str;
}

/// Blanket implementation: any Transport can be used as TransportBoxed
impl<T: Transport> TransportBoxed for T {
    fn send_boxed(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ExportResult<Bytes>> + Send + '_>> {
        Box::pin(self.send(payload, timeout))
    }

    fn shutdown_boxed(&self) {
        Transport::shutdown(self);
    }

    fn name(&self) -> &str {
        Transport::name(self)
    }
}

/// Which transport variant an exporter is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportStrategy {
    /// HTTP request/response with full status visibility.
    #[default]
    BufferedRequest,
    /// gRPC unary calls over a shared channel.
    StreamingRpc,
    /// Best-effort send with no response visibility.
    Beacon,
}

/// What the caller can tolerate from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRequirements {
    /// The caller can wait for a round trip.
    pub can_await_response: bool,
    /// The process is about to terminate.
    pub terminating: bool,
}

impl TransportStrategy {
    /// Picks the variant for `requirements`, falling back to `preferred`.
    ///
    /// A terminating caller that cannot await a response gets a beacon; a
    /// caller that can await never gets one.
    pub fn negotiate(requirements: TransportRequirements, preferred: TransportStrategy) -> Self {
        match (requirements.can_await_response, requirements.terminating, preferred) {
            (false, true, _) => Self::Beacon,
            (true, _, Self::Beacon) => Self::BufferedRequest,
            (_, _, preferred) => preferred,
        }
    }
}

/// Closed set of production transports, resolved once from configuration.
pub enum TransportVariant {
    Http(HttpTransport),
    Grpc(GrpcTransport),
    Beacon(BeaconTransport),
}

impl TransportVariant {
    /// Builds the variant named by `config.transport` for `signal`.
    ///
    /// The gRPC variant spawns its connection worker, so it must be built
    /// inside a tokio runtime.
    pub fn from_config(
        config: &ExporterConfig,
        signal: Signal,
        content_type: &'static str,
    ) -> Result<Self, ConfigError> {
        Ok(match config.transport {
            TransportStrategy::BufferedRequest => {
                Self::Http(HttpTransport::new(config, signal, content_type)?)
            }
            TransportStrategy::StreamingRpc => Self::Grpc(GrpcTransport::new(config, signal)?),
            TransportStrategy::Beacon => {
                Self::Beacon(BeaconTransport::new(config, signal, content_type)?)
            }
        })
    }

    pub fn strategy(&self) -> TransportStrategy {
        match self {
            Self::Http(_) => TransportStrategy::BufferedRequest,
            Self::Grpc(_) => TransportStrategy::StreamingRpc,
            Self::Beacon(_) => TransportStrategy::Beacon,
        }
    }
}

impl Transport for TransportVariant {
    async fn send(&self, payload: Bytes, timeout: Duration) -> ExportResult<Bytes> {
        match self {
            Self::Http(t) => t.send(payload, timeout).await,
            Self::Grpc(t) => t.send(payload, timeout).await,
            Self::Beacon(t) => t.send(payload, timeout).await,
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Http(t) => Transport::shutdown(t),
            Self::Grpc(t) => Transport::shutdown(t),
            Self::Beacon(t) => Transport::shutdown(t),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Http(t) => Transport::name(t),
            Self::Grpc(t) => Transport::name(t),
            Self::Beacon(t) => Transport::name(t),
        }
    }
}

pub(crate) fn gzip(payload: &[u8]) -> ExportResult<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(payload)
        .and_then(|()| encoder.finish())
        .map_err(|e| ExportError::Serialization(format!("gzip: {e}")))
}

pub(crate) fn encode_body(payload: Bytes, compression: Compression) -> ExportResult<Bytes> {
    match compression {
        Compression::None => Ok(payload),
        Compression::Gzip => gzip(&payload).map(Bytes::from),
    }
}

/// Stdout transport for testing and debugging
pub struct StdoutTransport {
    verbose: bool,
}

impl StdoutTransport {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Transport for StdoutTransport {
    async fn send(&self, payload: Bytes, _timeout: Duration) -> ExportResult<Bytes> {
        if self.verbose {
            println!("=== Exporting {} bytes ===", payload.len());
            println!("{}", String::from_utf8_lossy(&payload));
            println!("=== Export complete ===\n");
        }
        Ok(Bytes::new())
    }

    fn shutdown(&self) {}

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Null transport that discards all payloads (for benchmarking)
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    async fn send(&self, _payload: Bytes, _timeout: Duration) -> ExportResult<Bytes> {
        Ok(Bytes::new())
    }

    fn shutdown(&self) {}

    fn name(&self) -> &str {
        "null"
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_negotiate() {
        let terminating = TransportRequirements {
            can_await_response: false,
            terminating: true,
        };
        let awaiting = TransportRequirements {
            can_await_response: true,
            terminating: false,
        };

        assert_eq!(
            TransportStrategy::negotiate(terminating, TransportStrategy::BufferedRequest),
            TransportStrategy::Beacon
        );
        assert_eq!(
            TransportStrategy::negotiate(awaiting, TransportStrategy::Beacon),
            TransportStrategy::BufferedRequest
        );
        assert_eq!(
            TransportStrategy::negotiate(awaiting, TransportStrategy::StreamingRpc),
            TransportStrategy::StreamingRpc
        );
    }

    #[test]
    fn test_gzip_round_trip() {
        let payload = Bytes::from_static(b"{\"resourceSpans\":[]}");
        let compressed = encode_body(payload.clone(), Compression::Gzip).unwrap();

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);

        let untouched = encode_body(payload.clone(), Compression::None).unwrap();
        assert_eq!(untouched, payload);
    }

    #[test]
    fn test_variant_follows_strategy() {
        let config = ExporterConfig::default().with_transport(TransportStrategy::Beacon);
        let variant = TransportVariant::from_config(&config, Signal::Logs, "application/json").unwrap();
        assert_eq!(variant.strategy(), TransportStrategy::Beacon);
        assert_eq!(Transport::name(&variant), "beacon");

        let http = TransportVariant::from_config(&ExporterConfig::default(), Signal::Traces, "application/json").unwrap();
        assert_eq!(http.strategy(), TransportStrategy::BufferedRequest);
    }

    #[tokio::test]
    async fn test_null_and_stdout_transports() {
        let payload = Bytes::from_static(b"ignored");
        assert!(NullTransport.send(payload.clone(), Duration::from_secs(1)).await.unwrap().is_empty());
        assert!(StdoutTransport::new(false).send(payload, Duration::from_secs(1)).await.is_ok());
    }
}
