//! Unary gRPC transport multiplexed over one HTTP/2 channel.
//!
//! Payloads are already-encoded bytes, so calls go through a pass-through
//! codec instead of generated message types.

use super::Transport;
use crate::config::{merge_headers, Compression, ExporterConfig, HeaderProvider};
use crate::diag::Diagnostics;
use crate::error::{ConfigError, ExportError, ExportResult};
use crate::record::Signal;
use bytes::{Buf, BufMut, Bytes};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tonic::codec::{Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

/// Codec that moves request and response bodies as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

pub struct GrpcTransport {
    /// `None` once shut down; the channel closes with its last clone.
    client: Mutex<Option<tonic::client::Grpc<Channel>>>,
    method: PathAndQuery,
    headers: Vec<(String, String)>,
    header_provider: Option<HeaderProvider>,
    diag: Diagnostics,
}

impl GrpcTransport {
    /// Creates a lazily connecting channel. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &ExporterConfig, signal: Signal) -> Result<Self, ConfigError> {
        let endpoint = config.resolve_endpoint(signal)?;
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|_| ConfigError::InvalidEndpoint(endpoint))?
            .connect_lazy();

        let mut client = tonic::client::Grpc::new(channel);
        if config.compression == Compression::Gzip {
            client = client
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip);
        }

        Ok(Self {
            client: Mutex::new(Some(client)),
            method: PathAndQuery::from_static(signal.grpc_method()),
            headers: config.headers.clone(),
            header_provider: config.header_provider.clone(),
            diag: config.diagnostics.clone(),
        })
    }

    fn request(&self, payload: Bytes, timeout: Duration) -> Request<Bytes> {
        let mut request = Request::new(payload);
        request.set_timeout(timeout);
        for (key, value) in merge_headers(&self.headers, self.header_provider.as_ref()) {
            let key = AsciiMetadataKey::from_bytes(key.to_ascii_lowercase().as_bytes());
            match (key, AsciiMetadataValue::try_from(value.as_str())) {
                (Ok(key), Ok(value)) => {
                    request.metadata_mut().insert(key, value);
                }
                _ => self.diag.warn("grpc", "dropping invalid metadata entry"),
            }
        }
        request
    }
}

impl Transport for GrpcTransport {
    async fn send(&self, payload: Bytes, timeout: Duration) -> ExportResult<Bytes> {
        let mut client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExportError::Shutdown)?;
        let request = self.request(payload, timeout);
        let method = self.method.clone();
        let call = async move {
            client
                .ready()
                .await
                .map_err(|e| ExportError::Network(e.to_string()))?;
            client
                .unary(request, method, RawCodec)
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| status_to_error(&status))
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout(timeout)),
        }
    }

    fn shutdown(&self) {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn name(&self) -> &str {
        "grpc"
    }
}

/// Maps a gRPC status to the export outcome.
pub(crate) fn status_to_error(status: &Status) -> ExportError {
    let code = status.code();
    let numeric = u32::try_from(code as i32).unwrap_or(u32::MAX);
    match code {
        Code::Cancelled
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable
        | Code::DataLoss => ExportError::RetryableStatus {
            status: numeric,
            retry_after: None,
        },
        _ => ExportError::NonRetryableStatus {
            status: numeric,
            message: status.message().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes_are_retryable() {
        for code in [Code::Unavailable, Code::ResourceExhausted, Code::DeadlineExceeded] {
            assert!(status_to_error(&Status::new(code, "")).is_retryable());
        }
    }

    #[test]
    fn test_permanent_codes_are_terminal() {
        let err = status_to_error(&Status::invalid_argument("bad span"));
        assert_eq!(
            err,
            ExportError::NonRetryableStatus {
                status: 3,
                message: "bad span".into()
            }
        );
        assert!(!status_to_error(&Status::unauthenticated("")).is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let config = ExporterConfig::default()
            .with_transport(crate::transport::TransportStrategy::StreamingRpc)
            .with_endpoint("http://bad host");
        assert!(GrpcTransport::new(&config, Signal::Traces).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_retryable() {
        let config = ExporterConfig::default()
            .with_transport(crate::transport::TransportStrategy::StreamingRpc)
            .with_endpoint("http://127.0.0.1:9");
        let transport = GrpcTransport::new(&config, Signal::Traces).unwrap();

        let err = transport
            .send(Bytes::from_static(b"\x0a\x00"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[tokio::test]
    async fn test_metadata_is_lowercased() {
        let config = ExporterConfig::default()
            .with_transport(crate::transport::TransportStrategy::StreamingRpc)
            .with_header("X-Tenant", "core");
        let transport = GrpcTransport::new(&config, Signal::Logs).unwrap();

        let request = transport.request(Bytes::new(), Duration::from_secs(1));
        assert_eq!(request.metadata().get("x-tenant").unwrap(), "core");
    }

    #[tokio::test]
    async fn test_shutdown_releases_channel() {
        let config = ExporterConfig::default()
            .with_transport(crate::transport::TransportStrategy::StreamingRpc)
            .with_endpoint("http://127.0.0.1:9");
        let transport = GrpcTransport::new(&config, Signal::Traces).unwrap();

        transport.shutdown();
        transport.shutdown();
        assert!(transport.client.lock().unwrap().is_none());
        assert_eq!(
            transport.send(Bytes::new(), Duration::from_secs(1)).await,
            Err(ExportError::Shutdown)
        );
    }
}
