//! Buffered request/response transport over HTTP.

use super::{encode_body, Transport};
use crate::config::{merge_headers, Compression, ExporterConfig, HeaderProvider};
use crate::diag::Diagnostics;
use crate::error::{ConfigError, ExportError, ExportResult};
use crate::record::Signal;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const USER_AGENT_VALUE: &str = concat!("otlp-export-rust/", env!("CARGO_PKG_VERSION"));

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

/// POSTs payloads to one signal endpoint, reusing pooled connections.
pub struct HttpTransport {
    /// `None` once shut down; dropping the last clone closes the pool.
    client: Mutex<Option<reqwest::Client>>,
    url: String,
    content_type: &'static str,
    compression: Compression,
    headers: Vec<(String, String)>,
    header_provider: Option<HeaderProvider>,
    diag: Diagnostics,
}

impl HttpTransport {
    pub fn new(
        config: &ExporterConfig,
        signal: Signal,
        content_type: &'static str,
    ) -> Result<Self, ConfigError> {
        let url = config.resolve_endpoint(signal)?;
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.concurrency_limit)
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;

        Ok(Self {
            client: Mutex::new(Some(client)),
            url,
            content_type,
            compression: config.compression,
            headers: config.headers.clone(),
            header_provider: config.header_provider.clone(),
            diag: config.diagnostics.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `false` once the pool has been released.
    pub fn is_open(&self) -> bool {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn request_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        merge_headers(&self.headers, self.header_provider.as_ref())
            .into_iter()
            .filter_map(|(key, value)| {
                match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
                    (Ok(name), Ok(value)) => Some((name, value)),
                    _ => {
                        self.diag.warn("http", format_args!("dropping invalid header `{key}`"));
                        None
                    }
                }
            })
            .collect()
    }
}

impl Transport for HttpTransport {
    async fn send(&self, payload: Bytes, timeout: Duration) -> ExportResult<Bytes> {
        // Requests already running hold their own clone of the client.
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExportError::Shutdown)?;

        let body = encode_body(payload, self.compression)?;
        let mut request = client
            .post(&self.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, self.content_type)
            .header(USER_AGENT, USER_AGENT_VALUE);
        if self.compression == Compression::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        for (name, value) in self.request_headers() {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        classify_status(status, retry_after.as_deref(), &body, Utc::now())?;
        Ok(body)
    }

    fn shutdown(&self) {
        let released = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        if released.is_some() {
            tracing::debug!(url = %self.url, "http transport released its connection pool");
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn map_reqwest_error(err: &reqwest::Error, timeout: Duration) -> ExportError {
    if err.is_timeout() {
        ExportError::Timeout(timeout)
    } else {
        ExportError::Network(err.to_string())
    }
}

/// Maps an HTTP status to the export outcome.
///
/// 2xx succeeds. 429 and 5xx are retryable and carry any `Retry-After`
/// hint. Everything else is terminal and keeps a prefix of the body.
pub fn classify_status(
    status: u16,
    retry_after: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
) -> ExportResult<()> {
    match status {
        200..=299 => Ok(()),
        429 | 500..=599 => Err(ExportError::RetryableStatus {
            status: u32::from(status),
            retry_after: retry_after.and_then(|raw| parse_retry_after(raw, now)),
        }),
        _ => {
            let text = String::from_utf8_lossy(body);
            let message = match text.char_indices().nth(MAX_ERROR_BODY) {
                Some((cut, _)) => format!("{}...", &text[..cut]),
                None => text.into_owned(),
            };
            Err(ExportError::NonRetryableStatus {
                status: u32::from(status),
                message,
            })
        }
    }
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
