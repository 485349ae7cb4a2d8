//! Exporter configuration.
//!
//! An [`ExporterConfig`] is built once (by hand, or from `OTEL_*` variables)
//! and then shared read-only by every exporter that uses it. Invalid
//! environment values are reported through diagnostics and the default is
//! kept; they never fail construction.

use crate::batch_processor::BatchConfig;
use crate::diag::Diagnostics;
use crate::error::ConfigError;
use crate::record::Signal;
use crate::retry::RetryPolicy;
use crate::transport::TransportStrategy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HTTP_ENDPOINT: &str = "http://localhost:4318";
pub const DEFAULT_GRPC_ENDPOINT: &str = "http://localhost:4317";

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Callback producing request headers; evaluated on every send.
#[derive(Clone)]
pub struct HeaderProvider(Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>);

impl HeaderProvider {
    pub fn new(provider: impl Fn() -> Vec<(String, String)> + Send + Sync + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        (self.0)()
    }
}

impl fmt::Debug for HeaderProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HeaderProvider(..)")
    }
}

/// Immutable settings shared by all exporters built from it.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Base endpoint; `/v1/<signal>` is appended for HTTP transports.
    pub endpoint: Option<String>,
    /// Per-signal endpoints, used verbatim.
    pub traces_endpoint: Option<String>,
    pub metrics_endpoint: Option<String>,
    pub logs_endpoint: Option<String>,
    pub transport: TransportStrategy,
    /// Headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Dynamic headers; win over `headers` on key collision.
    pub header_provider: Option<HeaderProvider>,
    pub compression: Compression,
    /// Maximum exports in flight per exporter.
    pub concurrency_limit: usize,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Raw `OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE` value.
    pub temporality_preference: Option<String>,
    pub diagnostics: Diagnostics,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            traces_endpoint: None,
            metrics_endpoint: None,
            logs_endpoint: None,
            transport: TransportStrategy::BufferedRequest,
            headers: Vec::new(),
            header_provider: None,
            compression: Compression::None,
            concurrency_limit: 30,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            temporality_preference: None,
            diagnostics: Diagnostics::default(),
        }
    }
}

impl ExporterConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_signal_endpoint(mut self, signal: Signal, endpoint: impl Into<String>) -> Self {
        let endpoint = Some(endpoint.into());
        match signal {
            Signal::Traces => self.traces_endpoint = endpoint,
            Signal::Metrics => self.metrics_endpoint = endpoint,
            Signal::Logs => self.logs_endpoint = endpoint,
        }
        self
    }

    pub fn with_transport(mut self, transport: TransportStrategy) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_header_provider(mut self, provider: HeaderProvider) -> Self {
        self.header_provider = Some(provider);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Sets the per-attempt timeout and rescales the retry budget to match.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.retry = self.retry.with_budget_for(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_temporality_preference(mut self, preference: impl Into<String>) -> Self {
        self.temporality_preference = Some(preference.into());
        self
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diagnostics = diag;
        self
    }

    /// Endpoint for `signal`.
    ///
    /// A signal-specific endpoint is used as-is. A base endpoint gets the
    /// signal path appended for request/response transports; RPC transports
    /// use the base endpoint's authority and route by method name.
    pub fn resolve_endpoint(&self, signal: Signal) -> Result<String, ConfigError> {
        let specific = match signal {
            Signal::Traces => &self.traces_endpoint,
            Signal::Metrics => &self.metrics_endpoint,
            Signal::Logs => &self.logs_endpoint,
        };
        let resolved = match (specific, &self.endpoint, self.transport) {
            (Some(url), _, _) => url.clone(),
            (None, base, TransportStrategy::StreamingRpc) => base
                .clone()
                .unwrap_or_else(|| DEFAULT_GRPC_ENDPOINT.to_string()),
            (None, base, _) => {
                let base = base.as_deref().unwrap_or(DEFAULT_HTTP_ENDPOINT);
                format!("{}{}", base.trim_end_matches('/'), signal.http_path())
            }
        };

        if resolved.starts_with("http://") || resolved.starts_with("https://") {
            Ok(resolved)
        } else {
            Err(ConfigError::InvalidEndpoint(resolved))
        }
    }

    /// Static headers overlaid with the provider's headers.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        merge_headers(&self.headers, self.header_provider.as_ref())
    }

    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(&|key| std::env::var(key).ok())
    }

    /// Reads `OTEL_EXPORTER_OTLP_*` through `lookup`.
    pub fn from_env_with(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self::default().overlay_env(lookup)
    }

    /// Applies `OTEL_EXPORTER_OTLP_*` values on top of `self`.
    pub fn overlay_env(mut self, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let diag = self.diagnostics.clone();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(protocol) = get("OTEL_EXPORTER_OTLP_PROTOCOL") {
            match protocol.as_str() {
                "grpc" => self.transport = TransportStrategy::StreamingRpc,
                "http/json" => self.transport = TransportStrategy::BufferedRequest,
                "http/protobuf" => {
                    diag.warn("config", "http/protobuf is not supported, sending http/json");
                    self.transport = TransportStrategy::BufferedRequest;
                }
                other => diag.warn("config", format_args!("unknown OTLP protocol `{other}`")),
            }
        }
        if let Some(endpoint) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        for signal in [Signal::Traces, Signal::Metrics, Signal::Logs] {
            if let Some(endpoint) = get(&format!("OTEL_EXPORTER_OTLP_{}_ENDPOINT", signal.env_name())) {
                self = self.with_signal_endpoint(signal, endpoint);
            }
        }
        if let Some(raw) = get("OTEL_EXPORTER_OTLP_HEADERS") {
            match parse_headers(&raw) {
                Ok(headers) => self.headers.extend(headers),
                Err(err) => diag.warn("config", err),
            }
        }
        if let Some(compression) = get("OTEL_EXPORTER_OTLP_COMPRESSION") {
            match compression.as_str() {
                "gzip" => self.compression = Compression::Gzip,
                "none" => self.compression = Compression::None,
                other => diag.warn("config", format_args!("unknown compression `{other}`")),
            }
        }
        if let Some(millis) = parse_millis(&diag, "OTEL_EXPORTER_OTLP_TIMEOUT", get("OTEL_EXPORTER_OTLP_TIMEOUT")) {
            self = self.with_timeout(millis);
        }
        if let Some(preference) = get("OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE") {
            self.temporality_preference = Some(preference);
        }
        self
    }
}

impl BatchConfig {
    /// Reads `OTEL_BSP_*` through `lookup`; unparsable values keep defaults.
    pub fn from_env_with(lookup: &dyn Fn(&str) -> Option<String>, diag: &Diagnostics) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(delay) = parse_millis(diag, "OTEL_BSP_SCHEDULE_DELAY", get("OTEL_BSP_SCHEDULE_DELAY")) {
            config.scheduled_delay = delay;
        }
        if let Some(timeout) = parse_millis(diag, "OTEL_BSP_EXPORT_TIMEOUT", get("OTEL_BSP_EXPORT_TIMEOUT")) {
            config.export_timeout = timeout;
        }
        if let Some(size) = parse_count(diag, "OTEL_BSP_MAX_QUEUE_SIZE", get("OTEL_BSP_MAX_QUEUE_SIZE")) {
            config.max_queue_size = size;
        }
        if let Some(size) = parse_count(diag, "OTEL_BSP_MAX_EXPORT_BATCH_SIZE", get("OTEL_BSP_MAX_EXPORT_BATCH_SIZE")) {
            config.max_export_batch_size = size;
        }
        config.normalized(diag)
    }
}

fn parse_millis(diag: &Diagnostics, key: &str, raw: Option<String>) -> Option<Duration> {
    let raw = raw?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            diag.warn("config", format_args!("ignoring {key}=`{raw}`: expected milliseconds"));
            None
        }
    }
}

fn parse_count(diag: &Diagnostics, key: &str, raw: Option<String>) -> Option<usize> {
    let raw = raw?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            diag.warn("config", format_args!("ignoring {key}=`{raw}`: expected a positive integer"));
            None
        }
    }
}

/// `fixed` overlaid with the provider's current headers, keys compared
/// case-insensitively.
pub(crate) fn merge_headers(
    fixed: &[(String, String)],
    provider: Option<&HeaderProvider>,
) -> Vec<(String, String)> {
    let mut headers = fixed.to_vec();
    if let Some(provider) = provider {
        for (key, value) in provider.headers() {
            match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
                Some(slot) => slot.1 = value,
                None => headers.push((key, value)),
            }
        }
    }
    headers
}

/// Parses `key=value,key2=value2` with percent-encoded values.
pub fn parse_headers(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidHeader(pair.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidHeader(pair.to_string()));
            }
            let value = urlencoding::decode(value.trim())
                .map_err(|_| ConfigError::InvalidHeader(pair.to_string()))?;
            Ok((key.to_string(), value.into_owned()))
        })
        .collect()
}
