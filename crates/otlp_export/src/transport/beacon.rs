//! Fire-and-forget transport for callers that are about to terminate.
//!
//! The send is accepted or rejected locally and resolves at once; the request
//! itself runs detached and its outcome is only logged. Nothing is retried.

use super::Transport;
use crate::config::{merge_headers, ExporterConfig, HeaderProvider};
use crate::diag::Diagnostics;
use crate::error::{ConfigError, ExportError, ExportResult};
use crate::record::Signal;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Largest payload a beacon accepts.
pub const MAX_BEACON_PAYLOAD: usize = 64 * 1024;

pub struct BeaconTransport {
    /// `None` once shut down. Detached sends keep their own clone.
    client: Mutex<Option<reqwest::Client>>,
    url: String,
    content_type: &'static str,
    headers: Vec<(String, String)>,
    header_provider: Option<HeaderProvider>,
    diag: Diagnostics,
}

impl BeaconTransport {
    pub fn new(
        config: &ExporterConfig,
        signal: Signal,
        content_type: &'static str,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Self {
            client: Mutex::new(Some(client)),
            url: config.resolve_endpoint(signal)?,
            content_type,
            headers: config.headers.clone(),
            header_provider: config.header_provider.clone(),
            diag: config.diagnostics.clone(),
        })
    }
}

impl Transport for BeaconTransport {
    async fn send(&self, payload: Bytes, timeout: Duration) -> ExportResult<Bytes> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExportError::Shutdown)?;
        if payload.len() > MAX_BEACON_PAYLOAD {
            return Err(ExportError::BeaconRejected(format!(
                "payload of {} bytes exceeds {MAX_BEACON_PAYLOAD}",
                payload.len()
            )));
        }
        let runtime = Handle::try_current()
            .map_err(|_| ExportError::BeaconRejected("no async runtime to queue the send".into()))?;

        let mut request = client
            .post(&self.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, self.content_type);
        for (key, value) in merge_headers(&self.headers, self.header_provider.as_ref()) {
            request = request.header(key, value);
        }

        let diag = self.diag.clone();
        runtime.spawn(async move {
            match request.body(payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => diag.debug(
                    "beacon",
                    format_args!("beacon answered with status {}", response.status()),
                ),
                Err(err) => diag.debug("beacon", format_args!("beacon send failed: {err}")),
            }
        });

        Ok(Bytes::new())
    }

    fn shutdown(&self) {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn name(&self) -> &str {
        "beacon"
    }
}
