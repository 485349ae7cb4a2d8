//! Error types for the export pipeline.

use std::time::Duration;
use thiserror::Error;

/// Result of one export or transport send.
///
/// `Ok` carries whatever the layer produces on success (the raw response body
/// for transports, `()` for exporters).
pub type ExportResult<T = ()> = Result<T, ExportError>;

/// Failure of a single export attempt.
///
/// Every failure mode a transport can hit is folded into one of these
/// variants; transports never panic across their public boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// The batch could not be encoded. Indicates a producer bug.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error: {0}")]
    Network(String),

    /// The attempt did not complete within its timeout.
    #[error("export timed out after {0:?}")]
    Timeout(Duration),

    /// The collector answered with a status that must not be retried.
    #[error("collector rejected export with status {status}: {message}")]
    NonRetryableStatus { status: u32, message: String },

    /// The collector answered with a transient status.
    #[error("collector responded with retryable status {status}")]
    RetryableStatus {
        status: u32,
        retry_after: Option<Duration>,
    },

    /// The exporter or transport has been shut down.
    #[error("exporter is shutdown")]
    Shutdown,

    /// Too many exports are already in flight on this delegate.
    #[error("concurrent export limit of {limit} reached")]
    ConcurrencyLimit { limit: usize },

    /// The beacon transport refused the payload locally.
    #[error("beacon rejected payload: {0}")]
    BeaconRejected(String),
}

impl ExportError {
    /// Returns `true` if the retry layer may attempt this export again.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RetryableStatus { .. }
        )
    }

    /// Minimum delay the collector asked for before the next attempt.
    #[inline]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryableStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Outcome of handing a record to the batch processor.
///
/// Neither variant is fatal; the producer may ignore both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The queue is at `max_queue_size`; the record was dropped.
    #[error("export queue is full, record dropped")]
    Full,
    /// The processor is shutting down or shut down; the record was rejected.
    #[error("processor is shutdown, record rejected")]
    Shutdown,
}

/// Errors surfaced by processor lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    /// The operation was issued after `shutdown()` began.
    #[error("processor is shutdown")]
    Shutdown,
    /// The background worker is gone (it panicked or was aborted).
    #[error("processor worker stopped unexpectedly")]
    WorkerGone,
}

/// Errors resolving deferred resource attributes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("attribute `{key}` could not be resolved: {reason}")]
    Unresolved { key: String, reason: String },
}

/// Errors building a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
    #[error("failed to build transport: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExportError::Network("reset".into()).is_retryable());
        assert!(ExportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            ExportError::RetryableStatus {
                status: 503,
                retry_after: None
            }
            .is_retryable()
        );

        assert!(!ExportError::Serialization("bad".into()).is_retryable());
        assert!(!ExportError::Shutdown.is_retryable());
        assert!(!ExportError::ConcurrencyLimit { limit: 1 }.is_retryable());
        assert!(
            !ExportError::NonRetryableStatus {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_retry_after_only_on_retryable_status() {
        let hinted = ExportError::RetryableStatus {
            status: 429,
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(hinted.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ExportError::Network("x".into()).retry_after(), None);
    }

    #[test]
    fn test_shutdown_message() {
        assert_eq!(ExportError::Shutdown.to_string(), "exporter is shutdown");
    }
}
