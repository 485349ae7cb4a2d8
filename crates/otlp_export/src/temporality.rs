//! Temporality and aggregation selection for metric exporters.
//!
//! Both selectors are pure lookups fixed once when the metric exporter is
//! built. The preference string comes from configuration
//! (`OTEL_EXPORTER_OTLP_METRICS_TEMPORALITY_PREFERENCE`) unless the caller
//! overrides it explicitly.

use crate::diag::Diagnostics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Instrument kinds that can produce metric points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Counter,
    UpDownCounter,
    Histogram,
    Gauge,
    ObservableCounter,
    ObservableUpDownCounter,
    ObservableGauge,
}

impl InstrumentKind {
    pub const ALL: [InstrumentKind; 7] = [
        Self::Counter,
        Self::UpDownCounter,
        Self::Histogram,
        Self::Gauge,
        Self::ObservableCounter,
        Self::ObservableUpDownCounter,
        Self::ObservableGauge,
    ];

    fn is_up_down(self) -> bool {
        matches!(self, Self::UpDownCounter | Self::ObservableUpDownCounter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationTemporality {
    Cumulative,
    Delta,
}

/// Named temporality policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalityPreference {
    #[default]
    Cumulative,
    Delta,
    LowMemory,
}

impl TemporalityPreference {
    /// Parses a configuration string.
    ///
    /// Unknown values fall back to `Cumulative` and report one warning.
    pub fn parse(raw: &str, diag: &Diagnostics) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Self::Cumulative,
            "delta" => Self::Delta,
            "lowmemory" => Self::LowMemory,
            other => {
                diag.warn(
                    "temporality",
                    format_args!(
                        "unknown temporality preference `{other}`, using cumulative"
                    ),
                );
                Self::Cumulative
            }
        }
    }

    pub fn temporality(self, kind: InstrumentKind) -> AggregationTemporality {
        match self {
            Self::Cumulative | Self::LowMemory => AggregationTemporality::Cumulative,
            Self::Delta if kind.is_up_down() => AggregationTemporality::Cumulative,
            Self::Delta => AggregationTemporality::Delta,
        }
    }
}

/// Instrument kind to temporality, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TemporalitySelector {
    preference: TemporalityPreference,
}

impl TemporalitySelector {
    /// Resolves the selector: explicit override, then configuration
    /// string, then the cumulative default.
    pub fn resolve(
        explicit: Option<TemporalityPreference>,
        configured: Option<&str>,
        diag: &Diagnostics,
    ) -> Self {
        let preference = match (explicit, configured) {
            (Some(preference), _) => preference,
            (None, Some(raw)) => TemporalityPreference::parse(raw, diag),
            (None, None) => TemporalityPreference::default(),
        };
        Self { preference }
    }

    pub fn from_preference(preference: TemporalityPreference) -> Self {
        Self { preference }
    }

    pub fn preference(&self) -> TemporalityPreference {
        self.preference
    }

    #[inline]
    pub fn select(&self, kind: InstrumentKind) -> AggregationTemporality {
        self.preference.temporality(kind)
    }
}

/// Aggregation applied to an instrument before export.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// The SDK default for the instrument kind.
    Default,
    Drop,
    Sum,
    LastValue,
    ExplicitBucketHistogram { boundaries: Vec<f64> },
}

/// Instrument kind to aggregation, resolved once.
#[derive(Clone, Default)]
pub struct AggregationSelector {
    custom: Option<Arc<dyn Fn(InstrumentKind) -> Aggregation + Send + Sync>>,
}

impl AggregationSelector {
    pub fn new(select: impl Fn(InstrumentKind) -> Aggregation + Send + Sync + 'static) -> Self {
        Self {
            custom: Some(Arc::new(select)),
        }
    }

    pub fn select(&self, kind: InstrumentKind) -> Aggregation {
        match &self.custom {
            Some(select) => select(kind),
            None => Aggregation::Default,
        }
    }
}

impl fmt::Debug for AggregationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationSelector")
            .field("custom", &self.custom.is_some())
            .finish()
    }
}
