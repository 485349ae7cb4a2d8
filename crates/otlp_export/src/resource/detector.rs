//! Resource detectors.

use super::Resource;
use crate::diag::Diagnostics;
use crate::record::AttributeValue;
use std::sync::Arc;

/// Produces a resource describing some aspect of the environment.
pub trait ResourceDetector: Send + Sync {
    fn detect(&self) -> Resource;
}

/// Runs `detectors` in order and merges their results; later detectors
/// override earlier ones.
pub fn detect_resources(detectors: &[&dyn ResourceDetector]) -> Resource {
    detectors
        .iter()
        .fold(Resource::empty(), |acc, detector| acc.merge(&detector.detect()))
}

fn executable_name() -> Option<String> {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
}

/// `service.name` and `telemetry.sdk.*` defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct SdkResourceDetector;

impl ResourceDetector for SdkResourceDetector {
    fn detect(&self) -> Resource {
        let service = match executable_name() {
            Some(exe) => format!("unknown_service:{exe}"),
            None => "unknown_service".to_string(),
        };
        Resource::new([
            ("service.name", service),
            ("telemetry.sdk.name", "otlp_export".to_string()),
            ("telemetry.sdk.language", "rust".to_string()),
            ("telemetry.sdk.version", env!("CARGO_PKG_VERSION").to_string()),
        ])
    }
}

/// `process.*` attributes of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessResourceDetector;

impl ResourceDetector for ProcessResourceDetector {
    fn detect(&self) -> Resource {
        let mut resource = Resource::empty()
            .with_attribute("process.pid", i64::from(std::process::id()))
            .with_attribute("process.runtime.name", "rust");
        if let Some(exe) = executable_name() {
            resource = resource.with_attribute("process.executable.name", exe);
        }
        resource
    }
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `OTEL_RESOURCE_ATTRIBUTES` and `OTEL_SERVICE_NAME`.
///
/// `OTEL_RESOURCE_ATTRIBUTES` is a comma-separated list of `key=value` pairs
/// with percent-encoded values. Malformed pairs are skipped with a warning.
/// `OTEL_SERVICE_NAME` wins over a `service.name` pair.
#[derive(Clone)]
pub struct EnvResourceDetector {
    lookup: Lookup,
    diag: Diagnostics,
}

impl EnvResourceDetector {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Uses `lookup` instead of the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
            diag: Diagnostics::default(),
        }
    }

    pub fn with_diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = diag;
        self
    }

    fn parse_attributes(&self, raw: &str) -> Vec<(String, AttributeValue)> {
        let mut parsed = Vec::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                self.diag.warn(
                    "resource",
                    format_args!("skipping malformed OTEL_RESOURCE_ATTRIBUTES entry `{pair}`"),
                );
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            match urlencoding::decode(value.trim()) {
                Ok(decoded) => parsed.push((key.to_string(), AttributeValue::from(decoded.into_owned()))),
                Err(err) => self.diag.warn(
                    "resource",
                    format_args!("skipping OTEL_RESOURCE_ATTRIBUTES entry `{key}`: {err}"),
                ),
            }
        }
        parsed
    }
}

impl Default for EnvResourceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceDetector for EnvResourceDetector {
    fn detect(&self) -> Resource {
        let mut resource = Resource::empty().with_diagnostics(self.diag.clone());
        if let Some(raw) = (self.lookup)("OTEL_RESOURCE_ATTRIBUTES") {
            for (key, value) in self.parse_attributes(&raw) {
                resource = resource.with_attribute(key, value);
            }
        }
        if let Some(service) = (self.lookup)("OTEL_SERVICE_NAME")
            && !service.trim().is_empty()
        {
            resource = resource.with_attribute("service.name", service.trim().to_string());
        }
        resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{self, DiagLevel};
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> EnvResourceDetector {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvResourceDetector::with_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn test_env_attributes_are_decoded() {
        let detector = env(&[(
            "OTEL_RESOURCE_ATTRIBUTES",
            "deployment.environment=prod, team=core%20infra",
        )]);
        let resource = detector.detect();
        assert_eq!(resource.get("deployment.environment"), Some("prod".into()));
        assert_eq!(resource.get("team"), Some("core infra".into()));
    }

    #[test]
    fn test_service_name_variable_wins() {
        let detector = env(&[
            ("OTEL_RESOURCE_ATTRIBUTES", "service.name=from-attrs"),
            ("OTEL_SERVICE_NAME", "checkout"),
        ]);
        assert_eq!(detector.detect().get("service.name"), Some("checkout".into()));
    }

    #[test]
    fn test_malformed_pair_is_skipped() {
        let (diag, observer) = diag::recording();
        let detector = env(&[("OTEL_RESOURCE_ATTRIBUTES", "ok=1,broken,also=2")]).with_diagnostics(diag);
        let resource = detector.detect();
        assert_eq!(resource.len(), 2);
        assert_eq!(observer.count(DiagLevel::Warn), 1);
    }

    #[test]
    fn test_detect_resources_later_detector_wins() {
        let from_env = env(&[("OTEL_SERVICE_NAME", "billing")]);
        let detectors: [&dyn ResourceDetector; 3] =
            [&SdkResourceDetector, &ProcessResourceDetector, &from_env];
        let detected = detect_resources(&detectors);
        assert_eq!(detected.get("service.name"), Some("billing".into()));
        assert_eq!(detected.get("telemetry.sdk.language"), Some("rust".into()));
        assert!(detected.get("process.pid").is_some());
    }

    #[test]
    fn test_default_resource_has_unknown_service() {
        let resource = Resource::default();
        match resource.get("service.name") {
            Some(AttributeValue::String(name)) => assert!(name.starts_with("unknown_service")),
            other => panic!("unexpected service.name {other:?}"),
        }
    }
}
