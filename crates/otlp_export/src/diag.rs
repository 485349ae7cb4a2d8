//! Injected diagnostics.
//!
//! Every component takes a [`Diagnostics`] handle at construction instead of
//! reaching for a process-wide logger. The default handle forwards to
//! `tracing`, which stays silent until the host installs a subscriber; tests
//! plug in their own [`DiagnosticObserver`] to assert on what was reported.

use std::fmt;
use std::sync::Arc;

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receiver of diagnostic events.
pub trait DiagnosticObserver: Send + Sync {
    fn event(&self, level: DiagLevel, component: &'static str, message: &str);
}

/// Forwards diagnostics to the `tracing` ecosystem.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl DiagnosticObserver for TracingObserver {
    fn event(&self, level: DiagLevel, component: &'static str, message: &str) {
        match level {
            DiagLevel::Debug => tracing::debug!(component, "{message}"),
            DiagLevel::Info => tracing::info!(component, "{message}"),
            DiagLevel::Warn => tracing::warn!(component, "{message}"),
            DiagLevel::Error => tracing::error!(component, "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl DiagnosticObserver for NoopObserver {
    fn event(&self, _level: DiagLevel, _component: &'static str, _message: &str) {}
}

/// Cloneable handle to a diagnostic observer.
#[derive(Clone)]
pub struct Diagnostics {
    observer: Arc<dyn DiagnosticObserver>,
}

impl Diagnostics {
    pub fn new(observer: Arc<dyn DiagnosticObserver>) -> Self {
        Self { observer }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopObserver))
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingObserver))
    }

    pub fn debug(&self, component: &'static str, message: impl fmt::Display) {
        self.emit(DiagLevel::Debug, component, message);
    }

    pub fn info(&self, component: &'static str, message: impl fmt::Display) {
        self.emit(DiagLevel::Info, component, message);
    }

    pub fn warn(&self, component: &'static str, message: impl fmt::Display) {
        self.emit(DiagLevel::Warn, component, message);
    }

    pub fn error(&self, component: &'static str, message: impl fmt::Display) {
        self.emit(DiagLevel::Error, component, message);
    }

    fn emit(&self, level: DiagLevel, component: &'static str, message: impl fmt::Display) {
        self.observer.event(level, component, &message.to_string());
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}

/// Observer that keeps every event in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: std::sync::Mutex<Vec<(DiagLevel, &'static str, String)>>,
}

#[cfg(test)]
impl RecordingObserver {
    pub(crate) fn count(&self, level: DiagLevel) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .count()
    }

    pub(crate) fn messages(&self, level: DiagLevel) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, _, m)| m.clone())
            .collect()
    }
}

#[cfg(test)]
impl DiagnosticObserver for RecordingObserver {
    fn event(&self, level: DiagLevel, component: &'static str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((level, component, message.to_string()));
    }
}

/// A `Diagnostics` handle plus the recorder behind it.
#[cfg(test)]
pub(crate) fn recording() -> (Diagnostics, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    (Diagnostics::new(observer.clone()), observer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_filters_by_level() {
        let (diag, observer) = recording();
        diag.warn("test", "first");
        diag.error("test", format_args!("second {}", 2));
        diag.warn("test", "third");

        assert_eq!(observer.count(DiagLevel::Warn), 2);
        assert_eq!(observer.messages(DiagLevel::Error), vec!["second 2"]);
    }

    #[test]
    fn test_noop_is_silent() {
        // Nothing to observe; just make sure it does not panic.
        Diagnostics::noop().error("test", "ignored");
    }
}
