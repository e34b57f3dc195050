//! Fire-and-forget telemetry events
//!
//! The supervisor emits named events (`circuit_break`, `degradation`,
//! `restart`) carrying numeric measurements and metadata tags. The default
//! sink forwards them to `tracing`; [`MemorySink`] collects them for tests.

use parking_lot::Mutex;
use tracing::info;

/// A single named telemetry event
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub name: &'static str,
    pub measurements: Vec<(&'static str, f64)>,
    pub tags: Vec<(&'static str, String)>,
}

impl TelemetryEvent {
    #[inline]
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            measurements: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn measure(mut self, key: &'static str, value: f64) -> Self {
        self.measurements.push((key, value));
        self
    }

    #[inline]
    #[must_use]
    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }
}

/// Destination for telemetry events; emission never fails or blocks
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Sink that logs events through `tracing`
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        info!(
            target: "recovery_kernel::telemetry",
            event = event.name,
            measurements = ?event.measurements,
            tags = ?event.tags,
        );
    }
}

/// Sink that records events in memory, for assertions
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_builder() {
        let event = TelemetryEvent::new("circuit_break")
            .measure("duration_ms", 80_000.0)
            .tag("child_id", "cache");
        assert_eq!(event.name, "circuit_break");
        assert_eq!(event.measurements, vec![("duration_ms", 80_000.0)]);
        assert_eq!(event.tags, vec![("child_id", "cache".to_string())]);
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        sink.emit(TelemetryEvent::new("restart"));
        sink.emit(TelemetryEvent::new("restart"));
        sink.emit(TelemetryEvent::new("degradation"));
        assert_eq!(sink.count("restart"), 2);
        assert_eq!(sink.count("degradation"), 1);
        assert_eq!(sink.events().len(), 3);
    }
}
