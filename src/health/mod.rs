//! Live system health input for health-gated decisions

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Point-in-time system health measurements
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub render_avg_ms: f64,
    pub memory_mb: f64,
    pub error_rate_percent: f64,
}

/// Coarse health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthSnapshot {
    #[inline]
    #[must_use]
    pub fn new(render_avg_ms: f64, memory_mb: f64, error_rate_percent: f64) -> Self {
        Self {
            render_avg_ms,
            memory_mb,
            error_rate_percent,
        }
    }

    /// Any degraded-health threshold crossed (20ms / 50MB / 2%)
    #[inline]
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.render_avg_ms > 20.0 || self.memory_mb > 50.0 || self.error_rate_percent > 2.0
    }

    /// Any critical-health threshold crossed (50ms / 125MB / 5%)
    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.render_avg_ms > 50.0 || self.memory_mb > 125.0 || self.error_rate_percent > 5.0
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> HealthLevel {
        if self.is_critical() {
            HealthLevel::Critical
        } else if self.is_degraded() {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }
}

/// Point-in-time health snapshot provider
pub trait HealthProbe: Send + Sync {
    fn snapshot(&self) -> HealthSnapshot;
}

/// Probe backed by an externally updated snapshot
///
/// Usable both as a manual feed from a metrics pipeline and as a test probe.
#[derive(Debug, Default)]
pub struct StaticHealthProbe {
    current: RwLock<HealthSnapshot>,
}

impl StaticHealthProbe {
    #[inline]
    #[must_use]
    pub fn new(initial: HealthSnapshot) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    #[inline]
    #[must_use]
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: HealthSnapshot) {
        *self.current.write() = snapshot;
    }
}

impl HealthProbe for StaticHealthProbe {
    fn snapshot(&self) -> HealthSnapshot {
        *self.current.read()
    }
}
