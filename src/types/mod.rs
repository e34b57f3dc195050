//! Core types for the recovery engine
//!
//! Defines the shared vocabulary of the subsystem:
//! - Child identifiers and declarations
//! - Recovery strategies and the tagged-union recovery action
//! - Restart bookkeeping and attempt context
//! - Error signatures for indexing learned statistics

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of a managed child process
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildId(String);

impl ChildId {
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Synthesize an id for a malformed child declaration
    #[inline]
    #[must_use]
    pub fn synthesize() -> Self {
        Self(format!("child-{}", uuid::Uuid::new_v4()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChildId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Normalized key identifying a class of error
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    #[inline]
    #[must_use]
    pub fn new(sig: impl Into<String>) -> Self {
        Self(sig.into())
    }

    /// Normalize a raw failure reason into a signature
    ///
    /// Takes the first line, lowercases it, collapses runs of
    /// non-alphanumeric characters to `_`, and truncates to 64 bytes so
    /// unbounded reason strings cannot grow the learning maps without limit.
    #[must_use]
    pub fn from_reason(reason: &str) -> Self {
        let line = reason.lines().next().unwrap_or("");
        let mut out = String::with_capacity(line.len().min(64));
        let mut last_sep = true;
        for ch in line.chars() {
            if out.len() >= 64 {
                break;
            }
            if ch.is_ascii_alphanumeric() {
                out.extend(ch.to_lowercase());
                last_sep = false;
            } else if !last_sep {
                out.push('_');
                last_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        if out.is_empty() {
            out.push_str("unknown");
        }
        Self(out)
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recovery strategies the learner scores and recommends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRestart,
    DelayedRestart,
    CircuitBreak,
    GracefulDegradation,
    DependencyRestart,
    Escalate,
}

impl RecoveryStrategy {
    /// Every strategy, in scoring order
    pub const ALL: [RecoveryStrategy; 6] = [
        RecoveryStrategy::ImmediateRestart,
        RecoveryStrategy::DelayedRestart,
        RecoveryStrategy::CircuitBreak,
        RecoveryStrategy::GracefulDegradation,
        RecoveryStrategy::DependencyRestart,
        RecoveryStrategy::Escalate,
    ];

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::ImmediateRestart => "immediate_restart",
            RecoveryStrategy::DelayedRestart => "delayed_restart",
            RecoveryStrategy::CircuitBreak => "circuit_break",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
            RecoveryStrategy::DependencyRestart => "dependency_restart",
            RecoveryStrategy::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialSuccess,
    Failure,
}

impl Outcome {
    /// Success value blended into the pattern EMA
    #[inline]
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            Outcome::Success => 1.0,
            Outcome::PartialSuccess => 0.5,
            Outcome::Failure => 0.0,
        }
    }

    /// Step applied to the per-strategy success rate
    #[inline]
    #[must_use]
    pub fn step(&self) -> f64 {
        match self {
            Outcome::Success => 0.1,
            Outcome::PartialSuccess => 0.05,
            Outcome::Failure => -0.1,
        }
    }
}

/// Coarse classification of how heavy a recovery was
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceImpact {
    Low,
    Medium,
    High,
}

impl PerformanceImpact {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceImpact::Low => "low",
            PerformanceImpact::Medium => "medium",
            PerformanceImpact::High => "high",
        }
    }
}

/// Restart flavor chosen by the decision procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartVariant {
    Immediate,
    Delayed,
    Careful,
    WithDependencies,
}

/// Degradation mode applied when a child is not restarted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Leave the child stopped; the system proceeds without it
    Disable,
    /// Start a registered substitute keyed by a variant tag
    Fallback(String),
    /// Telemetry-only notification, no structural change
    Notify(String),
}

impl Default for FallbackMode {
    fn default() -> Self {
        FallbackMode::Disable
    }
}

/// Declared behavior when a child's dependencies are down at exit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategyDecl {
    Independent,
    WaitForDependencies,
    RestartWithDependencies,
    GracefulDegradation,
    Escalate,
}

impl Default for RestartStrategyDecl {
    fn default() -> Self {
        RestartStrategyDecl::Independent
    }
}

/// Action selected by the supervisor's decision procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Restart(RestartVariant),
    CircuitBreak { duration: Duration },
    Degrade(FallbackMode),
    Escalate,
}

impl RecoveryAction {
    /// The strategy this action realizes, for feedback into the learner
    #[must_use]
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            RecoveryAction::Restart(RestartVariant::Immediate) => {
                RecoveryStrategy::ImmediateRestart
            }
            RecoveryAction::Restart(RestartVariant::Delayed)
            | RecoveryAction::Restart(RestartVariant::Careful) => {
                RecoveryStrategy::DelayedRestart
            }
            RecoveryAction::Restart(RestartVariant::WithDependencies) => {
                RecoveryStrategy::DependencyRestart
            }
            RecoveryAction::CircuitBreak { .. } => RecoveryStrategy::CircuitBreak,
            RecoveryAction::Degrade(_) => RecoveryStrategy::GracefulDegradation,
            RecoveryAction::Escalate => RecoveryStrategy::Escalate,
        }
    }
}

/// Declaration of a managed child, parsed into the dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Child identity; synthesized when the declaration carries none
    pub id: ChildId,
    /// Backing implementation tag (informational)
    pub backing: String,
    /// Priority in `[0, 10]`, higher restarts sooner
    pub priority: u8,
    /// Explicitly on a critical path
    pub critical: bool,
    /// Direct dependencies
    pub depends_on: Vec<ChildId>,
    /// Degradation mode; defaults to `Disable`
    #[serde(default)]
    pub fallback: FallbackMode,
    /// Dependency-down behavior; defaults to `Independent`
    #[serde(default)]
    pub restart: RestartStrategyDecl,
    /// Context store key; defaults to the child id
    pub context_key: String,
}

impl ChildSpec {
    #[must_use]
    pub fn new(id: impl Into<ChildId>) -> Self {
        let id = id.into();
        let context_key = id.as_str().to_string();
        Self {
            id,
            backing: String::new(),
            priority: 5,
            critical: false,
            depends_on: Vec::new(),
            fallback: FallbackMode::Disable,
            restart: RestartStrategyDecl::Independent,
            context_key,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_backing(mut self, backing: impl Into<String>) -> Self {
        self.backing = backing.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(10);
        self
    }

    #[inline]
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn depends_on(mut self, dep: impl Into<ChildId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = fallback;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_restart(mut self, restart: RestartStrategyDecl) -> Self {
        self.restart = restart;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = key.into();
        self
    }
}

/// One entry in the supervisor's bounded restart history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartInfo {
    pub child_id: ChildId,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub error: String,
    /// Restarts of this child within the trailing window at decision time
    pub restart_count: u32,
    pub recovery_time_ms: Option<u64>,
}

/// Context describing one recovery attempt, fed to the learner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub child_id: Option<ChildId>,
    pub restart_count: Option<u32>,
    pub recovery_time_ms: Option<u64>,
    pub memory_impact_mb: Option<f64>,
    pub cpu_spike: bool,
    pub error_count: Option<u32>,
    pub dependency_failure: bool,
    /// Normalized system load in `[0, 1]`
    pub system_load: Option<f64>,
    /// Local hour of day `[0, 24)`; filled by the learner when absent
    pub hour_of_day: Option<u8>,
}

impl AttemptContext {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn for_child(id: ChildId, restart_count: u32) -> Self {
        Self {
            child_id: Some(id),
            restart_count: Some(restart_count),
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_recovery_time(mut self, ms: u64) -> Self {
        self.recovery_time_ms = Some(ms);
        self
    }

    /// Classify this attempt's weight per the pattern rules
    #[must_use]
    pub fn performance_impact(&self) -> PerformanceImpact {
        let time = self.recovery_time_ms.unwrap_or(0);
        let memory = self.memory_impact_mb.unwrap_or(0.0);
        if time > 5_000 || memory > 10.0 || self.cpu_spike {
            PerformanceImpact::High
        } else if time > 1_000 {
            PerformanceImpact::Medium
        } else {
            PerformanceImpact::Low
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
#[inline]
#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
