//! Adaptive failure-recovery supervision kernel
//!
//! Four cooperating pieces:
//! - [`graph`]: dependency topology, restart ordering, and impact analysis
//! - [`learner`]: per-error-signature strategy learning with adaptive
//!   scoring and best-effort JSON persistence
//! - [`supervisor`]: the recovery decision loop turning child exits into
//!   restarts, circuit breaks, degradation, or escalation
//! - [`wrapper`]: a transparent per-worker proxy that preserves state
//!   across crashes and reports failures upward
//!
//! The ambient seams are [`context::ContextManager`], [`health::HealthProbe`],
//! and [`telemetry::TelemetrySink`]; in-memory implementations of each ship
//! with the crate.

pub mod context;
pub mod graph;
pub mod health;
pub mod learner;
pub mod logging;
pub mod supervisor;
pub mod telemetry;
pub mod types;
pub mod wrapper;

pub mod error;

pub use error::*;
pub use types::*;

pub use context::{ContextManager, InMemoryContextStore};
pub use graph::DependencyGraph;
pub use health::{HealthProbe, HealthSnapshot, StaticHealthProbe};
pub use learner::{spawn_learner, LearnerConfig, LearnerHandle};
pub use supervisor::{
    spawn_supervisor, RestartBackend, SupervisorConfig, SupervisorDeps, SupervisorHandle,
};
pub use telemetry::{TelemetrySink, TracingTelemetry};
pub use wrapper::{spawn_wrapper, Worker, WrapperConfig, WrapperDeps, WrapperExit, WrapperHandle};
