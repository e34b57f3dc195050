//! Error types for the recovery engine
//!
//! Per-component error enums plus the umbrella [`RecoveryError`]. Most
//! failure paths in this subsystem degrade locally instead of propagating;
//! the variants here cover the surfaces that do return `Result`.

use crate::types::ChildId;

/// Main recovery engine error type
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Learner failure
    #[error("learner error: {0}")]
    Learner(#[from] LearnerError),

    /// Supervisor failure
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Wrapper failure
    #[error("wrapper error: {0}")]
    Wrapper(#[from] WrapperError),
}

impl RecoveryError {
    /// Whether retrying the same operation can succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            RecoveryError::Learner(e) => e.is_retryable(),
            RecoveryError::Supervisor(e) => e.is_retryable(),
            RecoveryError::Wrapper(e) => {
                matches!(e, WrapperError::Timeout | WrapperError::WorkerUnavailable)
            }
        }
    }
}

/// Learner errors
#[derive(Debug, thiserror::Error)]
pub enum LearnerError {
    /// Learner task is gone
    #[error("learner unavailable: channel closed")]
    ChannelClosed,

    /// Query reply timed out
    #[error("learner query timed out")]
    QueryTimeout,

    /// Persistence I/O failure (logged, learning continues in memory)
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl LearnerError {
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, LearnerError::QueryTimeout | LearnerError::Persistence(_))
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Supervisor task is gone
    #[error("supervisor unavailable: channel closed")]
    ChannelClosed,

    /// Child is not declared in the dependency graph
    #[error("unknown child: {0}")]
    UnknownChild(ChildId),

    /// Underlying restart primitive failed
    #[error("restart backend failed for {child}: {reason}")]
    Backend { child: ChildId, reason: String },
}

impl SupervisorError {
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::Backend { .. })
    }
}

/// Wrapper errors
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum WrapperError {
    /// Worker did not answer within the bounded window
    #[error("worker request timed out")]
    Timeout,

    /// Worker channel is closed or the worker is dead
    #[error("worker unavailable")]
    WorkerUnavailable,

    /// Wrapper task is gone
    #[error("wrapper unavailable: channel closed")]
    ChannelClosed,

    /// Consecutive forwarding failures hit the hard ceiling
    #[error("too many consecutive forwarding errors")]
    TooManyErrors,
}
