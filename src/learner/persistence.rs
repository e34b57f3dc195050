//! Best-effort JSON persistence for learning state
//!
//! The schema is forward-compatible: unknown fields are ignored on load and
//! missing fields fall back to defaults. A missing or corrupt file yields a
//! cold-start state, never an error.

use super::{LearnerState, RecoveryPattern};
use crate::error::LearnerError;
use crate::types::{ErrorSignature, PerformanceImpact, RecoveryStrategy};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRate {
    pub signature: ErrorSignature,
    pub strategy: RecoveryStrategy,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPattern {
    pub signature: ErrorSignature,
    pub strategy: RecoveryStrategy,
    pub pattern: RecoveryPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPerformance {
    pub signature: ErrorSignature,
    pub impact: PerformanceImpact,
    pub outcomes: HashMap<RecoveryStrategy, Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedContextStrategy {
    pub signature: ErrorSignature,
    pub feature: String,
    pub value: String,
    pub outcomes: HashMap<RecoveryStrategy, Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedErrorCount {
    pub signature: ErrorSignature,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedErrorContext {
    pub signature: ErrorSignature,
    pub feature: String,
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedThreshold {
    pub strategy: RecoveryStrategy,
    pub multiplier: f64,
}

/// On-disk snapshot of every learning map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedLearning {
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub strategy_success_rates: Vec<PersistedRate>,
    #[serde(default)]
    pub recovery_patterns: Vec<PersistedPattern>,
    #[serde(default)]
    pub performance_correlations: Vec<PersistedPerformance>,
    #[serde(default)]
    pub context_strategies: Vec<PersistedContextStrategy>,
    #[serde(default)]
    pub error_counts: Vec<PersistedErrorCount>,
    #[serde(default)]
    pub error_contexts: Vec<PersistedErrorContext>,
    #[serde(default)]
    pub adaptive_thresholds: Vec<PersistedThreshold>,
    #[serde(default)]
    pub total_attempts: u64,
}

impl PersistedLearning {
    pub(crate) fn from_state(state: &LearnerState) -> Self {
        Self {
            updated_at: Utc::now().to_rfc3339(),
            strategy_success_rates: state
                .success_rates
                .iter()
                .map(|((signature, strategy), rate)| PersistedRate {
                    signature: signature.clone(),
                    strategy: *strategy,
                    rate: *rate,
                })
                .collect(),
            recovery_patterns: state
                .patterns
                .iter()
                .map(|((signature, strategy), pattern)| PersistedPattern {
                    signature: signature.clone(),
                    strategy: *strategy,
                    pattern: pattern.clone(),
                })
                .collect(),
            performance_correlations: state
                .performance_correlations
                .iter()
                .map(|((signature, impact), outcomes)| PersistedPerformance {
                    signature: signature.clone(),
                    impact: *impact,
                    outcomes: outcomes.clone(),
                })
                .collect(),
            context_strategies: state
                .context_strategies
                .iter()
                .map(|((signature, feature, value), outcomes)| PersistedContextStrategy {
                    signature: signature.clone(),
                    feature: feature.clone(),
                    value: value.clone(),
                    outcomes: outcomes.clone(),
                })
                .collect(),
            error_counts: state
                .error_counts
                .iter()
                .map(|(signature, count)| PersistedErrorCount {
                    signature: signature.clone(),
                    count: *count,
                })
                .collect(),
            error_contexts: state
                .error_contexts
                .iter()
                .map(|((signature, feature, value), count)| PersistedErrorContext {
                    signature: signature.clone(),
                    feature: feature.clone(),
                    value: value.clone(),
                    count: *count,
                })
                .collect(),
            adaptive_thresholds: state
                .thresholds
                .iter()
                .map(|(strategy, multiplier)| PersistedThreshold {
                    strategy: *strategy,
                    multiplier: *multiplier,
                })
                .collect(),
            total_attempts: state.total_attempts,
        }
    }

    pub(crate) fn restore_into(self, state: &mut LearnerState) {
        for entry in self.strategy_success_rates {
            state
                .success_rates
                .insert((entry.signature, entry.strategy), entry.rate.clamp(0.05, 0.95));
        }
        for entry in self.recovery_patterns {
            state
                .patterns
                .insert((entry.signature, entry.strategy), entry.pattern);
        }
        for entry in self.performance_correlations {
            state
                .performance_correlations
                .insert((entry.signature, entry.impact), entry.outcomes);
        }
        for entry in self.context_strategies {
            state
                .context_strategies
                .insert((entry.signature, entry.feature, entry.value), entry.outcomes);
        }
        for entry in self.error_counts {
            state.error_counts.insert(entry.signature, entry.count);
        }
        for entry in self.error_contexts {
            state
                .error_contexts
                .insert((entry.signature, entry.feature, entry.value), entry.count);
        }
        for entry in self.adaptive_thresholds {
            state
                .thresholds
                .insert(entry.strategy, entry.multiplier.clamp(0.1, 2.0));
        }
        state.total_attempts = self.total_attempts;
    }
}

/// Load a snapshot; any failure is a cold start
pub(crate) async fn load(path: &Path) -> Option<PersistedLearning> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt learning snapshot, cold start");
            None
        }
    }
}

/// Serialize and write the current state
pub(crate) async fn save(path: &Path, state: &LearnerState) -> Result<(), LearnerError> {
    save_snapshot(path, &PersistedLearning::from_state(state)).await
}

pub(crate) async fn save_snapshot(
    path: &Path,
    snapshot: &PersistedLearning,
) -> Result<(), LearnerError> {
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| LearnerError::Persistence(e.to_string()))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| LearnerError::Persistence(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptContext, Outcome};

    #[tokio::test]
    async fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");

        let mut state = LearnerState::default();
        state.apply_record(
            ErrorSignature::new("conn_timeout"),
            RecoveryStrategy::CircuitBreak,
            Outcome::Success,
            &AttemptContext::new().with_recovery_time(250),
        );
        state.apply_error(ErrorSignature::new("conn_timeout"), &AttemptContext::new());
        save(&path, &state).await.unwrap();

        let mut restored = LearnerState::default();
        load(&path).await.unwrap().restore_into(&mut restored);
        assert_eq!(restored.total_attempts, 1);
        assert_eq!(restored.success_rates, state.success_rates);
        assert_eq!(restored.error_counts, state.error_counts);
        assert_eq!(restored.error_contexts, state.error_contexts);
        assert_eq!(
            restored.patterns[&(ErrorSignature::new("conn_timeout"), RecoveryStrategy::CircuitBreak)]
                .avg_recovery_time_ms,
            250.0
        );
    }

    #[tokio::test]
    async fn missing_file_is_cold_start() {
        assert!(load(Path::new("/nonexistent/learning.json")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load(&path).await.is_none());
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        tokio::fs::write(
            &path,
            br#"{"total_attempts": 7, "some_future_field": {"x": 1}}"#,
        )
        .await
        .unwrap();
        let snapshot = load(&path).await.unwrap();
        assert_eq!(snapshot.total_attempts, 7);
        assert!(snapshot.strategy_success_rates.is_empty());
    }
}
