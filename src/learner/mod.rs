//! Online recovery-pattern learner
//!
//! Records recovery attempt outcomes and produces strategy recommendations
//! and adaptive thresholds from the accumulated statistics. Learning uses
//! bounded exponential moving averages and heuristics, nothing heavier.
//!
//! The learner runs as a single tokio task owning every learning map
//! (single-writer discipline). Producers reach it through [`LearnerHandle`]
//! over an unbounded channel: records are fire-and-forget and never block
//! the hot failure path; queries use oneshot request/reply.

mod persistence;

pub use persistence::PersistedLearning;

use crate::error::LearnerError;
use crate::health::HealthSnapshot;
use crate::types::{AttemptContext, ErrorSignature, Outcome, PerformanceImpact, RecoveryStrategy};
use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// EMA weight kept for the old value
const EMA_OLD: f64 = 0.9;
/// EMA weight for the new observation
const EMA_NEW: f64 = 0.1;
/// Success-rate clamp bounds
const RATE_FLOOR: f64 = 0.05;
const RATE_CEIL: f64 = 0.95;
/// Adaptive threshold clamp bounds
const THRESHOLD_FLOOR: f64 = 0.1;
const THRESHOLD_CEIL: f64 = 2.0;
/// Bounded history lengths
const CONTEXT_HISTORY_LIMIT: usize = 10;
const PERFORMANCE_HISTORY_LIMIT: usize = 20;

pub(crate) type PatternKey = (ErrorSignature, RecoveryStrategy);

/// Learner configuration
#[derive(Debug, Clone)]
pub struct LearnerConfig {
    /// JSON snapshot destination; `None` disables persistence
    pub persist_path: Option<PathBuf>,
    /// One snapshot per this many updates on average; 0 disables sampling
    pub persist_sample_rate: u32,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            persist_path: None,
            persist_sample_rate: 50,
        }
    }
}

impl LearnerConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.persist_sample_rate = rate;
        self
    }
}

/// Learned statistics for one `(signature, strategy)` pair
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecoveryPattern {
    /// EMA-blended success rate
    pub success_rate: f64,
    /// EMA-blended recovery time
    pub avg_recovery_time_ms: f64,
    /// Classification of the most recent attempt's weight
    pub performance_impact: PerformanceImpact,
    /// Bounded per-feature outcome history, keyed `feature=value`
    pub context_correlations: HashMap<String, Vec<f64>>,
    pub total_attempts: u64,
    pub last_updated: DateTime<Utc>,
}

impl RecoveryPattern {
    fn new() -> Self {
        Self {
            success_rate: 0.5,
            avg_recovery_time_ms: 0.0,
            performance_impact: PerformanceImpact::Low,
            context_correlations: HashMap::new(),
            total_attempts: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Queryable snapshot of the learner's statistics
#[derive(Debug, Clone, Default)]
pub struct LearnerStats {
    pub total_attempts: u64,
    pub tracked_patterns: usize,
    pub error_counts: Vec<(ErrorSignature, u64)>,
    pub success_rates: Vec<(ErrorSignature, RecoveryStrategy, f64)>,
    pub thresholds: Vec<(RecoveryStrategy, f64)>,
}

/// All learning state, owned by the learner task
#[derive(Debug, Default)]
pub(crate) struct LearnerState {
    pub(crate) success_rates: HashMap<PatternKey, f64>,
    pub(crate) patterns: HashMap<PatternKey, RecoveryPattern>,
    pub(crate) performance_correlations:
        HashMap<(ErrorSignature, PerformanceImpact), HashMap<RecoveryStrategy, Vec<f64>>>,
    pub(crate) context_strategies:
        HashMap<(ErrorSignature, String, String), HashMap<RecoveryStrategy, Vec<f64>>>,
    pub(crate) error_counts: HashMap<ErrorSignature, u64>,
    pub(crate) error_contexts: HashMap<(ErrorSignature, String, String), u64>,
    pub(crate) thresholds: HashMap<RecoveryStrategy, f64>,
    pub(crate) total_attempts: u64,
}

/// Extract feature buckets from an attempt context
fn extract_features(ctx: &AttemptContext) -> Vec<(String, String)> {
    let mut features = Vec::with_capacity(6);
    if let Some(count) = ctx.restart_count {
        let bucket = match count {
            0 => "0",
            1 => "1",
            2 => "2",
            _ => "3+",
        };
        features.push(("restart_count".into(), bucket.into()));
    }
    features.push((
        "performance_impact".into(),
        ctx.performance_impact().as_str().into(),
    ));
    if let Some(count) = ctx.error_count {
        let bucket = match count {
            0 => "0",
            1..=5 => "1-5",
            _ => "6+",
        };
        features.push(("error_count".into(), bucket.into()));
    }
    features.push((
        "dependency_failure".into(),
        if ctx.dependency_failure { "true" } else { "false" }.into(),
    ));
    if let Some(load) = ctx.system_load {
        let bucket = if load < 0.33 {
            "low"
        } else if load < 0.66 {
            "medium"
        } else {
            "high"
        };
        features.push(("system_load".into(), bucket.into()));
    }
    let hour = ctx
        .hour_of_day
        .map(u32::from)
        .unwrap_or_else(|| Utc::now().hour());
    let slot = match hour {
        0..=5 => "night",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    };
    features.push(("time_of_day".into(), slot.into()));
    features
}

fn push_bounded(history: &mut Vec<f64>, value: f64, limit: usize) {
    history.push(value);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl LearnerState {
    /// Record one attempt: success-rate step, pattern EMA, correlation maps
    pub(crate) fn apply_record(
        &mut self,
        signature: ErrorSignature,
        strategy: RecoveryStrategy,
        outcome: Outcome,
        ctx: &AttemptContext,
    ) {
        let key = (signature.clone(), strategy);
        let value = outcome.value();
        let features = extract_features(ctx);

        let rate = self.success_rates.entry(key.clone()).or_insert(0.5);
        *rate = (*rate + outcome.step()).clamp(RATE_FLOOR, RATE_CEIL);

        let pattern = self.patterns.entry(key).or_insert_with(RecoveryPattern::new);
        pattern.success_rate = EMA_OLD * pattern.success_rate + EMA_NEW * value;
        if let Some(time) = ctx.recovery_time_ms {
            if pattern.total_attempts == 0 {
                pattern.avg_recovery_time_ms = time as f64;
            } else {
                pattern.avg_recovery_time_ms =
                    EMA_OLD * pattern.avg_recovery_time_ms + EMA_NEW * time as f64;
            }
        }
        let impact = ctx.performance_impact();
        pattern.performance_impact = impact;
        for (name, bucket) in &features {
            let history = pattern
                .context_correlations
                .entry(format!("{name}={bucket}"))
                .or_default();
            push_bounded(history, value, CONTEXT_HISTORY_LIMIT);
        }
        pattern.total_attempts += 1;
        pattern.last_updated = Utc::now();

        let perf = self
            .performance_correlations
            .entry((signature.clone(), impact))
            .or_default()
            .entry(strategy)
            .or_default();
        push_bounded(perf, value, PERFORMANCE_HISTORY_LIMIT);

        for (name, bucket) in features {
            let history = self
                .context_strategies
                .entry((signature.clone(), name, bucket))
                .or_default()
                .entry(strategy)
                .or_default();
            push_bounded(history, value, CONTEXT_HISTORY_LIMIT);
        }

        self.total_attempts += 1;
    }

    /// Count an error occurrence, bucketed by the context it arose in
    pub(crate) fn apply_error(&mut self, signature: ErrorSignature, ctx: &AttemptContext) {
        *self.error_counts.entry(signature.clone()).or_insert(0) += 1;
        for (name, bucket) in extract_features(ctx) {
            *self
                .error_contexts
                .entry((signature.clone(), name, bucket))
                .or_insert(0) += 1;
        }
    }

    fn has_data_for(&self, signature: &ErrorSignature) -> bool {
        self.success_rates.keys().any(|(sig, _)| sig == signature)
    }

    fn threshold(&self, strategy: RecoveryStrategy) -> f64 {
        self.thresholds.get(&strategy).copied().unwrap_or(1.0)
    }

    /// Score every surviving strategy and return the arg-max
    pub(crate) fn recommend(
        &self,
        signature: &ErrorSignature,
        ctx: &AttemptContext,
    ) -> RecoveryStrategy {
        // Cold start: nothing learned for this signature yet
        if !self.has_data_for(signature) {
            return RecoveryStrategy::ImmediateRestart;
        }

        let restart_count = ctx.restart_count.unwrap_or(0);
        let impact = ctx.performance_impact();
        let features = extract_features(ctx);

        let mut best = None;
        let mut best_score = f64::MIN;
        for strategy in RecoveryStrategy::ALL {
            // Hard filter: too many recent restarts rule out an immediate one
            if strategy == RecoveryStrategy::ImmediateRestart && restart_count > 2 {
                continue;
            }

            let base = self
                .success_rates
                .get(&(signature.clone(), strategy))
                .copied()
                .unwrap_or(0.5);

            let mut feature_scores = Vec::new();
            for (name, bucket) in &features {
                if let Some(per_strategy) = self.context_strategies.get(&(
                    signature.clone(),
                    name.clone(),
                    bucket.clone(),
                )) {
                    if let Some(avg) = per_strategy.get(&strategy).and_then(|h| mean(h)) {
                        feature_scores.push(avg);
                    }
                }
            }
            let context_score = mean(&feature_scores).unwrap_or(0.5);

            let performance_score = self
                .performance_correlations
                .get(&(signature.clone(), impact))
                .and_then(|per_strategy| per_strategy.get(&strategy))
                .and_then(|h| mean(h))
                .unwrap_or(0.5);

            let mut score = (0.4 * base + 0.3 * context_score + 0.3 * performance_score)
                * self.threshold(strategy);

            // Context preferences
            if restart_count > 1 && strategy == RecoveryStrategy::CircuitBreak {
                score *= 1.5;
            }
            if impact == PerformanceImpact::High
                && strategy == RecoveryStrategy::GracefulDegradation
            {
                score *= 1.5;
            }

            if score > best_score {
                best_score = score;
                best = Some(strategy);
            }
        }
        best.unwrap_or(RecoveryStrategy::ImmediateRestart)
    }

    /// Re-weight strategy multipliers from live performance metrics
    ///
    /// The blended factor sits at 1.0 when every signal is exactly at its
    /// degraded threshold; gentler strategies gain weight as it rises and
    /// `immediate_restart` loses it.
    pub(crate) fn update_thresholds(&mut self, metrics: &HealthSnapshot) {
        let factor = ((metrics.render_avg_ms / 20.0
            + metrics.memory_mb / 50.0
            + metrics.error_rate_percent / 2.0)
            / 3.0)
            .clamp(0.0, 2.0);

        for strategy in RecoveryStrategy::ALL {
            let raw = match strategy {
                RecoveryStrategy::ImmediateRestart => 2.0 - factor,
                RecoveryStrategy::DelayedRestart => 1.5 - 0.5 * factor,
                RecoveryStrategy::CircuitBreak | RecoveryStrategy::GracefulDegradation => {
                    0.5 + 0.75 * factor
                }
                RecoveryStrategy::DependencyRestart => 1.25 - 0.25 * factor,
                RecoveryStrategy::Escalate => 0.5 + 0.5 * factor,
            };
            self.thresholds
                .insert(strategy, raw.clamp(THRESHOLD_FLOOR, THRESHOLD_CEIL));
        }
    }

    pub(crate) fn stats(&self) -> LearnerStats {
        let mut error_counts: Vec<_> = self
            .error_counts
            .iter()
            .map(|(sig, count)| (sig.clone(), *count))
            .collect();
        error_counts.sort();
        let mut success_rates: Vec<_> = self
            .success_rates
            .iter()
            .map(|((sig, strategy), rate)| (sig.clone(), *strategy, *rate))
            .collect();
        success_rates.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        let mut thresholds: Vec<_> = self
            .thresholds
            .iter()
            .map(|(s, m)| (*s, *m))
            .collect();
        thresholds.sort_by_key(|(s, _)| *s);
        LearnerStats {
            total_attempts: self.total_attempts,
            tracked_patterns: self.patterns.len(),
            error_counts,
            success_rates,
            thresholds,
        }
    }
}

enum LearnerMsg {
    Record {
        signature: ErrorSignature,
        strategy: RecoveryStrategy,
        outcome: Outcome,
        context: AttemptContext,
    },
    RecordError {
        signature: ErrorSignature,
        context: AttemptContext,
    },
    Recommend {
        signature: ErrorSignature,
        context: AttemptContext,
        reply: oneshot::Sender<RecoveryStrategy>,
    },
    UpdateThresholds {
        metrics: HealthSnapshot,
    },
    Stats {
        reply: oneshot::Sender<LearnerStats>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), LearnerError>>,
    },
}

/// Cloneable handle to the learner task
#[derive(Clone)]
pub struct LearnerHandle {
    tx: mpsc::UnboundedSender<LearnerMsg>,
}

impl LearnerHandle {
    /// Record the outcome of a recovery attempt; fire-and-forget
    pub fn record_recovery_attempt(
        &self,
        signature: ErrorSignature,
        strategy: RecoveryStrategy,
        outcome: Outcome,
        context: AttemptContext,
    ) {
        let _ = self.tx.send(LearnerMsg::Record {
            signature,
            strategy,
            outcome,
            context,
        });
    }

    /// Record that an error class occurred in the given context;
    /// fire-and-forget
    pub fn record_error(&self, signature: ErrorSignature, context: AttemptContext) {
        let _ = self.tx.send(LearnerMsg::RecordError { signature, context });
    }

    /// Ask for the best strategy for this signature under this context
    pub async fn recommend_recovery_strategy(
        &self,
        signature: ErrorSignature,
        context: AttemptContext,
    ) -> Result<RecoveryStrategy, LearnerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LearnerMsg::Recommend {
                signature,
                context,
                reply,
            })
            .map_err(|_| LearnerError::ChannelClosed)?;
        rx.await.map_err(|_| LearnerError::ChannelClosed)
    }

    /// Re-weight adaptive thresholds from live metrics; fire-and-forget
    pub fn update_adaptive_thresholds(&self, metrics: HealthSnapshot) {
        let _ = self.tx.send(LearnerMsg::UpdateThresholds { metrics });
    }

    /// Snapshot of accumulated statistics
    pub async fn stats(&self) -> Result<LearnerStats, LearnerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LearnerMsg::Stats { reply })
            .map_err(|_| LearnerError::ChannelClosed)?;
        rx.await.map_err(|_| LearnerError::ChannelClosed)
    }

    /// Force a persistence snapshot now
    pub async fn flush(&self) -> Result<(), LearnerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LearnerMsg::Flush { reply })
            .map_err(|_| LearnerError::ChannelClosed)?;
        rx.await.map_err(|_| LearnerError::ChannelClosed)?
    }
}

/// Spawn the learner task
///
/// A missing or corrupt snapshot file yields an empty cold-start state.
pub fn spawn_learner(config: LearnerConfig) -> (LearnerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LearnerHandle { tx };
    let task = tokio::spawn(learner_task(config, rx));
    (handle, task)
}

async fn learner_task(config: LearnerConfig, mut rx: mpsc::UnboundedReceiver<LearnerMsg>) {
    let mut state = LearnerState::default();
    if let Some(path) = &config.persist_path {
        if let Some(persisted) = persistence::load(path).await {
            persisted.restore_into(&mut state);
            debug!(
                patterns = state.patterns.len(),
                "restored learning state from snapshot"
            );
        }
    }

    while let Some(msg) = rx.recv().await {
        match msg {
            LearnerMsg::Record {
                signature,
                strategy,
                outcome,
                context,
            } => {
                state.apply_record(signature, strategy, outcome, &context);
                maybe_persist(&config, &state);
            }
            LearnerMsg::RecordError { signature, context } => {
                state.apply_error(signature, &context);
            }
            LearnerMsg::Recommend {
                signature,
                context,
                reply,
            } => {
                let _ = reply.send(state.recommend(&signature, &context));
            }
            LearnerMsg::UpdateThresholds { metrics } => {
                state.update_thresholds(&metrics);
            }
            LearnerMsg::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            LearnerMsg::Flush { reply } => {
                let result = match &config.persist_path {
                    Some(path) => persistence::save(path, &state).await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
        }
    }
}

/// Sampled, asynchronous persistence: ~one snapshot per `sample_rate` updates
fn maybe_persist(config: &LearnerConfig, state: &LearnerState) {
    let Some(path) = config.persist_path.clone() else {
        return;
    };
    if config.persist_sample_rate == 0 {
        return;
    }
    if rand::thread_rng().gen_range(0..config.persist_sample_rate) != 0 {
        return;
    }
    let snapshot = PersistedLearning::from_state(state);
    tokio::spawn(async move {
        if let Err(e) = persistence::save_snapshot(&path, &snapshot).await {
            error!(error = %e, "learning snapshot write failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sig(s: &str) -> ErrorSignature {
        ErrorSignature::new(s)
    }

    #[test]
    fn success_rate_steps_and_clamps() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext::new();
        for _ in 0..3 {
            state.apply_record(
                sig("conn_timeout"),
                RecoveryStrategy::ImmediateRestart,
                Outcome::Failure,
                &ctx,
            );
        }
        let rate = state.success_rates
            [&(sig("conn_timeout"), RecoveryStrategy::ImmediateRestart)];
        // 0.5 -> 0.4 -> 0.3 -> 0.2
        assert!((rate - 0.2).abs() < 1e-9);

        for _ in 0..20 {
            state.apply_record(
                sig("conn_timeout"),
                RecoveryStrategy::ImmediateRestart,
                Outcome::Failure,
                &ctx,
            );
        }
        let rate = state.success_rates
            [&(sig("conn_timeout"), RecoveryStrategy::ImmediateRestart)];
        assert!((rate - RATE_FLOOR).abs() < 1e-9);

        for _ in 0..30 {
            state.apply_record(
                sig("conn_timeout"),
                RecoveryStrategy::ImmediateRestart,
                Outcome::Success,
                &ctx,
            );
        }
        let rate = state.success_rates
            [&(sig("conn_timeout"), RecoveryStrategy::ImmediateRestart)];
        assert!((rate - RATE_CEIL).abs() < 1e-9);
    }

    #[test]
    fn pattern_ema_blend() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext::new().with_recovery_time(1_000);
        state.apply_record(
            sig("oom"),
            RecoveryStrategy::CircuitBreak,
            Outcome::Success,
            &ctx,
        );
        let pattern = &state.patterns[&(sig("oom"), RecoveryStrategy::CircuitBreak)];
        // first attempt blends into the 0.5 prior
        assert!((pattern.success_rate - 0.55).abs() < 1e-9);
        assert!((pattern.avg_recovery_time_ms - 1_000.0).abs() < 1e-9);
        assert_eq!(pattern.total_attempts, 1);

        let ctx2 = AttemptContext::new().with_recovery_time(3_000);
        state.apply_record(
            sig("oom"),
            RecoveryStrategy::CircuitBreak,
            Outcome::Failure,
            &ctx2,
        );
        let pattern = &state.patterns[&(sig("oom"), RecoveryStrategy::CircuitBreak)];
        assert!((pattern.success_rate - 0.495).abs() < 1e-9);
        assert!((pattern.avg_recovery_time_ms - 1_200.0).abs() < 1e-9);
    }

    #[test]
    fn histories_stay_bounded() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext::for_child(crate::types::ChildId::new("w"), 1);
        for _ in 0..50 {
            state.apply_record(
                sig("crash"),
                RecoveryStrategy::DelayedRestart,
                Outcome::Success,
                &ctx,
            );
        }
        let pattern = &state.patterns[&(sig("crash"), RecoveryStrategy::DelayedRestart)];
        assert!(pattern
            .context_correlations
            .values()
            .all(|h| h.len() <= CONTEXT_HISTORY_LIMIT));
        assert!(state
            .performance_correlations
            .values()
            .flat_map(|m| m.values())
            .all(|h| h.len() <= PERFORMANCE_HISTORY_LIMIT));
        assert!(state
            .context_strategies
            .values()
            .flat_map(|m| m.values())
            .all(|h| h.len() <= CONTEXT_HISTORY_LIMIT));
    }

    #[test]
    fn error_records_are_feature_conditioned() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext {
            dependency_failure: true,
            ..AttemptContext::new()
        };
        state.apply_error(sig("db_gone"), &ctx);
        state.apply_error(sig("db_gone"), &ctx);

        assert_eq!(state.error_counts[&sig("db_gone")], 2);
        let hit = (
            sig("db_gone"),
            "dependency_failure".to_string(),
            "true".to_string(),
        );
        let miss = (
            sig("db_gone"),
            "dependency_failure".to_string(),
            "false".to_string(),
        );
        assert_eq!(state.error_contexts[&hit], 2);
        assert!(!state.error_contexts.contains_key(&miss));
    }

    #[test]
    fn cold_start_recommends_immediate_restart() {
        let state = LearnerState::default();
        assert_eq!(
            state.recommend(&sig("never_seen"), &AttemptContext::new()),
            RecoveryStrategy::ImmediateRestart
        );
    }

    #[test]
    fn high_restart_count_excludes_immediate() {
        let mut state = LearnerState::default();
        // seed strong stats for immediate restart
        let ctx = AttemptContext::new();
        for _ in 0..10 {
            state.apply_record(
                sig("crash"),
                RecoveryStrategy::ImmediateRestart,
                Outcome::Success,
                &ctx,
            );
        }
        let hot = AttemptContext {
            restart_count: Some(3),
            ..AttemptContext::new()
        };
        assert_ne!(
            state.recommend(&sig("crash"), &hot),
            RecoveryStrategy::ImmediateRestart
        );
    }

    #[test]
    fn repeated_restarts_prefer_circuit_break() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext::new();
        for strategy in RecoveryStrategy::ALL {
            state.apply_record(sig("flap"), strategy, Outcome::PartialSuccess, &ctx);
        }
        let hot = AttemptContext {
            restart_count: Some(2),
            ..AttemptContext::new()
        };
        assert_eq!(
            state.recommend(&sig("flap"), &hot),
            RecoveryStrategy::CircuitBreak
        );
    }

    #[test]
    fn high_impact_prefers_degradation() {
        let mut state = LearnerState::default();
        let ctx = AttemptContext::new();
        for strategy in RecoveryStrategy::ALL {
            state.apply_record(sig("heavy"), strategy, Outcome::PartialSuccess, &ctx);
        }
        let heavy = AttemptContext {
            cpu_spike: true,
            ..AttemptContext::new()
        };
        assert_eq!(
            state.recommend(&sig("heavy"), &heavy),
            RecoveryStrategy::GracefulDegradation
        );
    }

    #[test]
    fn thresholds_track_health() {
        let mut state = LearnerState::default();
        state.update_thresholds(&HealthSnapshot::new(0.0, 0.0, 0.0));
        let immediate_healthy = state.thresholds[&RecoveryStrategy::ImmediateRestart];
        let gentle_healthy = state.thresholds[&RecoveryStrategy::CircuitBreak];

        state.update_thresholds(&HealthSnapshot::new(60.0, 150.0, 6.0));
        let immediate_sick = state.thresholds[&RecoveryStrategy::ImmediateRestart];
        let gentle_sick = state.thresholds[&RecoveryStrategy::CircuitBreak];

        assert!(immediate_sick < immediate_healthy);
        assert!(gentle_sick > gentle_healthy);
        for m in state.thresholds.values() {
            assert!(*m >= THRESHOLD_FLOOR && *m <= THRESHOLD_CEIL);
        }
    }

    #[tokio::test]
    async fn handle_round_trip() {
        let (learner, task) = spawn_learner(LearnerConfig::default());
        learner.record_recovery_attempt(
            sig("conn_timeout"),
            RecoveryStrategy::ImmediateRestart,
            Outcome::Failure,
            AttemptContext::new(),
        );
        learner.record_error(sig("conn_timeout"), AttemptContext::new());
        let stats = learner.stats().await.unwrap();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.error_counts, vec![(sig("conn_timeout"), 1)]);
        drop(learner);
        task.await.unwrap();
    }

    proptest! {
        #[test]
        fn success_rate_always_bounded(outcomes in proptest::collection::vec(0u8..3, 1..200)) {
            let mut state = LearnerState::default();
            let ctx = AttemptContext::new();
            for o in outcomes {
                let outcome = match o {
                    0 => Outcome::Success,
                    1 => Outcome::PartialSuccess,
                    _ => Outcome::Failure,
                };
                state.apply_record(
                    sig("prop"),
                    RecoveryStrategy::DelayedRestart,
                    outcome,
                    &ctx,
                );
                let rate = state.success_rates[&(sig("prop"), RecoveryStrategy::DelayedRestart)];
                prop_assert!((RATE_FLOOR..=RATE_CEIL).contains(&rate));
                let ema = state.patterns[&(sig("prop"), RecoveryStrategy::DelayedRestart)].success_rate;
                prop_assert!((0.0..=1.0).contains(&ema));
            }
        }
    }
}
