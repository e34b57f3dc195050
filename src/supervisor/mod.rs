//! Restart-decision state machine
//!
//! The supervisor reacts to child-exit events, consults the dependency graph
//! and the pattern learner plus live system health, executes exactly one
//! recovery action, and feeds the realized outcome back into the learner.
//!
//! It runs as one tokio task and processes child exits sequentially, so two
//! restart decisions for the same child never overlap. Timers (circuit-break
//! retries, delayed restarts) carry a per-child epoch; a stale epoch means
//! the timer was superseded and it is ignored.

use crate::context::{ContextBlob, ContextManager, DEFAULT_CONTEXT_TTL};
use crate::error::SupervisorError;
use crate::graph::DependencyGraph;
use crate::health::{HealthLevel, HealthProbe, HealthSnapshot};
use crate::learner::LearnerHandle;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{
    now_millis, AttemptContext, ChildId, ChildSpec, ErrorSignature, FallbackMode, Outcome,
    RecoveryAction, RecoveryStrategy, RestartInfo, RestartStrategyDecl, RestartVariant,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Underlying one-for-one restart primitive, consumed through this seam
#[async_trait]
pub trait RestartBackend: Send + Sync {
    /// Trigger a restart of the child; returns a reason string on failure
    async fn restart_child(&self, id: &ChildId) -> Result<(), String>;

    /// Whether the child is currently running
    async fn is_running(&self, id: &ChildId) -> bool;

    /// Deliver preserved context to a freshly started child
    async fn deliver_context(&self, id: &ChildId, ctx: ContextBlob);

    /// Start a registered substitute keyed by a variant tag
    async fn start_fallback(&self, id: &ChildId, tag: &str) -> Result<(), String>;

    /// Propagate the failure to the governing supervision authority
    async fn escalate(&self, id: &ChildId, reason: &str);
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Trailing window over which restart counts are computed
    pub restart_window: Duration,
    /// Restart-history ring capacity
    pub history_limit: usize,
    /// Circuit-break base duration, doubled per restart up to the cap
    pub circuit_base: Duration,
    /// Exponent cap for circuit-break backoff
    pub max_backoff_exponent: u32,
    /// Circuit duration while waiting for dependencies
    pub dependency_wait: Duration,
    /// Delay before a delayed restart fires
    pub delayed_restart_delay: Duration,
    /// Delay applied when a careful restart finds degraded health
    pub careful_restart_delay: Duration,
    /// Pause between dependency restarts and the child restart
    pub stabilization_delay: Duration,
    /// Bound on waiting for a learner recommendation
    pub recommend_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_window: Duration::from_secs(60),
            history_limit: 100,
            circuit_base: Duration::from_millis(5_000),
            max_backoff_exponent: 6,
            dependency_wait: Duration::from_millis(10_000),
            delayed_restart_delay: Duration::from_millis(2_000),
            careful_restart_delay: Duration::from_millis(5_000),
            stabilization_delay: Duration::from_millis(500),
            recommend_timeout: Duration::from_millis(100),
        }
    }
}

/// Queryable recovery statistics
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub total_exits: u64,
    pub restarts: u64,
    pub circuit_breaks: u64,
    pub degradations: u64,
    pub escalations: u64,
    /// Most recent entries of the bounded history, newest last
    pub recent_history: Vec<RestartInfo>,
    /// Per-child restart counts within the trailing window
    pub window_restart_counts: Vec<(ChildId, u32)>,
}

/// Failure report sent by a wrapper when its worker dies
#[derive(Debug, Clone)]
pub struct ChildFailureReport {
    pub child_id: ChildId,
    pub context_key: String,
    pub reason: String,
    pub diagnostics: ContextBlob,
}

/// Select the recovery action for one child exit
///
/// Strict priority order, first match wins:
/// 1. three or more restarts in the window circuit-break with exponential
///    backoff,
/// 2. degraded live health (or the global degradation bias) degrades to the
///    child's declared fallback,
/// 3. a dependency down at exit time follows the child's declared restart
///    strategy (`independent` children fall through to the normal path),
/// 4. otherwise restart, with the variant picked from the prior restart
///    count and refined by the learner's recommendation.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn decide(
    restart_count: u32,
    health: &HealthSnapshot,
    degradation_mode: bool,
    dependencies_down: bool,
    restart_strategy: RestartStrategyDecl,
    fallback: &FallbackMode,
    recommended: Option<RecoveryStrategy>,
    config: &SupervisorConfig,
) -> RecoveryAction {
    if restart_count >= 3 {
        let exponent = restart_count.min(config.max_backoff_exponent);
        return RecoveryAction::CircuitBreak {
            duration: config.circuit_base * 2u32.pow(exponent),
        };
    }

    if health.is_degraded() || degradation_mode {
        return RecoveryAction::Degrade(fallback.clone());
    }

    if dependencies_down {
        match restart_strategy {
            RestartStrategyDecl::WaitForDependencies => {
                return RecoveryAction::CircuitBreak {
                    duration: config.dependency_wait,
                };
            }
            RestartStrategyDecl::RestartWithDependencies => {
                return RecoveryAction::Restart(RestartVariant::WithDependencies);
            }
            RestartStrategyDecl::GracefulDegradation => {
                return RecoveryAction::Degrade(fallback.clone());
            }
            RestartStrategyDecl::Escalate => return RecoveryAction::Escalate,
            RestartStrategyDecl::Independent => {}
        }
    }

    let variant = match restart_count {
        0 => RestartVariant::Immediate,
        1 | 2 => RestartVariant::Delayed,
        _ => RestartVariant::Careful,
    };
    match recommended {
        Some(RecoveryStrategy::GracefulDegradation) => RecoveryAction::Degrade(fallback.clone()),
        Some(RecoveryStrategy::CircuitBreak) => RecoveryAction::CircuitBreak {
            duration: config.dependency_wait,
        },
        Some(RecoveryStrategy::DelayedRestart) if variant == RestartVariant::Immediate => {
            RecoveryAction::Restart(RestartVariant::Delayed)
        }
        _ => RecoveryAction::Restart(variant),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    CircuitRetry,
    Delayed,
}

enum SupervisorMsg {
    ChildExit {
        id: ChildId,
        reason: String,
    },
    ChildFailure(ChildFailureReport),
    RecoverChild {
        id: ChildId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    GetStats {
        reply: oneshot::Sender<RecoveryStats>,
    },
    SetDegradationMode(bool),
    PreserveContext {
        id: ChildId,
        ctx: ContextBlob,
    },
    TimerFired {
        id: ChildId,
        epoch: u64,
        kind: TimerKind,
    },
}

/// Cloneable handle to the supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMsg>,
    graph: Arc<DependencyGraph>,
}

impl SupervisorHandle {
    /// Report an unexpected child exit; fire-and-forget
    pub fn notify_child_exit(&self, id: ChildId, reason: impl Into<String>) {
        let _ = self.tx.send(SupervisorMsg::ChildExit {
            id,
            reason: reason.into(),
        });
    }

    /// Report a worker death observed by its wrapper; fire-and-forget
    pub fn report_child_failure(&self, report: ChildFailureReport) {
        let _ = self.tx.send(SupervisorMsg::ChildFailure(report));
    }

    /// Manual recovery override; supersedes any pending timers for the child
    pub async fn recover_child(&self, id: ChildId) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMsg::RecoverChild { id, reply })
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Snapshot of decision counters and recent history
    pub async fn get_recovery_stats(&self) -> Result<RecoveryStats, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMsg::GetStats { reply })
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Bias every subsequent decision toward degradation until cleared
    pub fn set_degradation_mode(&self, enabled: bool) {
        let _ = self.tx.send(SupervisorMsg::SetDegradationMode(enabled));
    }

    /// Store context for a child under its configured key
    pub fn preserve_context(&self, id: ChildId, ctx: ContextBlob) {
        let _ = self.tx.send(SupervisorMsg::PreserveContext { id, ctx });
    }

    /// The dependency graph built at startup
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }
}

/// External collaborators of the supervisor
pub struct SupervisorDeps {
    pub learner: LearnerHandle,
    pub context: Arc<dyn ContextManager>,
    pub health: Arc<dyn HealthProbe>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub backend: Arc<dyn RestartBackend>,
}

/// Spawn the supervisor task; the graph is built once from `specs`
pub fn spawn_supervisor(
    specs: &[ChildSpec],
    config: SupervisorConfig,
    deps: SupervisorDeps,
) -> (SupervisorHandle, JoinHandle<()>) {
    let graph = Arc::new(DependencyGraph::build(specs));
    let context_keys = specs
        .iter()
        .map(|s| (s.id.clone(), s.context_key.clone()))
        .collect();
    let (tx, rx) = mpsc::unbounded_channel();
    let core = SupervisorCore {
        config,
        graph: Arc::clone(&graph),
        learner: deps.learner,
        context: deps.context,
        health: deps.health,
        telemetry: deps.telemetry,
        backend: deps.backend,
        context_keys,
        history: VecDeque::new(),
        epochs: HashMap::new(),
        last_signatures: HashMap::new(),
        degradation_mode: false,
        stats: Counters::default(),
        self_tx: tx.clone(),
    };
    let task = tokio::spawn(core.run(rx));
    (SupervisorHandle { tx, graph }, task)
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total_exits: u64,
    restarts: u64,
    circuit_breaks: u64,
    degradations: u64,
    escalations: u64,
}

struct SupervisorCore {
    config: SupervisorConfig,
    graph: Arc<DependencyGraph>,
    learner: LearnerHandle,
    context: Arc<dyn ContextManager>,
    health: Arc<dyn HealthProbe>,
    telemetry: Arc<dyn TelemetrySink>,
    backend: Arc<dyn RestartBackend>,
    context_keys: HashMap<ChildId, String>,
    history: VecDeque<RestartInfo>,
    epochs: HashMap<ChildId, u64>,
    last_signatures: HashMap<ChildId, ErrorSignature>,
    degradation_mode: bool,
    stats: Counters,
    self_tx: mpsc::UnboundedSender<SupervisorMsg>,
}

impl SupervisorCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                SupervisorMsg::ChildExit { id, reason } => {
                    self.handle_child_exit(id, reason).await;
                }
                SupervisorMsg::ChildFailure(report) => {
                    self.context_keys
                        .entry(report.child_id.clone())
                        .or_insert_with(|| report.context_key.clone());
                    debug!(
                        child = %report.child_id,
                        diagnostics = %report.diagnostics,
                        "wrapper reported worker death"
                    );
                    self.handle_child_exit(report.child_id, report.reason).await;
                }
                SupervisorMsg::RecoverChild { id, reply } => {
                    // Invalidate any pending timers before acting manually
                    self.bump_epoch(&id);
                    let count = self.window_count(&id);
                    let result = self
                        .restart_now(&id, RecoveryStrategy::ImmediateRestart, count)
                        .await;
                    let _ = reply.send(result.map(|_| ()));
                }
                SupervisorMsg::GetStats { reply } => {
                    let _ = reply.send(self.snapshot_stats());
                }
                SupervisorMsg::SetDegradationMode(enabled) => {
                    self.degradation_mode = enabled;
                }
                SupervisorMsg::PreserveContext { id, ctx } => {
                    let key = self.context_key(&id);
                    self.context
                        .store_context(&key, ctx, DEFAULT_CONTEXT_TTL)
                        .await;
                }
                SupervisorMsg::TimerFired { id, epoch, kind } => {
                    self.handle_timer(id, epoch, kind).await;
                }
            }
        }
    }

    fn context_key(&self, id: &ChildId) -> String {
        self.context_keys
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.as_str().to_string())
    }

    fn window_count(&self, id: &ChildId) -> u32 {
        let cutoff = now_millis().saturating_sub(self.config.restart_window.as_millis() as u64);
        self.history
            .iter()
            .filter(|info| &info.child_id == id && info.timestamp_ms >= cutoff)
            .count() as u32
    }

    fn bump_epoch(&mut self, id: &ChildId) -> u64 {
        let epoch = self.epochs.entry(id.clone()).or_insert(0);
        *epoch += 1;
        *epoch
    }

    fn current_epoch(&self, id: &ChildId) -> u64 {
        self.epochs.get(id).copied().unwrap_or(0)
    }

    fn schedule_timer(&mut self, id: &ChildId, kind: TimerKind, after: Duration) {
        let epoch = self.bump_epoch(id);
        let tx = self.self_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(SupervisorMsg::TimerFired { id, epoch, kind });
        });
    }

    async fn handle_child_exit(&mut self, id: ChildId, reason: String) {
        self.stats.total_exits += 1;
        // a fresh failure supersedes whatever recovery is still pending for
        // this child; the new decision re-schedules as needed
        self.bump_epoch(&id);
        let restart_count = self.window_count(&id);
        let signature = ErrorSignature::from_reason(&reason);
        self.last_signatures.insert(id.clone(), signature.clone());

        self.learner
            .record_error(signature.clone(), AttemptContext::for_child(id.clone(), restart_count));

        let health = self.health.snapshot();
        self.learner.update_adaptive_thresholds(health);

        let mut dependencies_down = false;
        for dep in self.graph.get_dependencies(&id) {
            if !self.backend.is_running(&dep).await {
                dependencies_down = true;
                break;
            }
        }

        let attempt_ctx = AttemptContext {
            dependency_failure: dependencies_down,
            ..AttemptContext::for_child(id.clone(), restart_count)
        };
        let recommended = timeout(
            self.config.recommend_timeout,
            self.learner
                .recommend_recovery_strategy(signature.clone(), attempt_ctx),
        )
        .await
        .ok()
        .and_then(Result::ok);

        let action = decide(
            restart_count,
            &health,
            self.degradation_mode,
            dependencies_down,
            self.graph.restart_strategy(&id),
            &self.graph.fallback_strategy(&id),
            recommended,
            &self.config,
        );
        debug!(child = %id, ?action, restart_count, "recovery decision");

        let recovery_time_ms = self
            .execute_action(&id, &reason, restart_count, action)
            .await;

        self.history.push_back(RestartInfo {
            child_id: id,
            timestamp_ms: now_millis(),
            error: reason,
            restart_count,
            recovery_time_ms,
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    /// Execute the chosen action; returns the measured recovery time for
    /// actions that completed a restart synchronously
    async fn execute_action(
        &mut self,
        id: &ChildId,
        reason: &str,
        restart_count: u32,
        action: RecoveryAction,
    ) -> Option<u64> {
        match action {
            RecoveryAction::Restart(RestartVariant::Immediate) => self
                .restart_now(id, RecoveryStrategy::ImmediateRestart, restart_count)
                .await
                .ok()
                .map(|ms| ms as u64),
            RecoveryAction::Restart(RestartVariant::Delayed) => {
                self.schedule_timer(id, TimerKind::Delayed, self.config.delayed_restart_delay);
                None
            }
            RecoveryAction::Restart(RestartVariant::Careful) => {
                self.careful_attempt(id, RecoveryStrategy::DelayedRestart).await;
                None
            }
            RecoveryAction::Restart(RestartVariant::WithDependencies) => {
                self.restart_with_dependencies(id, restart_count).await;
                None
            }
            RecoveryAction::CircuitBreak { duration } => {
                self.stats.circuit_breaks += 1;
                self.telemetry.emit(
                    TelemetryEvent::new("circuit_break")
                        .measure("duration_ms", duration.as_millis() as f64)
                        .measure("restart_count", f64::from(restart_count))
                        .tag("child_id", id.as_str()),
                );
                self.schedule_timer(id, TimerKind::CircuitRetry, duration);
                None
            }
            RecoveryAction::Degrade(mode) => {
                self.degrade(id, mode, restart_count).await;
                None
            }
            RecoveryAction::Escalate => {
                self.stats.escalations += 1;
                warn!(child = %id, reason, "local recovery exhausted, escalating");
                self.backend.escalate(id, reason).await;
                None
            }
        }
    }

    /// Fetch preserved context, trigger the restart primitive, deliver the
    /// context, and report the realized outcome to the learner
    async fn restart_now(
        &mut self,
        id: &ChildId,
        strategy: RecoveryStrategy,
        restart_count: u32,
    ) -> Result<u128, SupervisorError> {
        let signature = self
            .last_signatures
            .get(id)
            .cloned()
            .unwrap_or_else(|| ErrorSignature::new("unknown"));
        let key = self.context_key(id);
        let started = Instant::now();
        let preserved = self.context.get_context(&key).await;

        match self.backend.restart_child(id).await {
            Ok(()) => {
                if let Some(ctx) = preserved {
                    self.backend.deliver_context(id, ctx).await;
                }
                let elapsed = started.elapsed().as_millis();
                self.stats.restarts += 1;
                self.telemetry.emit(
                    TelemetryEvent::new("restart")
                        .measure("duration_ms", elapsed as f64)
                        .tag("child_id", id.as_str())
                        .tag("strategy", strategy.as_str()),
                );
                self.learner.record_recovery_attempt(
                    signature,
                    strategy,
                    Outcome::Success,
                    AttemptContext::for_child(id.clone(), restart_count)
                        .with_recovery_time(elapsed as u64),
                );
                Ok(elapsed)
            }
            Err(backend_reason) => {
                warn!(child = %id, reason = %backend_reason, "restart primitive failed");
                self.learner.record_recovery_attempt(
                    signature,
                    strategy,
                    Outcome::Failure,
                    AttemptContext::for_child(id.clone(), restart_count),
                );
                Err(SupervisorError::Backend {
                    child: id.clone(),
                    reason: backend_reason,
                })
            }
        }
    }

    /// Restart not-running dependencies first, wait briefly for
    /// stabilization, then restart the child itself
    async fn restart_with_dependencies(&mut self, id: &ChildId, restart_count: u32) {
        let order = self.graph.get_restart_order(id);
        for dep in order.iter().filter(|n| *n != id) {
            if !self.backend.is_running(dep).await {
                if let Err(reason) = self.backend.restart_child(dep).await {
                    warn!(dependency = %dep, reason = %reason, "dependency restart failed");
                }
            }
        }
        sleep(self.config.stabilization_delay).await;
        let _ = self
            .restart_now(id, RecoveryStrategy::DependencyRestart, restart_count)
            .await;
    }

    /// Health-gated restart: healthy restarts now, degraded defers,
    /// critical degrades instead
    async fn careful_attempt(&mut self, id: &ChildId, strategy: RecoveryStrategy) {
        match self.health.snapshot().level() {
            HealthLevel::Healthy => {
                let count = self.window_count(id);
                let _ = self.restart_now(id, strategy, count).await;
            }
            HealthLevel::Degraded => {
                self.schedule_timer(id, TimerKind::Delayed, self.config.careful_restart_delay);
            }
            HealthLevel::Critical => {
                let fallback = self.graph.fallback_strategy(id);
                let count = self.window_count(id);
                self.degrade(id, fallback, count).await;
            }
        }
    }

    async fn degrade(&mut self, id: &ChildId, mode: FallbackMode, restart_count: u32) {
        self.stats.degradations += 1;
        let signature = self
            .last_signatures
            .get(id)
            .cloned()
            .unwrap_or_else(|| ErrorSignature::new("unknown"));
        let outcome = match &mode {
            FallbackMode::Disable => {
                self.telemetry.emit(
                    TelemetryEvent::new("degradation")
                        .tag("child_id", id.as_str())
                        .tag("mode", "disable"),
                );
                Outcome::PartialSuccess
            }
            FallbackMode::Fallback(tag) => {
                self.telemetry.emit(
                    TelemetryEvent::new("degradation")
                        .tag("child_id", id.as_str())
                        .tag("mode", "fallback")
                        .tag("fallback", tag.clone()),
                );
                match self.backend.start_fallback(id, tag).await {
                    Ok(()) => Outcome::PartialSuccess,
                    Err(reason) => {
                        warn!(child = %id, fallback = %tag, reason = %reason, "fallback start failed");
                        Outcome::Failure
                    }
                }
            }
            FallbackMode::Notify(msg) => {
                self.telemetry.emit(
                    TelemetryEvent::new("degradation")
                        .tag("child_id", id.as_str())
                        .tag("mode", "notify")
                        .tag("message", msg.clone()),
                );
                Outcome::PartialSuccess
            }
        };
        self.learner.record_recovery_attempt(
            signature,
            RecoveryStrategy::GracefulDegradation,
            outcome,
            AttemptContext::for_child(id.clone(), restart_count),
        );
    }

    async fn handle_timer(&mut self, id: ChildId, epoch: u64, kind: TimerKind) {
        if epoch != self.current_epoch(&id) {
            debug!(child = %id, epoch, "stale recovery timer ignored");
            return;
        }
        match kind {
            TimerKind::CircuitRetry => {
                self.careful_attempt(&id, RecoveryStrategy::CircuitBreak).await;
            }
            TimerKind::Delayed => {
                let count = self.window_count(&id);
                let _ = self
                    .restart_now(&id, RecoveryStrategy::DelayedRestart, count)
                    .await;
            }
        }
    }

    fn snapshot_stats(&self) -> RecoveryStats {
        let mut counts: HashMap<ChildId, u32> = HashMap::new();
        let cutoff = now_millis().saturating_sub(self.config.restart_window.as_millis() as u64);
        for info in &self.history {
            if info.timestamp_ms >= cutoff {
                *counts.entry(info.child_id.clone()).or_insert(0) += 1;
            }
        }
        let mut window_restart_counts: Vec<_> = counts.into_iter().collect();
        window_restart_counts.sort();
        RecoveryStats {
            total_exits: self.stats.total_exits,
            restarts: self.stats.restarts,
            circuit_breaks: self.stats.circuit_breaks,
            degradations: self.stats.degradations,
            escalations: self.stats.escalations,
            recent_history: self.history.iter().cloned().collect(),
            window_restart_counts,
        }
    }
}
