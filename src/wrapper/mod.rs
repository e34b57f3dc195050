//! Transparent per-worker recovery proxy
//!
//! One wrapper supervises exactly one worker. Calls, casts, and raw
//! messages addressed to the wrapper are forwarded to the worker and call
//! replies relayed back to the original caller. The wrapper periodically
//! snapshots worker state into the context store and, on worker death,
//! preserves a final snapshot, records the error, reports the failure to
//! the supervisor, and terminates with the same reason so the owning
//! restart mechanism fires.
//!
//! Every wrapper-to-worker interaction is bounded (default 1s): a wedged
//! worker can never block the snapshot or death-handling path.

use crate::context::{ContextBlob, ContextManager, DEFAULT_CONTEXT_TTL, FINAL_CONTEXT_TTL};
use crate::error::WrapperError;
use crate::learner::LearnerHandle;
use crate::supervisor::{ChildFailureReport, SupervisorHandle};
use crate::types::{AttemptContext, ChildId, ErrorSignature};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Contract expected of a wrapped worker; every part is best-effort
#[async_trait]
pub trait Worker: Send + 'static {
    /// Handle a synchronous request; `Err` is a crash reason
    async fn handle_call(&mut self, payload: ContextBlob) -> Result<ContextBlob, String>;

    /// Handle a one-way message; `Err` is a crash reason
    async fn handle_cast(&mut self, _payload: ContextBlob) -> Result<(), String> {
        Ok(())
    }

    /// Handle an arbitrary forwarded message; `Err` is a crash reason
    async fn handle_info(&mut self, _payload: ContextBlob) -> Result<(), String> {
        Ok(())
    }

    /// Produce a state snapshot, if the worker supports it
    async fn get_state(&mut self) -> Option<ContextBlob> {
        None
    }

    /// Accept preserved context from before a restart
    async fn restore_context(&mut self, _ctx: ContextBlob) {}
}

/// Messages delivered to a worker task
pub enum WorkerMsg {
    Call {
        payload: ContextBlob,
        reply: oneshot::Sender<Result<ContextBlob, String>>,
    },
    Cast {
        payload: ContextBlob,
    },
    Info {
        payload: ContextBlob,
    },
    GetState {
        reply: oneshot::Sender<Option<ContextBlob>>,
    },
    RestoreContext {
        ctx: ContextBlob,
    },
}

/// Channel to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
}

impl WorkerHandle {
    #[inline]
    #[must_use]
    pub fn new(tx: mpsc::Sender<WorkerMsg>) -> Self {
        Self { tx }
    }
}

/// A freshly spawned worker: its channel plus a death notification
pub struct SpawnedWorker {
    pub handle: WorkerHandle,
    /// Resolves with the crash reason; a dropped sender means the worker
    /// stopped without reporting one
    pub exited: oneshot::Receiver<String>,
}

/// Produces a new worker instance each time the wrapper (re)starts one
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn_worker(&self) -> SpawnedWorker;
}

/// Run a [`Worker`] implementation as its own tokio task
pub fn spawn_worker_task<W: Worker>(mut worker: W, buffer: usize) -> SpawnedWorker {
    let (tx, mut rx) = mpsc::channel(buffer);
    let (exit_tx, exited) = oneshot::channel();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Call { payload, reply } => match worker.handle_call(payload).await {
                    Ok(value) => {
                        let _ = reply.send(Ok(value));
                    }
                    Err(reason) => {
                        let _ = reply.send(Err(reason.clone()));
                        let _ = exit_tx.send(reason);
                        return;
                    }
                },
                WorkerMsg::Cast { payload } => {
                    if let Err(reason) = worker.handle_cast(payload).await {
                        let _ = exit_tx.send(reason);
                        return;
                    }
                }
                WorkerMsg::Info { payload } => {
                    if let Err(reason) = worker.handle_info(payload).await {
                        let _ = exit_tx.send(reason);
                        return;
                    }
                }
                WorkerMsg::GetState { reply } => {
                    let _ = reply.send(worker.get_state().await);
                }
                WorkerMsg::RestoreContext { ctx } => {
                    worker.restore_context(ctx).await;
                }
            }
        }
    });
    SpawnedWorker {
        handle: WorkerHandle::new(tx),
        exited,
    }
}

/// Wrapper configuration
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    pub child_id: ChildId,
    pub context_key: String,
    pub snapshot_interval: Duration,
    /// Bound on every worker interaction
    pub io_timeout: Duration,
    /// Consecutive forwarding failures before the wrapper gives up
    pub max_consecutive_errors: u32,
}

impl WrapperConfig {
    #[must_use]
    pub fn new(child_id: impl Into<ChildId>) -> Self {
        let child_id = child_id.into();
        let context_key = child_id.as_str().to_string();
        Self {
            child_id,
            context_key,
            snapshot_interval: Duration::from_secs(30),
            io_timeout: Duration::from_secs(1),
            max_consecutive_errors: 5,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_context_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = key.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }
}

/// Why a wrapper task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperExit {
    /// The worker died; carries the same reason reported upward
    WorkerFailure(String),
    /// The consecutive-forwarding-failure ceiling was hit
    TooManyErrors,
    /// Orderly shutdown
    Shutdown,
}

enum WrapperMsg {
    Call {
        payload: ContextBlob,
        reply: oneshot::Sender<Result<ContextBlob, WrapperError>>,
    },
    Cast {
        payload: ContextBlob,
    },
    Message {
        payload: ContextBlob,
    },
    Snapshot,
    Shutdown,
}

/// Cloneable handle to a wrapper task
#[derive(Clone)]
pub struct WrapperHandle {
    tx: mpsc::UnboundedSender<WrapperMsg>,
}

impl WrapperHandle {
    /// Forward a synchronous request and relay the worker's reply
    pub async fn call(&self, payload: ContextBlob) -> Result<ContextBlob, WrapperError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WrapperMsg::Call { payload, reply })
            .map_err(|_| WrapperError::ChannelClosed)?;
        rx.await.map_err(|_| WrapperError::ChannelClosed)?
    }

    /// Forward a one-way message
    pub fn cast(&self, payload: ContextBlob) -> Result<(), WrapperError> {
        self.tx
            .send(WrapperMsg::Cast { payload })
            .map_err(|_| WrapperError::ChannelClosed)
    }

    /// Forward an arbitrary message
    pub fn send_message(&self, payload: ContextBlob) -> Result<(), WrapperError> {
        self.tx
            .send(WrapperMsg::Message { payload })
            .map_err(|_| WrapperError::ChannelClosed)
    }

    /// Trigger an out-of-cycle snapshot
    pub fn snapshot(&self) {
        let _ = self.tx.send(WrapperMsg::Snapshot);
    }

    /// Stop the wrapper without treating it as a failure
    pub fn shutdown(&self) {
        let _ = self.tx.send(WrapperMsg::Shutdown);
    }
}

/// External collaborators of a wrapper
pub struct WrapperDeps {
    pub factory: Arc<dyn WorkerFactory>,
    pub context: Arc<dyn ContextManager>,
    pub supervisor: SupervisorHandle,
    pub learner: LearnerHandle,
}

/// Spawn a wrapper and its worker
pub async fn spawn_wrapper(
    config: WrapperConfig,
    deps: WrapperDeps,
) -> (WrapperHandle, JoinHandle<WrapperExit>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = deps.factory.spawn_worker().await;
    let task = tokio::spawn(wrapper_task(config, deps, worker, rx));
    (WrapperHandle { tx }, task)
}

async fn wrapper_task(
    config: WrapperConfig,
    deps: WrapperDeps,
    worker: SpawnedWorker,
    mut rx: mpsc::UnboundedReceiver<WrapperMsg>,
) -> WrapperExit {
    let SpawnedWorker {
        handle: worker,
        mut exited,
    } = worker;

    // Best-effort context restoration under the worker's declared key
    if let Some(ctx) = deps.context.get_context(&config.context_key).await {
        let restore = worker.tx.send(WorkerMsg::RestoreContext { ctx });
        if timeout(config.io_timeout, restore).await.is_err() {
            debug!(child = %config.child_id, "context restoration timed out");
        }
    }

    let mut ticker = interval_at(
        Instant::now() + config.snapshot_interval,
        config.snapshot_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut error_count: u32 = 0;
    let mut last_snapshot: Option<ContextBlob> = None;

    loop {
        tokio::select! {
            inbound = rx.recv() => match inbound {
                None | Some(WrapperMsg::Shutdown) => return WrapperExit::Shutdown,
                Some(WrapperMsg::Call { payload, reply }) => {
                    match forward_call(&worker, payload, config.io_timeout).await {
                        Ok(value) => {
                            error_count = 0;
                            let _ = reply.send(Ok(value));
                        }
                        Err(e) => {
                            error_count += 1;
                            let _ = reply.send(Err(e));
                            if error_count >= config.max_consecutive_errors {
                                return WrapperExit::TooManyErrors;
                            }
                        }
                    }
                }
                Some(WrapperMsg::Cast { payload }) => {
                    match forward_oneway(&worker, WorkerMsg::Cast { payload }, config.io_timeout).await {
                        Ok(()) => error_count = 0,
                        Err(_) => {
                            error_count += 1;
                            if error_count >= config.max_consecutive_errors {
                                return WrapperExit::TooManyErrors;
                            }
                        }
                    }
                }
                Some(WrapperMsg::Message { payload }) => {
                    match forward_oneway(&worker, WorkerMsg::Info { payload }, config.io_timeout).await {
                        Ok(()) => error_count = 0,
                        Err(_) => {
                            error_count += 1;
                            if error_count >= config.max_consecutive_errors {
                                return WrapperExit::TooManyErrors;
                            }
                        }
                    }
                }
                Some(WrapperMsg::Snapshot) => {
                    take_snapshot(&config, &deps, &worker, &mut last_snapshot, DEFAULT_CONTEXT_TTL).await;
                }
            },
            _ = ticker.tick() => {
                take_snapshot(&config, &deps, &worker, &mut last_snapshot, DEFAULT_CONTEXT_TTL).await;
            }
            reason = &mut exited => {
                let reason = reason.unwrap_or_else(|_| "worker_terminated".to_string());
                handle_worker_death(&config, &deps, &worker, last_snapshot, &reason, error_count).await;
                return WrapperExit::WorkerFailure(reason);
            }
        }
    }
}

async fn forward_call(
    worker: &WorkerHandle,
    payload: ContextBlob,
    io_timeout: Duration,
) -> Result<ContextBlob, WrapperError> {
    let (reply, rx) = oneshot::channel();
    timeout(io_timeout, worker.tx.send(WorkerMsg::Call { payload, reply }))
        .await
        .map_err(|_| WrapperError::Timeout)?
        .map_err(|_| WrapperError::WorkerUnavailable)?;
    match timeout(io_timeout, rx).await {
        Err(_) => Err(WrapperError::Timeout),
        Ok(Err(_)) => Err(WrapperError::WorkerUnavailable),
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(_crash))) => Err(WrapperError::WorkerUnavailable),
    }
}

async fn forward_oneway(
    worker: &WorkerHandle,
    msg: WorkerMsg,
    io_timeout: Duration,
) -> Result<(), WrapperError> {
    timeout(io_timeout, worker.tx.send(msg))
        .await
        .map_err(|_| WrapperError::Timeout)?
        .map_err(|_| WrapperError::WorkerUnavailable)
}

/// Bounded state read; a failed cycle is skipped silently
async fn take_snapshot(
    config: &WrapperConfig,
    deps: &WrapperDeps,
    worker: &WorkerHandle,
    last_snapshot: &mut Option<ContextBlob>,
    ttl: Duration,
) {
    if let Some(state) = read_state(worker, config.io_timeout).await {
        *last_snapshot = Some(state.clone());
        deps.context
            .store_context(&config.context_key, state, ttl)
            .await;
    }
}

async fn read_state(worker: &WorkerHandle, io_timeout: Duration) -> Option<ContextBlob> {
    let (reply, rx) = oneshot::channel();
    timeout(io_timeout, worker.tx.send(WorkerMsg::GetState { reply }))
        .await
        .ok()?
        .ok()?;
    timeout(io_timeout, rx).await.ok()?.ok()?
}

/// Preserve final context, record the error, and report upward
async fn handle_worker_death(
    config: &WrapperConfig,
    deps: &WrapperDeps,
    worker: &WorkerHandle,
    last_snapshot: Option<ContextBlob>,
    reason: &str,
    error_count: u32,
) {
    // The worker is usually gone by now; fall back to the last periodic
    // snapshot when the final read fails.
    let final_state = match read_state(worker, config.io_timeout).await {
        Some(state) => Some(state),
        None => last_snapshot,
    };
    let had_final_state = final_state.is_some();
    if let Some(state) = final_state {
        deps.context
            .store_context(&config.context_key, state, FINAL_CONTEXT_TTL)
            .await;
    }

    deps.learner.record_error(
        ErrorSignature::from_reason(reason),
        AttemptContext {
            child_id: Some(config.child_id.clone()),
            error_count: Some(error_count),
            ..AttemptContext::new()
        },
    );

    warn!(child = %config.child_id, reason, "worker died");
    deps.supervisor.report_child_failure(ChildFailureReport {
        child_id: config.child_id.clone(),
        context_key: config.context_key.clone(),
        reason: reason.to_string(),
        diagnostics: json!({
            "error_count": error_count,
            "context_preserved": had_final_state,
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoWorker;

    #[async_trait]
    impl Worker for EchoWorker {
        async fn handle_call(&mut self, payload: ContextBlob) -> Result<ContextBlob, String> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn worker_task_echoes_calls() {
        let spawned = spawn_worker_task(EchoWorker, 8);
        let (reply, rx) = oneshot::channel();
        spawned
            .handle
            .tx
            .send(WorkerMsg::Call {
                payload: json!({"ping": 1}),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Ok(json!({"ping": 1})));
    }

    #[tokio::test]
    async fn worker_crash_reports_reason() {
        struct Crasher;

        #[async_trait]
        impl Worker for Crasher {
            async fn handle_call(&mut self, _payload: ContextBlob) -> Result<ContextBlob, String> {
                Err("boom".to_string())
            }
        }

        let spawned = spawn_worker_task(Crasher, 8);
        let (reply, rx) = oneshot::channel();
        spawned
            .handle
            .tx
            .send(WorkerMsg::Call {
                payload: json!(null),
                reply,
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Err("boom".to_string()));
        assert_eq!(spawned.exited.await.unwrap(), "boom");
    }

    #[tokio::test]
    async fn forward_call_to_dead_worker_fails_fast() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let worker = WorkerHandle::new(tx);
        let result = forward_call(&worker, json!(null), Duration::from_millis(50)).await;
        assert_eq!(result, Err(WrapperError::WorkerUnavailable));
    }
}
